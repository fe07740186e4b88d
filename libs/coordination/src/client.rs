//! Lazily-connected ZooKeeper session.
//!
//! `ZkClient::new` does no I/O. The first operation dials the configured
//! endpoints in order and performs the handshake; afterwards a background
//! session task owns the socket:
//!
//! ```text
//! ZkClient ──Call──▶ session task ──frame──▶ server
//!    ▲                   │   ▲
//!    └──── reply ────────┘   └── reader task (frames)
//! ```
//!
//! The session task pings every third of the negotiated timeout, matches
//! replies to callers by xid and fires one-shot child watches. When the
//! connection drops, in-flight calls fail with `ConnectionLoss`, armed
//! watches are dropped, and the next operation opens a new session.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::error::{CoordinationError, ErrorCode, Result};
use crate::path;
use crate::proto::{
    self, ConnectRequest, ConnectResponse, FrameReader, OpCode, ReplyHeader, Request, Response,
    MAX_FRAME_LEN, NOTIFICATION_XID, PING_XID,
};
use crate::{CoordinationClient, CreateMode, EventType, Stat, WatchReceiver, WatchedEvent};

/// Queue depth between callers and the session task.
const CALL_QUEUE_DEPTH: usize = 64;

/// ZooKeeper client.
pub struct ZkClient {
    endpoints: Vec<String>,
    session_timeout: Duration,
    session: Mutex<Option<SessionHandle>>,
}

struct SessionHandle {
    session_id: i64,
    calls: mpsc::Sender<Call>,
}

struct Call {
    request: Request,
    watcher: Option<oneshot::Sender<WatchedEvent>>,
    reply: oneshot::Sender<Result<Response>>,
}

impl ZkClient {
    /// Create a client. No connection is attempted until the first operation.
    pub fn new(endpoints: Vec<String>, session_timeout: Duration) -> Self {
        Self {
            endpoints,
            session_timeout,
            session: Mutex::new(None),
        }
    }

    /// Configured endpoints.
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Id of the live session, if one is established.
    pub async fn session_id(&self) -> Option<i64> {
        let guard = self.session.lock().await;
        guard
            .as_ref()
            .filter(|s| !s.calls.is_closed())
            .map(|s| s.session_id)
    }

    async fn calls(&self) -> Result<mpsc::Sender<Call>> {
        let mut guard = self.session.lock().await;

        if let Some(session) = guard.as_ref() {
            if !session.calls.is_closed() {
                return Ok(session.calls.clone());
            }
            info!(
                session_id = session.session_id,
                "Coordination session lost, reconnecting"
            );
        }

        let session = self.connect().await?;
        let calls = session.calls.clone();
        *guard = Some(session);
        Ok(calls)
    }

    async fn connect(&self) -> Result<SessionHandle> {
        let mut last_error = None;

        for endpoint in &self.endpoints {
            debug!(endpoint = %endpoint, "Dialing coordination service");
            match timeout(self.session_timeout, self.handshake(endpoint)).await {
                Ok(Ok((stream, response))) => {
                    let negotiated = Duration::from_millis(response.timeout_ms as u64);
                    info!(
                        endpoint = %endpoint,
                        session_id = response.session_id,
                        negotiated_timeout_ms = response.timeout_ms,
                        "Coordination session established"
                    );

                    let (calls_tx, calls_rx) = mpsc::channel(CALL_QUEUE_DEPTH);
                    tokio::spawn(run_session(
                        stream,
                        calls_rx,
                        negotiated / 3,
                        response.session_id,
                    ));

                    return Ok(SessionHandle {
                        session_id: response.session_id,
                        calls: calls_tx,
                    });
                }
                Ok(Err(e)) => {
                    warn!(endpoint = %endpoint, error = %e, "Coordination handshake failed");
                    last_error = Some(e.to_string());
                }
                Err(_) => {
                    warn!(
                        endpoint = %endpoint,
                        timeout_ms = self.session_timeout.as_millis() as u64,
                        "Coordination handshake timed out"
                    );
                    last_error = Some(format!("timed out after {:?}", self.session_timeout));
                }
            }
        }

        Err(CoordinationError::Connect {
            endpoints: self.endpoints.clone(),
            reason: last_error.unwrap_or_else(|| "no endpoints configured".to_string()),
        })
    }

    async fn handshake(&self, endpoint: &str) -> Result<(TcpStream, ConnectResponse)> {
        let mut stream = TcpStream::connect(endpoint).await?;
        stream.set_nodelay(true)?;

        let timeout_ms = i32::try_from(self.session_timeout.as_millis()).unwrap_or(i32::MAX);
        stream
            .write_all(&ConnectRequest::new_session(timeout_ms).encode())
            .await?;

        let body = read_frame(&mut stream).await?;
        let response = ConnectResponse::decode(body)?;
        if response.timeout_ms <= 0 {
            return Err(CoordinationError::SessionExpired);
        }
        Ok((stream, response))
    }

    async fn call(
        &self,
        request: Request,
        watcher: Option<oneshot::Sender<WatchedEvent>>,
    ) -> Result<Response> {
        path::validate(request.path())?;
        let calls = self.calls().await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        calls
            .send(Call {
                request,
                watcher,
                reply: reply_tx,
            })
            .await
            .map_err(|_| CoordinationError::ConnectionLoss)?;

        match timeout(self.session_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoordinationError::Interrupted),
            Err(_) => Err(CoordinationError::Timeout(self.session_timeout)),
        }
    }
}

fn unexpected(op: &str, response: Response) -> CoordinationError {
    CoordinationError::Codec(format!("unexpected {op} response: {response:?}"))
}

#[async_trait]
impl CoordinationClient for ZkClient {
    async fn create(&self, path: &str, data: &[u8], mode: CreateMode) -> Result<String> {
        let request = Request::Create {
            path: path.to_string(),
            data: data.to_vec(),
            mode,
        };
        match self.call(request, None).await? {
            Response::Create(created) => Ok(created),
            other => Err(unexpected("create", other)),
        }
    }

    async fn delete(&self, path: &str, version: Option<i32>) -> Result<()> {
        let request = Request::Delete {
            path: path.to_string(),
            version: version.unwrap_or(-1),
        };
        match self.call(request, None).await? {
            Response::Delete => Ok(()),
            other => Err(unexpected("delete", other)),
        }
    }

    async fn exists(&self, path: &str) -> Result<Option<Stat>> {
        let request = Request::Exists {
            path: path.to_string(),
            watch: false,
        };
        match self.call(request, None).await {
            Ok(Response::Stat(stat)) => Ok(Some(stat)),
            Ok(other) => Err(unexpected("exists", other)),
            Err(e) if e.is_no_node() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, Stat)> {
        let request = Request::GetData {
            path: path.to_string(),
            watch: false,
        };
        match self.call(request, None).await? {
            Response::Data(data, stat) => Ok((data, stat)),
            other => Err(unexpected("get_data", other)),
        }
    }

    async fn set_data(&self, path: &str, data: &[u8], version: Option<i32>) -> Result<Stat> {
        let request = Request::SetData {
            path: path.to_string(),
            data: data.to_vec(),
            version: version.unwrap_or(-1),
        };
        match self.call(request, None).await? {
            Response::Stat(stat) => Ok(stat),
            other => Err(unexpected("set_data", other)),
        }
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        let request = Request::GetChildren {
            path: path.to_string(),
            watch: false,
        };
        match self.call(request, None).await? {
            Response::Children(children) => Ok(children),
            other => Err(unexpected("get_children", other)),
        }
    }

    async fn watch_children(&self, path: &str) -> Result<(Vec<String>, WatchReceiver)> {
        let request = Request::GetChildren {
            path: path.to_string(),
            watch: true,
        };
        let (watch_tx, watch_rx) = oneshot::channel();
        match self.call(request, Some(watch_tx)).await? {
            Response::Children(children) => Ok((children, watch_rx)),
            other => Err(unexpected("watch_children", other)),
        }
    }

    fn session_timeout(&self) -> Duration {
        self.session_timeout
    }
}

// =============================================================================
// Session task
// =============================================================================

/// Read one length-prefixed frame, returning its body.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Bytes> {
    let len = reader.read_i32().await?;
    if len < 0 || len as usize > MAX_FRAME_LEN {
        return Err(CoordinationError::Codec(format!("invalid frame length {len}")));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(Bytes::from(body))
}

struct Pending {
    opcode: OpCode,
    path: String,
    watcher: Option<oneshot::Sender<WatchedEvent>>,
    reply: oneshot::Sender<Result<Response>>,
}

#[derive(Default)]
struct SessionState {
    last_xid: i32,
    pending: HashMap<i32, Pending>,
    child_watches: HashMap<String, Vec<oneshot::Sender<WatchedEvent>>>,
}

impl SessionState {
    fn next_xid(&mut self) -> i32 {
        // Negative xids are reserved for pings and notifications.
        self.last_xid = if self.last_xid == i32::MAX {
            1
        } else {
            self.last_xid + 1
        };
        self.last_xid
    }

    /// Handle one server frame. An error means the stream is unusable.
    fn dispatch(&mut self, frame: Bytes) -> Result<()> {
        let mut reader = FrameReader::new(frame);
        let header = ReplyHeader::decode(&mut reader)?;

        match header.xid {
            PING_XID => trace!("Ping acknowledged"),
            NOTIFICATION_XID => match proto::decode_watcher_event(&mut reader) {
                Ok(event) => self.fire(event),
                Err(e) => warn!(error = %e, "Dropping malformed watch notification"),
            },
            xid => {
                let Some(pending) = self.pending.remove(&xid) else {
                    warn!(xid, "Reply for unknown request");
                    return Ok(());
                };

                let result = match ErrorCode::from_code(header.err) {
                    Some(code) => Err(CoordinationError::server(code, pending.path.as_str())),
                    None => Response::decode(pending.opcode, &mut reader),
                };

                if result.is_ok() {
                    if let Some(watcher) = pending.watcher {
                        self.child_watches
                            .entry(pending.path)
                            .or_default()
                            .push(watcher);
                    }
                }
                let _ = pending.reply.send(result);
            }
        }
        Ok(())
    }

    fn fire(&mut self, event: WatchedEvent) {
        if !matches!(
            event.event_type,
            EventType::NodeChildrenChanged | EventType::NodeDeleted
        ) {
            return;
        }
        if let Some(watchers) = self.child_watches.remove(&event.path) {
            debug!(
                path = %event.path,
                event = ?event.event_type,
                watchers = watchers.len(),
                "Firing child watches"
            );
            for watcher in watchers {
                let _ = watcher.send(event.clone());
            }
        }
    }
}

/// Fail in-flight and queued calls once the session is gone.
fn fail_outstanding(state: &mut SessionState, calls: &mut mpsc::Receiver<Call>) {
    for (_, pending) in state.pending.drain() {
        let _ = pending.reply.send(Err(CoordinationError::ConnectionLoss));
    }

    calls.close();
    while let Ok(call) = calls.try_recv() {
        let _ = call.reply.send(Err(CoordinationError::ConnectionLoss));
    }
}

async fn run_session(
    stream: TcpStream,
    mut calls: mpsc::Receiver<Call>,
    ping_interval: Duration,
    session_id: i64,
) {
    let (mut reader, mut writer) = stream.into_split();

    let (frames_tx, mut frames) = mpsc::channel::<Result<Bytes>>(CALL_QUEUE_DEPTH);
    let reader_task = tokio::spawn(async move {
        loop {
            let frame = read_frame(&mut reader).await;
            let failed = frame.is_err();
            if frames_tx.send(frame).await.is_err() || failed {
                break;
            }
        }
    });

    let ping_interval = ping_interval.max(Duration::from_millis(10));
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    let mut state = SessionState::default();

    let reason = loop {
        tokio::select! {
            call = calls.recv() => match call {
                Some(call) => {
                    let xid = state.next_xid();
                    let frame = call.request.encode(xid);
                    if let Err(e) = writer.write_all(&frame).await {
                        let _ = call.reply.send(Err(CoordinationError::ConnectionLoss));
                        break e.to_string();
                    }
                    state.pending.insert(xid, Pending {
                        opcode: call.request.opcode(),
                        path: call.request.path().to_string(),
                        watcher: call.watcher,
                        reply: call.reply,
                    });
                }
                None => {
                    let _ = writer.write_all(&proto::close_session(state.next_xid())).await;
                    break "client dropped".to_string();
                }
            },
            _ = ping.tick() => {
                if let Err(e) = writer.write_all(&proto::ping()).await {
                    break e.to_string();
                }
            }
            frame = frames.recv() => match frame {
                Some(Ok(frame)) => {
                    if let Err(e) = state.dispatch(frame) {
                        break e.to_string();
                    }
                }
                Some(Err(e)) => break e.to_string(),
                None => break "reader stopped".to_string(),
            },
        }
    };

    reader_task.abort();
    fail_outstanding(&mut state, &mut calls);

    warn!(session_id, reason = %reason, "Coordination session closed");
}
