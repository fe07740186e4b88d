//! ZooKeeper wire encoding.
//!
//! Every frame on the wire is a 4-byte big-endian length followed by a
//! jute-encoded record:
//!
//! ```text
//! client -> server   [len][xid:i32][opcode:i32][request body]
//! server -> client   [len][xid:i32][zxid:i64][err:i32][response body]
//! ```
//!
//! The session handshake is the exception: `ConnectRequest` and
//! `ConnectResponse` carry no request/reply header.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{CoordinationError, CreateMode, EventType, Result, Stat, WatchedEvent};
use crate::OPEN_ACL_UNSAFE_PERMS;

/// Handshake protocol version.
pub const PROTOCOL_VERSION: i32 = 0;

/// xid carried by watch notifications.
pub const NOTIFICATION_XID: i32 = -1;

/// xid carried by pings and their replies.
pub const PING_XID: i32 = -2;

/// Largest frame accepted from the server.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Length of the session password.
pub const PASSWORD_LEN: usize = 16;

/// Request operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Create,
    Delete,
    Exists,
    GetData,
    SetData,
    GetChildren,
    Ping,
    CloseSession,
}

impl OpCode {
    pub fn code(&self) -> i32 {
        match self {
            Self::Create => 1,
            Self::Delete => 2,
            Self::Exists => 3,
            Self::GetData => 4,
            Self::SetData => 5,
            Self::GetChildren => 8,
            Self::Ping => 11,
            Self::CloseSession => -11,
        }
    }
}

// =============================================================================
// Primitive encoding
// =============================================================================

/// Builds one length-prefixed frame.
pub struct FrameWriter {
    buf: BytesMut,
}

impl FrameWriter {
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_i32(0);
        Self { buf }
    }

    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32(value);
        self
    }

    pub fn i64(&mut self, value: i64) -> &mut Self {
        self.buf.put_i64(value);
        self
    }

    pub fn bool(&mut self, value: bool) -> &mut Self {
        self.buf.put_u8(u8::from(value));
        self
    }

    /// Length-prefixed byte buffer; `None` encodes as length -1.
    pub fn buffer(&mut self, value: Option<&[u8]>) -> &mut Self {
        match value {
            Some(bytes) => {
                self.buf.put_i32(bytes.len() as i32);
                self.buf.put_slice(bytes);
            }
            None => self.buf.put_i32(-1),
        }
        self
    }

    pub fn string(&mut self, value: &str) -> &mut Self {
        self.buffer(Some(value.as_bytes()))
    }

    /// Patch the length prefix and return the frame.
    pub fn finish(mut self) -> Bytes {
        let len = (self.buf.len() - 4) as i32;
        self.buf[..4].copy_from_slice(&len.to_be_bytes());
        self.buf.freeze()
    }
}

impl Default for FrameWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads jute primitives out of a frame body, checking bounds.
pub struct FrameReader {
    buf: Bytes,
}

impl FrameReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, len: usize, what: &str) -> Result<()> {
        if self.buf.remaining() < len {
            return Err(CoordinationError::Codec(format!(
                "truncated {what}: need {len} bytes, have {}",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    pub fn i32(&mut self) -> Result<i32> {
        self.need(4, "i32")?;
        Ok(self.buf.get_i32())
    }

    pub fn i64(&mut self) -> Result<i64> {
        self.need(8, "i64")?;
        Ok(self.buf.get_i64())
    }

    pub fn bool(&mut self) -> Result<bool> {
        self.need(1, "bool")?;
        Ok(self.buf.get_u8() != 0)
    }

    pub fn buffer(&mut self) -> Result<Option<Vec<u8>>> {
        let len = self.i32()?;
        if len < 0 {
            return Ok(None);
        }
        let len = len as usize;
        self.need(len, "buffer")?;
        Ok(Some(self.buf.split_to(len).to_vec()))
    }

    pub fn string(&mut self) -> Result<String> {
        let bytes = self.buffer()?.unwrap_or_default();
        String::from_utf8(bytes)
            .map_err(|e| CoordinationError::Codec(format!("invalid utf-8 string: {e}")))
    }

    pub fn strings(&mut self) -> Result<Vec<String>> {
        let count = self.i32()?;
        if count < 0 {
            return Ok(Vec::new());
        }
        (0..count).map(|_| self.string()).collect()
    }

    pub fn stat(&mut self) -> Result<Stat> {
        Ok(Stat {
            czxid: self.i64()?,
            mzxid: self.i64()?,
            ctime: self.i64()?,
            mtime: self.i64()?,
            version: self.i32()?,
            cversion: self.i32()?,
            aversion: self.i32()?,
            ephemeral_owner: self.i64()?,
            data_length: self.i32()?,
            num_children: self.i32()?,
            pzxid: self.i64()?,
        })
    }
}

// =============================================================================
// Handshake
// =============================================================================

/// First frame sent on a new connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub last_zxid_seen: i64,
    pub timeout_ms: i32,
    pub session_id: i64,
    pub password: [u8; PASSWORD_LEN],
}

impl ConnectRequest {
    /// Request for a brand-new session.
    pub fn new_session(timeout_ms: i32) -> Self {
        Self {
            last_zxid_seen: 0,
            timeout_ms,
            session_id: 0,
            password: [0; PASSWORD_LEN],
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut w = FrameWriter::new();
        w.i32(PROTOCOL_VERSION)
            .i64(self.last_zxid_seen)
            .i32(self.timeout_ms)
            .i64(self.session_id)
            .buffer(Some(&self.password))
            .bool(false);
        w.finish()
    }
}

/// Server answer to the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectResponse {
    pub protocol_version: i32,
    pub timeout_ms: i32,
    pub session_id: i64,
    pub password: Vec<u8>,
}

impl ConnectResponse {
    /// Decode a handshake body (length prefix already stripped).
    pub fn decode(body: Bytes) -> Result<Self> {
        let mut r = FrameReader::new(body);
        let protocol_version = r.i32()?;
        let timeout_ms = r.i32()?;
        let session_id = r.i64()?;
        let password = r.buffer()?.unwrap_or_default();
        // Trailing read-only flag is optional.
        Ok(Self {
            protocol_version,
            timeout_ms,
            session_id,
            password,
        })
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Operations the client issues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Create {
        path: String,
        data: Vec<u8>,
        mode: CreateMode,
    },
    Delete {
        path: String,
        version: i32,
    },
    Exists {
        path: String,
        watch: bool,
    },
    GetData {
        path: String,
        watch: bool,
    },
    SetData {
        path: String,
        data: Vec<u8>,
        version: i32,
    },
    GetChildren {
        path: String,
        watch: bool,
    },
}

impl Request {
    pub fn opcode(&self) -> OpCode {
        match self {
            Self::Create { .. } => OpCode::Create,
            Self::Delete { .. } => OpCode::Delete,
            Self::Exists { .. } => OpCode::Exists,
            Self::GetData { .. } => OpCode::GetData,
            Self::SetData { .. } => OpCode::SetData,
            Self::GetChildren { .. } => OpCode::GetChildren,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::Create { path, .. }
            | Self::Delete { path, .. }
            | Self::Exists { path, .. }
            | Self::GetData { path, .. }
            | Self::SetData { path, .. }
            | Self::GetChildren { path, .. } => path,
        }
    }

    /// Encode as a frame with header.
    pub fn encode(&self, xid: i32) -> Bytes {
        let mut w = FrameWriter::new();
        w.i32(xid).i32(self.opcode().code());

        match self {
            Self::Create { path, data, mode } => {
                w.string(path).buffer(Some(data));
                // OPEN_ACL_UNSAFE: a single world:anyone entry
                w.i32(1)
                    .i32(OPEN_ACL_UNSAFE_PERMS)
                    .string("world")
                    .string("anyone");
                w.i32(mode.flags());
            }
            Self::Delete { path, version } => {
                w.string(path).i32(*version);
            }
            Self::Exists { path, watch }
            | Self::GetData { path, watch }
            | Self::GetChildren { path, watch } => {
                w.string(path).bool(*watch);
            }
            Self::SetData {
                path,
                data,
                version,
            } => {
                w.string(path).buffer(Some(data)).i32(*version);
            }
        }
        w.finish()
    }
}

/// Keepalive frame.
pub fn ping() -> Bytes {
    let mut w = FrameWriter::new();
    w.i32(PING_XID).i32(OpCode::Ping.code());
    w.finish()
}

/// Graceful session close.
pub fn close_session(xid: i32) -> Bytes {
    let mut w = FrameWriter::new();
    w.i32(xid).i32(OpCode::CloseSession.code());
    w.finish()
}

// =============================================================================
// Replies
// =============================================================================

/// Header of every server frame after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub xid: i32,
    pub zxid: i64,
    pub err: i32,
}

impl ReplyHeader {
    pub fn decode(r: &mut FrameReader) -> Result<Self> {
        Ok(Self {
            xid: r.i32()?,
            zxid: r.i64()?,
            err: r.i32()?,
        })
    }
}

/// Decoded successful response bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Create(String),
    Delete,
    Stat(Stat),
    Data(Vec<u8>, Stat),
    Children(Vec<String>),
}

impl Response {
    /// Decode the body that follows a successful reply header.
    pub fn decode(opcode: OpCode, r: &mut FrameReader) -> Result<Self> {
        let response = match opcode {
            OpCode::Create => Self::Create(r.string()?),
            OpCode::Delete => Self::Delete,
            OpCode::Exists | OpCode::SetData => Self::Stat(r.stat()?),
            OpCode::GetData => {
                let data = r.buffer()?.unwrap_or_default();
                Self::Data(data, r.stat()?)
            }
            OpCode::GetChildren => Self::Children(r.strings()?),
            OpCode::Ping | OpCode::CloseSession => Self::Delete,
        };
        Ok(response)
    }
}

/// Decode a watch notification body.
pub fn decode_watcher_event(r: &mut FrameReader) -> Result<WatchedEvent> {
    let raw_type = r.i32()?;
    let _state = r.i32()?;
    let path = r.string()?;
    let event_type = EventType::from_code(raw_type)
        .ok_or_else(|| CoordinationError::Codec(format!("unknown event type {raw_type}")))?;
    Ok(WatchedEvent { event_type, path })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(frame: Bytes) -> Bytes {
        let len = i32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
        frame.slice(4..)
    }

    #[test]
    fn test_connect_request_layout() {
        let frame = ConnectRequest::new_session(5000).encode();
        // version + zxid + timeout + session + passwd(len + 16) + readonly
        assert_eq!(frame.len(), 4 + 4 + 8 + 4 + 8 + 4 + 16 + 1);

        let mut r = FrameReader::new(body(frame));
        assert_eq!(r.i32().unwrap(), PROTOCOL_VERSION);
        assert_eq!(r.i64().unwrap(), 0);
        assert_eq!(r.i32().unwrap(), 5000);
        assert_eq!(r.i64().unwrap(), 0);
        assert_eq!(r.buffer().unwrap(), Some(vec![0u8; PASSWORD_LEN]));
        assert!(!r.bool().unwrap());
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_connect_response_decode() {
        let mut w = FrameWriter::new();
        w.i32(0).i32(4000).i64(0x1234).buffer(Some(&[7u8; 16]));
        let response = ConnectResponse::decode(body(w.finish())).unwrap();
        assert_eq!(response.timeout_ms, 4000);
        assert_eq!(response.session_id, 0x1234);
        assert_eq!(response.password, vec![7u8; 16]);
    }

    #[test]
    fn test_get_children_request_layout() {
        let request = Request::GetChildren {
            path: "/nexus/master".to_string(),
            watch: true,
        };
        let mut r = FrameReader::new(body(request.encode(7)));
        assert_eq!(r.i32().unwrap(), 7);
        assert_eq!(r.i32().unwrap(), 8);
        assert_eq!(r.string().unwrap(), "/nexus/master");
        assert!(r.bool().unwrap());
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_create_request_carries_open_acl() {
        let request = Request::Create {
            path: "/s/member_".to_string(),
            data: b"x".to_vec(),
            mode: CreateMode::EphemeralSequential,
        };
        let mut r = FrameReader::new(body(request.encode(1)));
        assert_eq!(r.i32().unwrap(), 1);
        assert_eq!(r.i32().unwrap(), 1);
        assert_eq!(r.string().unwrap(), "/s/member_");
        assert_eq!(r.buffer().unwrap(), Some(b"x".to_vec()));
        assert_eq!(r.i32().unwrap(), 1);
        assert_eq!(r.i32().unwrap(), OPEN_ACL_UNSAFE_PERMS);
        assert_eq!(r.string().unwrap(), "world");
        assert_eq!(r.string().unwrap(), "anyone");
        assert_eq!(r.i32().unwrap(), 3);
    }

    #[test]
    fn test_get_data_response_decode() {
        let mut w = FrameWriter::new();
        w.buffer(Some(b"10.0.0.9:5050"));
        for _ in 0..4 {
            w.i64(1);
        }
        w.i32(2).i32(0).i32(0).i64(0).i32(13).i32(0).i64(1);
        let mut r = FrameReader::new(body(w.finish()));
        match Response::decode(OpCode::GetData, &mut r).unwrap() {
            Response::Data(data, stat) => {
                assert_eq!(data, b"10.0.0.9:5050");
                assert_eq!(stat.version, 2);
                assert_eq!(stat.data_length, 13);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_truncated_frame_is_codec_error() {
        let mut r = FrameReader::new(Bytes::from_static(&[0, 0, 0, 9, b'a']));
        let err = r.string().unwrap_err();
        assert!(matches!(err, CoordinationError::Codec(_)));
    }

    #[test]
    fn test_watcher_event_decode() {
        let mut w = FrameWriter::new();
        w.i32(4).i32(3).string("/nexus/master");
        let mut r = FrameReader::new(body(w.finish()));
        let event = decode_watcher_event(&mut r).unwrap();
        assert_eq!(event.event_type, EventType::NodeChildrenChanged);
        assert_eq!(event.path, "/nexus/master");
    }
}
