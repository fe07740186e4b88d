//! Error types for coordination service operations.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = CoordinationError> = std::result::Result<T, E>;

/// Server-reported error codes from the ZooKeeper protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    SystemError,
    RuntimeInconsistency,
    DataInconsistency,
    ConnectionLoss,
    MarshallingError,
    Unimplemented,
    OperationTimeout,
    BadArguments,
    NoNode,
    NoAuth,
    BadVersion,
    NoChildrenForEphemerals,
    NodeExists,
    NotEmpty,
    SessionExpired,
    InvalidAcl,
    AuthFailed,
    Other(i32),
}

impl ErrorCode {
    /// Map a raw protocol error code. Returns `None` for `0` (success).
    pub fn from_code(code: i32) -> Option<Self> {
        let code = match code {
            0 => return None,
            -1 => Self::SystemError,
            -2 => Self::RuntimeInconsistency,
            -3 => Self::DataInconsistency,
            -4 => Self::ConnectionLoss,
            -5 => Self::MarshallingError,
            -6 => Self::Unimplemented,
            -7 => Self::OperationTimeout,
            -8 => Self::BadArguments,
            -101 => Self::NoNode,
            -102 => Self::NoAuth,
            -103 => Self::BadVersion,
            -108 => Self::NoChildrenForEphemerals,
            -110 => Self::NodeExists,
            -111 => Self::NotEmpty,
            -112 => Self::SessionExpired,
            -114 => Self::InvalidAcl,
            -115 => Self::AuthFailed,
            other => Self::Other(other),
        };
        Some(code)
    }

    /// Raw protocol value.
    pub fn code(&self) -> i32 {
        match self {
            Self::SystemError => -1,
            Self::RuntimeInconsistency => -2,
            Self::DataInconsistency => -3,
            Self::ConnectionLoss => -4,
            Self::MarshallingError => -5,
            Self::Unimplemented => -6,
            Self::OperationTimeout => -7,
            Self::BadArguments => -8,
            Self::NoNode => -101,
            Self::NoAuth => -102,
            Self::BadVersion => -103,
            Self::NoChildrenForEphemerals => -108,
            Self::NodeExists => -110,
            Self::NotEmpty => -111,
            Self::SessionExpired => -112,
            Self::InvalidAcl => -114,
            Self::AuthFailed => -115,
            Self::Other(code) => *code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Other(code) => write!(f, "error code {code}"),
            named => write!(f, "{named:?} ({})", named.code()),
        }
    }
}

/// Broad classification of a coordination failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport or session failure.
    Connection,
    /// The service answered, but the read or write could not be carried out.
    Protocol,
    /// A blocking wait was abandoned before a reply arrived.
    Interrupted,
}

/// Errors from coordination service operations.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// No endpoint accepted a session.
    #[error("failed to connect to coordination service {endpoints:?}: {reason}")]
    Connect {
        endpoints: Vec<String>,
        reason: String,
    },

    /// The session's connection dropped while a request was in flight.
    #[error("connection to coordination service lost")]
    ConnectionLoss,

    /// The service refused to renew the session.
    #[error("coordination session expired")]
    SessionExpired,

    /// No reply within the session timeout.
    #[error("coordination request timed out after {0:?}")]
    Timeout(Duration),

    /// The service rejected the request.
    #[error("{code} at {path}")]
    Server { code: ErrorCode, path: String },

    /// A frame could not be decoded.
    #[error("malformed coordination frame: {0}")]
    Codec(String),

    /// A watch could not be armed.
    #[error("failed to watch {path}: {source}")]
    Watch {
        path: String,
        #[source]
        source: Box<CoordinationError>,
    },

    /// The reply channel was dropped before an answer arrived.
    #[error("coordination request interrupted")]
    Interrupted,

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoordinationError {
    /// Build a server error for `path`.
    pub fn server(code: ErrorCode, path: impl Into<String>) -> Self {
        Self::Server {
            code,
            path: path.into(),
        }
    }

    /// Wrap an error raised while arming a watch on `path`.
    pub fn watch(path: impl Into<String>, source: CoordinationError) -> Self {
        Self::Watch {
            path: path.into(),
            source: Box::new(source),
        }
    }

    /// Classify the failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connect { .. }
            | Self::ConnectionLoss
            | Self::SessionExpired
            | Self::Timeout(_)
            | Self::Io(_) => ErrorKind::Connection,
            Self::Server { code, .. } => match code {
                ErrorCode::ConnectionLoss
                | ErrorCode::SessionExpired
                | ErrorCode::OperationTimeout => ErrorKind::Connection,
                _ => ErrorKind::Protocol,
            },
            Self::Codec(_) | Self::Watch { .. } => ErrorKind::Protocol,
            Self::Interrupted => ErrorKind::Interrupted,
        }
    }

    /// Server error code, if the service rejected the request.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// True if the addressed node does not exist.
    pub fn is_no_node(&self) -> bool {
        self.code() == Some(ErrorCode::NoNode)
    }

    /// True if the node being created already exists.
    pub fn is_node_exists(&self) -> bool {
        self.code() == Some(ErrorCode::NodeExists)
    }

    /// Standardized reason code for logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect_failed",
            Self::ConnectionLoss => "connection_loss",
            Self::SessionExpired => "session_expired",
            Self::Timeout(_) => "timeout",
            Self::Server { .. } => "server_error",
            Self::Codec(_) => "codec_error",
            Self::Watch { .. } => "watch_failed",
            Self::Interrupted => "interrupted",
            Self::Io(_) => "io_error",
        }
    }
}
