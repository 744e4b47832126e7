use thiserror::Error;

use crate::NodeId;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Numeric error codes understood by every participant of the substrate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[derive(serde::Deserialize, serde::Serialize)]
#[serde(from = "u32", into = "u32")]
pub enum ErrorCode {
    Timeout,
    NodeNotFound,
    NotSupported,
    TemporarilyUnavailable,
    MalformedRequest,
    Crash,
    Abort,
    KeyDoesNotExist,
    KeyAlreadyExists,
    PreconditionFailed,
    TxnConflict,
    Other(u32),
}

impl ErrorCode {
    pub fn code(self) -> u32 {
        self.into()
    }
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> Self {
        match code {
            0 => ErrorCode::Timeout,
            1 => ErrorCode::NodeNotFound,
            10 => ErrorCode::NotSupported,
            11 => ErrorCode::TemporarilyUnavailable,
            12 => ErrorCode::MalformedRequest,
            13 => ErrorCode::Crash,
            14 => ErrorCode::Abort,
            20 => ErrorCode::KeyDoesNotExist,
            21 => ErrorCode::KeyAlreadyExists,
            22 => ErrorCode::PreconditionFailed,
            30 => ErrorCode::TxnConflict,
            other => ErrorCode::Other(other),
        }
    }
}

impl From<ErrorCode> for u32 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Timeout => 0,
            ErrorCode::NodeNotFound => 1,
            ErrorCode::NotSupported => 10,
            ErrorCode::TemporarilyUnavailable => 11,
            ErrorCode::MalformedRequest => 12,
            ErrorCode::Crash => 13,
            ErrorCode::Abort => 14,
            ErrorCode::KeyDoesNotExist => 20,
            ErrorCode::KeyAlreadyExists => 21,
            ErrorCode::PreconditionFailed => 22,
            ErrorCode::TxnConflict => 30,
            ErrorCode::Other(other) => other,
        }
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct IoError(String, #[source] std::io::Error);

impl IoError {
    pub(crate) fn new(context: impl Into<String>, source: std::io::Error) -> Self {
        Self(context.into(), source)
    }
}

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("executor rejected task")]
    Rejected(#[source] BoxError),
}

/// A request/reply exchange with a peer failed.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("no reply before the deadline")]
    Timeout,

    #[error("node `{0}` is unknown")]
    Unreachable(NodeId),

    #[error("node id is not yet known")]
    Uninitialized,

    #[error("communicator is shut down")]
    ShutDown,

    #[error("node is temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error")]
    Io(#[from] IoError),
}

/// An operation against a key-value service failed.
#[derive(Debug, Error)]
pub enum KvError {
    #[error("key does not exist")]
    NotFound,

    #[error("precondition failed")]
    PreconditionFailed,

    #[error("key-value service did not answer in time")]
    Timeout,

    #[error("key-value service rejected request: {text} ({code:?})")]
    Rejected { code: ErrorCode, text: String },

    #[error("unexpected reply of kind `{0}`")]
    Unexpected(String),

    #[error("key `{key}` holds invalid value {value}")]
    Corrupt { key: String, value: i64 },

    #[error("key-value service unreachable")]
    Rpc(#[source] RpcError),
}

impl KvError {
    /// Timeouts may be retried; whether the operation took effect is unknown.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            KvError::Timeout
                | KvError::Rejected {
                    code: ErrorCode::TemporarilyUnavailable,
                    ..
                }
        )
    }
}

impl From<RpcError> for KvError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Timeout => KvError::Timeout,
            other => KvError::Rpc(other),
        }
    }
}

/// A request could not be answered with a regular reply.
///
/// Each variant is turned into an `error` reply carrying [`Self::code`].
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("request of kind `{0}` is not supported")]
    NotSupported(String),

    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("key-value service failed")]
    Store(#[from] KvError),
}

impl RequestError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RequestError::Malformed(_) => ErrorCode::MalformedRequest,
            RequestError::NotSupported(_) => ErrorCode::NotSupported,
            RequestError::Unavailable(_) => ErrorCode::TemporarilyUnavailable,
            RequestError::Store(KvError::NotFound) => ErrorCode::KeyDoesNotExist,
            RequestError::Store(KvError::PreconditionFailed) => ErrorCode::PreconditionFailed,
            RequestError::Store(KvError::Rejected { code, .. }) => *code,
            RequestError::Store(KvError::Timeout) => ErrorCode::Timeout,
            RequestError::Store(_) => ErrorCode::TemporarilyUnavailable,
        }
    }
}

impl From<std::convert::Infallible> for RequestError {
    fn from(never: std::convert::Infallible) -> Self {
        match never {}
    }
}
