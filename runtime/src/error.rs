use nanobot_mcp_core::RpcError;
use nanobot_mcp_core::hooks::HookParseError;
use nanobot_mcp_core::pending::DuplicateRequestId;
use nanobot_mcp_core::state::StateStoreError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The exchange was one-way; there is nothing to reply with.
    #[error("no response")]
    NoResponse,
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("transport: {0}")]
    Transport(String),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("hook {hook} rejected message: {reason}")]
    HookRejected { hook: String, reason: String },
    #[error(transparent)]
    InvalidHook(#[from] HookParseError),
    #[error(transparent)]
    DuplicateRequestId(#[from] DuplicateRequestId),
    #[error(transparent)]
    Store(#[from] StateStoreError),
    #[error("request cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("session closed")]
    SessionClosed,
    #[error("wire is not initialized")]
    NotInitialized,
    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn transport(msg: impl Into<String>) -> Self {
        Error::Transport(msg.into())
    }

    pub fn is_no_response(&self) -> bool {
        matches!(self, Error::NoResponse)
    }

    /// Maps the error onto the JSON-RPC error object sent back to a peer.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            Error::Rpc(e) => e.clone(),
            other => RpcError::internal(other.to_string()),
        }
    }
}
