use thiserror::Error;

use crate::{frame::MAX_FRAME_LEN, handshake::HandshakeError};

/// Failures on a JSON-RPC connection, either side.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("rpc: i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rpc: malformed message: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rpc: frame exceeds {MAX_FRAME_LEN} bytes")]
    FrameTooLarge,

    #[error("rpc: connection closed")]
    Closed,

    #[error("rpc: remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("rpc: {0}")]
    Protocol(String),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),
}

impl From<crate::jsonrpc::Error> for RpcError {
    fn from(err: crate::jsonrpc::Error) -> Self {
        RpcError::Remote {
            code: err.code,
            message: err.message,
        }
    }
}
