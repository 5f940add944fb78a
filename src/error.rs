use std::path::PathBuf;

use router_plugin::{
    RpcError,
    jsonrpc::{self, INVALID_PARAMS, SERVER_ERROR, SERVICE_NOT_FOUND},
};
use thiserror::Error;

pub const UNKNOWN_ID: i64 = -32003;
pub const HANDSHAKE_TIMEOUT: i64 = -32004;
pub const DUPLICATE_SERVICE: i64 = -32005;
pub const EMPTY_VERSION: i64 = -32006;
pub const PLUGIN_EXITED: i64 = -32007;
pub const NOT_RUNNING: i64 = -32008;
pub const RESTART_LIMIT: i64 = -32009;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("router: request ill-formed: {0}")]
    IllFormed(String),

    #[error("router: no plugin is awaiting registration with id {0}")]
    UnknownId(u32),

    #[error("router: awaiting registration to complete has timed out")]
    HandshakeTimeout,

    #[error("router: service {0:?} is already registered")]
    DuplicateService(String),

    #[error("router: can't find service {0:?}")]
    ServiceNotFound(String),

    #[error("router: plugin reported an empty version")]
    EmptyVersion,

    #[error("router: plugin exited before completing registration: {0}")]
    PluginExited(String),

    #[error("router: no plugin is running with id {0}")]
    NotRunning(u32),

    #[error("router: {} restarted too often, giving up", .0.display())]
    RestartLimit(PathBuf),

    #[error("router: failed to start {}: {source}", .exe.display())]
    Spawn {
        exe: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("router: i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl RouterError {
    /// JSON-RPC error code reported to callers.
    pub fn code(&self) -> i64 {
        match self {
            RouterError::IllFormed(_) => INVALID_PARAMS,
            RouterError::UnknownId(_) => UNKNOWN_ID,
            RouterError::HandshakeTimeout => HANDSHAKE_TIMEOUT,
            RouterError::DuplicateService(_) => DUPLICATE_SERVICE,
            RouterError::ServiceNotFound(_) => SERVICE_NOT_FOUND,
            RouterError::EmptyVersion => EMPTY_VERSION,
            RouterError::PluginExited(_) => PLUGIN_EXITED,
            RouterError::NotRunning(_) => NOT_RUNNING,
            RouterError::RestartLimit(_) => RESTART_LIMIT,
            RouterError::Spawn { .. } | RouterError::Io(_) | RouterError::Rpc(_) => SERVER_ERROR,
        }
    }

    pub fn to_rpc(&self) -> jsonrpc::Error {
        jsonrpc::Error::new(self.code(), self.to_string())
    }
}
