pub mod client;
pub mod connector;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod jsonrpc;
pub mod logging;
pub mod server;

pub use client::RpcClient;
pub use connector::Connector;
pub use error::RpcError;
pub use handshake::{HandshakeError, HandshakePayload, RegisterRequest};
pub use logging::init_plugin_tracing;
pub use server::{RpcService, serve, serve_conn};
