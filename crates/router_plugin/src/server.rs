use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
};
use tracing::{debug, warn};

use crate::{
    error::RpcError,
    frame::{is_blank, read_frame, write_frame},
    handshake::INIT_METHOD,
    jsonrpc::{self, Id, PARSE_ERROR, Request, Response, from_params, split_method},
};

/// Version reported by services that do not override [`RpcService::init`].
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A named receiver of `Service.Method` calls.
///
/// Plugins implement this for their service; the router implements it for
/// its registration endpoint.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    /// Prefix callers use to reach this service, e.g. `Echo`.
    fn name(&self) -> &str;

    /// Reciprocal half of the handshake. `router_addr` is the address of
    /// the registration service; the returned string is the plugin version
    /// and must not be empty.
    async fn init(&self, router_addr: String) -> Result<String, jsonrpc::Error> {
        debug!(service = self.name(), %router_addr, "init");
        Ok(VERSION.to_string())
    }

    /// Handles `method` (without the service prefix).
    async fn call(&self, method: &str, params: Value) -> Result<Value, jsonrpc::Error>;
}

/// Accepts connections forever, one task per connection.
pub async fn serve<S>(listener: TcpListener, service: Arc<S>) -> Result<(), RpcError>
where
    S: RpcService + ?Sized,
{
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let service = service.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_conn(stream, service).await {
                        debug!(%peer, "connection ended: {err}");
                    }
                });
            }
            Err(err) => warn!("accept failed: {err}"),
        }
    }
}

/// Answers requests on `stream` until the peer hangs up.
pub async fn serve_conn<S>(stream: TcpStream, service: Arc<S>) -> Result<(), RpcError>
where
    S: RpcService + ?Sized,
{
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::with_capacity(1024);

    loop {
        buf.clear();
        if read_frame(&mut reader, &mut buf).await? == 0 {
            return Ok(());
        }
        if is_blank(&buf) {
            continue;
        }

        let response = match serde_json::from_slice::<Request>(&buf) {
            Ok(req) => dispatch(&*service, req).await,
            Err(err) => Some(Response::fail(
                Id::Null,
                PARSE_ERROR,
                "Parse error",
                Some(json!(err.to_string())),
            )),
        };
        if let Some(response) = response {
            write_frame(&mut writer, &response).await?;
        }
    }
}

/// Runs one request against `service`. Notifications produce no response.
pub async fn dispatch<S>(service: &S, req: Request) -> Option<Response>
where
    S: RpcService + ?Sized,
{
    let params = req.params.unwrap_or(Value::Null);
    let result = match split_method(&req.method) {
        Some((name, method)) if name == service.name() => {
            if method == INIT_METHOD {
                match from_params::<String>(params) {
                    Ok(addr) => service.init(addr).await.map(Value::String),
                    Err(err) => Err(err),
                }
            } else {
                service.call(method, params).await
            }
        }
        _ => Err(jsonrpc::Error::method_not_found(&req.method)),
    };

    let id = req.id?;
    Some(match result {
        Ok(value) => Response::success(id, value),
        Err(err) => Response::from_error(id, err),
    })
}
