use std::sync::Arc;

use router_plugin::{
    RpcError,
    frame::{is_blank, read_frame, write_frame},
    jsonrpc::{INVALID_REQUEST, Id, PARSE_ERROR, RequestHeader, Response, SERVER_ERROR},
};
use serde_json::json;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
};
use tracing::{debug, warn};

use crate::{error::RouterError, plugin::Control};

/// Front door for callers: reads `Service.Method` requests and relays each
/// one, byte for byte, to the plugin registered for `Service`.
pub struct Router {
    control: Arc<Control>,
}

impl Router {
    pub fn new(control: Arc<Control>) -> Self {
        Self { control }
    }

    /// Accepts callers until the task is dropped.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let router = self.clone();
                    tokio::spawn(async move {
                        match router.route_conn(stream).await {
                            Ok(()) => debug!(%peer, "caller disconnected"),
                            Err(err) => warn!(%peer, "connection terminated: {err}"),
                        }
                    });
                }
                Err(err) => warn!("accept failed: {err}"),
            }
        }
    }

    /// Serves one caller connection until it closes or a request cannot be
    /// routed. Routing failures are answered with an error response before
    /// the connection is dropped.
    pub async fn route_conn(&self, stream: TcpStream) -> Result<(), RouterError> {
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut buf = Vec::with_capacity(4096);

        loop {
            buf.clear();
            if read_frame(&mut reader, &mut buf).await? == 0 {
                return Ok(());
            }
            if is_blank(&buf) {
                continue;
            }

            let header: RequestHeader = match serde_json::from_slice(&buf) {
                Ok(header) => header,
                Err(err) => {
                    let resp = Response::fail(
                        Id::Null,
                        PARSE_ERROR,
                        "Parse error",
                        Some(json!(err.to_string())),
                    );
                    reply(&mut writer, &resp).await;
                    return Err(RpcError::Json(err).into());
                }
            };
            let id = header.id.clone().unwrap_or(Id::Null);

            let Some(service) = header.service() else {
                let err = RouterError::IllFormed(format!(
                    "service/method request ill-formed: {:?}",
                    header.method
                ));
                reply(&mut writer, &Response::fail(id, INVALID_REQUEST, err.to_string(), None)).await;
                return Err(err);
            };

            let backend = match self.control.dial(service).await {
                Ok(backend) => backend,
                Err(err) => {
                    reply(&mut writer, &Response::from_error(id, err.to_rpc())).await;
                    return Err(err);
                }
            };

            if let Err(err) = self.relay(backend, &mut buf, header.id.is_some(), &mut writer).await {
                let resp = Response::fail(id, SERVER_ERROR, err.to_string(), None);
                reply(&mut writer, &resp).await;
                return Err(err);
            }
        }
    }

    /// Sends the request frame in `buf` to `backend` and, for calls, copies
    /// the single response frame back to the caller.
    async fn relay(
        &self,
        mut backend: TcpStream,
        buf: &mut Vec<u8>,
        expects_reply: bool,
        caller: &mut OwnedWriteHalf,
    ) -> Result<(), RouterError> {
        backend.write_all(buf).await?;
        backend.flush().await?;
        if !expects_reply {
            return Ok(());
        }

        let mut backend = BufReader::new(backend);
        loop {
            buf.clear();
            if read_frame(&mut backend, buf).await? == 0 {
                return Err(RpcError::Closed.into());
            }
            if !is_blank(buf) {
                break;
            }
        }
        caller.write_all(buf).await?;
        caller.flush().await?;
        Ok(())
    }
}

async fn reply(writer: &mut OwnedWriteHalf, resp: &Response) {
    if let Err(err) = write_frame(writer, resp).await {
        debug!("could not deliver error response: {err}");
    }
}
