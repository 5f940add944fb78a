use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};

use serde_json::Value;
use tokio::net::TcpListener;
use tracing::info;

use crate::{
    client::RpcClient,
    error::RpcError,
    handshake::{HandshakePayload, REGISTER_METHOD, RegisterRequest},
    server::{RpcService, serve},
};

/// Plugin side of the handshake: a listener on an ephemeral loopback port
/// plus what the router told us on stdin.
pub struct Connector {
    id: u32,
    router_addr: SocketAddr,
    listener: TcpListener,
}

impl Connector {
    /// Reads the handshake payload from stdin, then binds.
    pub async fn from_stdin() -> Result<Self, RpcError> {
        let payload = HandshakePayload::read_from(tokio::io::stdin()).await?;
        Self::bind(payload).await
    }

    pub async fn bind(payload: HandshakePayload) -> Result<Self, RpcError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        Ok(Self {
            id: payload.id,
            router_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, payload.port)),
            listener,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RpcError> {
        Ok(self.listener.local_addr()?)
    }

    /// Registers `service` with the router and keeps serving it.
    ///
    /// Requests are answered while registration is still in flight, which is
    /// what lets the router's `Init` callback through. Only returns on error.
    pub async fn serve<S>(self, service: Arc<S>) -> Result<(), RpcError>
    where
        S: RpcService + ?Sized,
    {
        let req = RegisterRequest {
            id: self.id,
            service: service.name().to_string(),
            port: self.local_addr()?.port(),
        };
        let router_addr = self.router_addr;

        let server = serve(self.listener, service);
        tokio::pin!(server);

        let register = async {
            let mut client = RpcClient::connect(router_addr).await?;
            client.call::<_, Value>(REGISTER_METHOD, &req).await?;
            Ok::<_, RpcError>(())
        };

        tokio::select! {
            res = &mut server => return res,
            res = register => res?,
        }
        info!(id = req.id, service = %req.service, port = req.port, "registered with router");

        server.await
    }

    /// `from_stdin` followed by `serve`; the usual body of a plugin's `main`.
    pub async fn listen_and_serve<S: RpcService>(service: S) -> Result<(), RpcError> {
        Self::from_stdin().await?.serve(Arc::new(service)).await
    }
}
