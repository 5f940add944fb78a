use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use router_plugin::{
    RegisterRequest, RpcClient, RpcService,
    handshake::{INIT_METHOD, REGISTRATION_SERVICE},
    jsonrpc::{self, from_params},
    serve,
};
use serde_json::Value;
use tokio::{net::TcpListener, sync::oneshot, task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};

use crate::error::RouterError;

/// A plugin that completed both halves of the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registered {
    pub id: u32,
    pub service: String,
    pub addr: SocketAddr,
    pub version: String,
}

pub type Completion = oneshot::Receiver<Result<Registered, RouterError>>;

/// The `Registration` RPC service plugins call right after launch.
///
/// Every spawned plugin gets a pending slot keyed by its id; a successful
/// `Registration.Register` fills it exactly once.
pub struct Registration {
    addr: SocketAddr,
    init_timeout: Duration,
    pending: DashMap<u32, oneshot::Sender<Result<Registered, RouterError>>>,
}

impl Registration {
    /// Binds the registration listener and starts serving it.
    pub async fn start(
        addr: SocketAddr,
        init_timeout: Duration,
    ) -> Result<(Arc<Self>, JoinHandle<()>), RouterError> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let registration = Arc::new(Self {
            addr,
            init_timeout,
            pending: DashMap::new(),
        });

        let service = registration.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = serve(listener, service).await {
                warn!("registration service stopped: {err}");
            }
        });
        info!(%addr, "registration service listening");
        Ok((registration, task))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Opens the slot for `id`. The receiver resolves once the plugin
    /// registered or failed to.
    pub fn add_pending(&self, id: u32) -> Completion {
        let (tx, rx) = oneshot::channel();
        if self.pending.insert(id, tx).is_some() {
            warn!(id, "replaced an existing pending registration");
        }
        rx
    }

    pub fn remove_pending(&self, id: u32) -> bool {
        self.pending.remove(&id).is_some()
    }

    pub fn is_pending(&self, id: u32) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Resolves the slot for `id` with `err`, if it is still open.
    pub fn fail_pending(&self, id: u32, err: RouterError) -> bool {
        match self.pending.remove(&id) {
            Some((_, tx)) => {
                let _ = tx.send(Err(err));
                true
            }
            None => false,
        }
    }

    /// Handles one `Register` call: validate, call back `<service>.Init`,
    /// then resolve the pending slot with the outcome. The error returned
    /// here is what the plugin sees; the supervisor gets the full one.
    pub async fn register(&self, req: RegisterRequest) -> Result<(), jsonrpc::Error> {
        if let Err(err) = req.validate() {
            return Err(RouterError::IllFormed(err.to_string()).to_rpc());
        }
        if !self.is_pending(req.id) {
            return Err(RouterError::UnknownId(req.id).to_rpc());
        }
        debug!(id = req.id, service = %req.service, port = req.port, "register");

        let outcome = match timeout(self.init_timeout, self.init(&req)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(RouterError::HandshakeTimeout),
        };
        let reply = outcome.as_ref().map(|_| ()).map_err(RouterError::to_rpc);

        match self.pending.remove(&req.id) {
            Some((_, tx)) => {
                if let Err(err) = &outcome {
                    warn!(id = req.id, service = %req.service, "registration failed: {err}");
                }
                if tx.send(outcome).is_err() {
                    debug!(id = req.id, "supervisor stopped waiting for registration");
                }
                reply
            }
            // the slot timed out or was failed while Init was in flight
            None => Err(RouterError::UnknownId(req.id).to_rpc()),
        }
    }

    async fn init(&self, req: &RegisterRequest) -> Result<Registered, RouterError> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, req.port));
        let mut client = RpcClient::connect(addr).await?;
        let method = format!("{}.{INIT_METHOD}", req.service);
        let version: String = client.call(&method, self.addr.to_string()).await?;
        if version.is_empty() {
            return Err(RouterError::EmptyVersion);
        }
        Ok(Registered {
            id: req.id,
            service: req.service.clone(),
            addr,
            version,
        })
    }
}

#[async_trait]
impl RpcService for Registration {
    fn name(&self) -> &str {
        REGISTRATION_SERVICE
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, jsonrpc::Error> {
        match method {
            "Register" => {
                let req: RegisterRequest = from_params(params)?;
                self.register(req).await.map(|()| Value::Null)
            }
            other => Err(jsonrpc::Error::method_not_found(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EMPTY_VERSION, UNKNOWN_ID};
    use router_plugin::{RpcError, handshake::REGISTER_METHOD, jsonrpc::INVALID_PARAMS};
    use serde_json::json;

    struct Versioned(&'static str);

    #[async_trait]
    impl RpcService for Versioned {
        fn name(&self) -> &str {
            "Versioned"
        }

        async fn init(&self, _router_addr: String) -> Result<String, jsonrpc::Error> {
            Ok(self.0.to_string())
        }

        async fn call(&self, method: &str, _params: Value) -> Result<Value, jsonrpc::Error> {
            Err(jsonrpc::Error::method_not_found(method))
        }
    }

    async fn plugin(version: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(serve(listener, Arc::new(Versioned(version))));
        port
    }

    async fn registration() -> Arc<Registration> {
        let (reg, _task) = Registration::start("127.0.0.1:0".parse().unwrap(), Duration::from_secs(5))
            .await
            .unwrap();
        reg
    }

    #[tokio::test]
    async fn completes_pending_slot() {
        let reg = registration().await;
        let done = reg.add_pending(4);
        let port = plugin("0.1.0").await;

        reg.register(RegisterRequest {
            id: 4,
            service: "Versioned".into(),
            port,
        })
        .await
        .unwrap();

        let registered = done.await.unwrap().unwrap();
        assert_eq!(registered.id, 4);
        assert_eq!(registered.version, "0.1.0");
        assert_eq!(registered.addr.port(), port);
        assert!(!reg.is_pending(4));
    }

    #[tokio::test]
    async fn ill_formed_request_leaves_slot_untouched() {
        let reg = registration().await;
        let _done = reg.add_pending(5);

        let err = reg
            .register(RegisterRequest {
                id: 5,
                service: String::new(),
                port: 1234,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
        assert!(reg.is_pending(5));
    }

    #[tokio::test]
    async fn unknown_id_is_rejected() {
        let reg = registration().await;
        let port = plugin("0.1.0").await;
        let err = reg
            .register(RegisterRequest {
                id: 77,
                service: "Versioned".into(),
                port,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, UNKNOWN_ID);
    }

    #[tokio::test]
    async fn empty_version_fails_the_slot() {
        let reg = registration().await;
        let done = reg.add_pending(6);
        let port = plugin("").await;

        let err = reg
            .register(RegisterRequest {
                id: 6,
                service: "Versioned".into(),
                port,
            })
            .await
            .unwrap_err();
        assert_eq!(err.code, EMPTY_VERSION);
        assert!(matches!(done.await.unwrap(), Err(RouterError::EmptyVersion)));
        assert!(!reg.is_pending(6));
    }

    #[tokio::test]
    async fn register_over_the_wire() {
        let reg = registration().await;
        let mut client = RpcClient::connect(reg.addr()).await.unwrap();

        // unknown id
        let port = plugin("1.0.0").await;
        let err = client
            .call::<_, Value>(REGISTER_METHOD, json!({"id": 9, "service": "Versioned", "port": port}))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Remote { code: UNKNOWN_ID, .. }));

        // missing port
        let _done = reg.add_pending(9);
        let err = client
            .call::<_, Value>(REGISTER_METHOD, json!({"id": 9, "service": "Versioned"}))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Remote { code: INVALID_PARAMS, .. }));

        // empty version travels back with its own code
        let _done = reg.add_pending(10);
        let silent = plugin("").await;
        let err = client
            .call::<_, Value>(REGISTER_METHOD, json!({"id": 10, "service": "Versioned", "port": silent}))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Remote { code: EMPTY_VERSION, .. }));

        client
            .call::<_, Value>(REGISTER_METHOD, json!({"id": 9, "service": "Versioned", "port": port}))
            .await
            .unwrap();
    }
}
