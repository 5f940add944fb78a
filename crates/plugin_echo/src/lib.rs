use async_trait::async_trait;
use router_plugin::{
    RpcService,
    jsonrpc::{self, from_params},
};
use serde_json::{Value, json};
use tracing::info;

/// `Echo.Echo(s)` returns `s`.
#[derive(Debug, Default, Clone)]
pub struct Echo;

#[async_trait]
impl RpcService for Echo {
    fn name(&self) -> &str {
        "Echo"
    }

    async fn init(&self, router_addr: String) -> Result<String, jsonrpc::Error> {
        info!("[echo] initialised, router at {router_addr}");
        Ok(env!("CARGO_PKG_VERSION").to_string())
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, jsonrpc::Error> {
        match method {
            "Echo" => {
                let text: String = from_params(params)?;
                Ok(json!(text))
            }
            other => Err(jsonrpc::Error::method_not_found(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_strings_only() {
        assert_eq!(Echo.call("Echo", json!("hi")).await.unwrap(), json!("hi"));
        assert!(Echo.call("Echo", json!(5)).await.is_err());
        assert!(Echo.call("Shout", json!("hi")).await.is_err());
        assert!(!Echo.init("127.0.0.1:1".into()).await.unwrap().is_empty());
    }
}
