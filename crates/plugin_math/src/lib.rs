//! Two tiny arithmetic services, each shipped as its own plugin binary.

use async_trait::async_trait;
use router_plugin::{
    RpcService,
    jsonrpc::{self, from_params},
};
use serde_json::{Value, json};

/// `Add.Three(n)` returns `n + 3`.
#[derive(Debug, Default, Clone)]
pub struct Add;

/// `Mul.Two(n)` returns `n * 2`.
#[derive(Debug, Default, Clone)]
pub struct Mul;

fn number(params: Value) -> Result<i64, jsonrpc::Error> {
    from_params(params)
}

#[async_trait]
impl RpcService for Add {
    fn name(&self) -> &str {
        "Add"
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, jsonrpc::Error> {
        match method {
            "Three" => {
                let n = number(params)?;
                n.checked_add(3)
                    .map(|v| json!(v))
                    .ok_or_else(|| jsonrpc::Error::invalid_params("overflow"))
            }
            other => Err(jsonrpc::Error::method_not_found(other)),
        }
    }
}

#[async_trait]
impl RpcService for Mul {
    fn name(&self) -> &str {
        "Mul"
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, jsonrpc::Error> {
        match method {
            "Two" => {
                let n = number(params)?;
                n.checked_mul(2)
                    .map(|v| json!(v))
                    .ok_or_else(|| jsonrpc::Error::invalid_params("overflow"))
            }
            other => Err(jsonrpc::Error::method_not_found(other)),
        }
    }
}
