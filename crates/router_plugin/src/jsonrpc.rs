//! JSON‑RPC 2.0 core types spoken between the router, its plugins and the
//! callers in front of the router.
//!
//! Messages travel as one JSON document per line (see [`crate::frame`]).
//!
//! ```ignore
//! use serde_json::json;
//! use router_plugin::jsonrpc::{Id, Request};
//!
//! let req = Request::call(Id::Number(1), "Echo.Echo", Some(json!("hi")));
//! let line = serde_json::to_string(&req).unwrap();
//! ```

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Generic failure inside the router (I/O towards a plugin, spawn errors).
pub const SERVER_ERROR: i64 = -32000;
/// No registered plugin serves the requested service.
pub const SERVICE_NOT_FOUND: i64 = -32001;

/// `id` MAY be a string, number or null. We support all forms.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
    Null,
}

/// JSON‑RPC 2.0 Request object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Omitted for *notifications*.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

/// The routing-relevant part of a request.
///
/// Deserializing into this skips `params` entirely, so the router never
/// materialises argument payloads it is only going to forward.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestHeader {
    pub method: String,
    #[serde(default)]
    pub id: Option<Id>,
}

impl RequestHeader {
    /// Service part of `Service.Method`: everything before the last `.`.
    pub fn service(&self) -> Option<&str> {
        split_method(&self.method).map(|(service, _)| service)
    }
}

/// Splits `Service.Method` at the last dot. Both halves must be non-empty.
pub fn split_method(method: &str) -> Option<(&str, &str)> {
    let dot = method.rfind('.')?;
    let (service, name) = (&method[..dot], &method[dot + 1..]);
    if service.is_empty() || name.is_empty() {
        return None;
    }
    Some((service, name))
}

/// JSON‑RPC 2.0 Error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Error {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Error {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn invalid_params(reason: impl std::fmt::Display) -> Self {
        Self::new(INVALID_PARAMS, format!("invalid params: {reason}"))
    }

    pub fn internal(reason: impl std::fmt::Display) -> Self {
        Self::new(INTERNAL_ERROR, reason.to_string())
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for Error {}

/// Decodes call parameters, mapping failures onto `INVALID_PARAMS`.
pub fn from_params<T: DeserializeOwned>(params: Value) -> Result<T, Error> {
    serde_json::from_value(params).map_err(Error::invalid_params)
}

/// JSON‑RPC 2.0 Response object.
/// Exactly one of `result` or `error` **must** be present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
    pub id: Id,
}

impl Request {
    /// Create a *notification* (no response expected).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: None,
        }
    }

    /// Create a *call* expecting a response.
    pub fn call(id: Id, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: Some(id),
        }
    }
}

impl Response {
    pub fn success(id: Id, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn fail(id: Id, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: None,
            error: Some(Error {
                code,
                message: message.into(),
                data,
            }),
            id,
        }
    }

    pub fn from_error(id: Id, error: Error) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: None,
            error: Some(error),
            id,
        }
    }

    /// A missing `result` on success is read as `null`.
    pub fn into_result(self) -> Result<Value, Error> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}
