//! The two halves of plugin registration.
//!
//! 1. The router writes a [`HandshakePayload`] (`"<registration-port> <id>"`)
//!    to the plugin's stdin and closes it.
//! 2. The plugin calls [`REGISTER_METHOD`] on the registration port with a
//!    [`RegisterRequest`]; the router answers once it has called back
//!    `<service>.Init` on the plugin's own port.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const REGISTRATION_SERVICE: &str = "Registration";
pub const REGISTER_METHOD: &str = "Registration.Register";
/// Method name (without service prefix) of the reciprocal init call.
pub const INIT_METHOD: &str = "Init";

/// Upper bound for the stdin payload. Two decimal numbers and a space.
const MAX_PAYLOAD_LEN: u64 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("handshake: payload is empty")]
    Empty,

    #[error("handshake: missing {0}")]
    Missing(&'static str),

    #[error("handshake: invalid {field} `{value}`")]
    Invalid { field: &'static str, value: String },

    #[error("handshake: unexpected trailing token `{0}`")]
    Trailing(String),

    #[error("handshake: payload longer than {MAX_PAYLOAD_LEN} bytes")]
    TooLong,

    #[error("handshake: reading payload failed: {0}")]
    Io(String),
}

/// What a freshly spawned plugin learns from the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakePayload {
    /// Port of the router's registration listener on the loopback interface.
    pub port: u16,
    /// Id the plugin must quote back when registering.
    pub id: u32,
}

impl HandshakePayload {
    /// Reads the payload until EOF and parses it.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: R) -> Result<Self, HandshakeError> {
        let mut raw = String::new();
        reader
            .take(MAX_PAYLOAD_LEN + 1)
            .read_to_string(&mut raw)
            .await
            .map_err(|e| HandshakeError::Io(e.to_string()))?;
        if raw.len() as u64 > MAX_PAYLOAD_LEN {
            return Err(HandshakeError::TooLong);
        }
        raw.parse()
    }
}

impl FromStr for HandshakePayload {
    type Err = HandshakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split_whitespace();
        let port = tokens.next().ok_or(HandshakeError::Empty)?;
        let id = tokens.next().ok_or(HandshakeError::Missing("id"))?;
        if let Some(extra) = tokens.next() {
            return Err(HandshakeError::Trailing(extra.to_string()));
        }

        let port = port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| HandshakeError::Invalid {
                field: "port",
                value: port.to_string(),
            })?;
        let id = id
            .parse::<u32>()
            .ok()
            .filter(|i| *i != 0)
            .ok_or_else(|| HandshakeError::Invalid {
                field: "id",
                value: id.to_string(),
            })?;

        Ok(Self { port, id })
    }
}

impl fmt::Display for HandshakePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.port, self.id)
    }
}

/// Params of [`REGISTER_METHOD`].
///
/// Missing fields decode to their zero value so that validation reports
/// them instead of the JSON decoder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterRequest {
    pub id: u32,
    pub service: String,
    pub port: u16,
}

impl RegisterRequest {
    pub fn validate(&self) -> Result<(), HandshakeError> {
        if self.id == 0 {
            return Err(HandshakeError::Invalid {
                field: "id",
                value: self.id.to_string(),
            });
        }
        if self.service.is_empty() || self.service.chars().any(char::is_whitespace) {
            return Err(HandshakeError::Invalid {
                field: "service",
                value: self.service.clone(),
            });
        }
        if self.port == 0 {
            return Err(HandshakeError::Invalid {
                field: "port",
                value: self.port.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_port_and_id() {
        let p: HandshakePayload = "40123 7".parse().unwrap();
        assert_eq!(p, HandshakePayload { port: 40123, id: 7 });
        assert_eq!(p.to_string(), "40123 7");

        let p: HandshakePayload = "  40123\t7\n".parse().unwrap();
        assert_eq!(p.id, 7);
    }

    #[test]
    fn rejects_bad_payloads() {
        assert_eq!("".parse::<HandshakePayload>(), Err(HandshakeError::Empty));
        assert_eq!(
            "40123".parse::<HandshakePayload>(),
            Err(HandshakeError::Missing("id"))
        );
        assert!(matches!(
            "0 7".parse::<HandshakePayload>(),
            Err(HandshakeError::Invalid { field: "port", .. })
        ));
        assert!(matches!(
            "70000 7".parse::<HandshakePayload>(),
            Err(HandshakeError::Invalid { field: "port", .. })
        ));
        assert!(matches!(
            "40123 0".parse::<HandshakePayload>(),
            Err(HandshakeError::Invalid { field: "id", .. })
        ));
        assert!(matches!(
            "40123 -1".parse::<HandshakePayload>(),
            Err(HandshakeError::Invalid { field: "id", .. })
        ));
        assert_eq!(
            "40123 7 8".parse::<HandshakePayload>(),
            Err(HandshakeError::Trailing("8".into()))
        );
    }

    #[tokio::test]
    async fn reads_until_eof() {
        let p = HandshakePayload::read_from(&b"5000 12"[..]).await.unwrap();
        assert_eq!(p, HandshakePayload { port: 5000, id: 12 });
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let padded = format!("5000 12{}garbage", " ".repeat(60));
        assert_eq!(
            HandshakePayload::read_from(padded.as_bytes()).await,
            Err(HandshakeError::TooLong)
        );

        // exactly at the limit still parses
        let fits = format!("5000 12{}", " ".repeat(MAX_PAYLOAD_LEN as usize - 7));
        assert_eq!(fits.len() as u64, MAX_PAYLOAD_LEN);
        assert!(HandshakePayload::read_from(fits.as_bytes()).await.is_ok());
    }

    #[test]
    fn register_request_validation() {
        let ok = RegisterRequest {
            id: 1,
            service: "Echo".into(),
            port: 4000,
        };
        assert!(ok.validate().is_ok());

        let missing: RegisterRequest = serde_json::from_str(r#"{"id":1,"port":4000}"#).unwrap();
        assert!(matches!(
            missing.validate(),
            Err(HandshakeError::Invalid { field: "service", .. })
        ));

        let zero_port = RegisterRequest { port: 0, ..ok.clone() };
        assert!(zero_port.validate().is_err());

        let zero_id = RegisterRequest { id: 0, ..ok };
        assert!(zero_id.validate().is_err());
    }
}
