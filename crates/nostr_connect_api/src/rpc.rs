//! Json rpc payloads carried inside nostr connect envelopes.

use crate::encoding::PublicKey;
use crate::*;

/// `result` value signalling an authentication challenge; the challenge
/// url travels in the `error` field.
pub const AUTH_URL: &str = "auth_url";

/// `result` value confirming a connect request.
pub const ACK: &str = "ack";

/// Remote signer methods.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RpcMethod {
    /// Open a session.
    Connect,
    /// Fetch the user's public key.
    GetPublicKey,
    /// Sign an unsigned event (json text).
    SignEvent,
    /// Liveness check, answered with `pong`.
    Ping,
    /// Legacy encrypt for a third party.
    Nip04Encrypt,
    /// Legacy decrypt from a third party.
    Nip04Decrypt,
    /// Encrypt for a third party.
    Nip44Encrypt,
    /// Decrypt from a third party.
    Nip44Decrypt,
}

impl RpcMethod {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::GetPublicKey => "get_public_key",
            Self::SignEvent => "sign_event",
            Self::Ping => "ping",
            Self::Nip04Encrypt => "nip04_encrypt",
            Self::Nip04Decrypt => "nip04_decrypt",
            Self::Nip44Encrypt => "nip44_encrypt",
            Self::Nip44Decrypt => "nip44_decrypt",
        }
    }
}

impl std::fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RpcMethod {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "connect" => Self::Connect,
            "get_public_key" => Self::GetPublicKey,
            "sign_event" => Self::SignEvent,
            "ping" => Self::Ping,
            "nip04_encrypt" => Self::Nip04Encrypt,
            "nip04_decrypt" => Self::Nip04Decrypt,
            "nip44_encrypt" => Self::Nip44Encrypt,
            "nip44_decrypt" => Self::Nip44Decrypt,
            other => {
                return Err(RpcError::SignerRejected(format!(
                    "unknown method {other}"
                )))
            }
        })
    }
}

/// An outgoing call.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RpcRequest {
    /// Correlation id, unique within a session.
    pub id: String,
    /// Method.
    pub method: RpcMethod,
    /// Positional string parameters.
    pub params: Vec<String>,
}

impl RpcRequest {
    /// Params for `connect`: `[signer, secret?, perms?]`. An empty secret
    /// placeholder is inserted when only perms are given.
    pub fn connect_params(
        signer: &PublicKey,
        secret: Option<&str>,
        perms: Option<&str>,
    ) -> Vec<String> {
        let mut params = vec![signer.to_hex()];
        match (secret, perms) {
            (Some(s), Some(p)) => {
                params.push(s.to_string());
                params.push(p.to_string());
            }
            (Some(s), None) => params.push(s.to_string()),
            (None, Some(p)) => {
                params.push(String::new());
                params.push(p.to_string());
            }
            (None, None) => (),
        }
        params
    }

    /// Json text.
    pub fn to_json(&self) -> String {
        // a struct of strings always serializes
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A reply from the signer.
///
/// Non-string `result` values (e.g. a signed event object) are kept as
/// their json text. An empty `error` is the same as no error.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(from = "RawResponse")]
pub struct RpcResponse {
    /// Correlation id.
    pub id: String,
    /// Result on success.
    pub result: Option<String>,
    /// Error on failure.
    pub error: Option<String>,
}

#[derive(serde::Deserialize)]
struct RawResponse {
    id: String,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

fn value_text(v: Option<serde_json::Value>) -> Option<String> {
    match v? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

impl From<RawResponse> for RpcResponse {
    fn from(r: RawResponse) -> Self {
        Self {
            id: r.id,
            result: value_text(r.result),
            error: value_text(r.error).filter(|e| !e.is_empty()),
        }
    }
}

impl RpcResponse {
    /// A success reply.
    pub fn ok<S: Into<String>>(id: S, result: S) -> Self {
        Self {
            id: id.into(),
            result: Some(result.into()),
            error: None,
        }
    }

    /// A failure reply.
    pub fn err<S: Into<String>>(id: S, error: S) -> Self {
        Self {
            id: id.into(),
            result: None,
            error: Some(error.into()),
        }
    }

    /// Json text.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse json text, `None` if it is not a response (including a
    /// reply carrying neither result nor error).
    pub fn from_json(s: &str) -> Option<Self> {
        let r: Self = serde_json::from_str(s).ok()?;
        if r.result.is_none() && r.error.is_none() {
            return None;
        }
        Some(r)
    }

    /// The challenge url if this is an `auth_url` reply.
    pub fn auth_challenge(&self) -> Option<&str> {
        match (self.result.as_deref(), self.error.as_deref()) {
            (Some(AUTH_URL), Some(url)) => Some(url),
            _ => None,
        }
    }

    /// Split into the result text or the signer's rejection.
    pub fn into_result(self) -> Result<String, RpcError> {
        if let Some(error) = self.error {
            return Err(RpcError::SignerRejected(error));
        }
        Ok(self.result.unwrap_or_default())
    }
}
