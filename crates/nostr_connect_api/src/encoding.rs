//! Helper types for dealing with serialization.
//!
//! Every hex and relay-url conversion in the crate goes through here.

use crate::*;
use std::sync::Arc;

/// Decode exactly `N` bytes of hex (either case).
pub fn hex_decode_fixed<const N: usize>(s: &str) -> Option<[u8; N]> {
    if s.len() != N * 2 {
        return None;
    }
    let mut out = [0; N];
    hex::decode_to_slice(s, &mut out).ok()?;
    Some(out)
}

/// Lowercase hex encoding.
pub fn hex_encode<B: AsRef<[u8]>>(b: B) -> String {
    hex::encode(b)
}

/// A 32-byte x-only secp256k1 public key.
///
/// Construction only checks the length and hex alphabet. Whether the bytes
/// lie on the curve is checked when the key is used for ecdh or
/// verification.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    /// Parse 64 hex characters.
    pub fn from_hex(s: &str) -> Option<Self> {
        hex_decode_fixed::<32>(s).map(Self)
    }

    /// Lowercase hex.
    pub fn to_hex(&self) -> String {
        hex_encode(self.0)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PublicKey").field(&self.to_hex()).finish()
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::str::FromStr for PublicKey {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s).ok_or_else(|| {
            UriError::Malformed(format!("expected 64 hex pubkey, got {s:?}"))
        })
    }
}

impl From<[u8; 32]> for PublicKey {
    fn from(b: [u8; 32]) -> Self {
        Self(b)
    }
}

impl serde::Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let tmp: String = serde::Deserialize::deserialize(deserializer)?;
        Self::from_hex(&tmp)
            .ok_or_else(|| serde::de::Error::custom("invalid pubkey hex"))
    }
}

/// A websocket relay url (`ws://` or `wss://`).
///
/// The caller's text is kept verbatim so uris round trip byte for byte.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelayUrl(Arc<str>);

impl RelayUrl {
    /// Validate a relay url.
    pub fn parse(s: &str) -> Result<Self, UriError> {
        let url = url::Url::parse(s).map_err(|e| {
            UriError::Malformed(format!("invalid relay url {s:?}: {e}"))
        })?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self(s.into())),
            other => Err(UriError::Malformed(format!(
                "relay url {s:?} has non websocket scheme {other:?}"
            ))),
        }
    }

    /// The url text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for RelayUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RelayUrl").field(&&*self.0).finish()
    }
}

impl std::fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for RelayUrl {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::ops::Deref for RelayUrl {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl serde::Serialize for RelayUrl {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for RelayUrl {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let tmp: String = serde::Deserialize::deserialize(deserializer)?;
        Self::parse(&tmp).map_err(serde::de::Error::custom)
    }
}
