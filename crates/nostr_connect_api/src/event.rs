//! Signed transport envelopes and subscription filters.

use crate::encoding::*;
use crate::identity::EphemeralIdentity;
use crate::*;
use k256::schnorr::signature::hazmat::{PrehashSigner, PrehashVerifier};
use sha2::{Digest, Sha256};

/// Event kind carrying nostr connect rpc traffic.
pub const KIND_NOSTR_CONNECT: u16 = 24133;

/// A signed relay event.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SignedEnvelope {
    /// Hex sha256 of the canonical serialization.
    pub id: String,
    /// Author.
    pub pubkey: PublicKey,
    /// Unix seconds.
    pub created_at: u64,
    /// Event kind.
    pub kind: u16,
    /// Tags, e.g. `[["p", "<hex>"]]`.
    pub tags: Vec<Vec<String>>,
    /// Opaque (here: encrypted) content.
    pub content: String,
    /// Hex bip-340 signature over `id`.
    pub sig: String,
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Sha256 over `[0,pubkey,created_at,kind,tags,content]`.
pub fn compute_id(
    pubkey: &PublicKey,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> [u8; 32] {
    let canonical = serde_json::json!([
        0,
        pubkey.to_hex(),
        created_at,
        kind,
        tags,
        content
    ]);
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hasher.finalize().into()
}

impl SignedEnvelope {
    /// Build and sign an envelope authored by `identity`.
    pub fn sign(
        identity: &EphemeralIdentity,
        kind: u16,
        tags: Vec<Vec<String>>,
        content: String,
    ) -> Result<Self, IdentityError> {
        let pubkey = identity.public_key();
        let created_at = now_secs();
        let id = compute_id(&pubkey, created_at, kind, &tags, &content);
        let sig: k256::schnorr::Signature = identity
            .secret_key()
            .to_signing_key()?
            .sign_prehash(&id)
            .map_err(|e| IdentityError::DerivationFailed(e.to_string()))?;

        Ok(Self {
            id: hex_encode(id),
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig: hex_encode(sig.to_bytes()),
        })
    }

    /// A nostr connect envelope addressed to `to`.
    pub fn nostr_connect(
        identity: &EphemeralIdentity,
        to: &PublicKey,
        content: String,
    ) -> Result<Self, IdentityError> {
        Self::sign(
            identity,
            KIND_NOSTR_CONNECT,
            vec![vec!["p".to_string(), to.to_hex()]],
            content,
        )
    }

    /// Check the id and signature.
    pub fn verify(&self) -> Result<(), CryptoError> {
        let id = compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        if hex_decode_fixed::<32>(&self.id) != Some(id) {
            return Err(CryptoError::Malformed("event id mismatch".into()));
        }
        let sig = hex_decode_fixed::<64>(&self.sig)
            .ok_or_else(|| CryptoError::Malformed("signature hex".into()))?;
        let sig = k256::schnorr::Signature::try_from(&sig[..])
            .map_err(|_| CryptoError::Malformed("signature encoding".into()))?;
        let vk =
            k256::schnorr::VerifyingKey::from_bytes(self.pubkey.as_bytes())
                .map_err(|_| {
                    CryptoError::InvalidPublicKey(self.pubkey.to_hex())
                })?;
        vk.verify_prehash(&id, &sig)
            .map_err(|_| CryptoError::AuthenticationFailed)
    }

    /// Pubkeys named by `p` tags.
    pub fn p_tags(&self) -> impl Iterator<Item = PublicKey> + '_ {
        self.tags.iter().filter_map(|t| match t.as_slice() {
            [name, value, ..] if name == "p" => PublicKey::from_hex(value),
            _ => None,
        })
    }
}

/// A relay subscription filter.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
pub struct Filter {
    /// Accepted kinds.
    pub kinds: Vec<u16>,
    /// Accepted authors, any author if `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<PublicKey>>,
    /// The envelope must `p` tag one of these.
    #[serde(rename = "#p", default, skip_serializing_if = "Vec::is_empty")]
    pub p: Vec<PublicKey>,
    /// Only envelopes created at or after this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
}

impl Filter {
    /// Nostr connect traffic addressed to `client`.
    pub fn nostr_connect(client: PublicKey) -> Self {
        Self {
            kinds: vec![KIND_NOSTR_CONNECT],
            authors: None,
            p: vec![client],
            since: None,
        }
    }

    /// Restrict to a single author.
    pub fn with_author(mut self, author: PublicKey) -> Self {
        self.authors = Some(vec![author]);
        self
    }

    /// Restrict by creation time.
    pub fn with_since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    /// True if `env` passes every constraint.
    pub fn matches(&self, env: &SignedEnvelope) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&env.kind) {
            return false;
        }
        if let Some(authors) = &self.authors {
            if !authors.contains(&env.pubkey) {
                return false;
            }
        }
        if !self.p.is_empty() && !env.p_tags().any(|p| self.p.contains(&p)) {
            return false;
        }
        if let Some(since) = self.since {
            if env.created_at < since {
                return false;
            }
        }
        true
    }
}
