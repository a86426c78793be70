//! Ephemeral secp256k1 identities.

use crate::encoding::*;
use crate::*;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// 32 bytes of secp256k1 secret scalar. Overwritten on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; 32]);

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

impl SecretKey {
    /// Wrap raw bytes without validation.
    /// Use [EphemeralIdentity::from_secret] to check them.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse 64 hex characters.
    pub fn from_hex(s: &str) -> Option<Self> {
        hex_decode_fixed::<32>(s).map(Self)
    }

    /// Hex encoding, wiped on drop.
    pub fn to_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex_encode(self.0))
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub(crate) fn to_signing_key(
        &self,
    ) -> Result<k256::schnorr::SigningKey, IdentityError> {
        k256::schnorr::SigningKey::from_bytes(&self.0)
            .map_err(|e| IdentityError::DerivationFailed(e.to_string()))
    }

    pub(crate) fn to_k256(&self) -> Result<k256::SecretKey, IdentityError> {
        k256::SecretKey::from_slice(&self.0)
            .map_err(|e| IdentityError::DerivationFailed(e.to_string()))
    }
}

/// A short-lived client keypair.
#[derive(Clone)]
pub struct EphemeralIdentity {
    secret_key: SecretKey,
    public_key: PublicKey,
}

impl std::fmt::Debug for EphemeralIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralIdentity")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Upper bound on rng draws before giving up. Each draw fails with
/// probability below 2^-127, so hitting this means the rng is broken.
const MAX_DRAWS: usize = 8;

impl EphemeralIdentity {
    /// Draw a fresh keypair from the system rng.
    ///
    /// Draws that are zero or not below the curve order are discarded and
    /// redrawn.
    pub fn generate() -> Result<Self, IdentityError> {
        for _ in 0..MAX_DRAWS {
            let mut bytes = [0_u8; 32];
            getrandom::getrandom(&mut bytes)
                .map_err(|e| IdentityError::DerivationFailed(e.to_string()))?;
            let candidate = SecretKey(bytes);
            bytes.zeroize();
            if k256::SecretKey::from_slice(candidate.as_bytes()).is_err() {
                trace!("rejected out of range secret draw");
                continue;
            }
            return Self::from_secret(candidate);
        }
        Err(IdentityError::DerivationFailed(
            "rng produced no valid scalar".into(),
        ))
    }

    /// Rebuild an identity from a stored secret.
    pub fn from_secret(secret_key: SecretKey) -> Result<Self, IdentityError> {
        let signing = secret_key.to_signing_key()?;
        let mut pk = [0_u8; 32];
        pk.copy_from_slice(&signing.verifying_key().to_bytes());
        Ok(Self {
            secret_key,
            public_key: PublicKey(pk),
        })
    }

    /// The x-only public key.
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// The secret key.
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }
}

/// 32 random bytes, hex encoded. Used for one-time connect secrets.
pub fn random_token() -> Result<Zeroizing<String>, IdentityError> {
    let mut bytes = Zeroizing::new([0_u8; 32]);
    getrandom::getrandom(&mut bytes[..])
        .map_err(|e| IdentityError::DerivationFailed(e.to_string()))?;
    Ok(Zeroizing::new(hex_encode(&bytes[..])))
}
