//! Established sessions and the encrypted channel they carry.

use crate::encoding::*;
use crate::envelope::{self, SharedSecret};
use crate::event::SignedEnvelope;
use crate::identity::{EphemeralIdentity, SecretKey};
use crate::uri::BunkerUri;
use crate::*;

/// The durable unit of state: everything needed to talk to the signer
/// again after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// The signer's communication key (author of its responses).
    pub signer_pubkey: PublicKey,
    /// Our ephemeral secret for this session.
    pub client_secret: SecretKey,
    /// Relays both sides use, in order.
    pub relays: Vec<RelayUrl>,
    /// True once the handshake completed.
    pub established: bool,
    /// The user's identity key, once learned via `get_public_key`.
    pub user_pubkey: Option<PublicKey>,
}

impl Session {
    /// An established session.
    pub fn new(
        signer_pubkey: PublicKey,
        client_secret: SecretKey,
        relays: Vec<RelayUrl>,
    ) -> Self {
        Self {
            signer_pubkey,
            client_secret,
            relays,
            established: true,
            user_pubkey: None,
        }
    }

    /// Rebuild the encrypted channel to the signer.
    pub fn open_channel(&self) -> Result<SecureChannel, EngineError> {
        let identity =
            EphemeralIdentity::from_secret(self.client_secret.clone())?;
        Ok(SecureChannel::new(identity, self.signer_pubkey)?)
    }

    /// The client's public key for this session.
    pub fn client_pubkey(&self) -> Result<PublicKey, IdentityError> {
        EphemeralIdentity::from_secret(self.client_secret.clone())
            .map(|id| id.public_key())
    }

    /// A `bunker://` uri reaching the same signer (without a secret).
    pub fn bunker_uri(&self) -> BunkerUri {
        BunkerUri {
            signer_pubkey: self.signer_pubkey,
            relays: self.relays.clone(),
            connect_secret: None,
        }
    }
}

/// Our identity paired with a known peer, plus the derived shared secret.
///
/// The shared secret never leaves this type.
#[derive(Clone)]
pub struct SecureChannel {
    identity: EphemeralIdentity,
    peer: PublicKey,
    secret: SharedSecret,
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("client", &self.identity.public_key())
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

impl SecureChannel {
    /// Derive the channel between `identity` and `peer`.
    pub fn new(
        identity: EphemeralIdentity,
        peer: PublicKey,
    ) -> Result<Self, CryptoError> {
        let secret = envelope::shared_secret(identity.secret_key(), &peer)?;
        Ok(Self {
            identity,
            peer,
            secret,
        })
    }

    /// Our identity.
    pub fn identity(&self) -> &EphemeralIdentity {
        &self.identity
    }

    /// The peer's public key.
    pub fn peer(&self) -> PublicKey {
        self.peer
    }

    /// Encrypt `plaintext` and wrap it in a signed envelope for the peer.
    pub fn seal(&self, plaintext: &str) -> Result<SignedEnvelope, EngineError> {
        let content = envelope::encrypt(&self.secret, plaintext)?;
        Ok(SignedEnvelope::nostr_connect(
            &self.identity,
            &self.peer,
            content,
        )?)
    }

    /// Decrypt an envelope authored by the peer.
    pub fn open(
        &self,
        env: &SignedEnvelope,
        accept_legacy: bool,
    ) -> Result<String, CryptoError> {
        if env.pubkey != self.peer {
            return Err(CryptoError::Malformed(format!(
                "envelope author {} is not the session peer",
                env.pubkey
            )));
        }
        envelope::decrypt_any(&self.secret, &env.content, accept_legacy)
    }
}
