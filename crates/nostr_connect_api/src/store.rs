//! Persisting session material through an external credential store.

use crate::encoding::*;
use crate::identity::SecretKey;
use crate::session::Session;
use crate::*;
use futures::future::BoxFuture;
use std::sync::Arc;

/// Key holding the hex client secret.
pub const KEY_CLIENT_SECRET: &str = "nip46-client-secret";

/// Key holding the hex signer communication pubkey.
pub const KEY_SIGNER_PUBKEY: &str = "nip46-signer-pubkey";

/// Key holding the json array of relay urls.
pub const KEY_RELAYS: &str = "nip46-relays";

/// Key holding the hex user pubkey, if known.
pub const KEY_USER_PUBKEY: &str = "nip46-user-pubkey";

/// Traits related to CredentialStore. Unless you're writing a new
/// implementation, you probably don't need these.
pub mod traits {
    use super::*;

    /// Defines a secret-at-rest key value backend.
    pub trait AsCredentialStore: 'static + Send + Sync {
        /// Read a value.
        fn get(
            &self,
            key: &'static str,
        ) -> BoxFuture<'static, Result<Option<String>, SessionError>>;

        /// Write a value, replacing any previous one.
        fn set(
            &self,
            key: &'static str,
            value: String,
        ) -> BoxFuture<'static, Result<(), SessionError>>;

        /// Remove a value. Removing an absent key is not an error.
        fn delete(
            &self,
            key: &'static str,
        ) -> BoxFuture<'static, Result<(), SessionError>>;
    }
}
use traits::*;

/// Concrete credential store handle.
#[derive(Clone)]
pub struct CredentialStore(pub Arc<dyn AsCredentialStore>);

impl CredentialStore {
    /// Wrap an implementation.
    pub fn new<S: AsCredentialStore>(store: S) -> Self {
        Self(Arc::new(store))
    }

    /// Read a value.
    pub fn get(
        &self,
        key: &'static str,
    ) -> BoxFuture<'static, Result<Option<String>, SessionError>> {
        AsCredentialStore::get(&*self.0, key)
    }

    /// Write a value.
    pub fn set(
        &self,
        key: &'static str,
        value: String,
    ) -> BoxFuture<'static, Result<(), SessionError>> {
        AsCredentialStore::set(&*self.0, key, value)
    }

    /// Remove a value.
    pub fn delete(
        &self,
        key: &'static str,
    ) -> BoxFuture<'static, Result<(), SessionError>> {
        AsCredentialStore::delete(&*self.0, key)
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CredentialStore")
    }
}

/// Maps a [Session] onto credential store keys.
#[derive(Debug, Clone)]
pub struct SessionStore(CredentialStore);

impl SessionStore {
    /// Persist sessions into `store`.
    pub fn new(store: CredentialStore) -> Self {
        Self(store)
    }

    /// Overwrite the stored session. Refuses a session that is not
    /// established.
    pub async fn save(&self, session: &Session) -> Result<(), SessionError> {
        if !session.established {
            return Err(SessionError::Corrupt(
                "refusing to persist a session that is not established".into(),
            ));
        }
        let relays = serde_json::to_string(&session.relays)
            .map_err(|e| SessionError::Store(e.to_string()))?;

        // the old session goes first and the secret lands last, so an
        // interrupted save never pairs one session's secret with
        // another's signer
        self.clear().await?;
        if let Err(err) = self.write_fields(session, relays).await {
            warn!(?err, "session save failed, clearing partial write");
            if let Err(err) = self.clear().await {
                warn!(?err, "could not clear partial session");
            }
            return Err(err);
        }
        debug!(signer = %session.signer_pubkey, "session saved");
        Ok(())
    }

    async fn write_fields(
        &self,
        session: &Session,
        relays: String,
    ) -> Result<(), SessionError> {
        self.0
            .set(KEY_SIGNER_PUBKEY, session.signer_pubkey.to_hex())
            .await?;
        self.0.set(KEY_RELAYS, relays).await?;
        if let Some(pk) = &session.user_pubkey {
            self.0.set(KEY_USER_PUBKEY, pk.to_hex()).await?;
        }
        let secret = session.client_secret.to_hex();
        self.0
            .set(KEY_CLIENT_SECRET, secret.as_str().to_owned())
            .await
    }

    /// Load the stored session, distinguishing "nothing stored" from
    /// "stored but unusable".
    pub async fn try_load(&self) -> Result<Session, SessionError> {
        let secret = self.0.get(KEY_CLIENT_SECRET).await?;
        let signer = self.0.get(KEY_SIGNER_PUBKEY).await?;
        let relays = self.0.get(KEY_RELAYS).await?;
        let user = self.0.get(KEY_USER_PUBKEY).await?;

        let (secret, signer, relays) = match (secret, signer, relays) {
            (None, None, None) => return Err(SessionError::NoStoredSession),
            (Some(s), Some(p), Some(r)) => (s, p, r),
            _ => {
                return Err(SessionError::Corrupt(
                    "session fields partially present".into(),
                ))
            }
        };

        let client_secret = SecretKey::from_hex(&secret).ok_or_else(|| {
            SessionError::Corrupt("client secret is not 64 hex".into())
        })?;
        crate::identity::EphemeralIdentity::from_secret(client_secret.clone())
            .map_err(|e| SessionError::Corrupt(e.to_string()))?;
        let signer_pubkey = PublicKey::from_hex(&signer).ok_or_else(|| {
            SessionError::Corrupt("signer pubkey is not 64 hex".into())
        })?;
        let relays: Vec<RelayUrl> = serde_json::from_str(&relays)
            .map_err(|e| SessionError::Corrupt(format!("relays: {e}")))?;
        if relays.is_empty() {
            return Err(SessionError::Corrupt("no relays".into()));
        }
        let user_pubkey = match user {
            Some(u) => Some(PublicKey::from_hex(&u).ok_or_else(|| {
                SessionError::Corrupt("user pubkey is not 64 hex".into())
            })?),
            None => None,
        };

        Ok(Session {
            signer_pubkey,
            client_secret,
            relays,
            established: true,
            user_pubkey,
        })
    }

    /// Load the stored session, `None` if absent or unusable.
    pub async fn load(&self) -> Option<Session> {
        match self.try_load().await {
            Ok(session) => Some(session),
            Err(SessionError::NoStoredSession) => None,
            Err(err) => {
                warn!(?err, "ignoring unusable stored session");
                None
            }
        }
    }

    /// Erase every stored field.
    pub async fn clear(&self) -> Result<(), SessionError> {
        for key in [
            KEY_CLIENT_SECRET,
            KEY_SIGNER_PUBKEY,
            KEY_RELAYS,
            KEY_USER_PUBKEY,
        ] {
            self.0.delete(key).await?;
        }
        debug!("stored session cleared");
        Ok(())
    }
}
