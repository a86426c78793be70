//! The connect / session protocol engine.
//!
//! [Engine::new] spawns one driver task that exclusively owns the state
//! machine, the rpc correlators and the active session. [Engine] handles
//! are cheap clones of a command sender; every operation is a message to
//! the driver plus a oneshot reply. Dropping every handle stops the driver.

use crate::correlator::PendingReceiver;
use crate::encoding::*;
use crate::internal::util::err_spawn;
use crate::relay::RelayPool;
use crate::rpc::*;
use crate::store::{CredentialStore, SessionStore};
use crate::uri;
use crate::*;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

mod driver;
use driver::*;

/// Where the engine is in the connect state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineState {
    /// No handshake in progress and no session.
    Idle,
    /// Minting an identity and connect uri, waiting for the relay
    /// subscription to be acknowledged.
    GeneratingUri,
    /// Bunker flow: waiting for the relay subscription to be acknowledged
    /// before sending `connect`.
    AwaitingRelayAck,
    /// Subscribed; waiting for the signer to answer.
    WaitingForPeer,
    /// A session is established and the rpc surface is usable.
    Connected,
    /// The last attempt failed. Starting a new one (or `cancel`) leaves
    /// this state.
    Error {
        /// What went wrong.
        message: String,
        /// True for transport level failures worth retrying as is.
        retriable: bool,
    },
}

/// Notifications emitted by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// The state machine moved.
    StateChanged(EngineState),
    /// The signer wants the user to visit `url` before it answers call
    /// `id`. The call stays pending.
    AuthChallenge {
        /// Request id of the challenged call.
        id: String,
        /// Where to send the user.
        url: String,
    },
    /// A session was established or restored.
    Connected {
        /// The signer's communication key.
        signer_pubkey: PublicKey,
        /// The user's identity key, if known.
        user_pubkey: Option<PublicKey>,
    },
    /// The established session's relay subscription could not be
    /// re-established. The persisted session is kept.
    SessionLost {
        /// Why.
        reason: String,
    },
}

/// Public description of the active session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// The signer's communication key.
    pub signer_pubkey: PublicKey,
    /// Our ephemeral key for this session.
    pub client_pubkey: PublicKey,
    /// The user's identity key, if known.
    pub user_pubkey: Option<PublicKey>,
    /// Session relays.
    pub relays: Vec<RelayUrl>,
}

/// A handshake that has been started.
#[derive(Debug)]
pub struct PendingHandshake {
    connect_uri: Option<String>,
    done: oneshot::Receiver<ConnectResult<PublicKey>>,
}

impl PendingHandshake {
    /// The `nostrconnect://` uri to show the user (connect flow only).
    pub fn connect_uri(&self) -> Option<&str> {
        self.connect_uri.as_deref()
    }

    /// Wait for the handshake to finish, yielding the user's public key.
    pub async fn established(self) -> ConnectResult<PublicKey> {
        self.done.await.map_err(|_| EngineError::EngineStopped)?
    }
}

/// An individual in-flight rpc call.
#[derive(Debug)]
pub struct RpcCall {
    id: String,
    method: RpcMethod,
    receiver: PendingReceiver,
    cmd: mpsc::WeakSender<Command>,
}

impl RpcCall {
    /// The request id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The method called.
    pub fn method(&self) -> RpcMethod {
        self.method
    }

    /// Cancel this call only. Its response resolves with
    /// [RpcError::Cancelled].
    pub async fn cancel(&self) {
        if let Some(cmd) = self.cmd.upgrade() {
            let _ = cmd
                .send(Command::CancelCall {
                    id: self.id.clone(),
                })
                .await;
        }
    }

    /// Wait for the signer's result text.
    pub async fn response(self) -> ConnectResult<String> {
        match self.receiver.await {
            Ok(Ok(response)) => Ok(response.into_result()?),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(EngineError::EngineStopped),
        }
    }
}

/// Handle to a running engine.
#[derive(Clone)]
pub struct Engine {
    cmd: mpsc::Sender<Command>,
    state: watch::Receiver<EngineState>,
    events: broadcast::Sender<EngineEvent>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl Engine {
    /// Validate `config` and spawn the driver task. Must be called from
    /// within a tokio runtime.
    pub fn new(
        config: EngineConfig,
        relay_pool: RelayPool,
        credential_store: CredentialStore,
    ) -> ConnectResult<Self> {
        config.validate()?;
        let (cmd, cmd_rx) = mpsc::channel(32);
        let (state_tx, state) = watch::channel(EngineState::Idle);
        let (events, _) = broadcast::channel(64);
        let driver = Driver::new(
            config,
            relay_pool,
            SessionStore::new(credential_store),
            cmd_rx,
            state_tx,
            events.clone(),
        );
        err_spawn("nostr-connect-engine", driver.run());
        Ok(Self { cmd, state, events })
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> Command,
    ) -> ConnectResult<R> {
        let (reply, rx) = oneshot::channel();
        self.cmd
            .send(make(reply))
            .await
            .map_err(|_| EngineError::EngineStopped)?;
        rx.await.map_err(|_| EngineError::EngineStopped)
    }

    /// The current state.
    pub fn state(&self) -> EngineState {
        self.state.borrow().clone()
    }

    /// Observe state changes.
    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.state.clone()
    }

    /// Subscribe to engine events.
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Mint a connect uri and wait for a signer to scan it.
    ///
    /// Empty `relays` falls back to the configured defaults; `app_name`
    /// falls back to the configured name. Any handshake already in
    /// progress is cancelled first.
    pub async fn start_connect(
        &self,
        relays: Vec<RelayUrl>,
        app_name: Option<String>,
    ) -> ConnectResult<PendingHandshake> {
        self.request(|reply| Command::StartConnect {
            relays,
            app_name,
            reply,
        })
        .await?
    }

    /// Connect to a waiting signer described by a `bunker://` uri.
    ///
    /// Uri errors are returned immediately. Any handshake already in
    /// progress is cancelled first.
    pub async fn start_bunker(
        &self,
        bunker_uri: &str,
    ) -> ConnectResult<PendingHandshake> {
        let uri = uri::parse_bunker(bunker_uri)?;
        self.request(|reply| Command::StartBunker { uri, reply })
            .await?
    }

    /// Resume the persisted session, if any, without a handshake.
    ///
    /// Returns false when nothing is stored. Calls issued before the
    /// relay subscription is acknowledged are queued.
    pub async fn restore(&self) -> ConnectResult<bool> {
        self.request(|reply| Command::Restore { reply }).await?
    }

    /// Cancel the handshake in progress. An established session is kept.
    pub async fn cancel(&self) -> ConnectResult<()> {
        self.request(|reply| Command::Cancel { reply }).await
    }

    /// Drop the session, cancel its calls and erase persisted material.
    pub async fn sign_out(&self) -> ConnectResult<()> {
        self.request(|reply| Command::SignOut { reply }).await?
    }

    /// Describe the active session.
    pub async fn session_info(&self) -> ConnectResult<Option<SessionInfo>> {
        self.request(|reply| Command::SessionInfo { reply }).await
    }

    /// Export the active session as a `bunker://` uri.
    pub async fn bunker_uri(&self) -> ConnectResult<String> {
        let info = self
            .session_info()
            .await?
            .ok_or(EngineError::NotConnected)?;
        Ok(uri::BunkerUri {
            signer_pubkey: info.signer_pubkey,
            relays: info.relays,
            connect_secret: None,
        }
        .to_string())
    }

    /// Issue a call on the active session. `timeout` overrides the
    /// configured rpc deadline.
    pub async fn call(
        &self,
        method: RpcMethod,
        params: Vec<String>,
        timeout: Option<Duration>,
    ) -> ConnectResult<RpcCall> {
        let (id, receiver) = self
            .request(|reply| Command::Call {
                method,
                params,
                timeout,
                reply,
            })
            .await??;
        Ok(RpcCall {
            id,
            method,
            receiver,
            cmd: self.cmd.downgrade(),
        })
    }

    async fn call_text(
        &self,
        method: RpcMethod,
        params: Vec<String>,
    ) -> ConnectResult<String> {
        self.call(method, params, None).await?.response().await
    }

    /// The user's public key, served from cache once known.
    pub async fn get_public_key(&self) -> ConnectResult<PublicKey> {
        if let Some(pk) = self
            .session_info()
            .await?
            .ok_or(EngineError::NotConnected)?
            .user_pubkey
        {
            return Ok(pk);
        }
        let text = self.call_text(RpcMethod::GetPublicKey, vec![]).await?;
        PublicKey::from_hex(&text).ok_or_else(|| {
            RpcError::SignerRejected(format!("invalid public key {text:?}"))
                .into()
        })
    }

    /// Have the signer sign an unsigned event (json); returns the signed
    /// event json.
    pub async fn sign_event(
        &self,
        unsigned_event: &str,
    ) -> ConnectResult<String> {
        self.call_text(RpcMethod::SignEvent, vec![unsigned_event.to_string()])
            .await
    }

    /// Liveness check.
    pub async fn ping(&self) -> ConnectResult<String> {
        self.call_text(RpcMethod::Ping, vec![]).await
    }

    /// Legacy-encrypt `plaintext` for `third_party`.
    pub async fn nip04_encrypt(
        &self,
        third_party: &PublicKey,
        plaintext: &str,
    ) -> ConnectResult<String> {
        self.call_text(
            RpcMethod::Nip04Encrypt,
            vec![third_party.to_hex(), plaintext.to_string()],
        )
        .await
    }

    /// Legacy-decrypt `ciphertext` from `third_party`.
    pub async fn nip04_decrypt(
        &self,
        third_party: &PublicKey,
        ciphertext: &str,
    ) -> ConnectResult<String> {
        self.call_text(
            RpcMethod::Nip04Decrypt,
            vec![third_party.to_hex(), ciphertext.to_string()],
        )
        .await
    }

    /// Encrypt `plaintext` for `third_party`.
    pub async fn nip44_encrypt(
        &self,
        third_party: &PublicKey,
        plaintext: &str,
    ) -> ConnectResult<String> {
        self.call_text(
            RpcMethod::Nip44Encrypt,
            vec![third_party.to_hex(), plaintext.to_string()],
        )
        .await
    }

    /// Decrypt `ciphertext` from `third_party`.
    pub async fn nip44_decrypt(
        &self,
        third_party: &PublicKey,
        ciphertext: &str,
    ) -> ConnectResult<String> {
        self.call_text(
            RpcMethod::Nip44Decrypt,
            vec![third_party.to_hex(), ciphertext.to_string()],
        )
        .await
    }
}
