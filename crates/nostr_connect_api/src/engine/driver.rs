use super::*;
use crate::correlator::{deadline_after, CallOutcome, Correlator};
use crate::event::{Filter, SignedEnvelope};
use crate::identity::{random_token, EphemeralIdentity};
use crate::internal::util::retry_with_backoff;
use crate::relay::EnvelopeStream;
use crate::session::{SecureChannel, Session};
use crate::uri::{BunkerUri, ConnectUri};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;
use zeroize::Zeroizing;

type SubscribeFuture =
    BoxFuture<'static, Result<EnvelopeStream, TransportError>>;

type Reply<T> = oneshot::Sender<T>;

pub(crate) enum Command {
    StartConnect {
        relays: Vec<RelayUrl>,
        app_name: Option<String>,
        reply: Reply<ConnectResult<PendingHandshake>>,
    },
    StartBunker {
        uri: BunkerUri,
        reply: Reply<ConnectResult<PendingHandshake>>,
    },
    Restore {
        reply: Reply<ConnectResult<bool>>,
    },
    Call {
        method: RpcMethod,
        params: Vec<String>,
        timeout: Option<Duration>,
        reply: Reply<ConnectResult<(String, PendingReceiver)>>,
    },
    CancelCall {
        id: String,
    },
    Cancel {
        reply: Reply<()>,
    },
    SignOut {
        reply: Reply<ConnectResult<()>>,
    },
    SessionInfo {
        reply: Reply<Option<SessionInfo>>,
    },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::StartConnect { .. } => "StartConnect",
            Self::StartBunker { .. } => "StartBunker",
            Self::Restore { .. } => "Restore",
            Self::Call { .. } => "Call",
            Self::CancelCall { .. } => "CancelCall",
            Self::Cancel { .. } => "Cancel",
            Self::SignOut { .. } => "SignOut",
            Self::SessionInfo { .. } => "SessionInfo",
        };
        f.write_str(name)
    }
}

/// Reports from tasks the driver spawned.
enum Internal {
    PublishFailed { id: String, err: PublishError },
}

#[derive(Debug, Clone, Copy)]
enum HandshakeStep {
    Connect,
    GetPublicKey,
}

enum Flow {
    /// We minted the uri; the first valid reply identifies the signer.
    Connect { secret: Zeroizing<String> },
    /// The signer is known; we send `connect`.
    Bunker {
        connect_secret: Option<Zeroizing<String>>,
    },
}

impl Flow {
    fn accepts(&self, result: &str) -> bool {
        if result == ACK {
            return true;
        }
        match self {
            Flow::Connect { secret } => result == secret.as_str(),
            Flow::Bunker { connect_secret } => connect_secret
                .as_ref()
                .map(|s| result == s.as_str())
                .unwrap_or(false),
        }
    }
}

type StepFuture = BoxFuture<'static, (HandshakeStep, CallOutcome)>;

struct Attempt {
    flow: Flow,
    identity: EphemeralIdentity,
    relays: Vec<RelayUrl>,
    /// Known from the start for bunker, after the first valid reply for
    /// connect.
    channel: Option<SecureChannel>,
    correlator: Correlator,
    steps: FuturesUnordered<StepFuture>,
    filter: Filter,
    subscribing: Option<SubscribeFuture>,
    stream: Option<EnvelopeStream>,
    /// Set once the first subscription has been acknowledged.
    acknowledged: bool,
    deadline: Instant,
    done: Option<Reply<ConnectResult<PublicKey>>>,
}

impl Attempt {
    fn call(
        &mut self,
        out: &Outbound,
        step: HandshakeStep,
        method: RpcMethod,
        params: Vec<String>,
    ) -> ConnectResult<()> {
        let channel = self.channel.as_ref().ok_or(EngineError::NotConnected)?;
        let now = Instant::now();
        let timeout = self.deadline.saturating_duration_since(now);
        let (request, receiver) =
            self.correlator.send(method, params, Some(timeout), now);
        let env = match channel.seal(&request.to_json()) {
            Ok(env) => env,
            Err(err) => {
                self.correlator.cancel(&request.id);
                return Err(err);
            }
        };
        self.steps.push(
            receiver
                .map(move |r| (step, r.unwrap_or(Err(RpcError::Cancelled))))
                .boxed(),
        );
        out.publish(self.relays.clone(), env, request.id);
        Ok(())
    }

    fn finish(&mut self, result: ConnectResult<PublicKey>) {
        self.correlator.cancel_all();
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }
}

struct ActiveSession {
    session: Session,
    channel: SecureChannel,
    correlator: Correlator,
    subscribing: Option<SubscribeFuture>,
    stream: Option<EnvelopeStream>,
    /// Sealed calls waiting for the subscription to be acknowledged.
    queued: Vec<(String, SignedEnvelope)>,
}

impl ActiveSession {
    fn filter(&self) -> Filter {
        Filter::nostr_connect(self.channel.identity().public_key())
            .with_author(self.session.signer_pubkey)
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            signer_pubkey: self.session.signer_pubkey,
            client_pubkey: self.channel.identity().public_key(),
            user_pubkey: self.session.user_pubkey,
            relays: self.session.relays.clone(),
        }
    }
}

enum AttemptInput {
    Subscribed(Result<EnvelopeStream, TransportError>),
    Inbound(Option<SignedEnvelope>),
    Step(HandshakeStep, CallOutcome),
}

enum SessionInput {
    Subscribed(Result<EnvelopeStream, TransportError>),
    Inbound(Option<SignedEnvelope>),
}

async fn subscribed(
    fut: Option<&mut SubscribeFuture>,
) -> Result<EnvelopeStream, TransportError> {
    match fut {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}

async fn inbound(
    stream: Option<&mut EnvelopeStream>,
) -> Option<SignedEnvelope> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

async fn next_step(
    steps: &mut FuturesUnordered<StepFuture>,
) -> (HandshakeStep, CallOutcome) {
    match steps.next().await {
        Some(r) => r,
        None => std::future::pending().await,
    }
}

async fn next_attempt_input(attempt: &mut Option<Attempt>) -> AttemptInput {
    let Attempt {
        subscribing,
        stream,
        steps,
        ..
    } = match attempt {
        Some(a) => a,
        None => return std::future::pending().await,
    };
    tokio::select! {
        r = subscribed(subscribing.as_mut()) => AttemptInput::Subscribed(r),
        e = inbound(stream.as_mut()) => AttemptInput::Inbound(e),
        (step, outcome) = next_step(steps) => AttemptInput::Step(step, outcome),
    }
}

async fn next_session_input(
    active: &mut Option<ActiveSession>,
) -> SessionInput {
    let ActiveSession {
        subscribing,
        stream,
        ..
    } = match active {
        Some(a) => a,
        None => return std::future::pending().await,
    };
    tokio::select! {
        r = subscribed(subscribing.as_mut()) => SessionInput::Subscribed(r),
        e = inbound(stream.as_mut()) => SessionInput::Inbound(e),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Relay traffic leaving the driver. Publishing happens on spawned
/// tasks; a final failure comes back as [Internal::PublishFailed].
struct Outbound {
    pool: RelayPool,
    internal: mpsc::UnboundedSender<Internal>,
    retries: u32,
    backoff: Duration,
}

impl Outbound {
    fn subscribe(
        &self,
        relays: Vec<RelayUrl>,
        filter: Filter,
    ) -> SubscribeFuture {
        let pool = self.pool.clone();
        let retries = self.retries;
        let backoff = self.backoff;
        async move {
            retry_with_backoff("subscribe", retries, backoff, || {
                pool.subscribe(relays.clone(), filter.clone())
            })
            .await
        }
        .boxed()
    }

    fn publish(&self, relays: Vec<RelayUrl>, env: SignedEnvelope, id: String) {
        let pool = self.pool.clone();
        let internal = self.internal.clone();
        let retries = self.retries;
        let backoff = self.backoff;
        err_spawn("publish", async move {
            let res = retry_with_backoff("publish", retries, backoff, || {
                pool.publish(relays.clone(), env.clone())
            })
            .await;
            if let Err(err) = &res {
                let _ = internal.send(Internal::PublishFailed {
                    id,
                    err: err.clone(),
                });
            }
            res
        });
    }
}

struct Notify {
    state: watch::Sender<EngineState>,
    events: broadcast::Sender<EngineEvent>,
}

impl Notify {
    fn set_state(&self, next: EngineState) {
        let changed = self.state.send_if_modified(|cur| {
            if *cur == next {
                return false;
            }
            *cur = next.clone();
            true
        });
        if changed {
            info!(state = ?next, "engine state");
            self.emit(EngineEvent::StateChanged(next));
        }
    }

    fn emit(&self, event: EngineEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Single owner of all mutable engine state.
pub(crate) struct Driver {
    config: EngineConfig,
    store: SessionStore,
    cmd: mpsc::Receiver<Command>,
    internal: mpsc::UnboundedReceiver<Internal>,
    out: Outbound,
    notify: Notify,
    attempt: Option<Attempt>,
    active: Option<ActiveSession>,
}

impl Driver {
    pub(crate) fn new(
        config: EngineConfig,
        pool: RelayPool,
        store: SessionStore,
        cmd: mpsc::Receiver<Command>,
        state: watch::Sender<EngineState>,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        let (internal_tx, internal) = mpsc::unbounded_channel();
        let out = Outbound {
            pool,
            internal: internal_tx,
            retries: config.transport_retries,
            backoff: config.retry_backoff(),
        };
        Self {
            config,
            store,
            cmd,
            internal,
            out,
            notify: Notify { state, events },
            attempt: None,
            active: None,
        }
    }

    pub(crate) async fn run(mut self) -> ConnectResult<()> {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                cmd = self.cmd.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => break,
                },
                input = next_attempt_input(&mut self.attempt) => {
                    self.on_attempt_input(input).await
                }
                input = next_session_input(&mut self.active) => {
                    self.on_session_input(input).await
                }
                Some(msg) = self.internal.recv() => self.on_internal(msg),
                _ = sleep_until(deadline) => self.on_tick(),
            }
        }

        debug!("all engine handles dropped, stopping");
        self.end_attempt(Err(EngineError::EngineStopped));
        if let Some(mut active) = self.active.take() {
            active.correlator.cancel_all();
        }
        Ok(())
    }

    fn next_deadline(&self) -> Option<Instant> {
        let attempt = self.attempt.as_ref().map(|a| {
            a.correlator
                .next_deadline()
                .map_or(a.deadline, |d| d.min(a.deadline))
        });
        let session =
            self.active.as_ref().and_then(|s| s.correlator.next_deadline());
        match (attempt, session) {
            (Some(a), Some(s)) => Some(a.min(s)),
            (a, s) => a.or(s),
        }
    }

    /// The state to settle in once no handshake is running.
    fn resting_state(&self) -> EngineState {
        if self.active.is_some() {
            EngineState::Connected
        } else {
            EngineState::Idle
        }
    }

    /// Drop the current attempt, if any, resolving its waiter.
    fn end_attempt(&mut self, result: ConnectResult<PublicKey>) -> bool {
        match self.attempt.take() {
            Some(mut attempt) => {
                attempt.finish(result);
                true
            }
            None => false,
        }
    }

    fn fail_attempt(&mut self, err: EngineError, retriable: bool) {
        if self.attempt.is_none() {
            return;
        }
        warn!(?err, "handshake failed");
        // observers see the error state before the waiter resolves
        self.notify.set_state(EngineState::Error {
            message: err.to_string(),
            retriable,
        });
        self.end_attempt(Err(err));
    }

    async fn on_command(&mut self, cmd: Command) {
        trace!(?cmd, "engine command");
        match cmd {
            Command::StartConnect {
                relays,
                app_name,
                reply,
            } => {
                let res = self.start_connect(relays, app_name);
                let _ = reply.send(res);
            }
            Command::StartBunker { uri, reply } => {
                let res = self.start_bunker(uri);
                let _ = reply.send(res);
            }
            Command::Restore { reply } => {
                let res = self.restore().await;
                let _ = reply.send(res);
            }
            Command::Call {
                method,
                params,
                timeout,
                reply,
            } => {
                let res = self.call(method, params, timeout);
                let _ = reply.send(res);
            }
            Command::CancelCall { id } => {
                if let Some(active) = self.active.as_mut() {
                    active.queued.retain(|(q, _)| q != &id);
                    active.correlator.cancel(&id);
                }
            }
            Command::Cancel { reply } => {
                if self.end_attempt(Err(EngineError::HandshakeCancelled)) {
                    info!("handshake cancelled");
                }
                self.notify.set_state(self.resting_state());
                let _ = reply.send(());
            }
            Command::SignOut { reply } => {
                let res = self.sign_out().await;
                let _ = reply.send(res);
            }
            Command::SessionInfo { reply } => {
                let _ = reply.send(self.active.as_ref().map(|a| a.info()));
            }
        }
    }

    fn start_connect(
        &mut self,
        relays: Vec<RelayUrl>,
        app_name: Option<String>,
    ) -> ConnectResult<PendingHandshake> {
        if self.end_attempt(Err(EngineError::HandshakeCancelled)) {
            info!("previous handshake superseded");
        }
        let relays = if relays.is_empty() {
            self.config.default_relays.clone()
        } else {
            relays
        };
        if relays.is_empty() {
            return Err(UriError::Malformed("no relays to listen on".into())
                .into());
        }

        self.notify.set_state(EngineState::GeneratingUri);
        let minted = EphemeralIdentity::generate()
            .map_err(EngineError::from)
            .and_then(|identity| Ok((identity, random_token()?)));
        let (identity, secret) = match minted {
            Ok(r) => r,
            Err(err) => {
                self.notify.set_state(EngineState::Error {
                    message: err.to_string(),
                    retriable: true,
                });
                return Err(err);
            }
        };

        let mut uri = ConnectUri::new(&identity, relays.clone());
        uri.secret = Some(secret.as_str().to_owned());
        uri.app_name = app_name
            .filter(|n| !n.is_empty())
            .or_else(|| self.config.app_name.clone());
        uri.url = self.config.app_url.clone();
        uri.image = self.config.app_image.clone();
        uri.perms = self.config.perms.clone();

        let (done, done_rx) = oneshot::channel();
        let filter = Filter::nostr_connect(identity.public_key());
        info!(client = %identity.public_key(), "connect uri minted");
        self.attempt = Some(Attempt {
            flow: Flow::Connect { secret },
            subscribing: Some(
                self.out.subscribe(relays.clone(), filter.clone()),
            ),
            filter,
            identity,
            relays,
            channel: None,
            correlator: Correlator::new(self.config.handshake_timeout()),
            steps: FuturesUnordered::new(),
            stream: None,
            acknowledged: false,
            deadline: deadline_after(
                Instant::now(),
                self.config.handshake_timeout(),
            ),
            done: Some(done),
        });
        Ok(PendingHandshake {
            connect_uri: Some(uri.to_string()),
            done: done_rx,
        })
    }

    fn start_bunker(
        &mut self,
        uri: BunkerUri,
    ) -> ConnectResult<PendingHandshake> {
        if self.end_attempt(Err(EngineError::HandshakeCancelled)) {
            info!("previous handshake superseded");
        }
        let identity = EphemeralIdentity::generate()?;
        let channel = SecureChannel::new(identity.clone(), uri.signer_pubkey)?;

        let (done, done_rx) = oneshot::channel();
        let filter = Filter::nostr_connect(identity.public_key())
            .with_author(uri.signer_pubkey);
        info!(signer = %uri.signer_pubkey, "bunker handshake starting");
        self.attempt = Some(Attempt {
            flow: Flow::Bunker {
                connect_secret: uri.connect_secret.map(Zeroizing::new),
            },
            subscribing: Some(
                self.out.subscribe(uri.relays.clone(), filter.clone()),
            ),
            filter,
            identity,
            relays: uri.relays,
            channel: Some(channel),
            correlator: Correlator::new(self.config.handshake_timeout()),
            steps: FuturesUnordered::new(),
            stream: None,
            acknowledged: false,
            deadline: deadline_after(
                Instant::now(),
                self.config.handshake_timeout(),
            ),
            done: Some(done),
        });
        self.notify.set_state(EngineState::AwaitingRelayAck);
        Ok(PendingHandshake {
            connect_uri: None,
            done: done_rx,
        })
    }

    async fn restore(&mut self) -> ConnectResult<bool> {
        if self.active.is_some() {
            return Ok(true);
        }
        let session = match self.store.try_load().await {
            Ok(session) => session,
            Err(SessionError::NoStoredSession) => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let channel = session.open_channel()?;
        let mut active = ActiveSession {
            session,
            channel,
            correlator: Correlator::new(self.config.rpc_timeout()),
            subscribing: None,
            stream: None,
            queued: Vec::new(),
        };
        let sub = self
            .out
            .subscribe(active.session.relays.clone(), active.filter());
        active.subscribing = Some(sub);
        info!(signer = %active.session.signer_pubkey, "session restored");
        self.notify.emit(EngineEvent::Connected {
            signer_pubkey: active.session.signer_pubkey,
            user_pubkey: active.session.user_pubkey,
        });
        self.active = Some(active);
        if self.attempt.is_none() {
            self.notify.set_state(EngineState::Connected);
        }
        Ok(true)
    }

    fn call(
        &mut self,
        method: RpcMethod,
        params: Vec<String>,
        timeout: Option<Duration>,
    ) -> ConnectResult<(String, PendingReceiver)> {
        let active = self.active.as_mut().ok_or(EngineError::NotConnected)?;
        let (request, receiver) =
            active
                .correlator
                .send(method, params, timeout, Instant::now());
        let env = match active.channel.seal(&request.to_json()) {
            Ok(env) => env,
            Err(err) => {
                active.correlator.cancel(&request.id);
                return Err(err);
            }
        };
        if active.stream.is_some() {
            let relays = active.session.relays.clone();
            self.out.publish(relays, env, request.id.clone());
        } else {
            trace!(id = %request.id, "queueing call until subscribed");
            active.queued.push((request.id.clone(), env));
        }
        Ok((request.id, receiver))
    }

    async fn sign_out(&mut self) -> ConnectResult<()> {
        self.end_attempt(Err(EngineError::HandshakeCancelled));
        if let Some(mut active) = self.active.take() {
            active.correlator.cancel_all();
            info!(signer = %active.session.signer_pubkey, "signed out");
        }
        self.notify.set_state(EngineState::Idle);
        self.store.clear().await?;
        Ok(())
    }

    async fn on_attempt_input(&mut self, input: AttemptInput) {
        match input {
            AttemptInput::Subscribed(Ok(stream)) => {
                self.attempt_subscribed(stream)
            }
            AttemptInput::Subscribed(Err(err)) => {
                self.fail_attempt(err.into(), true)
            }
            AttemptInput::Inbound(Some(env)) => self.attempt_envelope(env),
            AttemptInput::Inbound(None) => {
                if let Some(attempt) = self.attempt.as_mut() {
                    warn!("handshake subscription lost, resubscribing");
                    attempt.stream = None;
                    let relays = attempt.relays.clone();
                    let filter = attempt.filter.clone();
                    let sub = self.out.subscribe(relays, filter);
                    attempt.subscribing = Some(sub);
                }
            }
            AttemptInput::Step(step, outcome) => {
                self.attempt_step(step, outcome).await
            }
        }
    }

    fn attempt_subscribed(&mut self, stream: EnvelopeStream) {
        let attempt = match self.attempt.as_mut() {
            Some(a) => a,
            None => return,
        };
        attempt.subscribing = None;
        attempt.stream = Some(stream);
        if attempt.acknowledged {
            debug!("handshake resubscribed");
            return;
        }
        attempt.acknowledged = true;
        debug!(client = %attempt.identity.public_key(), "handshake subscribed");

        let connect = match (&attempt.flow, &attempt.channel) {
            (Flow::Bunker { connect_secret }, Some(channel)) => {
                Some(RpcRequest::connect_params(
                    &channel.peer(),
                    connect_secret.as_ref().map(|s| s.as_str()),
                    self.config.perms.as_deref(),
                ))
            }
            _ => None,
        };
        let res = match connect {
            Some(params) => attempt.call(
                &self.out,
                HandshakeStep::Connect,
                RpcMethod::Connect,
                params,
            ),
            None => Ok(()),
        };
        match res {
            Ok(()) => self.notify.set_state(EngineState::WaitingForPeer),
            Err(err) => self.fail_attempt(err, false),
        }
    }

    fn attempt_envelope(&mut self, env: SignedEnvelope) {
        if let Err(err) = env.verify() {
            debug!(?err, "dropping envelope that does not verify");
            return;
        }
        let accept_legacy = self.config.accept_legacy_nip04;
        let attempt = match self.attempt.as_mut() {
            Some(a) => a,
            None => return,
        };

        let pending_peer = attempt.channel.is_none();
        let channel = match &attempt.channel {
            Some(channel) => channel.clone(),
            None => match SecureChannel::new(
                attempt.identity.clone(),
                env.pubkey,
            ) {
                Ok(channel) => channel,
                Err(err) => {
                    debug!(?err, "dropping envelope from unusable key");
                    return;
                }
            },
        };
        let response = match channel
            .open(&env, accept_legacy)
            .ok()
            .and_then(|text| RpcResponse::from_json(&text))
        {
            Some(r) => r,
            None => {
                debug!(author = %env.pubkey, "dropping unreadable envelope");
                return;
            }
        };
        if let Some(url) = response.auth_challenge() {
            if pending_peer {
                debug!(author = %env.pubkey, "ignoring unproven challenge");
                return;
            }
            self.notify.emit(EngineEvent::AuthChallenge {
                id: response.id.clone(),
                url: url.to_string(),
            });
            return;
        }
        if !pending_peer {
            attempt.correlator.dispatch(response);
            return;
        }

        // connect flow: the signer introduces itself, until a sender
        // proves it holds the secret nothing it says is trusted
        match response.into_result() {
            Err(err) => {
                debug!(author = %env.pubkey, ?err, "ignoring unproven error")
            }
            Ok(result) if attempt.flow.accepts(&result) => {
                info!(signer = %channel.peer(), "signer answered connect uri");
                attempt.channel = Some(channel);
                if let Err(err) = attempt.call(
                    &self.out,
                    HandshakeStep::GetPublicKey,
                    RpcMethod::GetPublicKey,
                    Vec::new(),
                ) {
                    self.fail_attempt(err, false);
                }
            }
            Ok(_) => {
                debug!(author = %env.pubkey, "ignoring reply without secret")
            }
        }
    }

    async fn attempt_step(
        &mut self,
        step: HandshakeStep,
        outcome: CallOutcome,
    ) {
        let response = match outcome {
            Ok(response) => response,
            // the attempt is already gone
            Err(RpcError::Cancelled) => return,
            Err(RpcError::Timeout) => {
                return self.fail_attempt(EngineError::HandshakeTimeout, true)
            }
            Err(err) => {
                let retriable = matches!(err, RpcError::Transport(_));
                return self.fail_attempt(err.into(), retriable);
            }
        };
        let result = match response.into_result() {
            Ok(result) => result,
            Err(err) => return self.fail_attempt(err.into(), false),
        };

        match step {
            HandshakeStep::Connect => {
                let attempt = match self.attempt.as_mut() {
                    Some(a) => a,
                    None => return,
                };
                if !attempt.flow.accepts(&result) {
                    return self.fail_attempt(
                        RpcError::SignerRejected(format!(
                            "unexpected connect result {result:?}"
                        ))
                        .into(),
                        false,
                    );
                }
                debug!("signer acknowledged connect");
                if let Err(err) = attempt.call(
                    &self.out,
                    HandshakeStep::GetPublicKey,
                    RpcMethod::GetPublicKey,
                    Vec::new(),
                ) {
                    self.fail_attempt(err, false);
                }
            }
            HandshakeStep::GetPublicKey => match PublicKey::from_hex(&result) {
                Some(user) => self.establish(user).await,
                None => self.fail_attempt(
                    RpcError::SignerRejected(format!(
                        "invalid public key {result:?}"
                    ))
                    .into(),
                    false,
                ),
            },
        }
    }

    async fn establish(&mut self, user: PublicKey) {
        let mut attempt = match self.attempt.take() {
            Some(a) => a,
            None => return,
        };
        let channel = match attempt.channel.take() {
            Some(c) => c,
            None => {
                attempt.finish(Err(EngineError::NotConnected));
                return;
            }
        };
        let mut session = Session::new(
            channel.peer(),
            attempt.identity.secret_key().clone(),
            attempt.relays.clone(),
        );
        session.user_pubkey = Some(user);

        if let Some(mut old) = self.active.take() {
            info!(signer = %old.session.signer_pubkey, "replacing session");
            old.correlator.cancel_all();
        }
        if let Err(err) = self.store.save(&session).await {
            warn!(?err, "could not persist session");
        }

        let signer = session.signer_pubkey;
        info!(%signer, %user, "connected");
        self.active = Some(ActiveSession {
            session,
            channel,
            correlator: Correlator::new(self.config.rpc_timeout()),
            subscribing: None,
            stream: attempt.stream.take(),
            queued: Vec::new(),
        });
        self.notify.set_state(EngineState::Connected);
        self.notify.emit(EngineEvent::Connected {
            signer_pubkey: signer,
            user_pubkey: Some(user),
        });
        attempt.finish(Ok(user));
    }

    async fn on_session_input(&mut self, input: SessionInput) {
        match input {
            SessionInput::Subscribed(Ok(stream)) => {
                if let Some(active) = self.active.as_mut() {
                    active.subscribing = None;
                    active.stream = Some(stream);
                    debug!(queued = active.queued.len(), "session subscribed");
                    for (id, env) in active.queued.drain(..) {
                        self.out
                            .publish(active.session.relays.clone(), env, id);
                    }
                }
            }
            SessionInput::Subscribed(Err(err)) => {
                self.lose_session(err.to_string())
            }
            SessionInput::Inbound(Some(env)) => {
                self.session_envelope(env).await
            }
            SessionInput::Inbound(None) => {
                if let Some(active) = self.active.as_mut() {
                    warn!("session subscription lost, resubscribing");
                    active.stream = None;
                    let relays = active.session.relays.clone();
                    let sub = self.out.subscribe(relays, active.filter());
                    active.subscribing = Some(sub);
                }
            }
        }
    }

    fn lose_session(&mut self, reason: String) {
        if let Some(mut active) = self.active.take() {
            warn!(%reason, "session lost");
            active.correlator.fail_all(RpcError::Transport(
                TransportError::Subscribe(reason.clone()),
            ));
            if self.attempt.is_none() {
                self.notify.set_state(EngineState::Error {
                    message: reason.clone(),
                    retriable: true,
                });
            }
            self.notify.emit(EngineEvent::SessionLost { reason });
        }
    }

    async fn session_envelope(&mut self, env: SignedEnvelope) {
        if let Err(err) = env.verify() {
            debug!(?err, "dropping envelope that does not verify");
            return;
        }
        let active = match self.active.as_mut() {
            Some(a) => a,
            None => return,
        };
        let response = match active
            .channel
            .open(&env, self.config.accept_legacy_nip04)
            .ok()
            .and_then(|text| RpcResponse::from_json(&text))
        {
            Some(r) => r,
            None => {
                debug!(author = %env.pubkey, "dropping unreadable envelope");
                return;
            }
        };
        if let Some(url) = response.auth_challenge() {
            info!(id = %response.id, "signer requested authorization");
            self.notify.emit(EngineEvent::AuthChallenge {
                id: response.id.clone(),
                url: url.to_string(),
            });
            return;
        }

        let learned = match active.correlator.get(&response.id) {
            Some(req) if req.method == RpcMethod::GetPublicKey => response
                .result
                .as_deref()
                .and_then(PublicKey::from_hex)
                .filter(|pk| active.session.user_pubkey != Some(*pk)),
            _ => None,
        };
        active.correlator.dispatch(response);
        if let Some(user) = learned {
            active.session.user_pubkey = Some(user);
            if let Err(err) = self.store.save(&active.session).await {
                warn!(?err, "could not persist user pubkey");
            }
        }
    }

    fn on_internal(&mut self, msg: Internal) {
        match msg {
            Internal::PublishFailed { id, err } => {
                let err = RpcError::Transport(TransportError::Publish(err));
                let failed = self
                    .attempt
                    .as_mut()
                    .map_or(false, |a| a.correlator.fail(&id, err.clone()))
                    || self
                        .active
                        .as_mut()
                        .map_or(false, |a| a.correlator.fail(&id, err));
                if !failed {
                    trace!(%id, "publish failure for a call no longer pending");
                }
            }
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        if self.attempt.as_ref().map_or(false, |a| a.deadline <= now) {
            self.fail_attempt(EngineError::HandshakeTimeout, true);
        }
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.correlator.expire_overdue(now);
        }
        if let Some(active) = self.active.as_mut() {
            let expired = active.correlator.expire_overdue(now);
            if expired > 0 {
                debug!(expired, "rpc calls timed out");
            }
        }
    }
}
