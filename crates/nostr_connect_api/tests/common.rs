#![allow(dead_code)]

use nostr_connect_api::dependencies::*;
use nostr_connect_api::envelope::{self, nip04};
use nostr_connect_api::mem_relay::MemRelayHub;
use nostr_connect_api::prelude::*;

use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub fn init_tracing() {
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .compact()
            .finish(),
    );
}

pub fn relays() -> Vec<RelayUrl> {
    vec![
        RelayUrl::parse("wss://relay.one.example").unwrap(),
        RelayUrl::parse("wss://relay.two.example/nostr").unwrap(),
    ]
}

/// Replace the first hex digit of a signature or id.
pub fn flip_hex(s: &mut String) {
    let first = if s.starts_with('0') { "1" } else { "0" };
    s.replace_range(..1, first);
}

/// Wait until the hub holds `n` live subscriptions.
pub async fn wait_subscriptions(hub: &MemRelayHub, n: usize) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while hub.active_subscriptions() != n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for relay subscriptions")
}

/// Few retries so failure paths finish quickly.
pub fn test_config() -> EngineConfig {
    EngineConfig::builder()
        .with_retries(1, 10)
        .with_rpc_timeout_ms(5_000)
        .with_handshake_timeout_ms(5_000)
        .build()
        .unwrap()
}

pub async fn wait_for_state<F>(engine: &Engine, f: F) -> EngineState
where
    F: FnMut(&EngineState) -> bool,
{
    let mut rx = engine.watch_state();
    let state = tokio::time::timeout(Duration::from_secs(10), rx.wait_for(f))
        .await
        .expect("timed out waiting for engine state")
        .unwrap()
        .clone();
    state
}

pub async fn next_event<F>(
    rx: &mut broadcast::Receiver<EngineEvent>,
    mut f: F,
) -> EngineEvent
where
    F: FnMut(&EngineEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let evt = rx.recv().await.unwrap();
            if f(&evt) {
                return evt;
            }
        }
    })
    .await
    .expect("timed out waiting for engine event")
}

/// Knobs for misbehaving.
#[derive(Default)]
pub struct Behavior {
    /// Reply with this error to every call except `connect`.
    pub reject: Option<String>,
    /// Never answer these methods.
    pub silent: Vec<RpcMethod>,
    /// Send every reply twice.
    pub duplicate: bool,
    /// Send one auth challenge before answering the next `sign_event`.
    pub auth_url: Option<String>,
}

struct Inner {
    comm: EphemeralIdentity,
    user: EphemeralIdentity,
    relays: Vec<RelayUrl>,
    secret: Option<String>,
    pool: RelayPool,
    behavior: Mutex<Behavior>,
    requests: Mutex<Vec<RpcRequest>>,
}

/// A remote signer living on a [MemRelayHub]. It answers any client,
/// holds a separate communication key and user key, and resubscribes when
/// its relay subscription ends.
#[derive(Clone)]
pub struct TestSigner(Arc<Inner>);

impl TestSigner {
    pub async fn spawn(
        hub: &MemRelayHub,
        relays: Vec<RelayUrl>,
        secret: Option<&str>,
    ) -> Self {
        let inner = Arc::new(Inner {
            comm: EphemeralIdentity::generate().unwrap(),
            user: EphemeralIdentity::generate().unwrap(),
            relays,
            secret: secret.map(|s| s.to_string()),
            pool: hub.pool(),
            behavior: Mutex::new(Behavior::default()),
            requests: Mutex::new(Vec::new()),
        });
        let stream = inner
            .pool
            .subscribe(inner.relays.clone(), inner.filter())
            .await
            .unwrap();
        tokio::task::spawn(serve(inner.clone(), stream));
        Self(inner)
    }

    pub fn comm_pubkey(&self) -> PublicKey {
        self.0.comm.public_key()
    }

    pub fn user_pubkey(&self) -> PublicKey {
        self.0.user.public_key()
    }

    pub fn bunker_uri(&self) -> String {
        self.bunker_uri_with_secret(self.0.secret.clone())
    }

    pub fn bunker_uri_with_secret(&self, secret: Option<String>) -> String {
        BunkerUri {
            signer_pubkey: self.comm_pubkey(),
            relays: self.0.relays.clone(),
            connect_secret: secret,
        }
        .to_string()
    }

    pub fn behave(&self, f: impl FnOnce(&mut Behavior)) {
        f(&mut self.0.behavior.lock());
    }

    pub fn requests(&self) -> Vec<RpcRequest> {
        self.0.requests.lock().clone()
    }

    pub fn methods(&self) -> Vec<RpcMethod> {
        self.requests().into_iter().map(|r| r.method).collect()
    }

    /// Wait until the signer has seen `n` requests.
    pub async fn wait_requests(&self, n: usize) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while self.0.requests.lock().len() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("timed out waiting for signer requests")
    }

    /// Act on a scanned `nostrconnect://` uri: answer with its secret.
    pub async fn accept_connect_uri(&self, uri: &str) {
        let uri = parse_connect(uri).unwrap();
        let result = uri.secret.clone().unwrap_or_else(|| ACK.to_string());
        let response = RpcResponse::ok("connect-ack", result.as_str());
        self.send_to(uri.client_pubkey, response).await;
    }

    /// Push an arbitrary response to `client`.
    pub async fn send_to(&self, client: PublicKey, response: RpcResponse) {
        self.send_tampered(client, response, |_| ()).await;
    }

    /// Seal `response` for `client`, let `tamper` edit the envelope, then
    /// publish it as is.
    pub async fn send_tampered(
        &self,
        client: PublicKey,
        response: RpcResponse,
        tamper: impl FnOnce(&mut SignedEnvelope),
    ) {
        let channel = SecureChannel::new(self.0.comm.clone(), client).unwrap();
        let mut env = channel.seal(&response.to_json()).unwrap();
        tamper(&mut env);
        self.publish(env).await;
    }

    /// Sign `content` for `client` without encrypting it.
    pub async fn send_raw(&self, client: PublicKey, content: &str) {
        let env =
            SignedEnvelope::nostr_connect(&self.0.comm, &client, content.into())
                .unwrap();
        self.publish(env).await;
    }

    /// Answer `client` in the legacy nip-04 format.
    pub async fn send_legacy(&self, client: PublicKey, response: RpcResponse) {
        let secret =
            envelope::shared_secret(self.0.comm.secret_key(), &client).unwrap();
        let content = nip04::encrypt(&secret, &response.to_json()).unwrap();
        self.send_raw(client, &content).await;
    }

    async fn publish(&self, env: SignedEnvelope) {
        let _ = self.0.pool.publish(self.0.relays.clone(), env).await;
    }
}

impl Inner {
    fn filter(&self) -> Filter {
        Filter::nostr_connect(self.comm.public_key())
    }

    fn answer(&self, req: &RpcRequest) -> Result<String, String> {
        let third = || {
            req.params
                .first()
                .and_then(|p| PublicKey::from_hex(p))
                .ok_or_else(|| "bad pubkey param".to_string())
        };
        let text = || req.params.get(1).cloned().unwrap_or_default();
        let shared = |pk: PublicKey| {
            envelope::shared_secret(self.user.secret_key(), &pk)
                .map_err(|e| e.to_string())
        };
        match req.method {
            RpcMethod::Connect => match (&self.secret, req.params.get(1)) {
                (Some(want), Some(got)) if want == got => Ok(ACK.into()),
                (Some(_), _) => Err("invalid secret".into()),
                (None, _) => Ok(ACK.into()),
            },
            RpcMethod::GetPublicKey => Ok(self.user.public_key().to_hex()),
            RpcMethod::Ping => Ok("pong".into()),
            RpcMethod::SignEvent => {
                let unsigned: serde_json::Value = serde_json::from_str(
                    req.params.first().map(|s| s.as_str()).unwrap_or(""),
                )
                .map_err(|e| e.to_string())?;
                let kind = unsigned["kind"].as_u64().unwrap_or(1) as u16;
                let content =
                    unsigned["content"].as_str().unwrap_or("").to_string();
                let tags: Vec<Vec<String>> =
                    serde_json::from_value(unsigned["tags"].clone())
                        .unwrap_or_default();
                let signed =
                    SignedEnvelope::sign(&self.user, kind, tags, content)
                        .map_err(|e| e.to_string())?;
                Ok(serde_json::to_string(&signed).unwrap())
            }
            RpcMethod::Nip44Encrypt => {
                envelope::encrypt(&shared(third()?)?, &text())
                    .map_err(|e| e.to_string())
            }
            RpcMethod::Nip44Decrypt => {
                envelope::decrypt(&shared(third()?)?, &text())
                    .map_err(|e| e.to_string())
            }
            RpcMethod::Nip04Encrypt => {
                nip04::encrypt(&shared(third()?)?, &text())
                    .map_err(|e| e.to_string())
            }
            RpcMethod::Nip04Decrypt => {
                nip04::decrypt(&shared(third()?)?, &text())
                    .map_err(|e| e.to_string())
            }
        }
    }

    fn replies(&self, req: &RpcRequest) -> Vec<RpcResponse> {
        let mut behavior = self.behavior.lock();
        if behavior.silent.contains(&req.method) {
            return Vec::new();
        }
        let mut out = Vec::new();
        if req.method == RpcMethod::SignEvent {
            if let Some(url) = behavior.auth_url.take() {
                out.push(RpcResponse::ok(req.id.as_str(), AUTH_URL));
                out.last_mut().unwrap().error = Some(url);
            }
        }
        let reply = match (&behavior.reject, req.method) {
            (Some(err), m) if m != RpcMethod::Connect => {
                RpcResponse::err(req.id.clone(), err.clone())
            }
            _ => match self.answer(req) {
                Ok(result) => RpcResponse::ok(req.id.clone(), result),
                Err(err) => RpcResponse::err(req.id.clone(), err),
            },
        };
        if behavior.duplicate {
            out.push(reply.clone());
        }
        out.push(reply);
        out
    }

    async fn handle(&self, env: SignedEnvelope) {
        if env.verify().is_err() {
            return;
        }
        let channel = match SecureChannel::new(self.comm.clone(), env.pubkey) {
            Ok(c) => c,
            Err(_) => return,
        };
        let req: RpcRequest = match channel
            .open(&env, true)
            .ok()
            .and_then(|t| serde_json::from_str(&t).ok())
        {
            Some(r) => r,
            None => return,
        };
        self.requests.lock().push(req.clone());
        for reply in self.replies(&req) {
            let env = channel.seal(&reply.to_json()).unwrap();
            let _ = self.pool.publish(self.relays.clone(), env).await;
        }
    }
}

async fn serve(inner: Arc<Inner>, mut stream: EnvelopeStream) {
    loop {
        while let Some(env) = stream.next().await {
            inner.handle(env).await;
        }
        stream = loop {
            match inner
                .pool
                .subscribe(inner.relays.clone(), inner.filter())
                .await
            {
                Ok(s) => break s,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };
    }
}
