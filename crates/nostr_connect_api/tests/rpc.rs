use nostr_connect_api::dependencies::*;
use nostr_connect_api::envelope;
use nostr_connect_api::mem_relay::MemRelayHub;
use nostr_connect_api::mem_store::*;
use nostr_connect_api::prelude::*;
use pretty_assertions::assert_eq;
use std::time::Duration;

mod common;
use common::*;

async fn connected(config: EngineConfig) -> (MemRelayHub, TestSigner, Engine) {
    init_tracing();
    let hub = MemRelayHub::new();
    let signer = TestSigner::spawn(&hub, relays(), None).await;
    let engine = Engine::new(config, hub.pool(), create_mem_store()).unwrap();
    engine
        .start_bunker(&signer.bunker_uri())
        .await
        .unwrap()
        .established()
        .await
        .unwrap();
    (hub, signer, engine)
}

#[tokio::test(flavor = "multi_thread")]
async fn not_connected() {
    init_tracing();
    let hub = MemRelayHub::new();
    let engine =
        Engine::new(test_config(), hub.pool(), create_mem_store()).unwrap();
    assert!(matches!(engine.ping().await, Err(EngineError::NotConnected)));
    assert!(matches!(
        engine.get_public_key().await,
        Err(EngineError::NotConnected)
    ));
    assert!(matches!(
        engine.bunker_uri().await,
        Err(EngineError::NotConnected)
    ));
    assert!(hub.published().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn sign_event_and_ping() {
    let (_hub, signer, engine) = connected(test_config()).await;

    assert_eq!("pong", engine.ping().await.unwrap());

    let unsigned = serde_json::json!({
        "kind": 1,
        "content": "hello from the app",
        "tags": [["t", "demo"]],
        "created_at": 1_700_000_000,
    })
    .to_string();
    let signed = engine.sign_event(&unsigned).await.unwrap();
    let signed: SignedEnvelope = serde_json::from_str(&signed).unwrap();
    signed.verify().unwrap();
    assert_eq!(signer.user_pubkey(), signed.pubkey);
    assert_eq!("hello from the app", signed.content);
    assert_eq!(vec![vec!["t".to_string(), "demo".to_string()]], signed.tags);
}

#[tokio::test(flavor = "multi_thread")]
async fn user_pubkey_is_cached() {
    let (_hub, signer, engine) = connected(test_config()).await;
    let before = signer.requests().len();
    assert_eq!(signer.user_pubkey(), engine.get_public_key().await.unwrap());
    assert_eq!(before, signer.requests().len());
}

#[tokio::test(flavor = "multi_thread")]
async fn third_party_encryption() {
    let (_hub, signer, engine) = connected(test_config()).await;
    let friend = EphemeralIdentity::generate().unwrap();
    let friend_secret =
        envelope::shared_secret(friend.secret_key(), &signer.user_pubkey())
            .unwrap();

    let ct = engine
        .nip44_encrypt(&friend.public_key(), "meet at noon")
        .await
        .unwrap();
    assert_eq!(
        "meet at noon",
        envelope::decrypt(&friend_secret, &ct).unwrap()
    );
    assert_eq!(
        "meet at noon",
        engine.nip44_decrypt(&friend.public_key(), &ct).await.unwrap()
    );

    let legacy =
        envelope::nip04::encrypt(&friend_secret, "old school").unwrap();
    assert_eq!(
        "old school",
        engine
            .nip04_decrypt(&friend.public_key(), &legacy)
            .await
            .unwrap()
    );
    let ct = engine
        .nip04_encrypt(&friend.public_key(), "back again")
        .await
        .unwrap();
    assert_eq!(
        "back again",
        envelope::nip04::decrypt(&friend_secret, &ct).unwrap()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_responses_resolve_once() {
    let (_hub, signer, engine) = connected(test_config()).await;
    signer.behave(|b| b.duplicate = true);

    let a = engine.call(RpcMethod::Ping, vec![], None).await.unwrap();
    let b = engine.call(RpcMethod::Ping, vec![], None).await.unwrap();
    assert_ne!(a.id(), b.id());
    assert_eq!("pong", a.response().await.unwrap());
    assert_eq!("pong", b.response().await.unwrap());
    assert_eq!("pong", engine.ping().await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn signer_rejection_fails_one_call() {
    let (_hub, signer, engine) = connected(test_config()).await;
    signer.behave(|b| b.reject = Some("user said no".into()));

    match engine.sign_event(r#"{"kind":1,"content":"x"}"#).await {
        Err(EngineError::Rpc(RpcError::SignerRejected(msg))) => {
            assert_eq!("user said no", msg)
        }
        oth => panic!("unexpected {oth:?}"),
    }
    // the session survives
    assert_eq!(EngineState::Connected, engine.state());
    signer.behave(|b| b.reject = None);
    assert_eq!("pong", engine.ping().await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn auth_challenge_keeps_call_pending() {
    let (_hub, signer, engine) = connected(test_config()).await;
    signer.behave(|b| b.auth_url = Some("https://signer.example/ok".into()));
    let mut events = engine.events();

    let call = engine
        .call(
            RpcMethod::SignEvent,
            vec![r#"{"kind":1,"content":"x"}"#.into()],
            None,
        )
        .await
        .unwrap();
    let id = call.id().to_string();

    let evt = next_event(&mut events, |e| {
        matches!(e, EngineEvent::AuthChallenge { .. })
    })
    .await;
    assert_eq!(
        EngineEvent::AuthChallenge {
            id,
            url: "https://signer.example/ok".into(),
        },
        evt
    );

    // the real answer follows the challenge
    let signed: SignedEnvelope =
        serde_json::from_str(&call.response().await.unwrap()).unwrap();
    assert_eq!(signer.user_pubkey(), signed.pubkey);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_one_call() {
    let (_hub, signer, engine) = connected(test_config()).await;
    signer.behave(|b| b.silent.push(RpcMethod::Ping));

    let stuck = engine.call(RpcMethod::Ping, vec![], None).await.unwrap();
    let other = engine
        .call(RpcMethod::GetPublicKey, vec![], None)
        .await
        .unwrap();
    stuck.cancel().await;
    assert!(matches!(
        stuck.response().await,
        Err(EngineError::Rpc(RpcError::Cancelled))
    ));
    assert_eq!(
        signer.user_pubkey().to_hex(),
        other.response().await.unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn calls_time_out() {
    let config = EngineConfig::builder()
        .with_rpc_timeout_ms(500)
        .build()
        .unwrap();
    let (_hub, signer, engine) = connected(config).await;
    signer.behave(|b| b.silent.push(RpcMethod::Ping));

    let start = tokio::time::Instant::now();
    assert!(matches!(
        engine.ping().await,
        Err(EngineError::Rpc(RpcError::Timeout))
    ));
    assert!(start.elapsed() >= Duration::from_millis(500));

    let call = engine
        .call(RpcMethod::Ping, vec![], Some(Duration::from_millis(50)))
        .await
        .unwrap();
    assert!(matches!(
        call.response().await,
        Err(EngineError::Rpc(RpcError::Timeout))
    ));

    // timeouts do not end the session
    assert_eq!(EngineState::Connected, engine.state());
    signer.behave(|b| b.silent.clear());
    assert_eq!("pong", engine.ping().await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn publish_failure_fails_the_call() {
    let (hub, _signer, engine) = connected(test_config()).await;

    // one attempt plus one retry
    hub.fail_next_publishes(2);
    assert!(matches!(
        engine.ping().await,
        Err(EngineError::Rpc(RpcError::Transport(TransportError::Publish(
            _
        ))))
    ));
    assert_eq!("pong", engine.ping().await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn publish_retry_recovers() {
    let (hub, _signer, engine) = connected(test_config()).await;
    hub.fail_next_publishes(1);
    assert_eq!("pong", engine.ping().await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn huge_call_timeout_is_accepted() {
    let config = EngineConfig::builder()
        .with_rpc_timeout_ms(u64::MAX)
        .build()
        .unwrap();
    let (_hub, _signer, engine) = connected(config).await;

    let call = engine
        .call(RpcMethod::Ping, vec![], Some(Duration::MAX))
        .await
        .unwrap();
    assert_eq!("pong", call.response().await.unwrap());
    assert_eq!("pong", engine.ping().await.unwrap());
}

/// Issue a ping the signer will not answer, returning the call and the
/// client key responses must be addressed to.
async fn unanswered_ping(
    signer: &TestSigner,
    engine: &Engine,
) -> (RpcCall, PublicKey) {
    signer.behave(|b| b.silent.push(RpcMethod::Ping));
    let seen = signer.requests().len();
    let call = engine.call(RpcMethod::Ping, vec![], None).await.unwrap();
    signer.wait_requests(seen + 1).await;
    let client = engine.session_info().await.unwrap().unwrap().client_pubkey;
    (call, client)
}

#[tokio::test(flavor = "multi_thread")]
async fn session_survives_garbage() {
    let (hub, signer, engine) = connected(test_config()).await;
    let (call, client) = unanswered_ping(&signer, &engine).await;
    let id = call.id().to_string();
    let forged = || RpcResponse::ok(id.as_str(), "forged");

    signer.send_raw(client, "definitely not ciphertext").await;
    signer.send_raw(client, "").await;
    signer
        .send_tampered(client, forged(), |env| flip_hex(&mut env.sig))
        .await;
    signer
        .send_tampered(client, forged(), |env| flip_hex(&mut env.id))
        .await;
    signer
        .send_tampered(client, forged(), |env| env.content.push('A'))
        .await;
    signer.send_legacy(client, forged()).await;
    let stranger = TestSigner::spawn(&hub, relays(), None).await;
    stranger.send_to(client, forged()).await;
    stranger
        .send_to(client, RpcResponse::err(id.as_str(), "forged"))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(EngineState::Connected, engine.state());

    signer
        .send_to(client, RpcResponse::ok(id.as_str(), "pong"))
        .await;
    assert_eq!("pong", call.response().await.unwrap());
    signer.behave(|b| b.silent.clear());
    assert_eq!("pong", engine.ping().await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn legacy_responses_need_opt_in() {
    let config = EngineConfig::builder()
        .with_retries(1, 10)
        .with_legacy_nip04(true)
        .build()
        .unwrap();
    let (_hub, signer, engine) = connected(config).await;
    let (call, client) = unanswered_ping(&signer, &engine).await;

    let id = call.id().to_string();
    signer
        .send_legacy(client, RpcResponse::ok(id.as_str(), "old pong"))
        .await;
    assert_eq!("old pong", call.response().await.unwrap());
}
