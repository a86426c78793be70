//! In-memory relay hub - usually for testing.
//!
//! Every pool handle made from one hub shares the same subscriptions, so
//! a client engine and a test signer can talk through it. Envelopes are
//! ephemeral: only subscriptions open at publish time receive them.

use crate::encoding::RelayUrl;
use crate::event::*;
use crate::relay::traits::*;
use crate::relay::*;
use crate::*;
use futures::channel::mpsc;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

struct MemSub {
    relays: Vec<RelayUrl>,
    filter: Filter,
    sender: mpsc::UnboundedSender<SignedEnvelope>,
}

#[derive(Default)]
struct MemRelayInner {
    subs: Vec<MemSub>,
    published: Vec<SignedEnvelope>,
    fail_publishes: u32,
    fail_subscribes: u32,
    subscribe_delay: Option<Duration>,
}

fn overlaps(a: &[RelayUrl], b: &[RelayUrl]) -> bool {
    a.iter().any(|r| b.contains(r))
}

/// A shared in-memory relay hub.
#[derive(Clone, Default)]
pub struct MemRelayHub(Arc<Mutex<MemRelayInner>>);

impl MemRelayHub {
    /// An empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// A relay pool handle backed by this hub.
    pub fn pool(&self) -> RelayPool {
        RelayPool::new(self.clone())
    }

    /// Number of subscriptions whose stream is still held by someone.
    pub fn active_subscriptions(&self) -> usize {
        let mut lock = self.0.lock();
        lock.subs.retain(|s| !s.sender.is_closed());
        lock.subs.len()
    }

    /// Every envelope published so far, in order.
    pub fn published(&self) -> Vec<SignedEnvelope> {
        self.0.lock().published.clone()
    }

    /// Make the next `n` publishes fail.
    pub fn fail_next_publishes(&self, n: u32) {
        self.0.lock().fail_publishes = n;
    }

    /// Make the next `n` subscribes fail.
    pub fn fail_next_subscribes(&self, n: u32) {
        self.0.lock().fail_subscribes = n;
    }

    /// Delay every subscription acknowledgement.
    pub fn set_subscribe_delay(&self, delay: Option<Duration>) {
        self.0.lock().subscribe_delay = delay;
    }

    /// End every open subscription stream, as a relay disconnect would.
    pub fn disconnect_all(&self) {
        let subs = std::mem::take(&mut self.0.lock().subs);
        debug!(count = subs.len(), "mem relay dropping all subscriptions");
        drop(subs);
    }

    fn deliver(&self, relays: &[RelayUrl], envelope: SignedEnvelope) {
        let mut lock = self.0.lock();
        lock.published.push(envelope.clone());
        lock.subs.retain(|sub| {
            if !overlaps(&sub.relays, relays) || !sub.filter.matches(&envelope)
            {
                return !sub.sender.is_closed();
            }
            sub.sender.unbounded_send(envelope.clone()).is_ok()
        });
    }
}

impl AsRelayPool for MemRelayHub {
    fn subscribe(
        &self,
        relays: Vec<RelayUrl>,
        filter: Filter,
    ) -> BoxFuture<'static, Result<EnvelopeStream, TransportError>> {
        let hub = self.clone();
        async move {
            let delay = {
                let mut lock = hub.0.lock();
                if lock.fail_subscribes > 0 {
                    lock.fail_subscribes -= 1;
                    return Err(TransportError::Subscribe(
                        "mem relay injected failure".into(),
                    ));
                }
                lock.subscribe_delay
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let (sender, receiver) = mpsc::unbounded();
            trace!(?filter, "mem relay subscribe");
            hub.0.lock().subs.push(MemSub {
                relays,
                filter,
                sender,
            });
            Ok(receiver.boxed())
        }
        .boxed()
    }

    fn publish(
        &self,
        relays: Vec<RelayUrl>,
        envelope: SignedEnvelope,
    ) -> BoxFuture<'static, Result<(), PublishError>> {
        let hub = self.clone();
        async move {
            {
                let mut lock = hub.0.lock();
                if lock.fail_publishes > 0 {
                    lock.fail_publishes -= 1;
                    return Err(PublishError(
                        "mem relay injected failure".into(),
                    ));
                }
            }
            hub.deliver(&relays, envelope);
            Ok(())
        }
        .boxed()
    }
}
