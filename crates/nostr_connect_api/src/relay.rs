//! The relay transport seam.
//!
//! The engine never speaks websocket itself. It asks a [RelayPool] to
//! subscribe to a filter and to publish envelopes.

use crate::encoding::RelayUrl;
use crate::event::*;
use crate::*;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::sync::Arc;

/// Stream of envelopes matching a subscription. Dropping it ends the
/// subscription; the stream ending means the relay side went away.
pub type EnvelopeStream = BoxStream<'static, SignedEnvelope>;

/// Traits related to RelayPool. Unless you're writing a new
/// implementation, you probably don't need these.
pub mod traits {
    use super::*;

    /// Defines the relay pool api.
    pub trait AsRelayPool: 'static + Send + Sync {
        /// Subscribe to `filter` on `relays`. Resolving `Ok` is the
        /// subscription acknowledgement.
        fn subscribe(
            &self,
            relays: Vec<RelayUrl>,
            filter: Filter,
        ) -> BoxFuture<'static, Result<EnvelopeStream, TransportError>>;

        /// Publish an envelope to `relays`.
        fn publish(
            &self,
            relays: Vec<RelayUrl>,
            envelope: SignedEnvelope,
        ) -> BoxFuture<'static, Result<(), PublishError>>;
    }
}
use traits::*;

/// Concrete relay pool handle.
#[derive(Clone)]
pub struct RelayPool(pub Arc<dyn AsRelayPool>);

impl RelayPool {
    /// Wrap an implementation.
    pub fn new<P: AsRelayPool>(pool: P) -> Self {
        Self(Arc::new(pool))
    }

    /// Subscribe to `filter` on `relays`.
    pub fn subscribe(
        &self,
        relays: Vec<RelayUrl>,
        filter: Filter,
    ) -> BoxFuture<'static, Result<EnvelopeStream, TransportError>> {
        AsRelayPool::subscribe(&*self.0, relays, filter)
    }

    /// Publish an envelope to `relays`.
    pub fn publish(
        &self,
        relays: Vec<RelayUrl>,
        envelope: SignedEnvelope,
    ) -> BoxFuture<'static, Result<(), PublishError>> {
        AsRelayPool::publish(&*self.0, relays, envelope)
    }
}

impl std::fmt::Debug for RelayPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RelayPool")
    }
}
