// default implementations don't always make sense...
#![allow(clippy::new_without_default)]
#![deny(missing_docs)]
//! Client side of the nostr connect (nip-46) remote signing protocol.
//!
//! An application uses this crate to obtain signatures from a remote key
//! holder (the "signer") without ever seeing the user's private key. All
//! traffic is encrypted json-rpc carried over untrusted public relays.
//!
//! The relay transport and the secret-at-rest backend are consumed through
//! the [relay::RelayPool] and [store::CredentialStore] seams; in-memory
//! implementations of both live in [mem_relay] and [mem_store].

/// Re-exported dependencies.
pub mod dependencies {
    pub use futures;
    pub use k256;
    pub use serde;
    pub use serde_json;
    pub use serde_yaml;
    pub use tokio;
    pub use tracing;
    pub use url;
    pub use zeroize;
}

use dependencies::tracing::*;

mod error;
pub use error::*;

mod config;
pub use config::*;

pub mod encoding;

pub mod uri;

pub mod identity;

pub mod envelope;

pub mod event;

pub mod rpc;

pub mod correlator;

pub mod relay;

pub mod mem_relay;

pub mod store;

pub mod mem_store;

pub mod session;

pub mod engine;

pub mod internal;

/// Re-export module for the most commonly used types.
pub mod prelude {
    pub use crate::config::*;
    pub use crate::correlator::*;
    pub use crate::encoding::*;
    pub use crate::engine::*;
    pub use crate::envelope::*;
    pub use crate::error::*;
    pub use crate::event::*;
    pub use crate::identity::*;
    pub use crate::relay::*;
    pub use crate::rpc::*;
    pub use crate::session::*;
    pub use crate::store::*;
    pub use crate::uri::*;
}
