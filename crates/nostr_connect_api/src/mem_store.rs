//! In-memory credential store - usually for testing.

use crate::store::traits::*;
use crate::store::*;
use crate::*;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Create an in-memory CredentialStore.
pub fn create_mem_store() -> CredentialStore {
    CredentialStore::new(MemCredentialStore::default())
}

/// In-memory credential store. Clones share the same map, so a test can
/// keep one to inspect what an engine wrote.
#[derive(Clone, Default)]
pub struct MemCredentialStore(Arc<RwLock<HashMap<&'static str, String>>>);

impl MemCredentialStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A credential store handle sharing this map.
    pub fn handle(&self) -> CredentialStore {
        CredentialStore::new(self.clone())
    }

    /// The keys currently present, sorted.
    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<_> = self.0.read().keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Raw access for inspection.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.0.read().get(key).cloned()
    }
}

impl AsCredentialStore for MemCredentialStore {
    fn get(
        &self,
        key: &'static str,
    ) -> BoxFuture<'static, Result<Option<String>, SessionError>> {
        let res = self.0.read().get(key).cloned();
        async move { Ok(res) }.boxed()
    }

    fn set(
        &self,
        key: &'static str,
        value: String,
    ) -> BoxFuture<'static, Result<(), SessionError>> {
        self.0.write().insert(key, value);
        async move { Ok(()) }.boxed()
    }

    fn delete(
        &self,
        key: &'static str,
    ) -> BoxFuture<'static, Result<(), SessionError>> {
        self.0.write().remove(key);
        async move { Ok(()) }.boxed()
    }
}
