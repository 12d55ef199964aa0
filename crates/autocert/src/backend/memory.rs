//! In-process secret store.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::{SecretBackend, SecretPayload};
use crate::error::BackendError;
use crate::model::SecretRef;

/// Secret store held in memory, for tests and offline runs.
///
/// Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemorySecretBackend {
    secrets: Arc<DashMap<SecretRef, SecretPayload>>,
}

impl MemorySecretBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a secret directly
    pub fn insert(&self, secret: SecretRef, payload: SecretPayload) {
        self.secrets.insert(secret, payload);
    }

    pub fn get(&self, secret: &SecretRef) -> Option<SecretPayload> {
        self.secrets.get(secret).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, secret: &SecretRef) -> bool {
        self.secrets.contains_key(secret)
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Ordered copy of every stored secret
    pub fn snapshot(&self) -> BTreeMap<SecretRef, SecretPayload> {
        self.secrets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[async_trait]
impl SecretBackend for MemorySecretBackend {
    async fn read(&self, secret: &SecretRef) -> Result<Option<SecretPayload>, BackendError> {
        let found = self.get(secret);
        trace!(secret = %secret, found = found.is_some(), "Memory secret read");
        Ok(found)
    }

    async fn write(&self, secret: &SecretRef, payload: SecretPayload) -> Result<(), BackendError> {
        trace!(secret = %secret, keys = payload.data.len(), "Memory secret write");
        self.secrets.insert(secret.clone(), payload);
        Ok(())
    }
}
