//! Durable certificate ledger
//!
//! The ledger is a single JSON document stored under one key of one secret:
//!
//! ```text
//! <namespace>/<name>            # CONTEXT_SECRET_NAMESPACE / CONTEXT_SECRET_NAME
//! └── context                   # {"certificates": {"<name>": {...record...}}}
//! ```
//!
//! A missing secret or a missing key means "no prior state", never an error.
//!
//! # Concurrency
//!
//! [`LedgerStore::put`] is a read-modify-write without a concurrency token.
//! Calls for different certificates must not run in parallel or updates get
//! lost; the engine processes certificates one at a time for this reason.

use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::backend::{SecretBackend, SecretPayload};
use crate::error::LedgerError;
use crate::model::{CertificateLedger, CertificateRecord, SecretRef};

/// Default key under which the ledger JSON is stored
pub const DEFAULT_LEDGER_KEY: &str = "context";

/// Load/save access to the certificate ledger
#[derive(Clone)]
pub struct LedgerStore {
    backend: Arc<dyn SecretBackend>,
    secret: SecretRef,
    key: String,
}

impl LedgerStore {
    /// Create a ledger store backed by `secret`/`key`
    pub fn new(backend: Arc<dyn SecretBackend>, secret: SecretRef, key: impl Into<String>) -> Self {
        Self {
            backend,
            secret,
            key: key.into(),
        }
    }

    /// The secret holding the ledger
    pub fn secret(&self) -> &SecretRef {
        &self.secret
    }

    // =========================================================================
    // Whole-ledger Operations
    // =========================================================================

    /// Load the ledger, returning an empty one when nothing is stored yet
    pub async fn load(&self) -> Result<CertificateLedger, LedgerError> {
        debug!(secret = %self.secret, "Loading certificate ledger");

        let Some(payload) = self.backend.read(&self.secret).await? else {
            debug!(secret = %self.secret, "Ledger secret does not exist, starting empty");
            return Ok(CertificateLedger::default());
        };

        let Some(raw) = payload.get(&self.key) else {
            debug!(
                secret = %self.secret,
                key = %self.key,
                "Ledger secret has no ledger key, starting empty"
            );
            return Ok(CertificateLedger::default());
        };

        let ledger: CertificateLedger = serde_json::from_slice(raw).map_err(LedgerError::Corrupt)?;

        debug!(certificates = ledger.len(), "Loaded certificate ledger");
        Ok(ledger)
    }

    /// Serialize and write the whole ledger (create or overwrite)
    pub async fn save(&self, ledger: &CertificateLedger) -> Result<(), LedgerError> {
        let json = serde_json::to_vec(ledger).map_err(LedgerError::Serialize)?;
        trace!(bytes = json.len(), "Serialized certificate ledger");

        self.backend
            .write(&self.secret, SecretPayload::opaque(self.key.clone(), json))
            .await?;

        info!(
            secret = %self.secret,
            certificates = ledger.len(),
            "Saved certificate ledger"
        );
        Ok(())
    }

    // =========================================================================
    // Record Operations
    // =========================================================================

    /// Look up one record
    pub async fn get(&self, name: &str) -> Result<Option<CertificateRecord>, LedgerError> {
        let mut ledger = self.load().await?;
        let record = ledger.certificates.remove(name);

        if record.is_some() {
            debug!(certificate = %name, "Found certificate in ledger");
        } else {
            debug!(certificate = %name, "Certificate not in ledger");
        }
        Ok(record)
    }

    /// Insert or replace one record (load, mutate, save)
    pub async fn put(&self, record: CertificateRecord) -> Result<(), LedgerError> {
        let mut ledger = self.load().await?;
        debug!(certificate = %record.name(), "Upserting certificate into ledger");
        ledger.upsert(record);
        self.save(&ledger).await
    }
}

impl std::fmt::Debug for LedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerStore")
            .field("secret", &self.secret)
            .field("key", &self.key)
            .finish()
    }
}
