//! Autocert Library
//!
//! Keeps ACME-issued TLS certificates valid and pushes them into secret
//! stores.
//!
//! Each pass reads the declared certificates, compares them with the
//! certificate ledger and then, per certificate:
//!
//! - **Issue** when the ledger has no entry
//! - **Renew** when the stored certificate expires within 30 days or cannot be read
//! - **Re-sync** the stored material to its target secrets otherwise
//!
//! Issuance is delegated to an external ACME client (`acme.sh`) through the
//! [`CertificateIssuer`] trait, and all storage goes through the
//! [`SecretBackend`] trait.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use autocert::{AcmeShIssuer, MemorySecretBackend, ReconciliationEngine, Settings};
//!
//! let settings = Settings::from_env();
//! let issuer = Arc::new(AcmeShIssuer::new(settings.issuer.clone()));
//! let engine = ReconciliationEngine::with_backend(
//!     Arc::new(MemorySecretBackend::new()),
//!     issuer,
//!     &settings,
//! );
//! let report = engine.reconcile_all(&specs).await;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod backend;
pub mod config;
pub mod declared;
pub mod distributor;
pub mod engine;
pub mod error;
pub mod expiry;
pub mod issuer;
pub mod ledger;
pub mod model;
pub mod scheduler;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Domain model
pub use model::{CertificateLedger, CertificateRecord, CertificateSpec, IssuedMaterial, SecretRef};

// Errors
pub use error::{
    BackendError, ConfigLoadError, DistributionError, ExpiryError, IssuerError, LedgerError,
    ReconcileError, ReconcileResult, SpecError,
};

// Settings
pub use config::{IssuerSettings, Settings};

// Secret stores
#[cfg(feature = "kubernetes")]
pub use backend::KubeSecretBackend;
pub use backend::{MemorySecretBackend, SecretBackend, SecretKind, SecretPayload};

// Reconciliation
pub use declared::{load_declared_file, parse_declared, DeclaredConfigSource};
pub use distributor::SecretDistributor;
pub use engine::{
    CertificateOutcome, CertificateState, ReconcileAction, ReconcileReport, ReconciliationEngine,
};
pub use expiry::{ExpiryEvaluator, ExpiryVerdict};
pub use issuer::{AcmeShIssuer, CertificateIssuer};
pub use ledger::LedgerStore;

// Scheduling
pub use scheduler::{PassSummary, RenewalScheduler, SweepTrigger};
