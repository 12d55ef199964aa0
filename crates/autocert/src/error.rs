//! Error types for certificate reconciliation.
//!
//! Every error here is scoped to one certificate or one pass; none of them
//! is fatal to the process.

use std::time::Duration;

use thiserror::Error;

/// Secret store I/O errors.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("secret store request for {secret} failed: {message}")]
    Api { secret: String, message: String },

    /// Transport failure, throttling or a server-side error; worth retrying
    #[error("secret store unavailable for {secret}: {message}")]
    Unavailable { secret: String, message: String },
}

/// Ledger load/save failures.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger store error: {0}")]
    Backend(#[from] BackendError),

    #[error("ledger data is corrupt: {0}")]
    Corrupt(#[source] serde_json::Error),

    #[error("failed to serialize ledger: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// Declared-config source failures. Each one aborts the current pass.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read declared config: {0}")]
    Backend(#[from] BackendError),

    #[error("declared config secret {0} not found")]
    SecretNotFound(String),

    #[error("declared config secret {secret} has no key {key:?}")]
    MissingKey { secret: String, key: String },

    #[error("failed to parse declared config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("failed to read declared config file: {0}")]
    Io(#[from] std::io::Error),
}

/// Stored certificate material could not be evaluated.
///
/// Callers treat this as "renewal required", never as a terminal failure.
#[derive(Debug, Error)]
pub enum ExpiryError {
    #[error("certificate data is not valid base64: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("certificate data is not PEM: {0}")]
    Pem(#[from] pem::PemError),

    #[error("PEM block is {0:?}, expected CERTIFICATE")]
    UnexpectedTag(String),

    #[error("invalid X.509 certificate: {0}")]
    X509(String),

    #[error("certificate NotAfter is out of range")]
    InvalidTimestamp,
}

/// Failures of the external ACME actor.
#[derive(Debug, Error)]
pub enum IssuerError {
    /// The actor could not be started or did not finish in time
    #[error("ACME actor unavailable: {reason}")]
    ActorUnavailable { reason: String },

    /// The actor ran and reported failure
    #[error("ACME actor failed for {domain} ({status}): {output}")]
    ActorFailed {
        domain: String,
        status: String,
        output: String,
    },

    /// The actor reported success but left no readable material
    #[error("ACME actor produced no readable {file} for {domain}: {reason}")]
    OutputUnreadable {
        domain: String,
        file: String,
        reason: String,
    },

    #[error("cannot invoke ACME actor: {0}")]
    InvalidSpec(#[from] SpecError),
}

impl IssuerError {
    pub(crate) fn timed_out(domain: &str, after: Duration) -> Self {
        Self::ActorUnavailable {
            reason: format!("invocation for {domain} timed out after {after:?}"),
        }
    }
}

/// Target store distribution failures.
#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("certificate or key data is empty")]
    IncompleteMaterial,

    #[error("{field} is not valid base64: {source}")]
    MalformedMaterial {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    #[error("failed to write secret {secret}: {source}")]
    StoreWrite {
        secret: String,
        #[source]
        source: BackendError,
    },
}

/// Structural problems in a declared certificate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("certificate name is empty")]
    EmptyName,

    #[error("no domains declared")]
    NoDomains,

    #[error("domain #{index} is empty")]
    EmptyDomain { index: usize },

    #[error("no DNS provider declared")]
    MissingDnsProvider,

    #[error("target secret #{index} needs both namespace and name")]
    InvalidTarget { index: usize },
}

/// Why reconciling one certificate failed.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid certificate spec: {0}")]
    InvalidSpec(#[from] SpecError),

    #[error("ledger I/O failed: {0}")]
    Ledger(#[from] LedgerError),

    #[error("issuance failed: {0}")]
    Issuer(#[from] IssuerError),

    #[error("distribution failed: {0}")]
    Distribution(#[from] DistributionError),
}

/// Result type for per-certificate reconciliation.
pub type ReconcileResult<T> = Result<T, ReconcileError>;
