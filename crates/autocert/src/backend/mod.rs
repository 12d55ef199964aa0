//! Secret store backends.
//!
//! The ledger, the declared-config source and every distribution target
//! live in the same kind of key-value secret store.

mod memory;
#[cfg(feature = "kubernetes")]
mod kubernetes;

pub use memory::MemorySecretBackend;
#[cfg(feature = "kubernetes")]
pub use kubernetes::KubeSecretBackend;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::BackendError;
use crate::model::SecretRef;

/// Key holding the certificate chain in a TLS secret
pub const TLS_CERT_KEY: &str = "tls.crt";

/// Key holding the private key in a TLS secret
pub const TLS_KEY_KEY: &str = "tls.key";

/// Purpose of a stored secret
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecretKind {
    #[default]
    Opaque,
    Tls,
}

impl SecretKind {
    /// Kubernetes secret type string
    pub fn as_type_str(self) -> &'static str {
        match self {
            SecretKind::Opaque => "Opaque",
            SecretKind::Tls => "kubernetes.io/tls",
        }
    }
}

/// Contents of one secret
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SecretPayload {
    pub kind: SecretKind,
    pub data: BTreeMap<String, Vec<u8>>,
}

impl SecretPayload {
    pub fn opaque(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            kind: SecretKind::Opaque,
            data: BTreeMap::from([(key.into(), value)]),
        }
    }

    /// A TLS secret with exactly `tls.crt` and `tls.key`
    pub fn tls(certificate_chain: Vec<u8>, private_key: Vec<u8>) -> Self {
        Self {
            kind: SecretKind::Tls,
            data: BTreeMap::from([
                (TLS_CERT_KEY.to_string(), certificate_chain),
                (TLS_KEY_KEY.to_string(), private_key),
            ]),
        }
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }
}

/// Secret store abstraction
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Read a secret; `Ok(None)` when it does not exist.
    async fn read(&self, secret: &SecretRef) -> Result<Option<SecretPayload>, BackendError>;

    /// Create the secret if absent, otherwise replace its contents.
    async fn write(&self, secret: &SecretRef, payload: SecretPayload) -> Result<(), BackendError>;
}
