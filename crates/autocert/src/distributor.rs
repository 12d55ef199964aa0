//! Pushes certificate material into target secrets.
//!
//! Each target receives a `kubernetes.io/tls` secret holding exactly
//! `tls.crt` and `tls.key`. Writes are create-or-replace, so pushing the same
//! record again leaves every target in the same state.
//!
//! Targets are written in declaration order. The first failing target aborts
//! the push; targets before it keep the new material (no rollback). Retrying
//! is always safe.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, error, info};

use crate::backend::{SecretBackend, SecretPayload};
use crate::error::DistributionError;
use crate::model::CertificateRecord;

/// Writes a record's material to every target it names
#[derive(Clone)]
pub struct SecretDistributor {
    backend: Arc<dyn SecretBackend>,
}

impl SecretDistributor {
    pub fn new(backend: Arc<dyn SecretBackend>) -> Self {
        Self { backend }
    }

    /// Push `record`'s certificate/key pair to all of its targets
    pub async fn distribute(&self, record: &CertificateRecord) -> Result<(), DistributionError> {
        if record.cert_data.is_empty() || record.key_data.is_empty() {
            error!(certificate = %record.name(), "Certificate or key data is empty");
            return Err(DistributionError::IncompleteMaterial);
        }

        let certificate_chain = STANDARD.decode(record.cert_data.trim()).map_err(|source| {
            DistributionError::MalformedMaterial {
                field: "cert_data",
                source,
            }
        })?;
        let private_key = STANDARD.decode(record.key_data.trim()).map_err(|source| {
            DistributionError::MalformedMaterial {
                field: "key_data",
                source,
            }
        })?;

        debug!(
            certificate = %record.name(),
            targets = record.spec.targets.len(),
            "Distributing certificate to target secrets"
        );

        for target in &record.spec.targets {
            let payload = SecretPayload::tls(certificate_chain.clone(), private_key.clone());

            if let Err(e) = self.backend.write(target, payload).await {
                error!(
                    certificate = %record.name(),
                    namespace = %target.namespace,
                    secret = %target.name,
                    error = %e,
                    "Failed to update target secret"
                );
                return Err(DistributionError::StoreWrite {
                    secret: target.to_string(),
                    source: e,
                });
            }

            debug!(
                certificate = %record.name(),
                namespace = %target.namespace,
                secret = %target.name,
                "Updated target secret"
            );
        }

        info!(
            certificate = %record.name(),
            targets = record.spec.targets.len(),
            "Target secrets are up to date"
        );
        Ok(())
    }
}

impl std::fmt::Debug for SecretDistributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretDistributor").finish_non_exhaustive()
    }
}
