//! Certificate reconciliation
//!
//! For every declared certificate the engine decides between issuing,
//! renewing and re-syncing, records the outcome in the ledger and pushes the
//! material to the certificate's target secrets.
//!
//! # Per-certificate state machine
//!
//! | State           | Meaning                                    | Action                               |
//! |-----------------|--------------------------------------------|--------------------------------------|
//! | `NoRecord`      | no ledger entry                            | issue, save, distribute              |
//! | `InvalidRecord` | material missing or unparsable             | merge spec, renew, save, distribute  |
//! | `NeedsRenewal`  | less than 30 days left                     | merge spec, renew, save, distribute  |
//! | `Valid`         | at least 30 days left                      | distribute the stored record as is   |
//!
//! Issue and renew each fall back to one forced re-issue before failing.
//!
//! A `Valid` certificate is redistributed from the stored record, so target
//! list changes in the declaration only take effect at the next renewal.
//!
//! Certificates are processed one at a time: the ledger is updated with an
//! unguarded read-modify-write and the ACME actor is never run concurrently.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::backend::SecretBackend;
use crate::config::Settings;
use crate::distributor::SecretDistributor;
use crate::error::{IssuerError, LedgerError, ReconcileError, ReconcileResult};
use crate::expiry::{self, ExpiryEvaluator};
use crate::issuer::CertificateIssuer;
use crate::ledger::LedgerStore;
use crate::model::{CertificateRecord, CertificateSpec, IssuedMaterial};

/// Where a certificate stands before reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateState {
    NoRecord,
    Valid,
    NeedsRenewal,
    InvalidRecord,
}

/// What reconciliation did for one certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// First issuance
    Issued,
    /// Renewed from `NeedsRenewal` or `InvalidRecord`
    Renewed { from: CertificateState },
    /// Still valid; stored material pushed again
    Synced,
}

impl fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileAction::Issued => f.write_str("issued"),
            ReconcileAction::Renewed { .. } => f.write_str("renewed"),
            ReconcileAction::Synced => f.write_str("synced"),
        }
    }
}

/// Result for one certificate in a pass
#[derive(Debug)]
pub struct CertificateOutcome {
    pub name: String,
    pub result: ReconcileResult<ReconcileAction>,
}

impl CertificateOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Ordered per-certificate results of one pass
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub outcomes: Vec<CertificateOutcome>,
}

impl ReconcileReport {
    pub fn attempted(&self) -> usize {
        self.outcomes.len()
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &CertificateOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    pub fn failure_count(&self) -> usize {
        self.failures().count()
    }

    pub fn is_clean(&self) -> bool {
        self.outcomes.iter().all(CertificateOutcome::is_success)
    }

    /// Outcome for a certificate name (the last one if it appeared twice)
    pub fn outcome(&self, name: &str) -> Option<&CertificateOutcome> {
        self.outcomes.iter().rev().find(|o| o.name == name)
    }
}

/// Drives issuance, renewal and distribution for declared certificates
pub struct ReconciliationEngine {
    ledger: LedgerStore,
    distributor: SecretDistributor,
    issuer: Arc<dyn CertificateIssuer>,
    evaluator: ExpiryEvaluator,
}

impl ReconciliationEngine {
    pub fn new(
        ledger: LedgerStore,
        distributor: SecretDistributor,
        issuer: Arc<dyn CertificateIssuer>,
    ) -> Self {
        Self {
            ledger,
            distributor,
            issuer,
            evaluator: ExpiryEvaluator::new(),
        }
    }

    /// Engine whose ledger and targets share one secret backend
    pub fn with_backend(
        backend: Arc<dyn SecretBackend>,
        issuer: Arc<dyn CertificateIssuer>,
        settings: &Settings,
    ) -> Self {
        let ledger = LedgerStore::new(
            Arc::clone(&backend),
            settings.ledger_secret.clone(),
            settings.ledger_key.clone(),
        );
        Self::new(ledger, SecretDistributor::new(backend), issuer)
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    // =========================================================================
    // Batch Operations
    // =========================================================================

    /// Reconcile every declared certificate in order
    ///
    /// A failing certificate never stops the pass; every outcome is returned.
    pub async fn reconcile_all(&self, specs: &[CertificateSpec]) -> ReconcileReport {
        info!(certificates = specs.len(), "Reconciling declared certificates");

        let mut report = ReconcileReport::default();
        for spec in specs {
            let result = self.reconcile(spec).await;
            match &result {
                Ok(action) => {
                    debug!(certificate = %spec.name, %action, "Certificate reconciled");
                }
                Err(e) => {
                    error!(certificate = %spec.name, error = %e, "Failed to reconcile certificate");
                }
            }
            report.outcomes.push(CertificateOutcome {
                name: spec.name.clone(),
                result,
            });
        }

        if report.is_clean() {
            info!(certificates = report.attempted(), "All certificates reconciled");
        } else {
            let failed: Vec<&str> = report.failures().map(|o| o.name.as_str()).collect();
            warn!(
                attempted = report.attempted(),
                failed = failed.len(),
                certificates = ?failed,
                "Reconciliation pass finished with failures"
            );
        }
        report
    }

    /// Reconcile every certificate already in the ledger, using each
    /// record's own spec as its declaration
    pub async fn sweep_ledger(&self) -> Result<ReconcileReport, LedgerError> {
        let ledger = self.ledger.load().await?;
        info!(certificates = ledger.len(), "Sweeping ledger certificates");

        let specs: Vec<CertificateSpec> = ledger
            .certificates
            .into_values()
            .map(|record| record.spec)
            .collect();
        Ok(self.reconcile_all(&specs).await)
    }

    // =========================================================================
    // Single Certificate
    // =========================================================================

    /// Classify a ledger entry against the current time
    pub fn classify(&self, record: Option<&CertificateRecord>) -> CertificateState {
        let Some(record) = record else {
            return CertificateState::NoRecord;
        };

        if !record.has_material() {
            debug!(certificate = %record.name(), "Certificate or key material is missing");
            return CertificateState::InvalidRecord;
        }

        match self.evaluator.evaluate(&record.cert_data) {
            Ok(verdict) if verdict.needs_renewal => {
                info!(
                    certificate = %record.name(),
                    expires = %verdict.expires_at.format("%Y-%m-%d"),
                    "Certificate expires soon, renewal required"
                );
                CertificateState::NeedsRenewal
            }
            Ok(verdict) => {
                info!(
                    certificate = %record.name(),
                    expires = %verdict.expires_at.format("%Y-%m-%d"),
                    "Certificate is still valid"
                );
                CertificateState::Valid
            }
            Err(e) => {
                warn!(
                    certificate = %record.name(),
                    error = %e,
                    "Cannot evaluate stored certificate, renewal required"
                );
                CertificateState::InvalidRecord
            }
        }
    }

    /// Reconcile one declared certificate
    pub async fn reconcile(&self, spec: &CertificateSpec) -> ReconcileResult<ReconcileAction> {
        spec.validate()?;
        info!(certificate = %spec.name, domains = ?spec.domains, "Processing certificate");

        let existing = self.ledger.get(&spec.name).await?;
        let state = self.classify(existing.as_ref());

        match (state, existing) {
            (CertificateState::Valid, Some(record)) => {
                debug!(certificate = %spec.name, "Re-syncing target secrets");
                self.distributor.distribute(&record).await?;
                Ok(ReconcileAction::Synced)
            }
            (CertificateState::NeedsRenewal | CertificateState::InvalidRecord, Some(mut record)) => {
                record.merge_spec(spec);
                debug!(
                    certificate = %spec.name,
                    domains = ?record.spec.domains,
                    dns = %record.spec.dns_provider,
                    "Refreshed record from declaration"
                );

                let material = self.renew_with_fallback(&record).await?;
                self.commit(&mut record, &material).await?;

                info!(certificate = %spec.name, "Renewed certificate");
                Ok(ReconcileAction::Renewed { from: state })
            }
            _ => {
                info!(certificate = %spec.name, "Certificate not in ledger, issuing");

                let material = self.issue_with_fallback(spec).await?;
                let mut record = CertificateRecord::from_spec(spec);
                self.commit(&mut record, &material).await?;

                info!(certificate = %spec.name, "Issued certificate");
                Ok(ReconcileAction::Issued)
            }
        }
    }

    async fn issue_with_fallback(&self, spec: &CertificateSpec) -> Result<IssuedMaterial, IssuerError> {
        match self.issuer.issue(spec).await {
            Ok(material) => Ok(material),
            Err(e) => {
                warn!(
                    certificate = %spec.name,
                    error = %e,
                    "Issuance failed, retrying with forced re-issue"
                );
                self.issuer.force_reissue(spec).await
            }
        }
    }

    async fn renew_with_fallback(
        &self,
        record: &CertificateRecord,
    ) -> Result<IssuedMaterial, IssuerError> {
        match self.issuer.renew(record).await {
            Ok(material) => Ok(material),
            Err(e) => {
                warn!(
                    certificate = %record.name(),
                    error = %e,
                    "Renewal failed, retrying with forced re-issue"
                );
                self.issuer.force_reissue(&record.spec).await
            }
        }
    }

    /// Store fresh material, persist the record, then push it to the targets
    async fn commit(
        &self,
        record: &mut CertificateRecord,
        material: &IssuedMaterial,
    ) -> Result<(), ReconcileError> {
        let expires_at = match expiry::not_after(&material.certificate_chain) {
            Ok(expires_at) => Some(expires_at),
            Err(e) => {
                warn!(
                    certificate = %record.name(),
                    error = %e,
                    "Issued certificate has no readable expiry"
                );
                None
            }
        };

        record.store_material(material, Utc::now(), expires_at);
        self.ledger.put(record.clone()).await?;
        self.distributor.distribute(record).await?;
        Ok(())
    }
}

impl fmt::Debug for ReconciliationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconciliationEngine")
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}
