//! Shared fixtures for the integration tests.
//!
//! Every test builds its own `MemorySecretBackend`, so tests never share
//! state.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use autocert::backend::{SecretPayload, TLS_CERT_KEY, TLS_KEY_KEY};
use autocert::{
    BackendError, CertificateIssuer, CertificateRecord, CertificateSpec, DeclaredConfigSource,
    IssuedMaterial, IssuerError, LedgerStore, MemorySecretBackend, ReconciliationEngine,
    RenewalScheduler, SecretBackend, SecretRef, Settings,
};

/// PEM certificate for `domain` whose NotAfter is `days` from now
pub fn pem_expiring_in(domain: &str, days: i64) -> Vec<u8> {
    let key_pair = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(vec![domain.to_string()]).unwrap();
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now - time::Duration::days(400);
    params.not_after = now + time::Duration::days(days);
    params.self_signed(&key_pair).unwrap().pem().into_bytes()
}

pub fn spec(name: &str, targets: &[(&str, &str)]) -> CertificateSpec {
    CertificateSpec {
        name: name.to_string(),
        domains: vec![format!("{name}.example.com")],
        dns_provider: "dns_cf".to_string(),
        server: "letsencrypt".to_string(),
        targets: targets
            .iter()
            .map(|(namespace, name)| SecretRef::new(*namespace, *name))
            .collect(),
        ..Default::default()
    }
}

/// Ledger record for `spec` holding a certificate that expires in `days`
pub fn record_expiring_in(spec: &CertificateSpec, days: i64) -> CertificateRecord {
    let mut record = CertificateRecord::from_spec(spec);
    record.cert_data = STANDARD.encode(pem_expiring_in(&spec.domains[0], days));
    record.key_data = STANDARD.encode(format!("stored-key-{}", spec.name));
    record
}

/// Decoded `tls.crt`/`tls.key` of a target secret
pub fn tls_pair(backend: &MemorySecretBackend, namespace: &str, name: &str) -> Option<(Vec<u8>, Vec<u8>)> {
    let payload = backend.get(&SecretRef::new(namespace, name))?;
    Some((
        payload.get(TLS_CERT_KEY)?.to_vec(),
        payload.get(TLS_KEY_KEY)?.to_vec(),
    ))
}

pub fn decode(data: &str) -> Vec<u8> {
    STANDARD.decode(data).unwrap()
}

pub struct Harness {
    pub backend: MemorySecretBackend,
    pub issuer: Arc<FakeIssuer>,
    pub engine: ReconciliationEngine,
    pub settings: Settings,
}

impl Harness {
    pub fn new() -> Self {
        let backend = MemorySecretBackend::new();
        Self::with_store(backend.clone(), Arc::new(backend))
    }

    /// Harness whose engine talks to `store` while tests inspect `backend`
    pub fn with_store(backend: MemorySecretBackend, store: Arc<dyn SecretBackend>) -> Self {
        let settings = Settings::default();
        let issuer = Arc::new(FakeIssuer::default());
        let engine = ReconciliationEngine::with_backend(store, issuer.clone(), &settings);
        Self {
            backend,
            issuer,
            engine,
            settings,
        }
    }

    pub fn ledger(&self) -> &LedgerStore {
        self.engine.ledger()
    }

    pub async fn seed(&self, record: CertificateRecord) {
        self.ledger().put(record).await.unwrap();
    }

    /// Scheduler over a second engine sharing this harness' store and issuer
    pub fn scheduler(&self, interval: std::time::Duration) -> RenewalScheduler {
        let store: Arc<dyn SecretBackend> = Arc::new(self.backend.clone());
        let engine = ReconciliationEngine::with_backend(
            Arc::clone(&store),
            self.issuer.clone(),
            &self.settings,
        );
        let source = DeclaredConfigSource::new(
            store,
            self.settings.config_secret.clone(),
            self.settings.config_key.clone(),
        );
        RenewalScheduler::new(Arc::new(engine), source).with_interval(interval)
    }

    pub fn declare(&self, yaml: &str) {
        self.backend.insert(
            self.settings.config_secret.clone(),
            SecretPayload::opaque(self.settings.config_key.clone(), yaml.as_bytes().to_vec()),
        );
    }
}

// ============================================================================
// Fake Issuer
// ============================================================================

/// Which issuer operations fail
#[derive(Debug, Default, Clone)]
pub struct Failures {
    pub issue: bool,
    pub renew: bool,
    pub force: bool,
    /// Certificate names for which every operation fails
    pub names: HashSet<String>,
}

/// Issuer that mints real certificates in-process and counts its calls
#[derive(Debug)]
pub struct FakeIssuer {
    pub issue_calls: AtomicUsize,
    pub renew_calls: AtomicUsize,
    pub force_calls: AtomicUsize,
    validity_days: AtomicI64,
    failures: Mutex<Failures>,
    seen: Mutex<Vec<(String, CertificateSpec)>>,
}

impl Default for FakeIssuer {
    fn default() -> Self {
        Self {
            issue_calls: AtomicUsize::new(0),
            renew_calls: AtomicUsize::new(0),
            force_calls: AtomicUsize::new(0),
            validity_days: AtomicI64::new(90),
            failures: Mutex::new(Failures::default()),
            seen: Mutex::new(Vec::new()),
        }
    }
}

impl FakeIssuer {
    pub fn fail(&self, update: impl FnOnce(&mut Failures)) {
        update(&mut self.failures.lock().unwrap());
    }

    pub fn set_validity_days(&self, days: i64) {
        self.validity_days.store(days, Ordering::SeqCst);
    }

    pub fn issues(&self) -> usize {
        self.issue_calls.load(Ordering::SeqCst)
    }

    pub fn renewals(&self) -> usize {
        self.renew_calls.load(Ordering::SeqCst)
    }

    pub fn forced(&self) -> usize {
        self.force_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.issues() + self.renewals() + self.forced()
    }

    /// Specs the issuer was invoked with, as `(operation, spec)`
    pub fn seen(&self) -> Vec<(String, CertificateSpec)> {
        self.seen.lock().unwrap().clone()
    }

    fn mint(
        &self,
        operation: &str,
        spec: &CertificateSpec,
        fails: impl FnOnce(&Failures) -> bool,
    ) -> Result<IssuedMaterial, IssuerError> {
        self.seen
            .lock()
            .unwrap()
            .push((operation.to_string(), spec.clone()));

        let failing = {
            let failures = self.failures.lock().unwrap();
            fails(&failures) || failures.names.contains(&spec.name)
        };
        if failing {
            return Err(IssuerError::ActorFailed {
                domain: spec.domains.first().cloned().unwrap_or_default(),
                status: "exit status: 1".to_string(),
                output: format!("{operation} refused"),
            });
        }

        let days = self.validity_days.load(Ordering::SeqCst);
        Ok(IssuedMaterial {
            certificate_chain: pem_expiring_in(&spec.domains[0], days),
            private_key: format!("{operation}-key-{}", spec.name).into_bytes(),
        })
    }
}

#[async_trait]
impl CertificateIssuer for FakeIssuer {
    async fn issue(&self, spec: &CertificateSpec) -> Result<IssuedMaterial, IssuerError> {
        self.issue_calls.fetch_add(1, Ordering::SeqCst);
        self.mint("issue", spec, |f| f.issue)
    }

    async fn renew(&self, record: &CertificateRecord) -> Result<IssuedMaterial, IssuerError> {
        self.renew_calls.fetch_add(1, Ordering::SeqCst);
        self.mint("renew", &record.spec, |f| f.renew)
    }

    async fn force_reissue(&self, spec: &CertificateSpec) -> Result<IssuedMaterial, IssuerError> {
        self.force_calls.fetch_add(1, Ordering::SeqCst);
        self.mint("force", spec, |f| f.force)
    }
}

// ============================================================================
// Failing Backend
// ============================================================================

/// Memory backend that refuses writes to selected secrets
#[derive(Debug, Clone)]
pub struct FailingBackend {
    inner: MemorySecretBackend,
    refuse_writes: Arc<Mutex<HashSet<SecretRef>>>,
}

impl FailingBackend {
    pub fn new(inner: MemorySecretBackend) -> Self {
        Self {
            inner,
            refuse_writes: Arc::default(),
        }
    }

    pub fn refuse(&self, secret: SecretRef) {
        self.refuse_writes.lock().unwrap().insert(secret);
    }

    pub fn allow(&self, secret: &SecretRef) {
        self.refuse_writes.lock().unwrap().remove(secret);
    }
}

#[async_trait]
impl SecretBackend for FailingBackend {
    async fn read(&self, secret: &SecretRef) -> Result<Option<SecretPayload>, BackendError> {
        self.inner.read(secret).await
    }

    async fn write(&self, secret: &SecretRef, payload: SecretPayload) -> Result<(), BackendError> {
        if self.refuse_writes.lock().unwrap().contains(secret) {
            return Err(BackendError::Api {
                secret: secret.to_string(),
                message: "forbidden".to_string(),
            });
        }
        self.inner.write(secret, payload).await
    }
}
