//! Declared certificate configuration
//!
//! The declaration is a YAML document stored under one key of one secret:
//!
//! ```yaml
//! domains:
//!   - name: example
//!     domains: ["example.com"]
//!     dns: dns_cf
//!     server: letsencrypt
//!     secrets:
//!       - namespace: default
//!         name: example-tls
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::backend::SecretBackend;
use crate::error::ConfigLoadError;
use crate::model::{CertificateSpec, SecretRef};

#[derive(Debug, Deserialize)]
struct DeclaredDocument {
    #[serde(default)]
    domains: Vec<CertificateSpec>,
}

/// Parse a declared-config YAML document into specs, in document order
pub fn parse_declared(yaml: &[u8]) -> Result<Vec<CertificateSpec>, ConfigLoadError> {
    let document: DeclaredDocument = serde_yaml::from_slice(yaml)?;

    let mut seen = HashSet::new();
    for spec in &document.domains {
        if !seen.insert(spec.name.as_str()) {
            warn!(
                certificate = %spec.name,
                "Certificate declared more than once, the last declaration wins"
            );
        }
    }

    Ok(document.domains)
}

/// Parse a declared-config YAML file from disk
pub fn load_declared_file(path: &Path) -> Result<Vec<CertificateSpec>, ConfigLoadError> {
    let raw = std::fs::read(path)?;
    parse_declared(&raw)
}

/// Reads declared certificates from a secret
#[derive(Clone)]
pub struct DeclaredConfigSource {
    backend: Arc<dyn SecretBackend>,
    secret: SecretRef,
    key: String,
}

impl DeclaredConfigSource {
    pub fn new(backend: Arc<dyn SecretBackend>, secret: SecretRef, key: impl Into<String>) -> Self {
        Self {
            backend,
            secret,
            key: key.into(),
        }
    }

    /// Load and parse the current declaration
    pub async fn load(&self) -> Result<Vec<CertificateSpec>, ConfigLoadError> {
        debug!(secret = %self.secret, key = %self.key, "Loading declared certificates");

        let payload = self
            .backend
            .read(&self.secret)
            .await?
            .ok_or_else(|| ConfigLoadError::SecretNotFound(self.secret.to_string()))?;

        let raw = payload.get(&self.key).ok_or_else(|| ConfigLoadError::MissingKey {
            secret: self.secret.to_string(),
            key: self.key.clone(),
        })?;

        let specs = parse_declared(raw)?;
        debug!(certificates = specs.len(), "Loaded declared certificates");
        Ok(specs)
    }
}

impl std::fmt::Debug for DeclaredConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeclaredConfigSource")
            .field("secret", &self.secret)
            .field("key", &self.key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemorySecretBackend, SecretPayload};

    const CONFIG: &str = r#"
domains:
  - name: example
    domains:
      - example.com
      - "*.example.com"
    dns: dns_cf
    server: letsencrypt
    email: ops@example.com
    secrets:
      - namespace: default
        name: example-tls
      - namespace: ingress
        name: example-tls
    envs:
      CF_Token: token
      CF_Account_ID: account
  - name: other
    domains: [other.example.org]
    dnsProvider: dns_ali
    acmeServer: https://acme.zerossl.com/v2/DV90
    targets:
      - namespace: default
        name: other-tls
    env:
      Ali_Key: key
"#;

    #[test]
    fn test_parse_declared() {
        let specs = parse_declared(CONFIG.as_bytes()).unwrap();
        assert_eq!(specs.len(), 2);

        let example = &specs[0];
        assert_eq!(example.name, "example");
        assert_eq!(example.primary_domain(), Some("example.com"));
        assert_eq!(example.dns_provider, "dns_cf");
        assert_eq!(example.server, "letsencrypt");
        assert_eq!(example.contact_email(), Some("ops@example.com"));
        assert_eq!(example.targets.len(), 2);
        assert_eq!(example.env.get("CF_Token").map(String::as_str), Some("token"));

        let other = &specs[1];
        assert_eq!(other.dns_provider, "dns_ali");
        assert_eq!(other.server, "https://acme.zerossl.com/v2/DV90");
        assert_eq!(other.targets, vec![SecretRef::new("default", "other-tls")]);
        assert_eq!(other.env.len(), 1);
        assert_eq!(other.email, None);
    }

    #[test]
    fn test_parse_keeps_duplicates_in_order() {
        let yaml = "domains:\n  - {name: a, domains: [a.com], dns: dns_cf}\n  - {name: a, domains: [b.com], dns: dns_cf}\n";
        let specs = parse_declared(yaml.as_bytes()).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[1].domains, vec!["b.com".to_string()]);
    }

    #[test]
    fn test_parse_empty_document() {
        let specs = parse_declared(b"domains: []\n").unwrap();
        assert!(specs.is_empty());
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = parse_declared(b"domains: [ {name: ");
        assert!(matches!(result, Err(ConfigLoadError::Parse(_))));
    }

    #[test]
    fn test_load_declared_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, CONFIG).unwrap();

        assert_eq!(load_declared_file(&path).unwrap().len(), 2);
        assert!(matches!(
            load_declared_file(&dir.path().join("missing.yaml")),
            Err(ConfigLoadError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_load_from_secret() {
        let backend = MemorySecretBackend::new();
        let secret = SecretRef::new("default", "autocert-config");
        backend.insert(
            secret.clone(),
            SecretPayload::opaque("config.yaml", CONFIG.as_bytes().to_vec()),
        );

        let source = DeclaredConfigSource::new(Arc::new(backend), secret, "config.yaml");
        assert_eq!(source.load().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_load_missing_secret_or_key() {
        let backend = MemorySecretBackend::new();
        let secret = SecretRef::new("default", "autocert-config");
        let source = DeclaredConfigSource::new(Arc::new(backend.clone()), secret.clone(), "config.yaml");

        assert!(matches!(
            source.load().await,
            Err(ConfigLoadError::SecretNotFound(_))
        ));

        backend.insert(secret, SecretPayload::opaque("other.yaml", b"domains: []".to_vec()));
        assert!(matches!(
            source.load().await,
            Err(ConfigLoadError::MissingKey { .. })
        ));
    }
}
