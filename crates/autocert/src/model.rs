//! Declared certificates, ledger records and the ledger itself.
//!
//! The serialized field names follow the declared-config YAML and the
//! persisted ledger JSON:
//!
//! ```yaml
//! domains:
//!   - name: example
//!     domains: ["example.com", "*.example.com"]
//!     dns: dns_cf
//!     server: letsencrypt
//!     email: ops@example.com
//!     secrets:
//!       - namespace: default
//!         name: example-tls
//!     envs:
//!       CF_Token: "..."
//! ```

use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::SpecError;

/// Coordinates of one secret store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SecretRef {
    pub namespace: String,
    pub name: String,
}

impl SecretRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reads an explicit `null` as the type's default, like a missing key.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// A certificate as declared in the external configuration.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateSpec {
    /// Unique certificate name, the ledger key
    pub name: String,

    /// DNS names; the first one is the primary domain
    #[serde(default, deserialize_with = "null_as_default")]
    pub domains: Vec<String>,

    /// DNS-challenge plugin passed to the ACME actor (e.g. `dns_cf`)
    #[serde(rename = "dns", alias = "dnsProvider", default)]
    pub dns_provider: String,

    /// ACME directory URL or actor short name
    #[serde(alias = "acmeServer", default)]
    pub server: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    /// Secrets that receive the certificate/key pair
    #[serde(
        rename = "secrets",
        alias = "targets",
        default,
        deserialize_with = "null_as_default"
    )]
    pub targets: Vec<SecretRef>,

    /// Provider credentials handed to the ACME actor's environment
    #[serde(
        rename = "envs",
        alias = "env",
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub env: BTreeMap<String, String>,
}

impl CertificateSpec {
    /// The domain the ACME actor keys its state on
    pub fn primary_domain(&self) -> Option<&str> {
        self.domains.first().map(String::as_str)
    }

    /// Contact address, treating an empty string as absent
    pub fn contact_email(&self) -> Option<&str> {
        self.email.as_deref().filter(|email| !email.trim().is_empty())
    }

    /// Check the structural requirements a spec must meet before it can be
    /// reconciled.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.name.trim().is_empty() {
            return Err(SpecError::EmptyName);
        }
        if self.domains.is_empty() {
            return Err(SpecError::NoDomains);
        }
        if let Some(index) = self.domains.iter().position(|d| d.trim().is_empty()) {
            return Err(SpecError::EmptyDomain { index });
        }
        if self.dns_provider.trim().is_empty() {
            return Err(SpecError::MissingDnsProvider);
        }
        if let Some(index) = self
            .targets
            .iter()
            .position(|t| t.namespace.trim().is_empty() || t.name.trim().is_empty())
        {
            return Err(SpecError::InvalidTarget { index });
        }
        Ok(())
    }
}

// Credential values must never reach the logs.
impl fmt::Debug for CertificateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let env_keys: Vec<&str> = self.env.keys().map(String::as_str).collect();
        f.debug_struct("CertificateSpec")
            .field("name", &self.name)
            .field("domains", &self.domains)
            .field("dns_provider", &self.dns_provider)
            .field("server", &self.server)
            .field("email", &self.email)
            .field("targets", &self.targets)
            .field("env_keys", &env_keys)
            .finish()
    }
}

/// Certificate chain and private key as produced by the issuer (raw PEM).
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedMaterial {
    pub certificate_chain: Vec<u8>,
    pub private_key: Vec<u8>,
}

impl fmt::Debug for IssuedMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedMaterial")
            .field("certificate_chain_bytes", &self.certificate_chain.len())
            .field("private_key_bytes", &self.private_key.len())
            .finish()
    }
}

/// A ledger entry: the declaration it was last reconciled against plus the
/// material obtained for it.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    #[serde(flatten)]
    pub spec: CertificateSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Base64 of the PEM certificate chain
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cert_data: String,

    /// Base64 of the PEM private key
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key_data: String,
}

impl CertificateRecord {
    /// Start a record for a spec that has never been issued
    pub fn from_spec(spec: &CertificateSpec) -> Self {
        Self {
            spec: spec.clone(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn has_material(&self) -> bool {
        !self.cert_data.is_empty() && !self.key_data.is_empty()
    }

    /// Refresh the fields a renewal must honor from the current declaration.
    ///
    /// Contact address and credentials keep their recorded values.
    pub fn merge_spec(&mut self, spec: &CertificateSpec) {
        self.spec.domains = spec.domains.clone();
        self.spec.dns_provider = spec.dns_provider.clone();
        self.spec.server = spec.server.clone();
        self.spec.targets = spec.targets.clone();
    }

    /// Replace the stored material with freshly issued PEM data.
    pub fn store_material(
        &mut self,
        material: &IssuedMaterial,
        issued_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) {
        self.cert_data = STANDARD.encode(&material.certificate_chain);
        self.key_data = STANDARD.encode(&material.private_key);
        self.issued_at = Some(issued_at);
        self.expires_at = expires_at;
    }
}

impl fmt::Debug for CertificateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRecord")
            .field("spec", &self.spec)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("cert_data_len", &self.cert_data.len())
            .field("key_data_len", &self.key_data.len())
            .finish()
    }
}

/// Every certificate this system has ever reconciled, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateLedger {
    #[serde(default, deserialize_with = "null_as_default")]
    pub certificates: BTreeMap<String, CertificateRecord>,
}

impl CertificateLedger {
    pub fn get(&self, name: &str) -> Option<&CertificateRecord> {
        self.certificates.get(name)
    }

    /// Insert or replace the record under its own name
    pub fn upsert(&mut self, record: CertificateRecord) {
        self.certificates.insert(record.name().to_string(), record);
    }

    pub fn len(&self) -> usize {
        self.certificates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certificates.is_empty()
    }
}
