//! Certificate validity evaluation
//!
//! Decodes stored material and decides whether it falls inside the renewal
//! window. Pure computation, safe to call from any task.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, trace};

use crate::error::ExpiryError;

/// Certificates with less than this many days left are renewed
pub const RENEWAL_THRESHOLD_DAYS: i64 = 30;

/// Outcome of evaluating stored certificate material
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryVerdict {
    pub needs_renewal: bool,
    pub expires_at: DateTime<Utc>,
}

/// Evaluates stored certificates against the fixed renewal threshold
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpiryEvaluator;

impl ExpiryEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate base64-encoded PEM material against the current time
    pub fn evaluate(&self, cert_data: &str) -> Result<ExpiryVerdict, ExpiryError> {
        self.evaluate_at(cert_data, Utc::now())
    }

    /// Evaluate base64-encoded PEM material against `now`
    ///
    /// Any decode or parse failure is returned as an error; callers must
    /// treat it as "renewal required".
    pub fn evaluate_at(
        &self,
        cert_data: &str,
        now: DateTime<Utc>,
    ) -> Result<ExpiryVerdict, ExpiryError> {
        let pem_bytes = STANDARD.decode(cert_data.trim())?;
        let expires_at = not_after(&pem_bytes)?;
        let needs_renewal = needs_renewal(expires_at, now);

        debug!(
            expires = %expires_at.format("%Y-%m-%d"),
            days_left = (expires_at - now).num_days(),
            needs_renewal,
            "Evaluated certificate expiry"
        );

        Ok(ExpiryVerdict {
            needs_renewal,
            expires_at,
        })
    }
}

/// Whether a certificate expiring at `expires_at` is inside the renewal window.
///
/// Exactly 30 days left is still valid; anything less renews.
pub fn needs_renewal(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    expires_at - now < Duration::days(RENEWAL_THRESHOLD_DAYS)
}

/// NotAfter of the first certificate in a PEM document (the leaf of a chain)
pub fn not_after(pem_bytes: &[u8]) -> Result<DateTime<Utc>, ExpiryError> {
    let block = pem::parse(pem_bytes)?;
    if block.tag() != "CERTIFICATE" {
        return Err(ExpiryError::UnexpectedTag(block.tag().to_string()));
    }

    let (_, cert) = x509_parser::parse_x509_certificate(block.contents())
        .map_err(|e| ExpiryError::X509(e.to_string()))?;

    let timestamp = cert.validity().not_after.timestamp();
    trace!(not_after = timestamp, "Parsed certificate validity");

    DateTime::from_timestamp(timestamp, 0).ok_or(ExpiryError::InvalidTimestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pem_expiring_in(days: i64) -> String {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["a.example.com".to_string()]).unwrap();
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(400);
        params.not_after = now + time::Duration::days(days);
        params.self_signed(&key_pair).unwrap().pem()
    }

    fn encoded_expiring_in(days: i64) -> String {
        STANDARD.encode(pem_expiring_in(days))
    }

    #[test]
    fn test_far_expiry_is_valid() {
        let verdict = ExpiryEvaluator::new()
            .evaluate(&encoded_expiring_in(200))
            .unwrap();
        assert!(!verdict.needs_renewal);
        assert!(verdict.expires_at > Utc::now() + Duration::days(199));
    }

    #[test]
    fn test_near_expiry_needs_renewal() {
        let verdict = ExpiryEvaluator::new()
            .evaluate(&encoded_expiring_in(10))
            .unwrap();
        assert!(verdict.needs_renewal);
    }

    #[test]
    fn test_expired_needs_renewal() {
        let verdict = ExpiryEvaluator::new()
            .evaluate(&encoded_expiring_in(-5))
            .unwrap();
        assert!(verdict.needs_renewal);
        assert!(verdict.expires_at < Utc::now());
    }

    #[test]
    fn test_threshold_boundary_is_exclusive() {
        let now = Utc::now();
        assert!(!needs_renewal(now + Duration::days(30), now));
        assert!(needs_renewal(
            now + Duration::days(30) - Duration::seconds(1),
            now
        ));
        assert!(needs_renewal(
            now + Duration::days(29) + Duration::hours(23) + Duration::minutes(59),
            now
        ));
    }

    #[test]
    fn test_invalid_base64_is_error() {
        let result = ExpiryEvaluator::new().evaluate("%%% not base64 %%%");
        assert!(matches!(result, Err(ExpiryError::Decode(_))));
    }

    #[test]
    fn test_not_pem_is_error() {
        let result = ExpiryEvaluator::new().evaluate(&STANDARD.encode("plain text"));
        assert!(matches!(result, Err(ExpiryError::Pem(_))));
    }

    #[test]
    fn test_key_instead_of_certificate_is_error() {
        let key = rcgen::KeyPair::generate().unwrap().serialize_pem();
        let result = ExpiryEvaluator::new().evaluate(&STANDARD.encode(key));
        assert!(matches!(result, Err(ExpiryError::UnexpectedTag(_))));
    }

    #[test]
    fn test_garbage_der_is_error() {
        let garbage = "-----BEGIN CERTIFICATE-----\nAAECAwQF\n-----END CERTIFICATE-----\n";
        let result = ExpiryEvaluator::new().evaluate(&STANDARD.encode(garbage));
        assert!(matches!(result, Err(ExpiryError::X509(_))));
    }

    #[test]
    fn test_chain_uses_leaf() {
        let chain = format!("{}{}", pem_expiring_in(10), pem_expiring_in(300));
        let verdict = ExpiryEvaluator::new()
            .evaluate(&STANDARD.encode(chain))
            .unwrap();
        assert!(verdict.needs_renewal);
    }

    proptest! {
        #[test]
        fn prop_more_than_threshold_is_valid(extra_secs in 0i64..(3650 * 86400)) {
            let now = Utc::now();
            let expires = now + Duration::days(RENEWAL_THRESHOLD_DAYS) + Duration::seconds(extra_secs);
            prop_assert!(!needs_renewal(expires, now));
        }

        #[test]
        fn prop_less_than_threshold_renews(short_secs in 1i64..(3650 * 86400)) {
            let now = Utc::now();
            let expires = now + Duration::days(RENEWAL_THRESHOLD_DAYS) - Duration::seconds(short_secs);
            prop_assert!(needs_renewal(expires, now));
        }
    }
}
