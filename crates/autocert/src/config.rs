//! Runtime settings
//!
//! Built once at startup from environment variables and handed to the
//! components that need them. Every variable is optional; empty values count
//! as unset.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::ledger::DEFAULT_LEDGER_KEY;
use crate::model::SecretRef;

/// Default scheduler interval (24 hours)
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 3600);

/// Default bound on a single ACME actor invocation (10 minutes)
pub const DEFAULT_ISSUER_TIMEOUT: Duration = Duration::from_secs(10 * 60);

pub const DEFAULT_LEDGER_SECRET_NAME: &str = "acmesh-autocert-context";
pub const DEFAULT_CONFIG_SECRET_NAME: &str = "autocert-config";
pub const DEFAULT_CONFIG_KEY: &str = "config.yaml";
pub const DEFAULT_NAMESPACE: &str = "default";
pub const DEFAULT_ACME_SH_PATH: &str = "/usr/local/bin/acme.sh";
pub const DEFAULT_WORK_DIR: &str = "/tmp/certs";

/// How the external ACME actor is invoked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuerSettings {
    /// Path to the `acme.sh` executable
    pub acme_sh_path: PathBuf,
    /// Root of the per-domain working area
    pub work_dir: PathBuf,
    /// Upper bound on one invocation
    pub timeout: Duration,
}

impl Default for IssuerSettings {
    fn default() -> Self {
        Self {
            acme_sh_path: PathBuf::from(DEFAULT_ACME_SH_PATH),
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            timeout: DEFAULT_ISSUER_TIMEOUT,
        }
    }
}

/// Process-wide settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Secret holding the certificate ledger
    pub ledger_secret: SecretRef,
    /// Key of the ledger JSON inside `ledger_secret`
    pub ledger_key: String,
    /// Secret holding the declared certificates
    pub config_secret: SecretRef,
    /// Key of the declared YAML inside `config_secret`
    pub config_key: String,
    /// Interval between scheduled passes
    pub check_interval: Duration,
    /// Debug logging
    pub debug: bool,
    pub issuer: IssuerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ledger_secret: SecretRef::new(DEFAULT_NAMESPACE, DEFAULT_LEDGER_SECRET_NAME),
            ledger_key: DEFAULT_LEDGER_KEY.to_string(),
            config_secret: SecretRef::new(DEFAULT_NAMESPACE, DEFAULT_CONFIG_SECRET_NAME),
            config_key: DEFAULT_CONFIG_KEY.to_string(),
            check_interval: DEFAULT_CHECK_INTERVAL,
            debug: false,
            issuer: IssuerSettings::default(),
        }
    }
}

impl Settings {
    /// Read settings from the process environment
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let or = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        Self {
            ledger_secret: SecretRef::new(
                or("CONTEXT_SECRET_NAMESPACE", DEFAULT_NAMESPACE),
                or("CONTEXT_SECRET_NAME", DEFAULT_LEDGER_SECRET_NAME),
            ),
            ledger_key: or("CONTEXT_SECRET_KEY", DEFAULT_LEDGER_KEY),
            config_secret: SecretRef::new(
                or("CONFIG_SECRET_NAMESPACE", DEFAULT_NAMESPACE),
                or("CONFIG_SECRET_NAME", DEFAULT_CONFIG_SECRET_NAME),
            ),
            config_key: or("CONFIG_MAP_KEY", DEFAULT_CONFIG_KEY),
            check_interval: duration_or_default(
                "CHECK_INTERVAL",
                get("CHECK_INTERVAL"),
                DEFAULT_CHECK_INTERVAL,
            ),
            debug: get("DEBUG_MODE").is_some_and(|v| v.trim().eq_ignore_ascii_case("true")),
            issuer: IssuerSettings {
                acme_sh_path: PathBuf::from(or("ACME_SH_PATH", DEFAULT_ACME_SH_PATH)),
                work_dir: PathBuf::from(or("CERT_OUTPUT_DIR", DEFAULT_WORK_DIR)),
                timeout: duration_or_default(
                    "ISSUER_TIMEOUT",
                    get("ISSUER_TIMEOUT"),
                    DEFAULT_ISSUER_TIMEOUT,
                ),
            },
        }
    }
}

fn duration_or_default(key: &str, value: Option<String>, default: Duration) -> Duration {
    let Some(value) = value else {
        return default;
    };

    match parse_duration(&value) {
        Ok(duration) if !duration.is_zero() => duration,
        Ok(_) => {
            warn!(variable = key, value = %value, default = ?default, "Zero duration, using default");
            default
        }
        Err(e) => {
            warn!(variable = key, value = %value, default = ?default, error = %e, "Cannot parse duration, using default");
            default
        }
    }
}

/// Duration parse failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid duration {input:?}: {reason}")]
pub struct DurationParseError {
    input: String,
    reason: &'static str,
}

/// Parse a Go-style duration such as `24h`, `90m`, `1h30m`, `1.5h` or `250ms`.
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let fail = |reason| DurationParseError {
        input: input.to_string(),
        reason,
    };

    let s = input.trim();
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(fail("empty"));
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(fail("expected a number"));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| fail("malformed number"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            "ns" => 1e-9,
            "" => return Err(fail("missing unit")),
            _ => return Err(fail("unknown unit")),
        };
        rest = &rest[unit_len..];
        total += value * seconds_per_unit;
    }

    Duration::try_from_secs_f64(total).map_err(|_| fail("out of range"))
}
