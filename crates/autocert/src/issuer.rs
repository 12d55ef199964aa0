//! External ACME actor
//!
//! ACME itself (account handling, DNS-01 validation, order finalization) is
//! delegated to `acme.sh`. This module builds its command line, runs it with
//! the certificate's provider credentials in the environment, and reads the
//! produced material back from a per-domain working directory:
//!
//! ```text
//! <work_dir>/
//! └── example.com/          # primary domain
//!     ├── cert.pem          # leaf certificate
//!     ├── key.pem           # private key
//!     └── fullchain.pem     # leaf + intermediates (what gets distributed)
//! ```
//!
//! Output files are removed before every invocation, so a run that produces
//! nothing can never hand back the previous run's material.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::IssuerSettings;
use crate::error::IssuerError;
use crate::model::{CertificateRecord, CertificateSpec, IssuedMaterial};

/// Lines of actor output attached to an `ActorFailed` error
const FAILURE_OUTPUT_LINES: usize = 20;

/// Issues and renews certificates
///
/// Every call blocks until the actor finishes and is safe to retry for the
/// same certificate.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Issue a certificate for a spec with no prior material
    async fn issue(&self, spec: &CertificateSpec) -> Result<IssuedMaterial, IssuerError>;

    /// Renew an existing certificate
    async fn renew(&self, record: &CertificateRecord) -> Result<IssuedMaterial, IssuerError>;

    /// Issue while bypassing the actor's own skip/rate-limit heuristics
    async fn force_reissue(&self, spec: &CertificateSpec) -> Result<IssuedMaterial, IssuerError>;
}

/// Kind of actor invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueOperation {
    Issue,
    Renew,
    ForceIssue,
}

impl IssueOperation {
    fn as_str(self) -> &'static str {
        match self {
            IssueOperation::Issue => "issue",
            IssueOperation::Renew => "renew",
            IssueOperation::ForceIssue => "force-issue",
        }
    }
}

/// Output file locations for one primary domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputPaths {
    pub dir: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
    pub fullchain: PathBuf,
}

impl OutputPaths {
    fn new(work_dir: &Path, primary_domain: &str) -> Self {
        // Keep wildcard and odd names inside the working area
        let dir_name: String = primary_domain
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        let dir_name = if dir_name.starts_with('.') {
            format!("_{dir_name}")
        } else {
            dir_name
        };

        let dir = work_dir.join(dir_name);
        Self {
            cert: dir.join("cert.pem"),
            key: dir.join("key.pem"),
            fullchain: dir.join("fullchain.pem"),
            dir,
        }
    }

    fn all(&self) -> [&Path; 3] {
        [&self.cert, &self.key, &self.fullchain]
    }
}

/// Build the `acme.sh` argument list for one invocation
pub fn build_arguments(
    operation: IssueOperation,
    spec: &CertificateSpec,
    paths: &OutputPaths,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::new();

    match operation {
        IssueOperation::Issue => args.push("--issue".into()),
        IssueOperation::ForceIssue => {
            args.push("--issue".into());
            args.push("--force".into());
        }
        IssueOperation::Renew => args.push("--renew".into()),
    }

    if operation != IssueOperation::Renew {
        args.push("--dns".into());
        args.push(spec.dns_provider.clone().into());
        if !spec.server.trim().is_empty() {
            args.push("--server".into());
            args.push(spec.server.clone().into());
        }
    }

    // Primary domain first, then the SANs
    for domain in &spec.domains {
        args.push("-d".into());
        args.push(domain.clone().into());
    }

    if let Some(email) = spec.contact_email() {
        args.push("--email".into());
        args.push(email.into());
    }

    args.push("--cert-file".into());
    args.push(paths.cert.clone().into_os_string());
    args.push("--key-file".into());
    args.push(paths.key.clone().into_os_string());
    args.push("--fullchain-file".into());
    args.push(paths.fullchain.clone().into_os_string());

    args
}

/// Runs `acme.sh` as a subprocess
#[derive(Debug, Clone)]
pub struct AcmeShIssuer {
    settings: IssuerSettings,
}

impl AcmeShIssuer {
    pub fn new(settings: IssuerSettings) -> Self {
        Self { settings }
    }

    /// Create the working area root
    pub async fn prepare(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.settings.work_dir).await?;
        debug!(work_dir = %self.settings.work_dir.display(), "Prepared issuer working directory");
        Ok(())
    }

    /// Output locations for a primary domain
    pub fn output_paths(&self, primary_domain: &str) -> OutputPaths {
        OutputPaths::new(&self.settings.work_dir, primary_domain)
    }

    async fn run(
        &self,
        operation: IssueOperation,
        spec: &CertificateSpec,
    ) -> Result<IssuedMaterial, IssuerError> {
        spec.validate()?;
        let domain = spec.domains[0].as_str();
        let paths = self.output_paths(domain);

        info!(
            certificate = %spec.name,
            domain = %domain,
            operation = operation.as_str(),
            dns = %spec.dns_provider,
            server = %spec.server,
            "Invoking ACME actor"
        );

        reset_output_dir(&paths).await.map_err(|e| IssuerError::ActorUnavailable {
            reason: format!("cannot prepare {}: {e}", paths.dir.display()),
        })?;

        let args = build_arguments(operation, spec, &paths);
        trace!(program = %self.settings.acme_sh_path.display(), ?args, "ACME actor command line");

        if !spec.env.is_empty() {
            // Keys only; values are credentials
            let keys: Vec<&str> = spec.env.keys().map(String::as_str).collect();
            debug!(certificate = %spec.name, env = ?keys, "Passing provider credentials");
        }

        let mut command = Command::new(&self.settings.acme_sh_path);
        command
            .args(&args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            error!(
                program = %self.settings.acme_sh_path.display(),
                error = %e,
                "Failed to start ACME actor"
            );
            IssuerError::ActorUnavailable {
                reason: format!("cannot start {}: {e}", self.settings.acme_sh_path.display()),
            }
        })?;

        let stdout = child.stdout.take().map(|out| drain(out, "stdout", domain.to_string()));
        let stderr = child.stderr.take().map(|err| drain(err, "stderr", domain.to_string()));

        let waited = tokio::time::timeout(self.settings.timeout, child.wait()).await;
        let status = match waited {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                abort_drains([stdout, stderr]);
                return Err(IssuerError::ActorUnavailable {
                    reason: format!("failed waiting for ACME actor: {e}"),
                });
            }
            Err(_) => {
                warn!(
                    domain = %domain,
                    timeout = ?self.settings.timeout,
                    "ACME actor timed out, killing it"
                );
                if let Err(e) = child.kill().await {
                    warn!(domain = %domain, error = %e, "Failed to kill ACME actor");
                }
                // Grandchildren may still hold the pipes open
                abort_drains([stdout, stderr]);
                return Err(IssuerError::timed_out(domain, self.settings.timeout));
            }
        };

        let mut output = collect(stdout).await;
        output.extend(collect(stderr).await);

        if !status.success() {
            error!(domain = %domain, %status, "ACME actor reported failure");
            let tail_start = output.len().saturating_sub(FAILURE_OUTPUT_LINES);
            return Err(IssuerError::ActorFailed {
                domain: domain.to_string(),
                status: status.to_string(),
                output: output[tail_start..].join("\n"),
            });
        }

        info!(domain = %domain, operation = operation.as_str(), "ACME actor succeeded");

        let certificate_chain = read_output(domain, &paths.fullchain).await?;
        let private_key = read_output(domain, &paths.key).await?;

        debug!(
            domain = %domain,
            chain_bytes = certificate_chain.len(),
            key_bytes = private_key.len(),
            "Read issued material"
        );

        Ok(IssuedMaterial {
            certificate_chain,
            private_key,
        })
    }
}

#[async_trait]
impl CertificateIssuer for AcmeShIssuer {
    async fn issue(&self, spec: &CertificateSpec) -> Result<IssuedMaterial, IssuerError> {
        self.run(IssueOperation::Issue, spec).await
    }

    async fn renew(&self, record: &CertificateRecord) -> Result<IssuedMaterial, IssuerError> {
        self.run(IssueOperation::Renew, &record.spec).await
    }

    async fn force_reissue(&self, spec: &CertificateSpec) -> Result<IssuedMaterial, IssuerError> {
        self.run(IssueOperation::ForceIssue, spec).await
    }
}

/// Make sure the directory exists and holds no output from earlier runs
async fn reset_output_dir(paths: &OutputPaths) -> std::io::Result<()> {
    tokio::fs::create_dir_all(&paths.dir).await?;
    for file in paths.all() {
        match tokio::fs::remove_file(file).await {
            Ok(()) => trace!(file = %file.display(), "Removed stale output"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

async fn read_output(domain: &str, path: &Path) -> Result<Vec<u8>, IssuerError> {
    let unreadable = |reason: String| IssuerError::OutputUnreadable {
        domain: domain.to_string(),
        file: path.display().to_string(),
        reason,
    };

    let data = tokio::fs::read(path).await.map_err(|e| unreadable(e.to_string()))?;
    if data.is_empty() {
        return Err(unreadable("file is empty".to_string()));
    }
    Ok(data)
}

/// Forward one output stream to the log while capturing it
fn drain<R>(reader: R, stream: &'static str, domain: String) -> JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut captured = Vec::new();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    info!(target: "autocert::issuer", domain = %domain, stream, "{line}");
                    captured.push(line);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(domain = %domain, stream, error = %e, "Stopped reading ACME actor output");
                    break;
                }
            }
        }
        captured
    })
}

async fn collect(handle: Option<JoinHandle<Vec<String>>>) -> Vec<String> {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => Vec::new(),
    }
}

fn abort_drains(handles: [Option<JoinHandle<Vec<String>>>; 2]) {
    for handle in handles.into_iter().flatten() {
        handle.abort();
    }
}
