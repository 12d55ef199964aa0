//! Autocert - Main entry point
//!
//! Keeps ACME certificates valid and synchronized into Kubernetes secrets.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use autocert::{
    load_declared_file, AcmeShIssuer, DeclaredConfigSource, KubeSecretBackend, ReconcileReport,
    ReconciliationEngine, RenewalScheduler, SecretBackend, Settings, SweepTrigger,
};

/// Autocert - ACME certificate automation for Kubernetes secrets
#[derive(Parser, Debug)]
#[command(name = "autocert")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable debug logging (same as DEBUG_MODE=true)
    #[arg(long = "debug", global = true)]
    debug: bool,

    /// Log output format
    #[arg(
        long = "log-format",
        env = "LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Text,
        global = true
    )]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the renewal scheduler until SIGTERM/SIGINT (default)
    Run,
    /// Reconcile the declared certificates once and exit
    Once,
    /// Reconcile every certificate in the ledger once and exit
    Sweep,
    /// Validate a declared-config YAML file and exit
    Check {
        /// Declared-config file to check
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings = Settings::from_env();

    init_logging(cli.debug || settings.debug, cli.log_format);

    let result = match cli.command {
        Some(Commands::Check { file }) => check_config(&file),
        command => run_async(command.unwrap_or(Commands::Run), settings),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!(error = %format!("{e:#}"), "Autocert failed");
            ExitCode::FAILURE
        }
    }
}

/// RUST_LOG wins; otherwise debug or info
fn init_logging(debug: bool, format: LogFormat) {
    let log_level = if debug { "debug" } else { "info" };
    let builder = tracing_subscriber::fmt().with_env_filter(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
    );
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Validate a declared-config file offline
fn check_config(path: &Path) -> Result<bool> {
    info!("Checking declared certificates in {}", path.display());

    let specs = load_declared_file(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    let mut invalid = 0usize;
    for spec in &specs {
        if let Err(e) = spec.validate() {
            warn!(certificate = %spec.name, error = %e, "Invalid certificate declaration");
            invalid += 1;
        }
    }

    info!("  - {} certificate(s)", specs.len());
    info!("  - {} invalid", invalid);

    if invalid == 0 {
        println!("autocert: configuration file {} test is successful", path.display());
    }
    Ok(invalid == 0)
}

fn run_async(command: Commands, settings: Settings) -> Result<bool> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(async move {
        let client = kube::Client::try_default()
            .await
            .context("Failed to create Kubernetes client")?;
        let backend: Arc<dyn SecretBackend> = Arc::new(KubeSecretBackend::new(client));

        let issuer = AcmeShIssuer::new(settings.issuer.clone());
        issuer.prepare().await.with_context(|| {
            format!(
                "Failed to create certificate work directory {}",
                settings.issuer.work_dir.display()
            )
        })?;

        let engine = Arc::new(ReconciliationEngine::with_backend(
            Arc::clone(&backend),
            Arc::new(issuer),
            &settings,
        ));
        let source = DeclaredConfigSource::new(
            backend,
            settings.config_secret.clone(),
            settings.config_key.clone(),
        );

        info!(
            ledger = %settings.ledger_secret,
            config = %settings.config_secret,
            "Autocert starting"
        );

        match command {
            Commands::Once => {
                let specs = source
                    .load()
                    .await
                    .context("Failed to load declared certificates")?;
                Ok(report_ok(&engine.reconcile_all(&specs).await))
            }
            Commands::Sweep => {
                let report = engine
                    .sweep_ledger()
                    .await
                    .context("Failed to load certificate ledger")?;
                Ok(report_ok(&report))
            }
            _ => run_scheduler(engine, source, &settings).await.map(|()| true),
        }
    })
}

async fn run_scheduler(
    engine: Arc<ReconciliationEngine>,
    source: DeclaredConfigSource,
    settings: &Settings,
) -> Result<()> {
    let scheduler = RenewalScheduler::new(engine, source).with_interval(settings.check_interval);
    let trigger = scheduler.trigger();
    let shutdown = CancellationToken::new();

    let handle = tokio::spawn(scheduler.run(shutdown.clone()));
    setup_signal_handlers(shutdown, trigger).context("Failed to register signal handlers")?;

    handle.await.context("Scheduler task failed")?;
    info!("Autocert stopped");
    Ok(())
}

/// SIGTERM/SIGINT stop the scheduler, SIGHUP requests a pass
fn setup_signal_handlers(shutdown: CancellationToken, trigger: SweepTrigger) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => break,
                _ = sigint.recv() => break,
                _ = sighup.recv() => {
                    info!("Received SIGHUP, requesting reconciliation pass");
                    if !trigger.request() {
                        break;
                    }
                }
            }
        }
        info!("Received shutdown signal, finishing current pass");
        shutdown.cancel();
    });
    Ok(())
}

fn report_ok(report: &ReconcileReport) -> bool {
    for failure in report.failures() {
        if let Err(e) = &failure.result {
            error!(certificate = %failure.name, error = %e, "Certificate not reconciled");
        }
    }
    report.is_clean()
}
