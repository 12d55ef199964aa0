//! Background reconciliation scheduler
//!
//! Runs one pass immediately, then one per check interval. Extra passes can
//! be requested through a [`SweepTrigger`] (the binary wires this to SIGHUP).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::DEFAULT_CHECK_INTERVAL;
use crate::declared::DeclaredConfigSource;
use crate::engine::{ReconcileReport, ReconciliationEngine};

/// Minimum check interval (1 second)
const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of one scheduled pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// 1-based pass number
    pub pass: u64,
    pub attempted: usize,
    pub succeeded: usize,
    /// Names of the certificates that failed, in processing order
    pub failed: Vec<String>,
    /// Set when the declaration could not be loaded and nothing was attempted
    pub config_error: Option<String>,
}

impl PassSummary {
    fn from_report(pass: u64, report: &ReconcileReport) -> Self {
        Self {
            pass,
            attempted: report.attempted(),
            succeeded: report.succeeded(),
            failed: report.failures().map(|o| o.name.clone()).collect(),
            config_error: None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.config_error.is_none()
    }
}

/// Requests an out-of-schedule pass
///
/// Requests made while a pass is already pending are coalesced.
#[derive(Debug, Clone)]
pub struct SweepTrigger {
    tx: mpsc::Sender<()>,
}

impl SweepTrigger {
    /// Ask for a pass; returns `false` once the scheduler is gone
    pub fn request(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
            Err(mpsc::error::TrySendError::Closed(())) => false,
        }
    }
}

/// Periodic reconciliation of the declared certificates
pub struct RenewalScheduler {
    engine: Arc<ReconciliationEngine>,
    source: DeclaredConfigSource,
    check_interval: Duration,
    requests_tx: mpsc::Sender<()>,
    requests: mpsc::Receiver<()>,
    summaries: watch::Sender<Option<PassSummary>>,
    passes: u64,
}

impl RenewalScheduler {
    pub fn new(engine: Arc<ReconciliationEngine>, source: DeclaredConfigSource) -> Self {
        let (requests_tx, requests) = mpsc::channel(1);
        let (summaries, _) = watch::channel(None);
        Self {
            engine,
            source,
            check_interval: DEFAULT_CHECK_INTERVAL,
            requests_tx,
            requests,
            summaries,
            passes: 0,
        }
    }

    /// Set the check interval
    ///
    /// The interval is clamped to a minimum of 1 second.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.max(MIN_CHECK_INTERVAL);
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    pub fn trigger(&self) -> SweepTrigger {
        SweepTrigger {
            tx: self.requests_tx.clone(),
        }
    }

    /// Watch the summary of the most recent pass
    pub fn subscribe(&self) -> watch::Receiver<Option<PassSummary>> {
        self.summaries.subscribe()
    }

    /// Run the scheduler loop until `shutdown` is cancelled
    ///
    /// Cancellation is observed between passes; an in-flight pass always
    /// completes before this returns.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(
            check_interval_secs = self.check_interval.as_secs(),
            "Starting certificate renewal scheduler"
        );

        self.run_pass("startup").await;

        let mut ticker = interval_at(Instant::now() + self.check_interval, self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let reason = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => "interval",
                Some(()) = self.requests.recv() => "requested",
            };

            if shutdown.is_cancelled() {
                break;
            }
            self.run_pass(reason).await;
        }

        info!(passes = self.passes, "Certificate renewal scheduler stopped");
    }

    /// Load the declaration and reconcile it once
    pub async fn run_pass(&mut self, reason: &str) -> PassSummary {
        self.passes += 1;
        let pass = self.passes;
        debug!(pass, reason, "Running reconciliation pass");

        let summary = match self.source.load().await {
            Ok(specs) => {
                let report = self.engine.reconcile_all(&specs).await;
                PassSummary::from_report(pass, &report)
            }
            Err(e) => {
                error!(pass, error = %e, "Failed to load declared certificates, skipping pass");
                PassSummary {
                    pass,
                    config_error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };

        info!(
            pass,
            attempted = summary.attempted,
            succeeded = summary.succeeded,
            failed = summary.failed.len(),
            "Reconciliation pass complete"
        );

        self.summaries.send_replace(Some(summary.clone()));
        summary
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("source", &self.source)
            .field("check_interval", &self.check_interval)
            .field("passes", &self.passes)
            .finish()
    }
}
