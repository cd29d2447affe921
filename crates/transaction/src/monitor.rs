//! Background deadlock monitor
//!
//! Periodically resolves wait-for cycles and aborts transactions that have
//! been blocked or alive for too long.

use crate::coordinator::{DeadlockResolution, TransactionCoordinator};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};
use txguard_types::{Result, TransactionId};

pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// What one monitor pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorReport {
    pub resolution: DeadlockResolution,
    pub timed_out: Vec<TransactionId>,
}

impl MonitorReport {
    pub fn is_quiet(&self) -> bool {
        self.resolution.victims.is_empty() && self.timed_out.is_empty()
    }
}

pub struct DeadlockMonitor {
    coordinator: Arc<TransactionCoordinator>,
    /// Scan interval (default: 1 second)
    interval: Duration,
}

impl DeadlockMonitor {
    pub fn new(coordinator: Arc<TransactionCoordinator>) -> Self {
        Self::with_interval(coordinator, DEFAULT_SCAN_INTERVAL)
    }

    pub fn with_interval(coordinator: Arc<TransactionCoordinator>, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One pass: resolve cycles first, then sweep timeouts.
    pub async fn run_once(&self) -> Result<MonitorReport> {
        let resolution = self.coordinator.resolve_deadlocks().await?;
        let timed_out = self.coordinator.abort_timed_out_transactions().await?;

        let report = MonitorReport {
            resolution,
            timed_out,
        };
        if !report.is_quiet() {
            warn!(
                "Deadlock monitor aborted {} victim(s) and {} timed-out transaction(s)",
                report.resolution.victims.len(),
                report.timed_out.len()
            );
        }
        Ok(report)
    }

    /// Start the monitor loop (runs indefinitely)
    ///
    /// This should be spawned as a background task using `tokio::spawn`
    pub async fn start(self: Arc<Self>) {
        let mut interval = time::interval(self.interval);

        info!("Starting deadlock monitor (interval: {:?})", self.interval);

        loop {
            interval.tick().await;

            if let Err(e) = self.run_once().await {
                // Keep scanning; the next pass sees fresh state.
                error!("Deadlock monitor pass failed: {}", e);
            }
        }
    }

    /// Spawn the monitor as a background task. Abort the handle to stop it.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.start().await;
        })
    }
}
