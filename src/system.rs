//! Assembles the coordination core from configuration.

use crate::config::AppConfig;
use anyhow::Context;
use std::sync::Arc;
use tracing::info;
use txguard_consensus::{CoordinationMechanism, ImmediateAgreement, ProtocolRegistry, RoundExecutor};
use txguard_deadlock::DeadlockDetector;
use txguard_transaction::{DeadlockMonitor, TransactionCoordinator};

pub struct TransactionSystem {
    config: AppConfig,
    coordinator: Arc<TransactionCoordinator>,
    monitor: Arc<DeadlockMonitor>,
}

impl TransactionSystem {
    /// Build with rounds that agree immediately.
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        Self::with_executor(config, Arc::new(ImmediateAgreement))
    }

    pub fn with_executor(
        config: AppConfig,
        executor: Arc<dyn RoundExecutor>,
    ) -> anyhow::Result<Self> {
        config.validate().context("Invalid configuration")?;

        let topology = config
            .node_topology()
            .context("Failed to build node topology")?;
        let registry = ProtocolRegistry::new(&config.consensus_settings());
        let mechanism =
            CoordinationMechanism::new(registry, Arc::new(topology)).with_executor(executor);
        let detector = DeadlockDetector::new(config.deadlock_timeout());

        let coordinator = Arc::new(TransactionCoordinator::new(
            Arc::new(detector),
            Arc::new(mechanism),
            config.coordinator_settings(),
        ));
        let monitor = Arc::new(DeadlockMonitor::with_interval(
            coordinator.clone(),
            config.scan_interval(),
        ));

        info!(
            "Transaction system ready ({} nodes, f={}, deadlock timeout {:?})",
            config.topology.len(),
            config.consensus.fault_tolerance,
            config.deadlock_timeout()
        );

        Ok(Self {
            config,
            coordinator,
            monitor,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    pub fn monitor(&self) -> &Arc<DeadlockMonitor> {
        &self.monitor
    }

    /// Start the periodic deadlock monitor. Abort the handle to stop it.
    pub fn spawn_monitor(&self) -> tokio::task::JoinHandle<()> {
        self.monitor.clone().spawn()
    }
}
