//! Common fixtures for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use txguard::{AppConfig, TransactionSystem};
use txguard_consensus::{NodeProfile, ProtocolKind, RoundExecutor, RoundOutcome};
use txguard_types::{
    DistributedOperation, FailureType, NodeId, NodeLayer, ResourceId, Result, TransactionId,
};

pub fn tx(id: &str) -> TransactionId {
    TransactionId::from(id)
}

pub fn res(id: &str) -> ResourceId {
    ResourceId::from(id)
}

pub fn nodes(names: &[&str]) -> Vec<NodeId> {
    names.iter().map(|n| NodeId::from(*n)).collect()
}

/// Start times one second apart, oldest first, all in the recent past.
pub fn staggered_start(index: usize) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::seconds(4) + chrono::Duration::seconds(index as i64)
}

/// Reference topology plus three extra crash-only core nodes, so every
/// protocol can reach quorum.
pub fn extended_config() -> AppConfig {
    let mut config = AppConfig::default();
    for id in ["Core3", "Core4", "Core5"] {
        config
            .topology
            .push(NodeProfile::new(id, FailureType::Crash, NodeLayer::Core));
    }
    config
}

pub fn system(config: AppConfig) -> TransactionSystem {
    TransactionSystem::from_config(config).expect("valid test config")
}

/// Counts rounds and agrees.
#[derive(Default)]
pub struct CountingExecutor {
    pub rounds: AtomicU32,
}

#[async_trait]
impl RoundExecutor for CountingExecutor {
    async fn execute_round(
        &self,
        _protocol: ProtocolKind,
        _operation: &DistributedOperation,
        _participants: &[NodeId],
    ) -> Result<RoundOutcome> {
        self.rounds.fetch_add(1, Ordering::SeqCst);
        Ok(RoundOutcome::Agreed)
    }
}

/// Stalls for `delay` on the first `stalls` rounds, then agrees.
pub struct StallingExecutor {
    pub delay: Duration,
    pub stalls: u32,
    pub rounds: AtomicU32,
}

impl StallingExecutor {
    pub fn new(delay: Duration, stalls: u32) -> Arc<Self> {
        Arc::new(Self {
            delay,
            stalls,
            rounds: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl RoundExecutor for StallingExecutor {
    async fn execute_round(
        &self,
        _protocol: ProtocolKind,
        _operation: &DistributedOperation,
        _participants: &[NodeId],
    ) -> Result<RoundOutcome> {
        let round = self.rounds.fetch_add(1, Ordering::SeqCst);
        if round < self.stalls {
            tokio::time::sleep(self.delay).await;
        }
        Ok(RoundOutcome::Agreed)
    }
}

/// Rejects every round of one phase (`operation_type`) and agrees otherwise.
pub struct RejectingExecutor {
    pub phase: &'static str,
    pub rejected: AtomicU32,
}

impl RejectingExecutor {
    pub fn new(phase: &'static str) -> Arc<Self> {
        Arc::new(Self {
            phase,
            rejected: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl RoundExecutor for RejectingExecutor {
    async fn execute_round(
        &self,
        _protocol: ProtocolKind,
        operation: &DistributedOperation,
        _participants: &[NodeId],
    ) -> Result<RoundOutcome> {
        if operation.operation_type == self.phase {
            self.rejected.fetch_add(1, Ordering::SeqCst);
            return Ok(RoundOutcome::Rejected {
                reason: format!("{} vetoed", self.phase),
            });
        }
        Ok(RoundOutcome::Agreed)
    }
}
