//! Seam between a protocol's quorum/timeout policy and the rounds it runs.

use crate::protocol::ProtocolKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use txguard_types::{DistributedOperation, NodeId, Result};

#[cfg(test)]
use mockall::automock;

/// What the participants decided in one round attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundOutcome {
    Agreed,
    Rejected { reason: String },
}

/// Runs the message rounds of a consensus protocol.
///
/// Implementations only decide; quorum checks, attempt timeouts and retries
/// are applied by [`crate::ConsensusProtocol::coordinate`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RoundExecutor: Send + Sync {
    async fn execute_round(
        &self,
        protocol: ProtocolKind,
        operation: &DistributedOperation,
        participants: &[NodeId],
    ) -> Result<RoundOutcome>;
}

/// Executor whose rounds always reach agreement immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateAgreement;

#[async_trait]
impl RoundExecutor for ImmediateAgreement {
    async fn execute_round(
        &self,
        protocol: ProtocolKind,
        operation: &DistributedOperation,
        participants: &[NodeId],
    ) -> Result<RoundOutcome> {
        tracing::debug!(
            "{} round for operation {} agreed by {} participants",
            protocol,
            operation.operation_id,
            participants.len()
        );
        Ok(RoundOutcome::Agreed)
    }
}
