//! Failure-aware consensus for distributed transactions
//!
//! This crate selects and runs the consensus protocol that guards a
//! transaction's prepare phase. It provides:
//!
//! - **Protocols**: a closed set of fault models, each with its own quorum
//!   size and timeout:
//!   1. Byzantine fault tolerant: 3f+1 participants, 30s
//!   2. Crash fault tolerant: 2f+1 participants, 10s
//!   3. Omission fault tolerant: 2f+1 participants, 15s with retries
//!
//! - **Coordination Mechanism**: resolves the most restrictive failure type
//!   among the participants from the node topology, runs the per-layer
//!   coordination hooks and coordinates the operation.
//!
//! - **Round Executor**: the seam that actually runs protocol rounds. Quorum
//!   and timeout policy stay in this crate regardless of the executor.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use txguard_consensus::{CoordinationMechanism, NodeTopology, ProtocolRegistry};
//! use txguard_types::{DistributedOperation, NodeId};
//!
//! # async fn example() -> txguard_types::Result<()> {
//! let mechanism = CoordinationMechanism::new(
//!     ProtocolRegistry::default(),
//!     Arc::new(NodeTopology::reference()),
//! );
//!
//! let operation = DistributedOperation::new("op-1", "update_subscriber");
//! let participants = vec![NodeId::from("Edge1"), NodeId::from("Core1")];
//! let result = mechanism.coordinate_operation(&operation, &participants).await?;
//! assert!(!result.is_success());
//! # Ok(())
//! # }
//! ```

pub mod executor;
pub mod mechanism;
pub mod protocol;
pub mod strategy;
pub mod topology;

// Re-export main types
pub use executor::{ImmediateAgreement, RoundExecutor, RoundOutcome};
pub use mechanism::CoordinationMechanism;
pub use protocol::{
    ConsensusProtocol, ConsensusSettings, CoordinationOutcome, CoordinationResult, ProtocolKind,
    ProtocolRegistry, MAX_OMISSION_RETRIES,
};
pub use strategy::{CloudStrategy, CoordinationStrategy, CoreStrategy, EdgeStrategy};
pub use topology::{NodeProfile, NodeTopology, TopologyProvider};
