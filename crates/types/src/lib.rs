//! Shared types for the transaction coordination core.
//!
//! Identifiers, failure classification, the transaction state table and the
//! error type used by every other `txguard` crate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxGuardError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Transaction {tx_id} cannot wait for itself")]
    SelfWait { tx_id: String },

    #[error("Participant set must not be empty")]
    EmptyParticipants,

    #[error("Unknown node: {node_id}")]
    UnknownNode { node_id: String },

    #[error("Transaction not found: {tx_id}")]
    TransactionNotFound { tx_id: String },

    #[error("Transaction {tx_id} is not active (state {state})")]
    TransactionNotActive {
        tx_id: String,
        state: TransactionState,
    },

    #[error("Illegal state transition for tx_id={tx_id}: {from} -> {to}")]
    IllegalStateTransition {
        tx_id: String,
        from: TransactionState,
        to: TransactionState,
    },

    #[error("Prepare failed for tx_id={tx_id}: {reason}")]
    PrepareFailed { tx_id: String, reason: String },

    #[error("Transaction timed out: {tx_id}")]
    TransactionTimedOut { tx_id: String },

    #[error("Round execution error: {0}")]
    RoundExecution(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, TxGuardError>;

/// Identifier of a distributed transaction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub String);

impl TransactionId {
    /// Allocate a fresh random identifier.
    pub fn generate() -> Self {
        TransactionId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TransactionId {
    fn from(s: String) -> Self {
        TransactionId(s)
    }
}

impl From<&str> for TransactionId {
    fn from(s: &str) -> Self {
        TransactionId(s.to_string())
    }
}

/// Opaque name of a contended resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub String);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ResourceId {
    fn from(s: String) -> Self {
        ResourceId(s)
    }
}

impl From<&str> for ResourceId {
    fn from(s: &str) -> Self {
        ResourceId(s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

/// How a node is expected to fail. Fixed per node for the lifetime of a topology.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    /// Node stops responding cleanly.
    Crash,
    /// Node silently drops some messages.
    Omission,
    /// Node may send arbitrary or contradictory messages.
    Byzantine,
    /// Connectivity split between nodes.
    NetworkPartition,
}

impl FailureType {
    pub fn description(&self) -> &'static str {
        match self {
            FailureType::Crash => "node stops responding completely",
            FailureType::Omission => "node fails to send or receive some messages",
            FailureType::Byzantine => "node exhibits arbitrary malicious behavior",
            FailureType::NetworkPartition => "network connectivity issues between nodes",
        }
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Crash => write!(f, "CRASH"),
            FailureType::Omission => write!(f, "OMISSION"),
            FailureType::Byzantine => write!(f, "BYZANTINE"),
            FailureType::NetworkPartition => write!(f, "NETWORK_PARTITION"),
        }
    }
}

impl FromStr for FailureType {
    type Err = TxGuardError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "CRASH" => Ok(FailureType::Crash),
            "OMISSION" => Ok(FailureType::Omission),
            "BYZANTINE" => Ok(FailureType::Byzantine),
            "NETWORK_PARTITION" => Ok(FailureType::NetworkPartition),
            other => Err(TxGuardError::InvalidArgument(format!(
                "unknown failure type: {}",
                other
            ))),
        }
    }
}

/// Architectural layer a node belongs to. Ordered edge -> core -> cloud.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeLayer {
    Edge,
    Core,
    Cloud,
}

impl NodeLayer {
    /// Infer the layer from a node id prefix (`Edge1`, `Core2`, `Cloud1`).
    pub fn infer(node_id: &NodeId) -> Option<Self> {
        let id = node_id.as_str();
        if id.starts_with("Edge") {
            Some(NodeLayer::Edge)
        } else if id.starts_with("Core") {
            Some(NodeLayer::Core)
        } else if id.starts_with("Cloud") {
            Some(NodeLayer::Cloud)
        } else {
            None
        }
    }
}

impl fmt::Display for NodeLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeLayer::Edge => write!(f, "EDGE"),
            NodeLayer::Core => write!(f, "CORE"),
            NodeLayer::Cloud => write!(f, "CLOUD"),
        }
    }
}

/// Lifecycle state of a distributed transaction.
///
/// Legal transitions:
/// - Active -> Preparing | Aborting
/// - Preparing -> Prepared | Aborting
/// - Prepared -> Committing | Aborting
/// - Committing -> Committed | Aborting
/// - Aborting -> Aborted
///
/// `Committed` and `Aborted` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    Active,
    Preparing,
    Prepared,
    Committing,
    Committed,
    Aborting,
    Aborted,
}

impl TransactionState {
    pub const ALL: [TransactionState; 7] = [
        TransactionState::Active,
        TransactionState::Preparing,
        TransactionState::Prepared,
        TransactionState::Committing,
        TransactionState::Committed,
        TransactionState::Aborting,
        TransactionState::Aborted,
    ];

    pub fn allowed_transitions(&self) -> &'static [TransactionState] {
        match self {
            TransactionState::Active => &[TransactionState::Preparing, TransactionState::Aborting],
            TransactionState::Preparing => &[TransactionState::Prepared, TransactionState::Aborting],
            TransactionState::Prepared => &[TransactionState::Committing, TransactionState::Aborting],
            TransactionState::Committing => {
                &[TransactionState::Committed, TransactionState::Aborting]
            }
            TransactionState::Aborting => &[TransactionState::Aborted],
            TransactionState::Committed | TransactionState::Aborted => &[],
        }
    }

    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        self.allowed_transitions().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Preparing => write!(f, "PREPARING"),
            TransactionState::Prepared => write!(f, "PREPARED"),
            TransactionState::Committing => write!(f, "COMMITTING"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborting => write!(f, "ABORTING"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

impl FromStr for TransactionState {
    type Err = TxGuardError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ACTIVE" => Ok(TransactionState::Active),
            "PREPARING" => Ok(TransactionState::Preparing),
            "PREPARED" => Ok(TransactionState::Prepared),
            "COMMITTING" => Ok(TransactionState::Committing),
            "COMMITTED" => Ok(TransactionState::Committed),
            "ABORTING" => Ok(TransactionState::Aborting),
            "ABORTED" => Ok(TransactionState::Aborted),
            other => Err(TxGuardError::InvalidArgument(format!(
                "unknown transaction state: {}",
                other
            ))),
        }
    }
}

/// Why a transaction ended up aborted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    DeadlockVictim,
    PrepareFailed,
    CommitFailed,
    Explicit,
    Timeout,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::DeadlockVictim => write!(f, "deadlock_victim"),
            AbortReason::PrepareFailed => write!(f, "prepare_failed"),
            AbortReason::CommitFailed => write!(f, "commit_failed"),
            AbortReason::Explicit => write!(f, "explicit"),
            AbortReason::Timeout => write!(f, "timeout"),
        }
    }
}

/// Outcome reported by `commit`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommitResult {
    Committed,
    Aborted,
    TimedOut,
}

impl CommitResult {
    pub fn is_successful(&self) -> bool {
        matches!(self, CommitResult::Committed)
    }
}

/// Unit of work submitted to a consensus protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistributedOperation {
    pub operation_id: String,
    pub operation_type: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

impl DistributedOperation {
    pub fn new(operation_id: impl Into<String>, operation_type: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            operation_type: operation_type.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}
