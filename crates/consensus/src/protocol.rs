//! Failure-aware consensus protocols.
//!
//! Each variant fixes a minimum participant count and a timeout:
//!
//! | Protocol | Minimum | Timeout |
//! |---|---|---|
//! | Byzantine fault tolerant | 3f+1 | 30s |
//! | Crash fault tolerant | 2f+1 | 10s |
//! | Omission fault tolerant | 2f+1 | 15s total, retried |
//!
//! A participant set below the minimum fails without running any round.

use crate::executor::{RoundExecutor, RoundOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use txguard_types::{DistributedOperation, FailureType, NodeId};

pub const DEFAULT_BYZANTINE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_CRASH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_OMISSION_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_OMISSION_MAX_RETRIES: u32 = 2;

/// Upper bound accepted for configured omission retries.
pub const MAX_OMISSION_RETRIES: u32 = 16;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProtocolKind {
    ByzantineFaultTolerant,
    CrashFaultTolerant,
    OmissionFaultTolerant,
}

impl ProtocolKind {
    /// Short name used in result messages.
    pub fn short_name(&self) -> &'static str {
        match self {
            ProtocolKind::ByzantineFaultTolerant => "BFT",
            ProtocolKind::CrashFaultTolerant => "CFT",
            ProtocolKind::OmissionFaultTolerant => "OFT",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

/// Consensus protocol with its fault model parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusProtocol {
    ByzantineFaultTolerant {
        faults: usize,
        timeout: Duration,
    },
    CrashFaultTolerant {
        faults: usize,
        timeout: Duration,
    },
    /// `timeout` is the whole budget, split evenly over `1 + max_retries` attempts.
    OmissionFaultTolerant {
        faults: usize,
        timeout: Duration,
        max_retries: u32,
    },
}

impl ConsensusProtocol {
    pub fn byzantine(faults: usize) -> Self {
        ConsensusProtocol::ByzantineFaultTolerant {
            faults,
            timeout: DEFAULT_BYZANTINE_TIMEOUT,
        }
    }

    pub fn crash(faults: usize) -> Self {
        ConsensusProtocol::CrashFaultTolerant {
            faults,
            timeout: DEFAULT_CRASH_TIMEOUT,
        }
    }

    pub fn omission(faults: usize) -> Self {
        ConsensusProtocol::OmissionFaultTolerant {
            faults,
            timeout: DEFAULT_OMISSION_TIMEOUT,
            max_retries: DEFAULT_OMISSION_MAX_RETRIES,
        }
    }

    /// Replace the protocol timeout.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        match self {
            ConsensusProtocol::ByzantineFaultTolerant { faults, .. } => {
                ConsensusProtocol::ByzantineFaultTolerant { faults, timeout }
            }
            ConsensusProtocol::CrashFaultTolerant { faults, .. } => {
                ConsensusProtocol::CrashFaultTolerant { faults, timeout }
            }
            ConsensusProtocol::OmissionFaultTolerant {
                faults,
                max_retries,
                ..
            } => ConsensusProtocol::OmissionFaultTolerant {
                faults,
                timeout,
                max_retries,
            },
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        match self {
            ConsensusProtocol::ByzantineFaultTolerant { .. } => ProtocolKind::ByzantineFaultTolerant,
            ConsensusProtocol::CrashFaultTolerant { .. } => ProtocolKind::CrashFaultTolerant,
            ConsensusProtocol::OmissionFaultTolerant { .. } => ProtocolKind::OmissionFaultTolerant,
        }
    }

    pub fn faults(&self) -> usize {
        match self {
            ConsensusProtocol::ByzantineFaultTolerant { faults, .. }
            | ConsensusProtocol::CrashFaultTolerant { faults, .. }
            | ConsensusProtocol::OmissionFaultTolerant { faults, .. } => *faults,
        }
    }

    /// Saturates at `usize::MAX`, which no participant set can reach.
    pub fn minimum_participants(&self) -> usize {
        match self {
            ConsensusProtocol::ByzantineFaultTolerant { faults, .. } => {
                faults.saturating_mul(3).saturating_add(1)
            }
            ConsensusProtocol::CrashFaultTolerant { faults, .. }
            | ConsensusProtocol::OmissionFaultTolerant { faults, .. } => {
                faults.saturating_mul(2).saturating_add(1)
            }
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            ConsensusProtocol::ByzantineFaultTolerant { timeout, .. }
            | ConsensusProtocol::CrashFaultTolerant { timeout, .. }
            | ConsensusProtocol::OmissionFaultTolerant { timeout, .. } => *timeout,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        match self {
            ConsensusProtocol::OmissionFaultTolerant { max_retries, .. } => {
                max_retries.saturating_add(1)
            }
            _ => 1,
        }
    }

    pub fn attempt_timeout(&self) -> Duration {
        self.timeout() / self.max_attempts()
    }

    /// Run the protocol for `operation` among `participants`.
    ///
    /// Never returns an error: quorum shortfall, rejection, executor failure
    /// and timeout all come back as a failed [`CoordinationResult`].
    pub async fn coordinate(
        &self,
        operation: &DistributedOperation,
        participants: &[NodeId],
        executor: &dyn RoundExecutor,
    ) -> CoordinationResult {
        let kind = self.kind();
        let started = Instant::now();

        if participants.len() < self.minimum_participants() {
            warn!(
                "Operation {}: {} participants, {} requires {}",
                operation.operation_id,
                participants.len(),
                kind,
                self.minimum_participants()
            );
            return CoordinationResult::failed(
                kind,
                CoordinationOutcome::InsufficientQuorum,
                format!("Insufficient nodes for {} consensus", kind),
                0,
                started.elapsed(),
            );
        }

        let attempt_timeout = self.attempt_timeout();
        let max_attempts = self.max_attempts();

        for attempt in 1..=max_attempts {
            let round = executor.execute_round(kind, operation, participants);
            match tokio::time::timeout(attempt_timeout, round).await {
                Ok(Ok(RoundOutcome::Agreed)) => {
                    info!(
                        "{} consensus achieved for operation {} (attempt {})",
                        kind, operation.operation_id, attempt
                    );
                    return CoordinationResult::agreed(kind, attempt, started.elapsed());
                }
                Ok(Ok(RoundOutcome::Rejected { reason })) => {
                    warn!(
                        "{} consensus rejected operation {}: {}",
                        kind, operation.operation_id, reason
                    );
                    return CoordinationResult::failed(
                        kind,
                        CoordinationOutcome::Rejected,
                        format!("{} consensus rejected: {}", kind, reason),
                        attempt,
                        started.elapsed(),
                    );
                }
                Ok(Err(e)) => {
                    warn!(
                        "{} round failed for operation {}: {}",
                        kind, operation.operation_id, e
                    );
                    return CoordinationResult::failed(
                        kind,
                        CoordinationOutcome::RoundsFailed,
                        format!("{} consensus rounds failed: {}", kind, e),
                        attempt,
                        started.elapsed(),
                    );
                }
                Err(_) if attempt < max_attempts => {
                    debug!(
                        "{} attempt {}/{} timed out after {:?}, retrying",
                        kind, attempt, max_attempts, attempt_timeout
                    );
                }
                Err(_) => {
                    warn!(
                        "{} consensus timed out for operation {} after {} attempt(s)",
                        kind, operation.operation_id, attempt
                    );
                    return CoordinationResult::failed(
                        kind,
                        CoordinationOutcome::TimedOut,
                        format!("{} consensus timed out after {:?}", kind, self.timeout()),
                        attempt,
                        started.elapsed(),
                    );
                }
            }
        }

        // max_attempts is at least one, so the loop always returns.
        CoordinationResult::failed(
            kind,
            CoordinationOutcome::TimedOut,
            format!("{} consensus timed out after {:?}", kind, self.timeout()),
            max_attempts,
            started.elapsed(),
        )
    }
}

/// Why a coordination ended the way it did.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationOutcome {
    Agreed,
    InsufficientQuorum,
    TimedOut,
    Rejected,
    RoundsFailed,
}

/// Outcome of [`ConsensusProtocol::coordinate`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinationResult {
    success: bool,
    message: String,
    outcome: CoordinationOutcome,
    protocol: ProtocolKind,
    attempts: u32,
    duration_ms: u64,
    completed_at: DateTime<Utc>,
}

impl CoordinationResult {
    pub fn agreed(protocol: ProtocolKind, attempts: u32, elapsed: Duration) -> Self {
        Self {
            success: true,
            message: format!("{} consensus achieved", protocol),
            outcome: CoordinationOutcome::Agreed,
            protocol,
            attempts,
            duration_ms: elapsed.as_millis() as u64,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(
        protocol: ProtocolKind,
        outcome: CoordinationOutcome,
        message: impl Into<String>,
        attempts: u32,
        elapsed: Duration,
    ) -> Self {
        Self {
            success: false,
            message: message.into(),
            outcome,
            protocol,
            attempts,
            duration_ms: elapsed.as_millis() as u64,
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn outcome(&self) -> CoordinationOutcome {
        self.outcome
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    /// Round attempts made; zero when the quorum check failed.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }
}

/// Protocol parameters shared by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusSettings {
    pub fault_tolerance: usize,
    pub byzantine_timeout: Duration,
    pub crash_timeout: Duration,
    pub omission_timeout: Duration,
    pub omission_max_retries: u32,
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        Self {
            fault_tolerance: 1,
            byzantine_timeout: DEFAULT_BYZANTINE_TIMEOUT,
            crash_timeout: DEFAULT_CRASH_TIMEOUT,
            omission_timeout: DEFAULT_OMISSION_TIMEOUT,
            omission_max_retries: DEFAULT_OMISSION_MAX_RETRIES,
        }
    }
}

/// Read-only table of the three protocols, built once at start-up.
#[derive(Debug, Clone)]
pub struct ProtocolRegistry {
    byzantine: ConsensusProtocol,
    crash: ConsensusProtocol,
    omission: ConsensusProtocol,
}

impl ProtocolRegistry {
    pub fn new(settings: &ConsensusSettings) -> Self {
        let f = settings.fault_tolerance;
        Self {
            byzantine: ConsensusProtocol::ByzantineFaultTolerant {
                faults: f,
                timeout: settings.byzantine_timeout,
            },
            crash: ConsensusProtocol::CrashFaultTolerant {
                faults: f,
                timeout: settings.crash_timeout,
            },
            omission: ConsensusProtocol::OmissionFaultTolerant {
                faults: f,
                timeout: settings.omission_timeout,
                max_retries: settings.omission_max_retries,
            },
        }
    }

    pub fn get(&self, kind: ProtocolKind) -> &ConsensusProtocol {
        match kind {
            ProtocolKind::ByzantineFaultTolerant => &self.byzantine,
            ProtocolKind::CrashFaultTolerant => &self.crash,
            ProtocolKind::OmissionFaultTolerant => &self.omission,
        }
    }

    /// Protocol that tolerates a single failure type. Partitions are handled
    /// by the crash-tolerant majority protocol.
    pub fn for_failure_type(&self, failure_type: FailureType) -> &ConsensusProtocol {
        match failure_type {
            FailureType::Byzantine => &self.byzantine,
            FailureType::Omission => &self.omission,
            FailureType::Crash | FailureType::NetworkPartition => &self.crash,
        }
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new(&ConsensusSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ImmediateAgreement, MockRoundExecutor};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use txguard_types::TxGuardError;

    fn nodes(n: usize) -> Vec<NodeId> {
        (1..=n).map(|i| NodeId::from(format!("Core{}", i))).collect()
    }

    fn op() -> DistributedOperation {
        DistributedOperation::new("op-1", "transfer")
    }

    /// Sleeps longer than any test attempt timeout for the first `stalls` calls.
    struct StallingExecutor {
        stalls: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl RoundExecutor for StallingExecutor {
        async fn execute_round(
            &self,
            _protocol: ProtocolKind,
            _operation: &DistributedOperation,
            _participants: &[NodeId],
        ) -> txguard_types::Result<RoundOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.stalls {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(RoundOutcome::Agreed)
        }
    }

    #[test]
    fn test_minimum_participants() {
        assert_eq!(ConsensusProtocol::byzantine(1).minimum_participants(), 4);
        assert_eq!(ConsensusProtocol::crash(1).minimum_participants(), 3);
        assert_eq!(ConsensusProtocol::omission(1).minimum_participants(), 3);
        assert_eq!(ConsensusProtocol::byzantine(2).minimum_participants(), 7);
        assert_eq!(ConsensusProtocol::crash(2).minimum_participants(), 5);
    }

    #[test]
    fn test_default_timeouts() {
        assert_eq!(ConsensusProtocol::byzantine(1).timeout(), Duration::from_secs(30));
        assert_eq!(ConsensusProtocol::crash(1).timeout(), Duration::from_secs(10));
        let omission = ConsensusProtocol::omission(1);
        assert_eq!(omission.timeout(), Duration::from_secs(15));
        assert_eq!(omission.max_attempts(), 3);
        assert_eq!(omission.attempt_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_registry_failure_type_mapping() {
        let registry = ProtocolRegistry::default();
        assert_eq!(
            registry.for_failure_type(FailureType::Byzantine).kind(),
            ProtocolKind::ByzantineFaultTolerant
        );
        assert_eq!(
            registry.for_failure_type(FailureType::Omission).kind(),
            ProtocolKind::OmissionFaultTolerant
        );
        assert_eq!(
            registry.for_failure_type(FailureType::NetworkPartition).kind(),
            ProtocolKind::CrashFaultTolerant
        );
    }

    #[tokio::test]
    async fn test_extreme_parameters_do_not_overflow() {
        let settings = ConsensusSettings {
            omission_max_retries: u32::MAX,
            ..ConsensusSettings::default()
        };
        let registry = ProtocolRegistry::new(&settings);
        let omission = registry.for_failure_type(FailureType::Omission);
        assert_eq!(omission.max_attempts(), u32::MAX);

        let result = omission
            .coordinate(&op(), &nodes(3), &ImmediateAgreement)
            .await;
        assert!(result.is_success());
        assert_eq!(result.attempts(), 1);

        let byzantine = ConsensusProtocol::byzantine(usize::MAX);
        assert_eq!(byzantine.minimum_participants(), usize::MAX);
        assert_eq!(ConsensusProtocol::crash(usize::MAX).minimum_participants(), usize::MAX);
        let result = byzantine
            .coordinate(&op(), &nodes(4), &ImmediateAgreement)
            .await;
        assert_eq!(result.outcome(), CoordinationOutcome::InsufficientQuorum);
    }

    #[tokio::test]
    async fn test_insufficient_quorum_never_runs_rounds() {
        let mut executor = MockRoundExecutor::new();
        executor.expect_execute_round().times(0);

        let result = ConsensusProtocol::byzantine(1)
            .coordinate(&op(), &nodes(3), &executor)
            .await;

        assert!(!result.is_success());
        assert_eq!(result.outcome(), CoordinationOutcome::InsufficientQuorum);
        assert_eq!(result.message(), "Insufficient nodes for BFT consensus");
        assert_eq!(result.attempts(), 0);
    }

    #[tokio::test]
    async fn test_agreement_with_quorum() {
        let result = ConsensusProtocol::crash(1)
            .coordinate(&op(), &nodes(3), &ImmediateAgreement)
            .await;

        assert!(result.is_success());
        assert_eq!(result.protocol(), ProtocolKind::CrashFaultTolerant);
        assert_eq!(result.message(), "CFT consensus achieved");
        assert_eq!(result.attempts(), 1);
    }

    #[tokio::test]
    async fn test_executor_receives_protocol_and_participants() {
        let mut executor = MockRoundExecutor::new();
        executor
            .expect_execute_round()
            .withf(|kind, operation, participants| {
                *kind == ProtocolKind::ByzantineFaultTolerant
                    && operation.operation_id == "op-1"
                    && participants.len() == 4
            })
            .times(1)
            .returning(|_, _, _| Ok(RoundOutcome::Agreed));

        let result = ConsensusProtocol::byzantine(1)
            .coordinate(&op(), &nodes(4), &executor)
            .await;
        assert!(result.is_success());
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let mut executor = MockRoundExecutor::new();
        executor.expect_execute_round().times(1).returning(|_, _, _| {
            Ok(RoundOutcome::Rejected {
                reason: "conflicting write".to_string(),
            })
        });

        let result = ConsensusProtocol::omission(1)
            .coordinate(&op(), &nodes(3), &executor)
            .await;

        assert!(!result.is_success());
        assert_eq!(result.outcome(), CoordinationOutcome::Rejected);
        assert!(result.message().contains("conflicting write"));
    }

    #[tokio::test]
    async fn test_executor_error_reported_as_failed_rounds() {
        let mut executor = MockRoundExecutor::new();
        executor
            .expect_execute_round()
            .times(1)
            .returning(|_, _, _| Err(TxGuardError::RoundExecution("link down".to_string())));

        let result = ConsensusProtocol::crash(1)
            .coordinate(&op(), &nodes(3), &executor)
            .await;

        assert_eq!(result.outcome(), CoordinationOutcome::RoundsFailed);
    }

    #[tokio::test]
    async fn test_crash_protocol_times_out_without_retry() {
        let protocol = ConsensusProtocol::crash(1).with_timeout(Duration::from_millis(50));
        let executor = StallingExecutor {
            stalls: 1,
            calls: AtomicU32::new(0),
        };

        let result = protocol.coordinate(&op(), &nodes(3), &executor).await;

        assert!(!result.is_success());
        assert_eq!(result.outcome(), CoordinationOutcome::TimedOut);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_omission_protocol_retries_after_timeout() {
        let protocol = ConsensusProtocol::omission(1).with_timeout(Duration::from_millis(150));
        let executor = StallingExecutor {
            stalls: 2,
            calls: AtomicU32::new(0),
        };

        let result = protocol.coordinate(&op(), &nodes(3), &executor).await;

        assert!(result.is_success());
        assert_eq!(result.attempts(), 3);
    }

    #[tokio::test]
    async fn test_omission_protocol_gives_up_after_retries() {
        let protocol = ConsensusProtocol::omission(1).with_timeout(Duration::from_millis(150));
        let executor = StallingExecutor {
            stalls: 10,
            calls: AtomicU32::new(0),
        };

        let result = protocol.coordinate(&op(), &nodes(3), &executor).await;

        assert_eq!(result.outcome(), CoordinationOutcome::TimedOut);
        assert_eq!(result.attempts(), 3);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    }
}
