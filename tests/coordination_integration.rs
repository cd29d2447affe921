//! Protocol resolution and quorum enforcement through the assembled system.

mod common;

use common::{extended_config, nodes, CountingExecutor, StallingExecutor};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use txguard::TransactionSystem;
use txguard_consensus::{CoordinationOutcome, ProtocolKind};
use txguard_types::{DistributedOperation, TxGuardError};

fn operation() -> DistributedOperation {
    DistributedOperation::new("op-1", "update_subscriber")
        .with_parameter("subscriber", "alice")
        .with_parameter("balance", 42)
}

#[tokio::test]
async fn test_edge_and_byzantine_core_resolve_to_bft() {
    let executor = Arc::new(CountingExecutor::default());
    let system =
        TransactionSystem::with_executor(txguard::AppConfig::default(), executor.clone()).unwrap();
    let mechanism = system.coordinator().mechanism();

    let participants = nodes(&["Edge1", "Core1"]);
    let protocol = mechanism.resolve_protocol(&participants).unwrap();
    assert_eq!(protocol.kind(), ProtocolKind::ByzantineFaultTolerant);
    assert_eq!(protocol.minimum_participants(), 4);

    let result = mechanism
        .coordinate_operation(&operation(), &participants)
        .await
        .unwrap();
    assert!(!result.is_success());
    assert_eq!(result.outcome(), CoordinationOutcome::InsufficientQuorum);
    assert_eq!(executor.rounds.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_byzantine_member_forces_larger_quorum() {
    let executor = Arc::new(CountingExecutor::default());
    let system = TransactionSystem::with_executor(extended_config(), executor.clone()).unwrap();
    let mechanism = system.coordinator().mechanism();

    // Three crash nodes would satisfy CFT on their own.
    let crash_only = nodes(&["Core2", "Core3", "Core4"]);
    assert!(mechanism
        .coordinate_operation(&operation(), &crash_only)
        .await
        .unwrap()
        .is_success());

    let with_byzantine = nodes(&["Core1", "Core2", "Core3"]);
    let result = mechanism
        .coordinate_operation(&operation(), &with_byzantine)
        .await
        .unwrap();
    assert_eq!(result.protocol(), ProtocolKind::ByzantineFaultTolerant);
    assert!(!result.is_success());

    let quorum = nodes(&["Core1", "Core2", "Core3", "Core4"]);
    let result = mechanism
        .coordinate_operation(&operation(), &quorum)
        .await
        .unwrap();
    assert!(result.is_success());
    assert_eq!(executor.rounds.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_omission_protocol_retries_within_budget() {
    let mut config = extended_config();
    config.consensus.omission_timeout_ms = 300;
    config.consensus.omission_max_retries = 2;
    let executor = StallingExecutor::new(Duration::from_secs(2), 1);
    let system = TransactionSystem::with_executor(config, executor.clone()).unwrap();

    let result = system
        .coordinator()
        .mechanism()
        .coordinate_operation(&operation(), &nodes(&["Edge2", "Core2", "Core3"]))
        .await
        .unwrap();

    assert!(result.is_success());
    assert_eq!(result.protocol(), ProtocolKind::OmissionFaultTolerant);
    assert_eq!(result.attempts(), 2);
}

#[tokio::test]
async fn test_crash_protocol_timeout_is_distinct_from_quorum_failure() {
    let mut config = extended_config();
    config.consensus.crash_timeout_ms = 50;
    let executor = StallingExecutor::new(Duration::from_secs(2), u32::MAX);
    let system = TransactionSystem::with_executor(config, executor).unwrap();

    let result = system
        .coordinator()
        .mechanism()
        .coordinate_operation(&operation(), &nodes(&["Core2", "Core3", "Core4"]))
        .await
        .unwrap();

    assert_eq!(result.outcome(), CoordinationOutcome::TimedOut);
    assert_eq!(result.attempts(), 1);
}

#[tokio::test]
async fn test_unknown_participant_is_precondition_error() {
    let system = common::system(txguard::AppConfig::default());
    let err = system
        .coordinator()
        .mechanism()
        .coordinate_operation(&operation(), &nodes(&["Edge1", "Saturn7"]))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        TxGuardError::UnknownNode {
            node_id: "Saturn7".to_string()
        }
    );
}
