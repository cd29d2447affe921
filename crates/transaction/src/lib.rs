//! Transaction lifecycle for the coordination core
//!
//! - **FSM**: legal transitions between transaction states; no I/O.
//! - **Coordinator**: begin/prepare/commit/abort, resource acquisition and
//!   deadlock handling, serialized per transaction.
//! - **Monitor**: background task that resolves deadlocks and times out stuck
//!   transactions.

pub mod coordinator;
pub mod fsm;
pub mod monitor;

// Re-export main types
pub use coordinator::{
    CoordinatorSettings, CoordinatorStatsSnapshot, DeadlockResolution, TransactionCoordinator,
    TransactionOutcome, DEFAULT_TRANSACTION_TIMEOUT,
};
pub use fsm::TransactionFsm;
pub use monitor::{DeadlockMonitor, MonitorReport, DEFAULT_SCAN_INTERVAL};
