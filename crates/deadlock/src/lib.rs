//! Wait-for graph deadlock detection.
//!
//! [`WaitForGraph`] tracks which transaction holds which resource and who is
//! blocked on whom. [`DeadlockDetector`] scans it for cycles, picks the
//! youngest deadlocked transaction as the victim and scrubs it from the graph.
//!
//! The detector never changes transaction state; aborting the victim is the
//! coordinator's responsibility.

pub mod detector;
pub mod graph;

pub use detector::{
    DeadlockDetector, DeadlockStats, DeadlockStatsSnapshot, DEFAULT_DEADLOCK_TIMEOUT,
};
pub use graph::{AcquireOutcome, OwnershipConflict, WaitForGraph};
