//! Transaction coordinator
//!
//! Drives transactions through prepare/commit/abort, runs each phase's round
//! through the failure-aware coordination mechanism and resolves deadlocks
//! reported by the wait-for graph.
//!
//! Operations on one transaction are serialized by a per-transaction async
//! mutex. The transaction table itself is a `parking_lot` lock that is never
//! held across an await point. Lock order is always transaction mutex, then
//! graph lock.

use crate::fsm::TransactionFsm;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use txguard_consensus::{CoordinationMechanism, CoordinationOutcome, CoordinationResult};
use txguard_deadlock::{AcquireOutcome, DeadlockDetector};
use txguard_types::{
    AbortReason, CommitResult, DistributedOperation, NodeId, ResourceId, Result, TransactionId,
    TransactionState, TxGuardError,
};

pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// Age after which prepare/commit abort the transaction instead.
    pub transaction_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
        }
    }
}

/// Terminal or in-flight view of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionOutcome {
    pub tx_id: TransactionId,
    pub state: TransactionState,
    pub reason: Option<AbortReason>,
    pub coordination: Option<CoordinationOutcome>,
    pub participants: Vec<NodeId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Result of [`TransactionCoordinator::resolve_deadlocks`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeadlockResolution {
    /// Victims aborted, in the order they were chosen.
    pub victims: Vec<TransactionId>,
    /// Detection scans performed, including the final clean one.
    pub scans: usize,
}

#[derive(Debug, Default)]
struct CoordinatorStats {
    begun: AtomicU64,
    prepared: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    deadlock_victims: AtomicU64,
    prepare_failures: AtomicU64,
    commit_failures: AtomicU64,
    explicit_aborts: AtomicU64,
    timeouts: AtomicU64,
}

impl CoordinatorStats {
    fn record_abort(&self, reason: AbortReason) {
        self.aborted.fetch_add(1, AtomicOrdering::Relaxed);
        let counter = match reason {
            AbortReason::DeadlockVictim => &self.deadlock_victims,
            AbortReason::PrepareFailed => &self.prepare_failures,
            AbortReason::CommitFailed => &self.commit_failures,
            AbortReason::Explicit => &self.explicit_aborts,
            AbortReason::Timeout => &self.timeouts,
        };
        counter.fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn snapshot(&self) -> CoordinatorStatsSnapshot {
        CoordinatorStatsSnapshot {
            begun: self.begun.load(AtomicOrdering::Relaxed),
            prepared: self.prepared.load(AtomicOrdering::Relaxed),
            committed: self.committed.load(AtomicOrdering::Relaxed),
            aborted: self.aborted.load(AtomicOrdering::Relaxed),
            deadlock_victims: self.deadlock_victims.load(AtomicOrdering::Relaxed),
            prepare_failures: self.prepare_failures.load(AtomicOrdering::Relaxed),
            commit_failures: self.commit_failures.load(AtomicOrdering::Relaxed),
            explicit_aborts: self.explicit_aborts.load(AtomicOrdering::Relaxed),
            timeouts: self.timeouts.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStatsSnapshot {
    pub begun: u64,
    pub prepared: u64,
    pub committed: u64,
    pub aborted: u64,
    pub deadlock_victims: u64,
    pub prepare_failures: u64,
    pub commit_failures: u64,
    pub explicit_aborts: u64,
    pub timeouts: u64,
}

struct TransactionRecord {
    fsm: TransactionFsm,
    participants: Vec<NodeId>,
    abort_reason: Option<AbortReason>,
    coordination: Option<CoordinationOutcome>,
    finished_at: Option<DateTime<Utc>>,
}

struct TransactionSlot {
    // Immutable, so deadlock handling can read it without the mutex.
    started_at: DateTime<Utc>,
    record: Mutex<TransactionRecord>,
}

impl TransactionSlot {
    fn new(tx_id: TransactionId, started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            record: Mutex::new(TransactionRecord {
                fsm: TransactionFsm::new(tx_id),
                participants: Vec::new(),
                abort_reason: None,
                coordination: None,
                finished_at: None,
            }),
        }
    }
}

pub struct TransactionCoordinator {
    detector: Arc<DeadlockDetector>,
    mechanism: Arc<CoordinationMechanism>,
    transactions: RwLock<HashMap<TransactionId, Arc<TransactionSlot>>>,
    settings: CoordinatorSettings,
    stats: CoordinatorStats,
}

impl TransactionCoordinator {
    pub fn new(
        detector: Arc<DeadlockDetector>,
        mechanism: Arc<CoordinationMechanism>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            detector,
            mechanism,
            transactions: RwLock::new(HashMap::new()),
            settings,
            stats: CoordinatorStats::default(),
        }
    }

    pub fn detector(&self) -> &Arc<DeadlockDetector> {
        &self.detector
    }

    pub fn mechanism(&self) -> &Arc<CoordinationMechanism> {
        &self.mechanism
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Start a transaction with a fresh id, timestamped now.
    pub fn begin_transaction(&self) -> TransactionId {
        self.begin_transaction_at(Utc::now())
    }

    /// Start a transaction with a fresh id and a caller-supplied start time.
    pub fn begin_transaction_at(&self, started_at: DateTime<Utc>) -> TransactionId {
        loop {
            let tx_id = TransactionId::generate();
            if self.insert_slot(&tx_id, started_at) {
                return tx_id;
            }
        }
    }

    /// Start a transaction under a caller-chosen id.
    pub fn begin_transaction_with_id(
        &self,
        tx_id: TransactionId,
        started_at: DateTime<Utc>,
    ) -> Result<TransactionId> {
        if !self.insert_slot(&tx_id, started_at) {
            return Err(TxGuardError::InvalidArgument(format!(
                "transaction already exists: {}",
                tx_id
            )));
        }
        Ok(tx_id)
    }

    fn insert_slot(&self, tx_id: &TransactionId, started_at: DateTime<Utc>) -> bool {
        let mut transactions = self.transactions.write();
        if transactions.contains_key(tx_id) {
            return false;
        }
        transactions.insert(
            tx_id.clone(),
            Arc::new(TransactionSlot::new(tx_id.clone(), started_at)),
        );
        self.stats.begun.fetch_add(1, AtomicOrdering::Relaxed);
        info!("Started transaction {}", tx_id);
        true
    }

    fn slot(&self, tx_id: &TransactionId) -> Result<Arc<TransactionSlot>> {
        self.transactions
            .read()
            .get(tx_id)
            .cloned()
            .ok_or_else(|| TxGuardError::TransactionNotFound {
                tx_id: tx_id.to_string(),
            })
    }

    fn is_expired(&self, tx_id: &TransactionId, started_at: DateTime<Utc>) -> bool {
        self.detector
            .is_timed_out(tx_id, started_at, self.settings.transaction_timeout)
    }

    /// Prepare `tx_id` among `participants` with a default prepare operation.
    pub async fn prepare(
        &self,
        tx_id: &TransactionId,
        participants: &[NodeId],
    ) -> Result<CoordinationResult> {
        let operation = DistributedOperation::new(tx_id.to_string(), "prepare");
        self.prepare_operation(tx_id, &operation, participants).await
    }

    /// Run the prepare phase for `operation`.
    ///
    /// Unknown or missing participants fail before any state change. A failed
    /// coordination aborts the transaction and returns `PrepareFailed`.
    pub async fn prepare_operation(
        &self,
        tx_id: &TransactionId,
        operation: &DistributedOperation,
        participants: &[NodeId],
    ) -> Result<CoordinationResult> {
        let slot = self.slot(tx_id)?;
        let mut record = slot.record.lock().await;

        self.mechanism.resolve_protocol(participants)?;

        if !record.fsm.is_terminal() && self.is_expired(tx_id, slot.started_at) {
            warn!("Transaction {} timed out before prepare, aborting", tx_id);
            self.abort_locked(tx_id, &mut record, AbortReason::Timeout)
                .await?;
            return Err(TxGuardError::TransactionTimedOut {
                tx_id: tx_id.to_string(),
            });
        }

        record.fsm.start_prepare()?;
        record.participants = participants.to_vec();
        info!(
            "Preparing transaction {} with participants: {:?}",
            tx_id, participants
        );

        let result = match self
            .mechanism
            .coordinate_operation(operation, participants)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                self.abort_locked(tx_id, &mut record, AbortReason::PrepareFailed)
                    .await?;
                return Err(e);
            }
        };
        record.coordination = Some(result.outcome());

        if result.is_success() {
            record.fsm.mark_prepared()?;
            self.stats.prepared.fetch_add(1, AtomicOrdering::Relaxed);
            info!("Transaction {} prepared successfully", tx_id);
            Ok(result)
        } else {
            warn!(
                "Transaction {} prepare failed ({:?}): {}",
                tx_id,
                result.outcome(),
                result.message()
            );
            self.abort_locked(tx_id, &mut record, AbortReason::PrepareFailed)
                .await?;
            Err(TxGuardError::PrepareFailed {
                tx_id: tx_id.to_string(),
                reason: result.message().to_string(),
            })
        }
    }

    /// Commit a prepared transaction.
    ///
    /// The commit decision is delivered to the prepared participants under the
    /// protocol chosen for them. A rejected or failed commit round aborts the
    /// transaction and reports `Aborted`; a timed-out one aborts it and
    /// reports `TimedOut`.
    ///
    /// A transaction already aborted (for example as a deadlock victim)
    /// reports `Aborted`; one past its timeout is aborted and reports
    /// `TimedOut`. Any other state but `Prepared` is an illegal transition.
    pub async fn commit(&self, tx_id: &TransactionId) -> Result<CommitResult> {
        let slot = self.slot(tx_id)?;
        let mut record = slot.record.lock().await;

        if record.fsm.current_state() == TransactionState::Aborted {
            return Ok(CommitResult::Aborted);
        }

        if !record.fsm.is_terminal() && self.is_expired(tx_id, slot.started_at) {
            warn!("Transaction {} timed out before commit, aborting", tx_id);
            self.abort_locked(tx_id, &mut record, AbortReason::Timeout)
                .await?;
            return Ok(CommitResult::TimedOut);
        }

        record.fsm.start_commit()?;

        let participants = record.participants.clone();
        let operation = DistributedOperation::new(tx_id.to_string(), "commit");
        let result = match self
            .mechanism
            .coordinate_operation(&operation, &participants)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                self.abort_locked(tx_id, &mut record, AbortReason::CommitFailed)
                    .await?;
                return Err(e);
            }
        };
        record.coordination = Some(result.outcome());

        if !result.is_success() {
            let (reason, commit_result) = match result.outcome() {
                CoordinationOutcome::TimedOut => (AbortReason::Timeout, CommitResult::TimedOut),
                _ => (AbortReason::CommitFailed, CommitResult::Aborted),
            };
            warn!(
                "Transaction {} commit failed ({:?}): {}",
                tx_id,
                result.outcome(),
                result.message()
            );
            self.abort_locked(tx_id, &mut record, reason).await?;
            return Ok(commit_result);
        }

        record.fsm.mark_committed()?;
        record.finished_at = Some(Utc::now());
        self.detector.remove_transaction(tx_id);
        self.stats.committed.fetch_add(1, AtomicOrdering::Relaxed);
        info!("Transaction {} committed successfully", tx_id);

        Ok(CommitResult::Committed)
    }

    /// Abort explicitly. Aborting an aborted transaction is a no-op.
    ///
    /// Participants recorded by `prepare` are sent the abort before the
    /// transaction leaves the graph.
    pub async fn abort(&self, tx_id: &TransactionId) -> Result<()> {
        self.abort_with_reason(tx_id, AbortReason::Explicit).await
    }

    pub async fn abort_with_reason(&self, tx_id: &TransactionId, reason: AbortReason) -> Result<()> {
        let slot = self.slot(tx_id)?;
        let mut record = slot.record.lock().await;
        self.abort_locked(tx_id, &mut record, reason).await
    }

    async fn abort_locked(
        &self,
        tx_id: &TransactionId,
        record: &mut TransactionRecord,
        reason: AbortReason,
    ) -> Result<()> {
        match record.fsm.current_state() {
            TransactionState::Aborted => {
                debug!("Transaction {} already aborted", tx_id);
                return Ok(());
            }
            TransactionState::Aborting => {}
            _ => record.fsm.start_abort()?,
        }

        self.notify_abort(tx_id, &record.participants).await;

        record.fsm.mark_aborted()?;
        record.abort_reason = Some(reason);
        record.finished_at = Some(Utc::now());
        self.detector.remove_transaction(tx_id);
        self.stats.record_abort(reason);
        info!("Transaction {} aborted ({})", tx_id, reason);
        Ok(())
    }

    /// Deliver the abort decision. The abort stands whatever the
    /// participants answer; failures are only logged.
    async fn notify_abort(&self, tx_id: &TransactionId, participants: &[NodeId]) {
        if participants.is_empty() {
            return;
        }

        let operation = DistributedOperation::new(tx_id.to_string(), "abort");
        match self
            .mechanism
            .coordinate_operation(&operation, participants)
            .await
        {
            Ok(result) if result.is_success() => {
                debug!("Abort of {} delivered to {:?}", tx_id, participants);
            }
            Ok(result) => warn!(
                "Abort of {} not acknowledged ({:?}): {}",
                tx_id,
                result.outcome(),
                result.message()
            ),
            Err(e) => warn!("Abort of {} could not be delivered: {}", tx_id, e),
        }
    }

    /// Abort the youngest of `deadlocked` and scrub it from the graph.
    ///
    /// Exactly one victim per call; the rest stay active. Returns the victim,
    /// or `None` for an empty set. A victim busy in another operation (for
    /// example a prepare round) is left alone and `None` is returned; the next
    /// scan picks the cycle up again.
    pub async fn handle_deadlock(
        &self,
        deadlocked: &BTreeSet<TransactionId>,
    ) -> Result<Option<TransactionId>> {
        if deadlocked.is_empty() {
            return Ok(None);
        }
        warn!("Handling deadlock involving transactions: {:?}", deadlocked);

        let start_times: HashMap<TransactionId, DateTime<Utc>> = {
            let transactions = self.transactions.read();
            deadlocked
                .iter()
                .filter_map(|tx| transactions.get(tx).map(|slot| (tx.clone(), slot.started_at)))
                .collect()
        };

        let Some(victim) = self.detector.select_victim(deadlocked, &start_times) else {
            return Ok(None);
        };

        match self.slot(&victim) {
            Ok(slot) => {
                let Ok(mut record) = slot.record.try_lock() else {
                    warn!(
                        "Deadlock victim {} is busy, deferring to the next scan",
                        victim
                    );
                    return Ok(None);
                };
                self.abort_locked(&victim, &mut record, AbortReason::DeadlockVictim)
                    .await?;
            }
            Err(TxGuardError::TransactionNotFound { .. }) => {
                warn!(
                    "Deadlock victim {} is not tracked by the coordinator, clearing graph only",
                    victim
                );
            }
            Err(e) => return Err(e),
        }

        self.detector.perform_recovery(&victim);
        Ok(Some(victim))
    }

    /// Detect and handle deadlocks until a scan comes back clean.
    ///
    /// Each round removes one victim, so the loop is bounded by the number of
    /// transactions in the graph plus the final scan.
    pub async fn resolve_deadlocks(&self) -> Result<DeadlockResolution> {
        let max_scans = self.detector.get_active_transactions().len() + 1;
        let mut resolution = DeadlockResolution::default();

        while resolution.scans < max_scans {
            resolution.scans += 1;
            let deadlocked = self.detector.detect_deadlocks();
            if deadlocked.is_empty() {
                break;
            }
            match self.handle_deadlock(&deadlocked).await? {
                Some(victim) => resolution.victims.push(victim),
                None => break,
            }
        }

        if !resolution.victims.is_empty() {
            info!(
                "Resolved deadlocks with {} victim(s) in {} scan(s)",
                resolution.victims.len(),
                resolution.scans
            );
        }
        Ok(resolution)
    }

    /// Abort transactions past the transaction timeout, and blocked ones past
    /// the deadlock timeout even when no cycle was found.
    ///
    /// Transactions busy in another operation are skipped until the next sweep.
    pub async fn abort_timed_out_transactions(&self) -> Result<Vec<TransactionId>> {
        let slots: Vec<(TransactionId, Arc<TransactionSlot>)> = self
            .transactions
            .read()
            .iter()
            .map(|(tx, slot)| (tx.clone(), slot.clone()))
            .collect();

        let mut aborted = Vec::new();
        for (tx_id, slot) in slots {
            let stuck = self.detector.graph().is_waiting(&tx_id)
                && self
                    .detector
                    .exceeds_deadlock_timeout(&tx_id, slot.started_at);
            if !stuck && !self.is_expired(&tx_id, slot.started_at) {
                continue;
            }

            let Ok(mut record) = slot.record.try_lock() else {
                debug!("Transaction {} busy, skipping timeout sweep", tx_id);
                continue;
            };
            if record.fsm.is_terminal() {
                continue;
            }

            warn!("Transaction {} timed out, aborting", tx_id);
            self.abort_locked(&tx_id, &mut record, AbortReason::Timeout)
                .await?;
            aborted.push(tx_id);
        }

        Ok(aborted)
    }

    /// Try to take `resource` for `tx_id`, recording a wait-for edge to the
    /// current owner if it is taken.
    pub async fn acquire_resource(
        &self,
        tx_id: &TransactionId,
        resource: &ResourceId,
    ) -> Result<AcquireOutcome> {
        let slot = self.slot(tx_id)?;
        let record = slot.record.lock().await;

        let state = record.fsm.current_state();
        if state.is_terminal() || state == TransactionState::Aborting {
            return Err(TxGuardError::TransactionNotActive {
                tx_id: tx_id.to_string(),
                state,
            });
        }

        Ok(self.detector.try_acquire(tx_id, resource))
    }

    pub async fn release_resource(&self, tx_id: &TransactionId, resource: &ResourceId) -> Result<()> {
        let slot = self.slot(tx_id)?;
        let _record = slot.record.lock().await;
        self.detector.record_resource_release(tx_id, resource);
        Ok(())
    }

    pub async fn state(&self, tx_id: &TransactionId) -> Result<TransactionState> {
        let slot = self.slot(tx_id)?;
        let record = slot.record.lock().await;
        Ok(record.fsm.current_state())
    }

    pub async fn outcome(&self, tx_id: &TransactionId) -> Result<TransactionOutcome> {
        let slot = self.slot(tx_id)?;
        let record = slot.record.lock().await;
        Ok(TransactionOutcome {
            tx_id: tx_id.clone(),
            state: record.fsm.current_state(),
            reason: record.abort_reason,
            coordination: record.coordination,
            participants: record.participants.clone(),
            started_at: slot.started_at,
            finished_at: record.finished_at,
        })
    }

    pub fn start_time(&self, tx_id: &TransactionId) -> Option<DateTime<Utc>> {
        self.transactions.read().get(tx_id).map(|slot| slot.started_at)
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.read().len()
    }

    /// Drop committed and aborted transactions. Returns how many were removed.
    pub async fn reap_terminal(&self) -> usize {
        let slots: Vec<(TransactionId, Arc<TransactionSlot>)> = self
            .transactions
            .read()
            .iter()
            .map(|(tx, slot)| (tx.clone(), slot.clone()))
            .collect();

        let mut terminal = Vec::new();
        for (tx_id, slot) in slots {
            if slot.record.lock().await.fsm.is_terminal() {
                terminal.push(tx_id);
            }
        }

        let mut transactions = self.transactions.write();
        for tx_id in &terminal {
            transactions.remove(tx_id);
        }
        debug!("Reaped {} terminal transaction(s)", terminal.len());
        terminal.len()
    }

    pub fn stats(&self) -> CoordinatorStatsSnapshot {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("transactions", &self.transaction_count())
            .field("settings", &self.settings)
            .finish()
    }
}
