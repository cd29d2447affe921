use tracing::info;
use txguard_types::{Result, TransactionId, TransactionState, TxGuardError};

/// Transaction State Machine guarding the commit lifecycle
///
/// Valid transitions:
/// - Active -> Preparing (prepare started)
/// - Preparing -> Prepared (participants agreed)
/// - Prepared -> Committing (commit started)
/// - Committing -> Committed (commit applied)
/// - Active|Preparing|Prepared|Committing -> Aborting (abort requested)
/// - Aborting -> Aborted (abort completed)
///
/// The FSM performs no I/O; the coordinator consults it before acting.
#[derive(Debug, Clone)]
pub struct TransactionFsm {
    current_state: TransactionState,
    tx_id: TransactionId,
}

impl TransactionFsm {
    /// Create a new FSM in Active state
    pub fn new(tx_id: TransactionId) -> Self {
        Self {
            current_state: TransactionState::Active,
            tx_id,
        }
    }

    /// Create FSM from an existing state
    pub fn from_state(tx_id: TransactionId, state: TransactionState) -> Self {
        Self {
            current_state: state,
            tx_id,
        }
    }

    pub fn current_state(&self) -> TransactionState {
        self.current_state
    }

    pub fn tx_id(&self) -> &TransactionId {
        &self.tx_id
    }

    pub fn start_prepare(&mut self) -> Result<()> {
        self.transition(TransactionState::Preparing)
    }

    pub fn mark_prepared(&mut self) -> Result<()> {
        self.transition(TransactionState::Prepared)
    }

    pub fn start_commit(&mut self) -> Result<()> {
        self.transition(TransactionState::Committing)
    }

    pub fn mark_committed(&mut self) -> Result<()> {
        self.transition(TransactionState::Committed)
    }

    pub fn start_abort(&mut self) -> Result<()> {
        self.transition(TransactionState::Aborting)
    }

    pub fn mark_aborted(&mut self) -> Result<()> {
        self.transition(TransactionState::Aborted)
    }

    /// Move to `new_state` if the transition table allows it.
    pub fn transition(&mut self, new_state: TransactionState) -> Result<()> {
        if !self.current_state.can_transition_to(new_state) {
            return Err(TxGuardError::IllegalStateTransition {
                tx_id: self.tx_id.to_string(),
                from: self.current_state,
                to: new_state,
            });
        }

        info!(
            "State transition for tx_id={}: {} -> {}",
            self.tx_id, self.current_state, new_state
        );

        self.current_state = new_state;
        Ok(())
    }

    /// Check if state is terminal (no further transitions allowed)
    pub fn is_terminal(&self) -> bool {
        self.current_state.is_terminal()
    }
}
