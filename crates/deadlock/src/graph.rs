//! Wait-for graph shared by all transactions.
//!
//! The whole graph sits behind one readers-writer lock: every mutator takes
//! the write side for its full duration, so readers observe either the state
//! before or after a mutation and never a partial edge/ownership update.
//!
//! Ownership is single-writer. Two callers racing `record_resource_acquisition`
//! for the same resource is a caller bug; the last writer wins and the
//! previous owner loses the resource from its held set.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, warn};
use txguard_types::{ResourceId, Result, TransactionId, TxGuardError};

/// Result of an atomic acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The resource was free and now belongs to the caller.
    Granted,
    /// The caller already owned the resource.
    AlreadyHeld,
    /// Another transaction owns the resource; a wait-for edge was recorded.
    Blocked { holder: TransactionId },
}

/// Raised when `record_wait_for` names a holder that disagrees with the
/// recorded owner of the resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnershipConflict {
    pub resource: ResourceId,
    pub recorded_owner: TransactionId,
    pub asserted_holder: TransactionId,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct GraphState {
    /// waiter -> transactions it waits for
    pub(crate) wait_for: BTreeMap<TransactionId, BTreeSet<TransactionId>>,
    held: BTreeMap<TransactionId, BTreeSet<ResourceId>>,
    owner: BTreeMap<ResourceId, TransactionId>,
    /// waiter -> (resource -> holder it waits on for that resource)
    awaited: BTreeMap<TransactionId, BTreeMap<ResourceId, TransactionId>>,
}

impl GraphState {
    /// Bind `resource` to `tx`, moving it out of any previous owner's held set.
    /// Returns the previous owner when it differs from `tx`.
    fn assign_owner(&mut self, resource: &ResourceId, tx: &TransactionId) -> Option<TransactionId> {
        let previous = self.owner.insert(resource.clone(), tx.clone());
        let displaced = previous.filter(|prev| prev != tx);

        if let Some(prev) = &displaced {
            if let Some(resources) = self.held.get_mut(prev) {
                resources.remove(resource);
                if resources.is_empty() {
                    self.held.remove(prev);
                }
            }
        }

        self.held
            .entry(tx.clone())
            .or_default()
            .insert(resource.clone());

        displaced
    }

    fn add_wait(&mut self, waiter: &TransactionId, holder: &TransactionId, resource: &ResourceId) {
        let replaced = self
            .awaited
            .entry(waiter.clone())
            .or_default()
            .insert(resource.clone(), holder.clone());
        self.wait_for
            .entry(waiter.clone())
            .or_default()
            .insert(holder.clone());

        // Waiting on a new holder for the same resource drops the old edge
        // unless something else is still awaited from the old holder.
        if let Some(old) = replaced.filter(|old| old != holder) {
            let still_waiting = self
                .awaited
                .get(waiter)
                .map_or(false, |pending| pending.values().any(|h| *h == old));
            if !still_waiting {
                self.remove_edge(waiter, &old);
            }
        }
    }

    /// Drop the awaited record for `(waiter, resource)` and prune the edge to
    /// its holder once nothing else is awaited from that holder.
    fn clear_awaited(&mut self, waiter: &TransactionId, resource: &ResourceId) {
        let Some(pending) = self.awaited.get_mut(waiter) else {
            return;
        };
        let Some(holder) = pending.remove(resource) else {
            return;
        };
        let still_waiting = pending.values().any(|h| *h == holder);
        if pending.is_empty() {
            self.awaited.remove(waiter);
        }
        if !still_waiting {
            self.remove_edge(waiter, &holder);
        }
    }

    fn remove_edge(&mut self, waiter: &TransactionId, holder: &TransactionId) {
        if let Some(holders) = self.wait_for.get_mut(waiter) {
            holders.remove(holder);
            if holders.is_empty() {
                self.wait_for.remove(waiter);
            }
        }
    }

    fn contains(&self, tx: &TransactionId) -> bool {
        self.wait_for.contains_key(tx) || self.held.contains_key(tx) || self.awaited.contains_key(tx)
    }

    fn check_consistency(&self) -> std::result::Result<(), String> {
        for (resource, owner) in &self.owner {
            let holders: Vec<_> = self
                .held
                .iter()
                .filter(|(_, resources)| resources.contains(resource))
                .map(|(tx, _)| tx)
                .collect();
            if holders != vec![owner] {
                return Err(format!(
                    "resource {} owned by {} but held by {:?}",
                    resource, owner, holders
                ));
            }
        }
        for (tx, resources) in &self.held {
            for resource in resources {
                if self.owner.get(resource) != Some(tx) {
                    return Err(format!("{} holds {} without owning it", tx, resource));
                }
            }
        }
        for (waiter, pending) in &self.awaited {
            for holder in pending.values() {
                let has_edge = self
                    .wait_for
                    .get(waiter)
                    .map_or(false, |holders| holders.contains(holder));
                if !has_edge {
                    return Err(format!("{} awaits {} without an edge", waiter, holder));
                }
            }
        }
        for (waiter, holders) in &self.wait_for {
            if holders.is_empty() {
                return Err(format!("{} has an empty edge set", waiter));
            }
            if holders.contains(waiter) {
                return Err(format!("{} waits for itself", waiter));
            }
            for holder in holders {
                let awaited = self
                    .awaited
                    .get(waiter)
                    .map_or(false, |pending| pending.values().any(|h| h == holder));
                if !awaited {
                    return Err(format!("edge {} -> {} has no awaited resource", waiter, holder));
                }
            }
        }
        Ok(())
    }
}

/// Directed wait-for graph plus resource ownership.
pub struct WaitForGraph {
    state: RwLock<GraphState>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
        }
    }

    /// Record that `tx` now owns `resource`. Idempotent for the same pair.
    ///
    /// If `tx` had been waiting for `resource`, that wait is cleared.
    pub fn record_resource_acquisition(&self, tx: &TransactionId, resource: &ResourceId) {
        let mut state = self.state.write();
        if let Some(previous) = state.assign_owner(resource, tx) {
            debug!(
                "Resource {} reassigned from {} to {} (last writer wins)",
                resource, previous, tx
            );
        }
        state.clear_awaited(tx, resource);
        debug!("Transaction {} acquired resource {}", tx, resource);
    }

    /// Record that `waiter` is blocked on `resource`, which the caller asserts
    /// is held by `holder`.
    ///
    /// The holder is bound as the resource owner. When a different owner was
    /// recorded before, the mismatch is returned rather than reconciled.
    pub fn record_wait_for(
        &self,
        waiter: &TransactionId,
        holder: &TransactionId,
        resource: &ResourceId,
    ) -> Result<Option<OwnershipConflict>> {
        if waiter == holder {
            return Err(TxGuardError::SelfWait {
                tx_id: waiter.to_string(),
            });
        }

        let mut state = self.state.write();
        state.add_wait(waiter, holder, resource);
        let conflict = state
            .assign_owner(resource, holder)
            .map(|recorded_owner| OwnershipConflict {
                resource: resource.clone(),
                recorded_owner,
                asserted_holder: holder.clone(),
            });

        match &conflict {
            Some(c) => warn!(
                "Ownership conflict on {}: recorded owner {} but {} asserted as holder",
                c.resource, c.recorded_owner, c.asserted_holder
            ),
            None => debug!(
                "Transaction {} waiting for {} (resource: {})",
                waiter, holder, resource
            ),
        }

        Ok(conflict)
    }

    /// Release `resource` held by `tx`. No-op if `tx` does not hold it.
    ///
    /// Waits recorded against `tx` for this resource are dropped as well.
    pub fn record_resource_release(&self, tx: &TransactionId, resource: &ResourceId) {
        let mut state = self.state.write();

        let held = state
            .held
            .get_mut(tx)
            .map_or(false, |resources| resources.remove(resource));
        if !held {
            return;
        }
        if state.held.get(tx).map_or(false, |r| r.is_empty()) {
            state.held.remove(tx);
        }
        if state.owner.get(resource) == Some(tx) {
            state.owner.remove(resource);
        }

        let waiters: Vec<TransactionId> = state
            .awaited
            .iter()
            .filter(|(_, pending)| pending.get(resource) == Some(tx))
            .map(|(waiter, _)| waiter.clone())
            .collect();
        for waiter in waiters {
            state.clear_awaited(&waiter, resource);
        }

        debug!("Transaction {} released resource {}", tx, resource);
    }

    /// Atomically grant `resource` to `tx` if it is free, otherwise record a
    /// wait-for edge to its current owner.
    pub fn try_acquire(&self, tx: &TransactionId, resource: &ResourceId) -> AcquireOutcome {
        let mut state = self.state.write();
        match state.owner.get(resource).cloned() {
            None => {
                state.assign_owner(resource, tx);
                state.clear_awaited(tx, resource);
                debug!("Transaction {} acquired resource {}", tx, resource);
                AcquireOutcome::Granted
            }
            Some(owner) if owner == *tx => AcquireOutcome::AlreadyHeld,
            Some(owner) => {
                state.add_wait(tx, &owner, resource);
                debug!(
                    "Transaction {} blocked on {} held by {}",
                    tx, resource, owner
                );
                AcquireOutcome::Blocked { holder: owner }
            }
        }
    }

    /// Remove every trace of `tx`: outgoing edges, incoming edges, awaited
    /// resources and held resources. Returns whether anything was removed.
    pub fn remove_transaction(&self, tx: &TransactionId) -> bool {
        let mut state = self.state.write();
        if !state.contains(tx) && !state.wait_for.values().any(|h| h.contains(tx)) {
            return false;
        }

        state.wait_for.remove(tx);
        state.awaited.remove(tx);

        state.wait_for.retain(|_, holders| {
            holders.remove(tx);
            !holders.is_empty()
        });
        state.awaited.retain(|_, pending| {
            pending.retain(|_, holder| holder != tx);
            !pending.is_empty()
        });

        if let Some(resources) = state.held.remove(tx) {
            for resource in resources {
                if state.owner.get(&resource) == Some(tx) {
                    state.owner.remove(&resource);
                }
            }
        }

        debug!("Removed transaction {} from wait-for graph", tx);
        true
    }

    /// Every transaction with a footprint in the graph.
    pub fn active_transactions(&self) -> BTreeSet<TransactionId> {
        let state = self.state.read();
        state
            .wait_for
            .keys()
            .chain(state.held.keys())
            .chain(state.awaited.keys())
            .cloned()
            .collect()
    }

    pub fn waiting_for(&self, tx: &TransactionId) -> BTreeSet<TransactionId> {
        self.state.read().wait_for.get(tx).cloned().unwrap_or_default()
    }

    pub fn held_resources(&self, tx: &TransactionId) -> BTreeSet<ResourceId> {
        self.state.read().held.get(tx).cloned().unwrap_or_default()
    }

    pub fn awaited_resources(&self, tx: &TransactionId) -> BTreeMap<ResourceId, TransactionId> {
        self.state.read().awaited.get(tx).cloned().unwrap_or_default()
    }

    pub fn owner_of(&self, resource: &ResourceId) -> Option<TransactionId> {
        self.state.read().owner.get(resource).cloned()
    }

    pub fn is_waiting(&self, tx: &TransactionId) -> bool {
        self.state.read().wait_for.contains_key(tx)
    }

    pub fn edge_count(&self) -> usize {
        self.state.read().wait_for.values().map(|s| s.len()).sum()
    }

    pub fn resource_count(&self) -> usize {
        self.state.read().owner.len()
    }

    /// Verify the ownership and edge invariants, describing the first violation.
    pub fn check_consistency(&self) -> std::result::Result<(), String> {
        self.state.read().check_consistency()
    }

    /// Run `f` against the graph while holding the shared lock.
    pub(crate) fn with_read<R>(&self, f: impl FnOnce(&GraphState) -> R) -> R {
        let state = self.state.read();
        f(&state)
    }
}

impl Default for WaitForGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WaitForGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitForGraph")
            .field("edge_count", &self.edge_count())
            .field("resource_count", &self.resource_count())
            .finish()
    }
}
