//! Cycle detection and victim selection over the wait-for graph.

use crate::graph::{AcquireOutcome, GraphState, OwnershipConflict, WaitForGraph};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;
use tracing::{debug, info, warn};
use txguard_types::{ResourceId, Result, TransactionId};

/// Default age after which a transaction is considered stuck.
pub const DEFAULT_DEADLOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Counters maintained by the detector.
#[derive(Debug, Default)]
pub struct DeadlockStats {
    /// Number of detection scans.
    pub scans: AtomicU64,
    /// Number of scans that found at least one deadlocked transaction.
    pub deadlocks_found: AtomicU64,
    /// Number of victims selected.
    pub victims_selected: AtomicU64,
    /// Number of victims scrubbed from the graph.
    pub recoveries: AtomicU64,
    /// Number of `record_wait_for` calls whose holder disagreed with the owner.
    pub ownership_conflicts: AtomicU64,
}

impl DeadlockStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DeadlockStatsSnapshot {
        DeadlockStatsSnapshot {
            scans: self.scans.load(AtomicOrdering::Relaxed),
            deadlocks_found: self.deadlocks_found.load(AtomicOrdering::Relaxed),
            victims_selected: self.victims_selected.load(AtomicOrdering::Relaxed),
            recoveries: self.recoveries.load(AtomicOrdering::Relaxed),
            ownership_conflicts: self.ownership_conflicts.load(AtomicOrdering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeadlockStatsSnapshot {
    pub scans: u64,
    pub deadlocks_found: u64,
    pub victims_selected: u64,
    pub recoveries: u64,
    pub ownership_conflicts: u64,
}

/// Wait-for graph owner with cycle detection and victim policy.
pub struct DeadlockDetector {
    graph: WaitForGraph,
    deadlock_timeout: Duration,
    stats: DeadlockStats,
}

impl DeadlockDetector {
    pub fn new(deadlock_timeout: Duration) -> Self {
        Self {
            graph: WaitForGraph::new(),
            deadlock_timeout,
            stats: DeadlockStats::new(),
        }
    }

    pub fn graph(&self) -> &WaitForGraph {
        &self.graph
    }

    pub fn deadlock_timeout(&self) -> Duration {
        self.deadlock_timeout
    }

    pub fn record_resource_acquisition(&self, tx: &TransactionId, resource: &ResourceId) {
        self.graph.record_resource_acquisition(tx, resource);
    }

    pub fn record_wait_for(
        &self,
        waiter: &TransactionId,
        holder: &TransactionId,
        resource: &ResourceId,
    ) -> Result<Option<OwnershipConflict>> {
        let conflict = self.graph.record_wait_for(waiter, holder, resource)?;
        if conflict.is_some() {
            self.stats
                .ownership_conflicts
                .fetch_add(1, AtomicOrdering::Relaxed);
        }
        Ok(conflict)
    }

    pub fn record_resource_release(&self, tx: &TransactionId, resource: &ResourceId) {
        self.graph.record_resource_release(tx, resource);
    }

    pub fn try_acquire(&self, tx: &TransactionId, resource: &ResourceId) -> AcquireOutcome {
        self.graph.try_acquire(tx, resource)
    }

    pub fn remove_transaction(&self, tx: &TransactionId) -> bool {
        self.graph.remove_transaction(tx)
    }

    pub fn get_active_transactions(&self) -> BTreeSet<TransactionId> {
        self.graph.active_transactions()
    }

    pub fn get_waiting_for(&self, tx: &TransactionId) -> BTreeSet<TransactionId> {
        self.graph.waiting_for(tx)
    }

    pub fn get_held_resources(&self, tx: &TransactionId) -> BTreeSet<ResourceId> {
        self.graph.held_resources(tx)
    }

    /// Return the transactions on a wait-for cycle, plus those on the DFS path
    /// that led into it. Empty when the graph is acyclic.
    pub fn detect_deadlocks(&self) -> BTreeSet<TransactionId> {
        self.stats.scans.fetch_add(1, AtomicOrdering::Relaxed);

        let deadlocked = self.graph.with_read(find_deadlocked);

        if deadlocked.is_empty() {
            debug!("No deadlocks detected");
        } else {
            self.stats
                .deadlocks_found
                .fetch_add(1, AtomicOrdering::Relaxed);
            warn!("Deadlock detected among transactions: {:?}", deadlocked);
        }
        deadlocked
    }

    /// Pick the youngest transaction of `deadlocked`.
    ///
    /// Ordering is `(start_time, id)`, so equal start times fall back to the
    /// greatest id. Transactions without a start time rank as oldest.
    pub fn select_victim(
        &self,
        deadlocked: &BTreeSet<TransactionId>,
        start_times: &HashMap<TransactionId, DateTime<Utc>>,
    ) -> Option<TransactionId> {
        let victim = deadlocked
            .iter()
            .max_by(|a, b| {
                let ka = (start_times.get(*a), *a);
                let kb = (start_times.get(*b), *b);
                ka.cmp(&kb)
            })
            .cloned();

        if let Some(victim) = &victim {
            self.stats
                .victims_selected
                .fetch_add(1, AtomicOrdering::Relaxed);
            info!("Selected victim transaction {} for deadlock resolution", victim);
        }
        victim
    }

    /// True when `tx` has been running for strictly longer than `threshold`.
    pub fn is_timed_out(
        &self,
        tx: &TransactionId,
        start_time: DateTime<Utc>,
        threshold: Duration,
    ) -> bool {
        let elapsed = Utc::now().signed_duration_since(start_time);
        // A start time in the future yields a negative duration, never a timeout.
        let timed_out = elapsed
            .to_std()
            .map_or(false, |elapsed| elapsed > threshold);
        if timed_out {
            debug!("Transaction {} exceeded {:?}", tx, threshold);
        }
        timed_out
    }

    pub fn exceeds_deadlock_timeout(&self, tx: &TransactionId, start_time: DateTime<Utc>) -> bool {
        self.is_timed_out(tx, start_time, self.deadlock_timeout)
    }

    /// Scrub the victim from the graph. State changes are the caller's job.
    pub fn perform_recovery(&self, victim: &TransactionId) {
        self.graph.remove_transaction(victim);
        self.stats.recoveries.fetch_add(1, AtomicOrdering::Relaxed);
        info!("Performed deadlock recovery for transaction {}", victim);
    }

    pub fn stats(&self) -> DeadlockStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Default for DeadlockDetector {
    fn default() -> Self {
        Self::new(DEFAULT_DEADLOCK_TIMEOUT)
    }
}

impl std::fmt::Debug for DeadlockDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlockDetector")
            .field("graph", &self.graph)
            .field("deadlock_timeout", &self.deadlock_timeout)
            .finish()
    }
}

fn find_deadlocked(state: &GraphState) -> BTreeSet<TransactionId> {
    find_cycle_members(&state.wait_for)
}

/// Iterative DFS. Roots are visited in id order; on a back edge every node on
/// the current path is marked and the scan carries on.
pub(crate) fn find_cycle_members(
    edges: &BTreeMap<TransactionId, BTreeSet<TransactionId>>,
) -> BTreeSet<TransactionId> {
    let empty = BTreeSet::new();
    let mut deadlocked = BTreeSet::new();
    let mut visited: HashSet<&TransactionId> = HashSet::new();
    let mut on_path: HashSet<&TransactionId> = HashSet::new();

    for root in edges.keys() {
        if !visited.insert(root) {
            continue;
        }
        on_path.insert(root);
        let mut stack = vec![(root, edges.get(root).unwrap_or(&empty).iter())];

        loop {
            let next = match stack.last_mut() {
                Some((_, neighbours)) => neighbours.next(),
                None => break,
            };

            match next {
                Some(next) if on_path.contains(next) => {
                    deadlocked.extend(stack.iter().map(|(node, _)| (*node).clone()));
                }
                Some(next) => {
                    if visited.insert(next) {
                        on_path.insert(next);
                        stack.push((next, edges.get(next).unwrap_or(&empty).iter()));
                    }
                }
                None => {
                    if let Some((node, _)) = stack.pop() {
                        on_path.remove(node);
                    }
                }
            }
        }
    }

    deadlocked
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn tx(id: &str) -> TransactionId {
        TransactionId::from(id)
    }

    fn res(id: &str) -> ResourceId {
        ResourceId::from(id)
    }

    fn build_cycle(detector: &DeadlockDetector) {
        detector.record_resource_acquisition(&tx("T1"), &res("R1"));
        detector.record_resource_acquisition(&tx("T2"), &res("R2"));
        detector.record_resource_acquisition(&tx("T3"), &res("R3"));
        detector.record_wait_for(&tx("T1"), &tx("T2"), &res("R2")).unwrap();
        detector.record_wait_for(&tx("T2"), &tx("T3"), &res("R3")).unwrap();
        detector.record_wait_for(&tx("T3"), &tx("T1"), &res("R1")).unwrap();
    }

    #[test]
    fn test_three_way_cycle_detected() {
        let detector = DeadlockDetector::default();
        build_cycle(&detector);

        let deadlocked = detector.detect_deadlocks();
        assert_eq!(deadlocked, BTreeSet::from([tx("T1"), tx("T2"), tx("T3")]));
        assert_eq!(detector.stats().deadlocks_found, 1);
    }

    #[test]
    fn test_chain_without_cycle() {
        let detector = DeadlockDetector::default();
        detector.record_wait_for(&tx("T1"), &tx("T2"), &res("R2")).unwrap();
        detector.record_wait_for(&tx("T2"), &tx("T3"), &res("R3")).unwrap();

        assert!(detector.detect_deadlocks().is_empty());
        assert_eq!(detector.stats().scans, 1);
        assert_eq!(detector.stats().deadlocks_found, 0);
    }

    #[test]
    fn test_tail_into_cycle_marked() {
        let detector = DeadlockDetector::default();
        detector.record_wait_for(&tx("A"), &tx("B"), &res("R1")).unwrap();
        detector.record_wait_for(&tx("B"), &tx("C"), &res("R2")).unwrap();
        detector.record_wait_for(&tx("C"), &tx("B"), &res("R3")).unwrap();

        // A is on the DFS path leading into the B/C cycle.
        let deadlocked = detector.detect_deadlocks();
        assert_eq!(deadlocked, BTreeSet::from([tx("A"), tx("B"), tx("C")]));
    }

    #[test]
    fn test_tail_explored_after_cycle_not_marked() {
        let detector = DeadlockDetector::default();
        detector.record_wait_for(&tx("B"), &tx("C"), &res("R1")).unwrap();
        detector.record_wait_for(&tx("C"), &tx("B"), &res("R2")).unwrap();
        detector.record_wait_for(&tx("D"), &tx("B"), &res("R3")).unwrap();

        let deadlocked = detector.detect_deadlocks();
        assert_eq!(deadlocked, BTreeSet::from([tx("B"), tx("C")]));
    }

    #[test]
    fn test_independent_cycles_in_one_scan() {
        let detector = DeadlockDetector::default();
        detector.record_wait_for(&tx("T1"), &tx("T2"), &res("R1")).unwrap();
        detector.record_wait_for(&tx("T2"), &tx("T1"), &res("R2")).unwrap();
        detector.record_wait_for(&tx("T3"), &tx("T4"), &res("R3")).unwrap();
        detector.record_wait_for(&tx("T4"), &tx("T3"), &res("R4")).unwrap();

        assert_eq!(detector.detect_deadlocks().len(), 4);
    }

    #[test]
    fn test_victim_is_youngest() {
        let detector = DeadlockDetector::default();
        let deadlocked = BTreeSet::from([tx("T1"), tx("T2"), tx("T3")]);
        let start_times = HashMap::from([
            (tx("T1"), Utc.timestamp_opt(1_000, 0).unwrap()),
            (tx("T2"), Utc.timestamp_opt(2_000, 0).unwrap()),
            (tx("T3"), Utc.timestamp_opt(3_000, 0).unwrap()),
        ]);

        assert_eq!(detector.select_victim(&deadlocked, &start_times), Some(tx("T3")));
        assert_eq!(detector.stats().victims_selected, 1);
    }

    #[test]
    fn test_victim_tie_broken_by_id() {
        let detector = DeadlockDetector::default();
        let same = Utc.timestamp_opt(5_000, 0).unwrap();
        let deadlocked = BTreeSet::from([tx("A"), tx("B")]);
        let start_times = HashMap::from([(tx("A"), same), (tx("B"), same)]);

        assert_eq!(detector.select_victim(&deadlocked, &start_times), Some(tx("B")));
    }

    #[test]
    fn test_victim_unknown_start_time_ranks_oldest() {
        let detector = DeadlockDetector::default();
        let deadlocked = BTreeSet::from([tx("Z"), tx("A")]);
        let start_times = HashMap::from([(tx("A"), Utc.timestamp_opt(1, 0).unwrap())]);

        assert_eq!(detector.select_victim(&deadlocked, &start_times), Some(tx("A")));
    }

    #[test]
    fn test_victim_empty_set() {
        let detector = DeadlockDetector::default();
        assert_eq!(detector.select_victim(&BTreeSet::new(), &HashMap::new()), None);
        assert_eq!(detector.stats().victims_selected, 0);
    }

    #[test]
    fn test_is_timed_out_strict() {
        let detector = DeadlockDetector::default();
        let started = Utc::now() - chrono::Duration::seconds(10);

        assert!(detector.is_timed_out(&tx("T1"), started, Duration::from_secs(5)));
        assert!(!detector.is_timed_out(&tx("T1"), started, Duration::from_secs(60)));
        assert!(!detector.is_timed_out(
            &tx("T1"),
            Utc::now() + chrono::Duration::seconds(60),
            Duration::ZERO
        ));
    }

    #[test]
    fn test_recovery_breaks_cycle() {
        let detector = DeadlockDetector::default();
        build_cycle(&detector);

        detector.perform_recovery(&tx("T3"));

        assert!(detector.detect_deadlocks().is_empty());
        assert!(detector.get_held_resources(&tx("T3")).is_empty());
        assert_eq!(detector.graph().owner_of(&res("R3")), None);
        assert_eq!(detector.stats().recoveries, 1);
    }

    #[test]
    fn test_ownership_conflict_counted() {
        let detector = DeadlockDetector::default();
        detector.record_resource_acquisition(&tx("T1"), &res("R1"));
        let conflict = detector.record_wait_for(&tx("T2"), &tx("T3"), &res("R1")).unwrap();

        assert!(conflict.is_some());
        assert_eq!(detector.stats().ownership_conflicts, 1);
    }

    fn edges_strategy() -> impl Strategy<Value = Vec<(u8, u8)>> {
        prop::collection::vec((0u8..8, 0u8..8), 0..24)
    }

    fn to_edges(pairs: &[(u8, u8)]) -> BTreeMap<TransactionId, BTreeSet<TransactionId>> {
        let mut edges: BTreeMap<TransactionId, BTreeSet<TransactionId>> = BTreeMap::new();
        for (a, b) in pairs.iter().filter(|(a, b)| a != b) {
            edges
                .entry(tx(&format!("T{}", a)))
                .or_default()
                .insert(tx(&format!("T{}", b)));
        }
        edges
    }

    fn reachable<'a>(
        edges: &'a BTreeMap<TransactionId, BTreeSet<TransactionId>>,
        node: &'a TransactionId,
    ) -> HashSet<&'a TransactionId> {
        let mut seen = HashSet::new();
        let mut frontier = vec![node];
        while let Some(next) = frontier.pop() {
            if seen.insert(next) {
                if let Some(out) = edges.get(next) {
                    frontier.extend(out.iter());
                }
            }
        }
        seen
    }

    /// Reference check: a node is on a cycle iff it can reach itself.
    fn on_some_cycle(
        edges: &BTreeMap<TransactionId, BTreeSet<TransactionId>>,
        node: &TransactionId,
    ) -> bool {
        let mut seen = HashSet::new();
        let mut frontier: Vec<&TransactionId> =
            edges.get(node).map(|s| s.iter().collect()).unwrap_or_default();
        while let Some(next) = frontier.pop() {
            if next == node {
                return true;
            }
            if seen.insert(next) {
                if let Some(out) = edges.get(next) {
                    frontier.extend(out.iter());
                }
            }
        }
        false
    }

    proptest! {
        #[test]
        fn prop_detection_is_sound(pairs in edges_strategy()) {
            let edges = to_edges(&pairs);
            let found = find_cycle_members(&edges);
            // Members are cycle nodes or nodes whose DFS path leads into one.
            for member in &found {
                let leads_to_cycle = reachable(&edges, member)
                    .into_iter()
                    .any(|n| on_some_cycle(&edges, n));
                prop_assert!(leads_to_cycle, "{} cannot reach a cycle", member);
            }
        }

        #[test]
        fn prop_detection_is_complete(pairs in edges_strategy()) {
            let edges = to_edges(&pairs);
            let found = find_cycle_members(&edges);
            let cycle_nodes: Vec<_> = edges.keys().filter(|n| on_some_cycle(&edges, n)).collect();
            prop_assert_eq!(!cycle_nodes.is_empty(), !found.is_empty());
            if !cycle_nodes.is_empty() {
                prop_assert!(cycle_nodes.iter().any(|n| found.contains(*n)));
            }
        }

        #[test]
        fn prop_graph_stays_consistent(ops in prop::collection::vec((0u8..4, 0u8..5, 0u8..5, 0u8..4), 0..40)) {
            let detector = DeadlockDetector::default();
            for (op, a, b, r) in ops {
                let (a, b, r) = (tx(&format!("T{}", a)), tx(&format!("T{}", b)), res(&format!("R{}", r)));
                match op {
                    0 => { detector.try_acquire(&a, &r); }
                    1 => { let _ = detector.record_wait_for(&a, &b, &r); }
                    2 => detector.record_resource_release(&a, &r),
                    _ => { detector.remove_transaction(&a); }
                }
                prop_assert!(detector.graph().check_consistency().is_ok());
            }
        }
    }
}
