//! Failure-aware coordination across the edge/core/cloud topology.
//!
//! The protocol for an operation is chosen by the most restrictive failure
//! type among its participants: Byzantine, then omission, then crash.

use crate::executor::{ImmediateAgreement, RoundExecutor};
use crate::protocol::{ConsensusProtocol, CoordinationResult, ProtocolRegistry};
use crate::strategy::{CloudStrategy, CoordinationStrategy, CoreStrategy, EdgeStrategy};
use crate::topology::TopologyProvider;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};
use txguard_types::{DistributedOperation, FailureType, NodeId, NodeLayer, Result, TxGuardError};

pub struct CoordinationMechanism {
    registry: ProtocolRegistry,
    topology: Arc<dyn TopologyProvider>,
    strategies: BTreeMap<NodeLayer, Arc<dyn CoordinationStrategy>>,
    executor: Arc<dyn RoundExecutor>,
}

impl CoordinationMechanism {
    pub fn new(registry: ProtocolRegistry, topology: Arc<dyn TopologyProvider>) -> Self {
        let strategies: Vec<Arc<dyn CoordinationStrategy>> = vec![
            Arc::new(EdgeStrategy),
            Arc::new(CoreStrategy),
            Arc::new(CloudStrategy),
        ];
        Self {
            registry,
            topology,
            strategies: strategies.into_iter().map(|s| (s.layer(), s)).collect(),
            executor: Arc::new(ImmediateAgreement),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn RoundExecutor>) -> Self {
        self.executor = executor;
        self
    }

    /// Replace the strategy registered for the strategy's own layer.
    pub fn with_strategy(mut self, strategy: Arc<dyn CoordinationStrategy>) -> Self {
        self.strategies.insert(strategy.layer(), strategy);
        self
    }

    pub fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    pub fn strategy(&self, layer: NodeLayer) -> Option<&dyn CoordinationStrategy> {
        self.strategies.get(&layer).map(|s| s.as_ref())
    }

    /// Most restrictive failure type among `participants`.
    ///
    /// Fails on an empty set or a node the topology does not know.
    pub fn resolve_failure_type(&self, participants: &[NodeId]) -> Result<FailureType> {
        if participants.is_empty() {
            return Err(TxGuardError::EmptyParticipants);
        }

        let mut has_omission = false;
        for node in participants {
            let failure_type =
                self.topology
                    .failure_type(node)
                    .ok_or_else(|| TxGuardError::UnknownNode {
                        node_id: node.to_string(),
                    })?;
            match failure_type {
                FailureType::Byzantine => return Ok(FailureType::Byzantine),
                FailureType::Omission => has_omission = true,
                FailureType::Crash | FailureType::NetworkPartition => {}
            }
        }

        if has_omission {
            Ok(FailureType::Omission)
        } else {
            Ok(FailureType::Crash)
        }
    }

    pub fn resolve_protocol(&self, participants: &[NodeId]) -> Result<&ConsensusProtocol> {
        let failure_type = self.resolve_failure_type(participants)?;
        Ok(self.registry.for_failure_type(failure_type))
    }

    /// Choose the protocol for `participants`, run the layer hooks and
    /// coordinate `operation`.
    ///
    /// Duplicate participants count once. Precondition failures are errors;
    /// every protocol outcome, including quorum shortfall, is a result.
    pub async fn coordinate_operation(
        &self,
        operation: &DistributedOperation,
        participants: &[NodeId],
    ) -> Result<CoordinationResult> {
        let participants: Vec<NodeId> = participants
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let protocol = self.resolve_protocol(&participants)?;
        info!(
            "Coordinating operation {} ({}) with {} among {} participants",
            operation.operation_id,
            operation.operation_type,
            protocol.kind(),
            participants.len()
        );

        self.run_layer_hooks(&participants);

        Ok(protocol
            .coordinate(operation, &participants, self.executor.as_ref())
            .await)
    }

    fn run_layer_hooks(&self, participants: &[NodeId]) {
        let mut by_layer: BTreeMap<NodeLayer, Vec<NodeId>> = BTreeMap::new();
        for node in participants {
            if let Some(profile) = self.topology.profile(node) {
                by_layer.entry(profile.layer).or_default().push(node.clone());
            }
        }

        for (layer, nodes) in &by_layer {
            if let Some(strategy) = self.strategies.get(layer) {
                strategy.coordinate_within_layer(nodes);
            }
        }

        let layers: Vec<NodeLayer> = by_layer.keys().copied().collect();
        for pair in layers.windows(2) {
            let (source, target) = (pair[0], pair[1]);
            match self.strategies.get(&source) {
                Some(strategy) => strategy.coordinate_across_layers(source, target),
                None => debug!("No strategy for layer {}", source),
            }
        }
    }
}

impl std::fmt::Debug for CoordinationMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationMechanism")
            .field("registry", &self.registry)
            .field("layers", &self.strategies.keys().collect::<Vec<_>>())
            .finish()
    }
}
