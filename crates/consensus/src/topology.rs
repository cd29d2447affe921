//! Node failure classification supplied to the coordination mechanism.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use txguard_types::{FailureType, NodeId, NodeLayer, Result, TxGuardError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProfile {
    pub node_id: NodeId,
    pub failure_type: FailureType,
    pub layer: NodeLayer,
}

impl NodeProfile {
    pub fn new(node_id: impl Into<NodeId>, failure_type: FailureType, layer: NodeLayer) -> Self {
        Self {
            node_id: node_id.into(),
            failure_type,
            layer,
        }
    }
}

/// Source of node profiles. May be static or refreshed by its owner; the
/// coordination mechanism only reads it.
pub trait TopologyProvider: Send + Sync {
    fn profile(&self, node_id: &NodeId) -> Option<NodeProfile>;

    fn failure_type(&self, node_id: &NodeId) -> Option<FailureType> {
        self.profile(node_id).map(|p| p.failure_type)
    }
}

/// Fixed node table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeTopology {
    nodes: BTreeMap<NodeId, NodeProfile>,
}

impl NodeTopology {
    /// Build a topology, rejecting duplicate node ids.
    pub fn new(profiles: impl IntoIterator<Item = NodeProfile>) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        for profile in profiles {
            let node_id = profile.node_id.clone();
            if nodes.insert(node_id.clone(), profile).is_some() {
                return Err(TxGuardError::InvalidArgument(format!(
                    "duplicate node id in topology: {}",
                    node_id
                )));
            }
        }
        Ok(Self { nodes })
    }

    /// Five-node edge/core/cloud deployment.
    pub fn reference() -> Self {
        let nodes = [
            NodeProfile::new("Edge1", FailureType::Crash, NodeLayer::Edge),
            NodeProfile::new("Edge2", FailureType::Omission, NodeLayer::Edge),
            NodeProfile::new("Core1", FailureType::Byzantine, NodeLayer::Core),
            NodeProfile::new("Core2", FailureType::Crash, NodeLayer::Core),
            NodeProfile::new("Cloud1", FailureType::Omission, NodeLayer::Cloud),
        ]
        .into_iter()
        .map(|p| (p.node_id.clone(), p))
        .collect();
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn profiles(&self) -> impl Iterator<Item = &NodeProfile> {
        self.nodes.values()
    }

    pub fn nodes_in_layer(&self, layer: NodeLayer) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|p| p.layer == layer)
            .map(|p| p.node_id.clone())
            .collect()
    }
}

impl TopologyProvider for NodeTopology {
    fn profile(&self, node_id: &NodeId) -> Option<NodeProfile> {
        self.nodes.get(node_id).cloned()
    }
}
