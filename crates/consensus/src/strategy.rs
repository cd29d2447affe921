//! Per-layer coordination hooks.
//!
//! These run alongside consensus and never gate it.

use tracing::debug;
use txguard_types::{NodeId, NodeLayer};

pub trait CoordinationStrategy: Send + Sync {
    fn layer(&self) -> NodeLayer;

    /// Coordination among participants of this layer.
    fn coordinate_within_layer(&self, nodes: &[NodeId]);

    /// Handoff from this layer to `target`.
    fn coordinate_across_layers(&self, source: NodeLayer, target: NodeLayer);
}

/// Load balancing and failover between edge nodes; forwards requests to core.
#[derive(Debug, Default, Clone, Copy)]
pub struct EdgeStrategy;

impl CoordinationStrategy for EdgeStrategy {
    fn layer(&self) -> NodeLayer {
        NodeLayer::Edge
    }

    fn coordinate_within_layer(&self, nodes: &[NodeId]) {
        debug!("Edge load balancing across {:?}", nodes);
    }

    fn coordinate_across_layers(&self, source: NodeLayer, target: NodeLayer) {
        debug!("Forwarding requests {} -> {}", source, target);
    }
}

/// Transaction management between core nodes; delivers analytics to cloud.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoreStrategy;

impl CoordinationStrategy for CoreStrategy {
    fn layer(&self) -> NodeLayer {
        NodeLayer::Core
    }

    fn coordinate_within_layer(&self, nodes: &[NodeId]) {
        debug!("Core transaction coordination across {:?}", nodes);
    }

    fn coordinate_across_layers(&self, source: NodeLayer, target: NodeLayer) {
        debug!("Shipping analytics {} -> {}", source, target);
    }
}

/// Distributed analytics between cloud nodes; returns results to core.
#[derive(Debug, Default, Clone, Copy)]
pub struct CloudStrategy;

impl CoordinationStrategy for CloudStrategy {
    fn layer(&self) -> NodeLayer {
        NodeLayer::Cloud
    }

    fn coordinate_within_layer(&self, nodes: &[NodeId]) {
        debug!("Cloud analytics coordination across {:?}", nodes);
    }

    fn coordinate_across_layers(&self, source: NodeLayer, target: NodeLayer) {
        debug!("Delivering results {} -> {}", source, target);
    }
}
