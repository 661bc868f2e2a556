use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use crate::message::NodeId;

/// This node's current neighbor list. Replaced wholesale on every update.
///
/// Its lock is separate from the message store's, so a topology change never
/// waits on a `read` snapshot and vice versa. Every dissemination copies the
/// list once at its start; later updates only affect later broadcasts.
#[derive(Default)]
pub struct TopologyManager {
    neighbors: RwLock<Vec<NodeId>>,
}

impl TopologyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the neighbor list. No merge with the previous list.
    pub fn set_neighbors(&self, neighbors: Vec<NodeId>) {
        *self.neighbors.write().unwrap_or_else(PoisonError::into_inner) = neighbors;
    }

    /// Returns a copy of the current neighbor list.
    pub fn neighbors(&self) -> Vec<NodeId> {
        self.neighbors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Picks `node_id`'s entry out of a cluster-wide topology. Missing entries mean no neighbors.
pub fn neighbors_for(topology: &HashMap<NodeId, Vec<NodeId>>, node_id: &str) -> Vec<NodeId> {
    topology.get(node_id).cloned().unwrap_or_default()
}
