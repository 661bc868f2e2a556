use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::gossip::DisseminationError;
use crate::message::NodeId;

/// Acknowledgment bookkeeping for one dissemination.
///
/// The retry loop reads it at the start of every round; RPC callbacks write
/// to it whenever a neighbor answers. It also records the first failure any
/// callback reports so the retry loop can abort the whole operation.
pub struct AckSet {
    neighbors: Vec<NodeId>,
    state: Mutex<AckState>,
}

struct AckState {
    acked: HashMap<NodeId, bool>,
    failure: Option<DisseminationError>,
}

impl AckSet {
    pub fn new(neighbors: Vec<NodeId>) -> Self {
        let acked = neighbors.iter().map(|n| (n.clone(), false)).collect();
        Self {
            neighbors,
            state: Mutex::new(AckState {
                acked,
                failure: None,
            }),
        }
    }

    pub fn neighbors(&self) -> &[NodeId] {
        &self.neighbors
    }

    /// Neighbors that have not acknowledged yet, in neighbor-list order.
    pub fn pending(&self) -> Vec<NodeId> {
        let state = self.state();
        self.neighbors
            .iter()
            .filter(|n| !state.acked.get(*n).copied().unwrap_or(true))
            .cloned()
            .collect()
    }

    /// Marks `neighbor` as acknowledged. Returns `false` if it already was, or is unknown.
    pub fn mark_acked(&self, neighbor: &str) -> bool {
        match self.state().acked.get_mut(neighbor) {
            Some(acked) if !*acked => {
                *acked = true;
                true
            }
            _ => false,
        }
    }

    /// Records a failure. The first one wins; later ones are dropped.
    pub fn fail(&self, err: DisseminationError) {
        self.state().failure.get_or_insert(err);
    }

    pub fn failure(&self) -> Option<DisseminationError> {
        self.state().failure.clone()
    }

    fn state(&self) -> MutexGuard<'_, AckState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
