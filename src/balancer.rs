//! Smooth weighted round-robin node selection.
//!
//! Each selection adds every node's static weight to its accumulator,
//! picks the node with the largest accumulator (first one wins a tie) and
//! charges it the total weight of the set. Over `total` consecutive
//! selections on a static set every node is picked exactly `weight` times,
//! and picks of a heavy node are spread out instead of clustered.
//!
//! The node set sits behind a single mutex, which is the exclusion domain
//! for selection as well as for registry-driven add/remove. The lock is
//! never held across an await point.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::node::{Endpoint, Node, NodeSet};
use crate::{Result, TrafficError};

/// Smooth weighted round-robin selector owning the node set of one target.
///
/// Cloning shares the same set; all clones select from one sequence.
#[derive(Debug, Clone, Default)]
pub struct WeightedSelector {
    nodes: Arc<Mutex<NodeSet>>,
}

impl WeightedSelector {
    pub fn new(nodes: NodeSet) -> Self {
        Self {
            nodes: Arc::new(Mutex::new(nodes)),
        }
    }

    /// Builds a selector from endpoints in the given order.
    pub fn from_endpoints(endpoints: impl IntoIterator<Item = Endpoint>) -> Result<Self> {
        NodeSet::from_endpoints(endpoints).map(Self::new)
    }

    /// Selects the next node.
    ///
    /// Fails with [`TrafficError::EmptyPool`] when no node is registered.
    /// Only the chosen node's accumulator changes beyond the per-step
    /// increment every node receives.
    pub fn select(&self) -> Result<Endpoint> {
        self.lock().advance().ok_or(TrafficError::EmptyPool)
    }

    /// Registers a new node. Fails if the address is already present.
    pub fn add(&self, endpoint: Endpoint) -> Result<()> {
        self.lock().insert(endpoint)
    }

    /// Registers the node or updates the weight of an existing one.
    /// Returns `true` if the node was newly added.
    pub fn upsert(&self, endpoint: Endpoint) -> bool {
        self.lock().upsert(endpoint)
    }

    /// Removes the node with the given address. Returns `true` if a node
    /// was removed.
    pub fn remove(&self, address: &str) -> bool {
        self.lock().remove(address).is_some()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.lock().contains(address)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Point-in-time copy of every node and its accumulator.
    pub fn snapshot(&self) -> Vec<Node> {
        self.lock().iter().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, NodeSet> {
        // Every mutation leaves the set consistent, so a poisoned lock is
        // still safe to use.
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
