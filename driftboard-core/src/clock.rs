// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::NodeId;

/// Causal relation between two clock snapshots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CausalOrder {
    /// Every counter on the left is at most the counter on the right.
    Before,
    /// Every counter on the left is at least the counter on the right.
    After,
    /// Neither side dominates; the events happened concurrently.
    Concurrent,
}

/// Per-node logical clock used to detect whether two operations are causally
/// ordered or concurrent.
///
/// Only the conflict-resolution layer consults this clock: operations already
/// ordered by the consensus log never need it. Identical clocks compare as
/// [`CausalOrder::Concurrent`] so the pair is routed through the
/// deterministic transform rather than given an order the clock cannot
/// justify.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalityClock(BTreeMap<NodeId, u64>);

impl CausalityClock {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Current counter for a node, zero when the node was never seen.
    pub fn get(&self, node: &NodeId) -> u64 {
        self.0.get(node).copied().unwrap_or(0)
    }

    /// Record one local event for `node`.
    pub fn tick(&mut self, node: &NodeId) {
        *self.0.entry(node.clone()).or_insert(0) += 1;
    }

    /// Incorporate a remote clock: pointwise maximum of both sides, then one
    /// local tick for `node`.
    pub fn merge(&mut self, other: &CausalityClock, node: &NodeId) {
        for (remote_node, remote_counter) in &other.0 {
            let counter = self.0.entry(remote_node.clone()).or_insert(0);
            *counter = (*counter).max(*remote_counter);
        }
        self.tick(node);
    }

    /// Compare two clock snapshots.
    pub fn causal_cmp(&self, other: &CausalityClock) -> CausalOrder {
        let mut left_behind = false;
        let mut right_behind = false;

        for node in self.0.keys().chain(other.0.keys()) {
            let left = self.get(node);
            let right = other.get(node);

            if left < right {
                left_behind = true;
            }
            if left > right {
                right_behind = true;
            }
        }

        match (left_behind, right_behind) {
            (true, false) => CausalOrder::Before,
            (false, true) => CausalOrder::After,
            _ => CausalOrder::Concurrent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CausalOrder, CausalityClock};
    use crate::NodeId;

    #[test]
    fn tick_advances_own_counter() {
        let node = NodeId::new("node-a");
        let mut clock = CausalityClock::new();
        assert_eq!(clock.get(&node), 0);

        clock.tick(&node);
        clock.tick(&node);
        assert_eq!(clock.get(&node), 2);
    }

    #[test]
    fn merge_takes_pointwise_maximum_then_ticks() {
        let node_a = NodeId::new("node-a");
        let node_b = NodeId::new("node-b");

        let mut clock_a = CausalityClock::new();
        clock_a.tick(&node_a);
        clock_a.tick(&node_a);

        let mut clock_b = CausalityClock::new();
        clock_b.tick(&node_b);

        clock_a.merge(&clock_b, &node_a);
        assert_eq!(clock_a.get(&node_a), 3);
        assert_eq!(clock_a.get(&node_b), 1);
    }

    #[test]
    fn causally_ordered_events_compare_as_before_and_after() {
        let node_a = NodeId::new("node-a");
        let node_b = NodeId::new("node-b");

        let mut earlier = CausalityClock::new();
        earlier.tick(&node_a);

        // The later clock observed the earlier one.
        let mut later = earlier.clone();
        later.merge(&CausalityClock::new(), &node_b);

        assert_eq!(earlier.causal_cmp(&later), CausalOrder::Before);
        assert_eq!(later.causal_cmp(&earlier), CausalOrder::After);
    }

    #[test]
    fn independent_events_compare_as_concurrent() {
        let node_a = NodeId::new("node-a");
        let node_b = NodeId::new("node-b");

        let mut clock_a = CausalityClock::new();
        clock_a.tick(&node_a);

        let mut clock_b = CausalityClock::new();
        clock_b.tick(&node_b);

        assert_eq!(clock_a.causal_cmp(&clock_b), CausalOrder::Concurrent);
        assert_eq!(clock_b.causal_cmp(&clock_a), CausalOrder::Concurrent);
    }

    #[test]
    fn identical_clocks_compare_as_concurrent() {
        let node = NodeId::new("node-a");
        let mut clock = CausalityClock::new();
        clock.tick(&node);

        assert_eq!(clock.causal_cmp(&clock.clone()), CausalOrder::Concurrent);
    }
}
