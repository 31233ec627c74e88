//! Cluster-wide relocation concurrency cap.

use keel_core::{Setting, SettingsBus};

use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing::ShardRouting;

use super::AllocationDecider;

const NAME: &str = "concurrent_rebalance";

/// Throttles balance-driven moves once too many relocations are in flight.
pub struct ConcurrentRebalanceAllocationDecider {
    limit: Setting<i32>,
}

impl ConcurrentRebalanceAllocationDecider {
    /// Creates the decider wired to the settings bus.
    #[must_use]
    pub fn new(bus: &SettingsBus) -> Self {
        let limit = Setting::new(bus.current().concurrent_rebalance);
        let cell = limit.clone();
        bus.subscribe(move |s| cell.set(s.concurrent_rebalance));
        Self { limit }
    }
}

impl AllocationDecider for ConcurrentRebalanceAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_rebalance(&self, _shard: &ShardRouting, allocation: &RoutingAllocation) -> Decision {
        let limit = self.limit.get();
        if limit == -1 {
            return Decision::yes(NAME, "concurrent rebalancing is unbounded");
        }
        let relocating = allocation.routing_nodes.relocating_count();
        if relocating >= limit as usize {
            return Decision::throttle(
                NAME,
                format!("{relocating} relocations in flight, at the limit of {limit}"),
            );
        }
        Decision::yes(NAME, "below the concurrent relocation limit")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterState, DiscoveryNode, IndexMetadata};
    use crate::test_util::{assign, bus_with, context};

    fn state() -> ClusterState {
        ClusterState::new()
            .with_node(DiscoveryNode::new("node-1", "host-a"))
            .with_node(DiscoveryNode::new("node-2", "host-b"))
            .with_index(IndexMetadata::new("logs", "uuid-1", 2, 0))
    }

    #[test]
    fn test_throttles_at_the_limit() {
        let decider =
            ConcurrentRebalanceAllocationDecider::new(&bus_with(|s| s.concurrent_rebalance = 1));
        let mut allocation = context(state());
        let moving = assign(&mut allocation, "logs", 0, true, "node-1");
        let other = assign(&mut allocation, "logs", 1, true, "node-1");

        assert!(decider.can_rebalance(&other, &allocation).is_yes());
        allocation.routing_nodes.relocate_shard(&moving.shard_id, "node-1", "node-2");
        assert!(decider.can_rebalance(&other, &allocation).is_throttle());
    }

    #[test]
    fn test_unbounded() {
        let decider =
            ConcurrentRebalanceAllocationDecider::new(&bus_with(|s| s.concurrent_rebalance = -1));
        let mut allocation = context(state());
        let moving = assign(&mut allocation, "logs", 0, true, "node-1");
        let other = assign(&mut allocation, "logs", 1, true, "node-1");
        allocation.routing_nodes.relocate_shard(&moving.shard_id, "node-1", "node-2");
        assert!(decider.can_rebalance(&other, &allocation).is_yes());
    }
}
