//! Retry-budget decider.
//!
//! A copy that keeps failing to initialize must not flap forever: once it
//! has failed `max_retries` times it stays unassigned until an operator
//! issues a retry-failed reroute or an explicit allocation command.

use keel_core::{Setting, SettingsBus};

use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing::{RoutingNode, ShardRouting};

use super::AllocationDecider;

const NAME: &str = "max_retry";

/// Refuses allocation once a copy has exhausted its retry budget.
pub struct MaxRetryAllocationDecider {
    max_retries: Setting<u32>,
}

impl MaxRetryAllocationDecider {
    /// Creates the decider wired to the settings bus.
    #[must_use]
    pub fn new(bus: &SettingsBus) -> Self {
        let max_retries = Setting::new(bus.current().max_retries);
        let cell = max_retries.clone();
        bus.subscribe(move |s| cell.set(s.max_retries));
        Self { max_retries }
    }
}

impl AllocationDecider for MaxRetryAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        _node: &RoutingNode,
        _allocation: &RoutingAllocation,
    ) -> Decision {
        let max = self.max_retries.get();
        match &shard.unassigned_info {
            Some(info) if info.failed_allocations >= max => Decision::no(
                NAME,
                format!(
                    "shard has failed to allocate {} times (limit {max}); \
                     manual intervention (retry_failed reroute or an explicit \
                     allocation command) is required",
                    info.failed_allocations
                ),
            ),
            _ => Decision::yes(NAME, "retry budget not exhausted"),
        }
    }

    /// An operator may force-allocate past the retry budget, but never onto
    /// a node that already failed this copy; a different node is accepted
    /// immediately, with no cooldown.
    fn can_force_allocate_primary(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        _allocation: &RoutingAllocation,
    ) -> Decision {
        match &shard.unassigned_info {
            Some(info) if info.failed_node_ids.contains(node.node_id()) => Decision::no(
                NAME,
                format!(
                    "node [{}] already failed allocating this shard; pick a \
                     different node or clear failures with a retry_failed reroute",
                    node.node_id()
                ),
            ),
            _ => Decision::yes(NAME, "forced allocation overrides the retry budget"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterState, DiscoveryNode, IndexMetadata};
    use crate::routing::UnassignedInfo;
    use crate::test_util::{bus_with, context, take_copy};

    fn state() -> ClusterState {
        ClusterState::new()
            .with_node(DiscoveryNode::new("node-1", "host-a"))
            .with_node(DiscoveryNode::new("node-2", "host-b"))
            .with_index(IndexMetadata::new("logs", "uuid-1", 1, 0))
    }

    fn failed_times(shard: ShardRouting, node: &str, times: u32) -> ShardRouting {
        let mut info = shard.unassigned_info.clone().unwrap();
        for _ in 0..times {
            info = UnassignedInfo::failure(Some(&info), node, "boom");
        }
        ShardRouting { unassigned_info: Some(info), ..shard }
    }

    #[test]
    fn test_exhausted_budget_is_no() {
        let bus = bus_with(|s| s.max_retries = 3);
        let decider = MaxRetryAllocationDecider::new(&bus);
        let mut allocation = context(state());
        let shard = take_copy(&mut allocation, "logs", 0, true);
        let node = allocation.routing_nodes.node("node-1").unwrap().clone();

        let below = failed_times(shard.clone(), "node-1", 2);
        assert!(decider.can_allocate(&below, &node, &allocation).is_yes());

        let exhausted = failed_times(shard, "node-1", 3);
        assert!(decider.can_allocate(&exhausted, &node, &allocation).is_no());
    }

    #[test]
    fn test_force_allocate_rejects_only_failed_nodes() {
        let bus = bus_with(|s| s.max_retries = 1);
        let decider = MaxRetryAllocationDecider::new(&bus);
        let mut allocation = context(state());
        let shard = take_copy(&mut allocation, "logs", 0, true);
        let exhausted = failed_times(shard, "node-1", 1);

        let failed_node = allocation.routing_nodes.node("node-1").unwrap().clone();
        let fresh_node = allocation.routing_nodes.node("node-2").unwrap().clone();

        assert!(decider.can_allocate(&exhausted, &fresh_node, &allocation).is_no());
        assert!(decider
            .can_force_allocate_primary(&exhausted, &failed_node, &allocation)
            .is_no());
        assert!(decider
            .can_force_allocate_primary(&exhausted, &fresh_node, &allocation)
            .is_yes());
    }

    #[test]
    fn test_dynamic_limit_update() {
        let bus = bus_with(|s| s.max_retries = 5);
        let decider = MaxRetryAllocationDecider::new(&bus);
        let mut allocation = context(state());
        let shard = take_copy(&mut allocation, "logs", 0, true);
        let node = allocation.routing_nodes.node("node-1").unwrap().clone();
        let failed = failed_times(shard, "node-1", 2);

        assert!(decider.can_allocate(&failed, &node, &allocation).is_yes());

        let mut settings = bus.current();
        settings.max_retries = 2;
        bus.apply(settings).unwrap();
        assert!(decider.can_allocate(&failed, &node, &allocation).is_no());
    }
}
