//! Shard-count limits per node.

use keel_core::{Setting, SettingsBus};

use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing::{RoutingNode, ShardRouting};

use super::AllocationDecider;

const NAME: &str = "shards_limit";

/// Caps the number of copies a node may hold, in total and per index.
pub struct ShardsLimitAllocationDecider {
    node_limit: Setting<i32>,
    index_limit: Setting<i32>,
}

impl ShardsLimitAllocationDecider {
    /// Creates the decider wired to the settings bus.
    #[must_use]
    pub fn new(bus: &SettingsBus) -> Self {
        let current = bus.current();
        let node_limit = Setting::new(current.shards_per_node);
        let index_limit = Setting::new(current.index_shards_per_node);
        let node_cell = node_limit.clone();
        let index_cell = index_limit.clone();
        bus.subscribe(move |s| {
            node_cell.set(s.shards_per_node);
            index_cell.set(s.index_shards_per_node);
        });
        Self { node_limit, index_limit }
    }

    fn check(&self, shard: &ShardRouting, node: &RoutingNode, incoming: usize) -> Decision {
        let node_limit = self.node_limit.get();
        if node_limit != -1 && node.owning_shard_count() + incoming > node_limit as usize {
            return Decision::no(
                NAME,
                format!(
                    "node [{}] holds {} shard copies, at its limit of {node_limit}",
                    node.node_id(),
                    node.owning_shard_count()
                ),
            );
        }
        let index_limit = self.index_limit.get();
        let index_count = node.index_shard_count(&shard.shard_id.index);
        if index_limit != -1 && index_count + incoming > index_limit as usize {
            return Decision::no(
                NAME,
                format!(
                    "node [{}] holds {index_count} copies of [{}], at the per-index \
                     limit of {index_limit}",
                    node.node_id(),
                    shard.shard_id.index
                ),
            );
        }
        Decision::yes(NAME, "below shard count limits")
    }
}

impl AllocationDecider for ShardsLimitAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        _allocation: &RoutingAllocation,
    ) -> Decision {
        self.check(shard, node, 1)
    }

    fn can_remain(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        _allocation: &RoutingAllocation,
    ) -> Decision {
        self.check(shard, node, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterState, DiscoveryNode, IndexMetadata};
    use crate::test_util::{assign, bus_with, context, take_copy};

    fn state() -> ClusterState {
        ClusterState::new()
            .with_node(DiscoveryNode::new("node-1", "host-a"))
            .with_node(DiscoveryNode::new("node-2", "host-b"))
            .with_index(IndexMetadata::new("logs", "uuid-1", 2, 0))
            .with_index(IndexMetadata::new("metrics", "uuid-2", 1, 0))
    }

    #[test]
    fn test_node_limit() {
        let decider =
            ShardsLimitAllocationDecider::new(&bus_with(|s| s.shards_per_node = 2));
        let mut allocation = context(state());
        assign(&mut allocation, "logs", 0, true, "node-1");
        assign(&mut allocation, "logs", 1, true, "node-1");
        let shard = take_copy(&mut allocation, "metrics", 0, true);

        let full = allocation.routing_nodes.node("node-1").unwrap().clone();
        let empty = allocation.routing_nodes.node("node-2").unwrap().clone();
        assert!(decider.can_allocate(&shard, &full, &allocation).is_no());
        assert!(decider.can_allocate(&shard, &empty, &allocation).is_yes());
        // At the limit the copies may stay; only growth is refused.
        let resident = full.shards()[0].clone();
        assert!(decider.can_remain(&resident, &full, &allocation).is_yes());
    }

    #[test]
    fn test_per_index_limit() {
        let decider =
            ShardsLimitAllocationDecider::new(&bus_with(|s| s.index_shards_per_node = 1));
        let mut allocation = context(state());
        assign(&mut allocation, "logs", 0, true, "node-1");
        let same_index = take_copy(&mut allocation, "logs", 1, true);
        let other_index = take_copy(&mut allocation, "metrics", 0, true);

        let node = allocation.routing_nodes.node("node-1").unwrap().clone();
        assert!(decider.can_allocate(&same_index, &node, &allocation).is_no());
        assert!(decider.can_allocate(&other_index, &node, &allocation).is_yes());
    }

    #[test]
    fn test_unbounded_by_default() {
        let decider = ShardsLimitAllocationDecider::new(&bus_with(|_| {}));
        let mut allocation = context(state());
        assign(&mut allocation, "logs", 0, true, "node-1");
        assign(&mut allocation, "logs", 1, true, "node-1");
        let shard = take_copy(&mut allocation, "metrics", 0, true);
        let node = allocation.routing_nodes.node("node-1").unwrap().clone();
        assert!(decider.can_allocate(&shard, &node, &allocation).is_yes());
    }
}
