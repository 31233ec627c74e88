//! Attribute filter decider.
//!
//! Operators pin or ban shards via node-attribute rules at two levels:
//! cluster-wide (dynamic settings) and per index (index metadata). A node
//! must satisfy both levels to receive or keep a copy.

use keel_core::{FilterRules, Setting, SettingsBus};

use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing::{RoutingNode, ShardRouting};

use super::AllocationDecider;

const NAME: &str = "filter";

/// Enforces cluster- and index-level include/exclude/require rules.
pub struct FilterAllocationDecider {
    cluster_filters: Setting<FilterRules>,
}

impl FilterAllocationDecider {
    /// Creates the decider wired to the settings bus.
    #[must_use]
    pub fn new(bus: &SettingsBus) -> Self {
        let cluster_filters = Setting::new(bus.current().filters);
        let cell = cluster_filters.clone();
        bus.subscribe(move |s| cell.set(s.filters.clone()));
        Self { cluster_filters }
    }

    fn decide(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation,
    ) -> Decision {
        let Some(discovery) = allocation.state.nodes.get(node.node_id()) else {
            return Decision::no(NAME, format!("node [{}] is unknown", node.node_id()));
        };
        let cluster_filters = self.cluster_filters.get();
        if !cluster_filters.is_empty() && !cluster_filters.matches(&discovery.attributes) {
            return Decision::no(
                NAME,
                format!("node [{}] does not match cluster-level filters", node.node_id()),
            );
        }
        if let Some(metadata) = allocation.metadata(&shard.shard_id.index) {
            if !metadata.filters.is_empty() && !metadata.filters.matches(&discovery.attributes) {
                return Decision::no(
                    NAME,
                    format!(
                        "node [{}] does not match index-level filters of [{}]",
                        node.node_id(),
                        shard.shard_id.index
                    ),
                );
            }
        }
        Decision::yes(NAME, "node matches all filters")
    }
}

impl AllocationDecider for FilterAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation,
    ) -> Decision {
        self.decide(shard, node, allocation)
    }

    fn can_remain(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation,
    ) -> Decision {
        self.decide(shard, node, allocation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterState, DiscoveryNode, IndexMetadata};
    use crate::test_util::{bus, bus_with, context, take_copy};

    fn state(index_filters: FilterRules) -> ClusterState {
        ClusterState::new()
            .with_node(DiscoveryNode::new("hot-1", "host-a").with_attribute("tier", "hot"))
            .with_node(DiscoveryNode::new("cold-1", "host-b").with_attribute("tier", "cold"))
            .with_index(IndexMetadata::new("logs", "uuid-1", 1, 0).with_filters(index_filters))
    }

    #[test]
    fn test_index_level_require() {
        let mut filters = FilterRules::default();
        filters.require.insert("tier".to_string(), "hot".to_string());

        let decider = FilterAllocationDecider::new(&bus());
        let mut allocation = context(state(filters));
        let shard = take_copy(&mut allocation, "logs", 0, true);

        let hot = allocation.routing_nodes.node("hot-1").unwrap().clone();
        let cold = allocation.routing_nodes.node("cold-1").unwrap().clone();
        assert!(decider.can_allocate(&shard, &hot, &allocation).is_yes());
        assert!(decider.can_allocate(&shard, &cold, &allocation).is_no());
        assert!(decider.can_remain(&shard, &cold, &allocation).is_no());
    }

    #[test]
    fn test_cluster_level_exclude_updates_dynamically() {
        let bus = bus();
        let decider = FilterAllocationDecider::new(&bus);
        let mut allocation = context(state(FilterRules::default()));
        let shard = take_copy(&mut allocation, "logs", 0, true);
        let cold = allocation.routing_nodes.node("cold-1").unwrap().clone();

        assert!(decider.can_allocate(&shard, &cold, &allocation).is_yes());

        let mut settings = bus.current();
        settings.filters.exclude.insert("tier".to_string(), "cold".to_string());
        bus.apply(settings).unwrap();
        assert!(decider.can_allocate(&shard, &cold, &allocation).is_no());
    }

    #[test]
    fn test_no_filters_is_yes() {
        let decider = FilterAllocationDecider::new(&bus_with(|_| {}));
        let mut allocation = context(state(FilterRules::default()));
        let shard = take_copy(&mut allocation, "logs", 0, true);
        let node = allocation.routing_nodes.node("hot-1").unwrap().clone();
        assert!(decider.can_allocate(&shard, &node, &allocation).is_yes());
    }
}
