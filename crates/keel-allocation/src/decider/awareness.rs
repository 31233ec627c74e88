//! Zone-awareness decider.
//!
//! With awareness attributes configured (e.g. `zone`), copies of a shard
//! must spread evenly across the values of each attribute present in the
//! cluster: no value may hold more than `ceil(copies / values)` copies.

use keel_core::{Setting, SettingsBus};

use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing::{RoutingNode, ShardRouting};

use super::AllocationDecider;

const NAME: &str = "awareness";

/// Balances shard copies across failure-domain attribute values.
pub struct AwarenessAllocationDecider {
    attributes: Setting<Vec<String>>,
}

impl AwarenessAllocationDecider {
    /// Creates the decider wired to the settings bus.
    #[must_use]
    pub fn new(bus: &SettingsBus) -> Self {
        let attributes = Setting::new(bus.current().awareness_attributes);
        let cell = attributes.clone();
        bus.subscribe(move |s| cell.set(s.awareness_attributes.clone()));
        Self { attributes }
    }
}

impl AllocationDecider for AwarenessAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation,
    ) -> Decision {
        let attributes = self.attributes.get();
        if attributes.is_empty() {
            return Decision::yes(NAME, "no awareness attributes configured");
        }
        let Some(candidate) = allocation.state.nodes.get(node.node_id()) else {
            return Decision::no(NAME, format!("node [{}] is unknown", node.node_id()));
        };
        let total_copies = allocation
            .metadata(&shard.shard_id.index)
            .map_or(1, |m| m.number_of_replicas as usize + 1);

        for attribute in &attributes {
            let Some(candidate_value) = candidate.attributes.get(attribute) else {
                return Decision::no(
                    NAME,
                    format!(
                        "node [{}] lacks awareness attribute [{attribute}]",
                        node.node_id()
                    ),
                );
            };
            let values: std::collections::BTreeSet<&String> = allocation
                .state
                .nodes
                .values()
                .filter_map(|n| n.attributes.get(attribute))
                .collect();
            // Copies (active or recovering) already in the candidate's domain,
            // plus the one being placed.
            let in_domain = 1 + allocation
                .routing_nodes
                .assigned_copies(&shard.shard_id)
                .filter(|copy| {
                    let holder = copy.current_node_id.as_deref().expect("assigned");
                    holder != node.node_id()
                        && allocation
                            .state
                            .nodes
                            .get(holder)
                            .and_then(|n| n.attributes.get(attribute))
                            == Some(candidate_value)
                })
                .count();
            let ceiling = total_copies.div_ceil(values.len().max(1));
            if in_domain > ceiling {
                return Decision::no(
                    NAME,
                    format!(
                        "placing this copy would put {in_domain} of {total_copies} copies \
                         in [{attribute}={candidate_value}], above the balanced \
                         ceiling of {ceiling}"
                    ),
                );
            }
        }
        Decision::yes(NAME, "copy keeps awareness attributes balanced")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterState, DiscoveryNode, IndexMetadata};
    use crate::test_util::{assign, bus_with, context, take_copy};

    fn zoned_state() -> ClusterState {
        ClusterState::new()
            .with_node(DiscoveryNode::new("a-1", "host-1").with_attribute("zone", "a"))
            .with_node(DiscoveryNode::new("a-2", "host-2").with_attribute("zone", "a"))
            .with_node(DiscoveryNode::new("b-1", "host-3").with_attribute("zone", "b"))
            .with_index(IndexMetadata::new("logs", "uuid-1", 1, 1))
    }

    fn zone_decider() -> AwarenessAllocationDecider {
        AwarenessAllocationDecider::new(&bus_with(|s| {
            s.awareness_attributes = vec!["zone".to_string()];
        }))
    }

    #[test]
    fn test_replica_must_land_in_other_zone() {
        let decider = zone_decider();
        let mut allocation = context(zoned_state());
        assign(&mut allocation, "logs", 0, true, "a-1");
        let replica = take_copy(&mut allocation, "logs", 0, false);

        // 2 copies over 2 zones: ceiling is 1 per zone.
        let same_zone = allocation.routing_nodes.node("a-2").unwrap().clone();
        let other_zone = allocation.routing_nodes.node("b-1").unwrap().clone();
        assert!(decider.can_allocate(&replica, &same_zone, &allocation).is_no());
        assert!(decider.can_allocate(&replica, &other_zone, &allocation).is_yes());
    }

    #[test]
    fn test_node_without_attribute_is_no() {
        let decider = zone_decider();
        let state = zoned_state().with_node(DiscoveryNode::new("plain", "host-4"));
        let mut allocation = context(state);
        let primary = take_copy(&mut allocation, "logs", 0, true);
        let plain = allocation.routing_nodes.node("plain").unwrap().clone();
        assert!(decider.can_allocate(&primary, &plain, &allocation).is_no());
    }

    #[test]
    fn test_unconfigured_awareness_is_yes() {
        let decider = AwarenessAllocationDecider::new(&bus_with(|_| {}));
        let mut allocation = context(zoned_state());
        assign(&mut allocation, "logs", 0, true, "a-1");
        let replica = take_copy(&mut allocation, "logs", 0, false);
        let same_zone = allocation.routing_nodes.node("a-2").unwrap().clone();
        assert!(decider.can_allocate(&replica, &same_zone, &allocation).is_yes());
    }
}
