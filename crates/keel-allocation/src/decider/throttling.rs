//! Recovery throttling.
//!
//! Recoveries copy shard data over the network or replay it from disk, and a
//! node can only absorb so many at once. This decider throttles rather than
//! refuses: the copy stays unassigned and gets another chance next pass.
//! Primaries recovering from an on-disk copy replay locally and get their own
//! budget, separate from network recoveries.

use keel_core::{Setting, SettingsBus};

use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing::{RoutingNode, ShardRouting, ShardRoutingState};

use super::AllocationDecider;

const NAME: &str = "throttling";

#[derive(Debug, Clone, Copy)]
struct Limits {
    incoming: u32,
    outgoing: u32,
    initial_primaries: u32,
}

/// Caps concurrent recoveries per node.
pub struct ThrottlingAllocationDecider {
    limits: Setting<Limits>,
}

impl ThrottlingAllocationDecider {
    /// Creates the decider wired to the settings bus.
    #[must_use]
    pub fn new(bus: &SettingsBus) -> Self {
        let current = bus.current();
        let limits = Setting::new(Limits {
            incoming: current.node_concurrent_incoming_recoveries,
            outgoing: current.node_concurrent_outgoing_recoveries,
            initial_primaries: current.initial_primaries_recoveries,
        });
        let cell = limits.clone();
        bus.subscribe(move |s| {
            cell.set(Limits {
                incoming: s.node_concurrent_incoming_recoveries,
                outgoing: s.node_concurrent_outgoing_recoveries,
                initial_primaries: s.initial_primaries_recoveries,
            });
        });
        Self { limits }
    }
}

impl AllocationDecider for ThrottlingAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation,
    ) -> Decision {
        let limits = self.limits.get();
        // A primary recovering from a retained on-disk copy replays local
        // data instead of streaming from a peer.
        if shard.primary && !allocation.stored_copies(&shard.shard_id).is_empty() {
            let initial = node
                .shards()
                .iter()
                .filter(|s| s.primary && s.state == ShardRoutingState::Initializing)
                .count();
            if initial >= limits.initial_primaries as usize {
                return Decision::throttle(
                    NAME,
                    format!(
                        "node [{}] is recovering {initial} initial primaries, at the \
                         limit of {}",
                        node.node_id(),
                        limits.initial_primaries
                    ),
                );
            }
            return Decision::yes(NAME, "below the initial primary recovery limit");
        }
        let incoming = allocation.routing_nodes.incoming_recoveries(node.node_id());
        if incoming >= limits.incoming as usize {
            return Decision::throttle(
                NAME,
                format!(
                    "node [{}] has {incoming} incoming recoveries, at the limit of {}",
                    node.node_id(),
                    limits.incoming
                ),
            );
        }
        Decision::yes(NAME, "below the incoming recovery limit")
    }

    fn can_rebalance(&self, shard: &ShardRouting, allocation: &RoutingAllocation) -> Decision {
        let limits = self.limits.get();
        let Some(source) = shard.current_node_id.as_deref() else {
            return Decision::yes(NAME, "copy is not assigned");
        };
        let outgoing = allocation.routing_nodes.outgoing_recoveries(source);
        if outgoing >= limits.outgoing as usize {
            return Decision::throttle(
                NAME,
                format!(
                    "node [{source}] has {outgoing} outgoing recoveries, at the \
                     limit of {}",
                    limits.outgoing
                ),
            );
        }
        Decision::yes(NAME, "below the outgoing recovery limit")
    }

    /// Throttling never blocks an operator forcing a primary online.
    fn can_force_allocate_primary(
        &self,
        _shard: &ShardRouting,
        _node: &RoutingNode,
        _allocation: &RoutingAllocation,
    ) -> Decision {
        Decision::yes(NAME, "recovery limits do not apply to forced primaries")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterState, DiscoveryNode, IndexMetadata, StoredCopy};
    use crate::routing::{AllocationId, ShardId};
    use crate::test_util::{assign, bus_with, context, take_copy};

    fn state(shards: u32) -> ClusterState {
        ClusterState::new()
            .with_node(DiscoveryNode::new("node-1", "host-a"))
            .with_node(DiscoveryNode::new("node-2", "host-b"))
            .with_index(IndexMetadata::new("logs", "uuid-1", shards, 0))
    }

    fn initialize(allocation: &mut crate::allocation::RoutingAllocation, shard: u32, node: &str) {
        let copy = take_copy(allocation, "logs", shard, true);
        allocation.routing_nodes.initialize_shard(copy, node, None);
    }

    #[test]
    fn test_incoming_recoveries_throttle() {
        let decider = ThrottlingAllocationDecider::new(&bus_with(|s| {
            s.node_concurrent_incoming_recoveries = 1;
        }));
        let mut allocation = context(state(3));
        initialize(&mut allocation, 0, "node-1");
        let next = take_copy(&mut allocation, "logs", 1, true);

        let busy = allocation.routing_nodes.node("node-1").unwrap().clone();
        let idle = allocation.routing_nodes.node("node-2").unwrap().clone();
        assert!(decider.can_allocate(&next, &busy, &allocation).is_throttle());
        assert!(decider.can_allocate(&next, &idle, &allocation).is_yes());
    }

    #[test]
    fn test_initial_primaries_use_their_own_budget() {
        let decider = ThrottlingAllocationDecider::new(&bus_with(|s| {
            s.node_concurrent_incoming_recoveries = 1;
            s.initial_primaries_recoveries = 4;
        }));
        let mut state = state(3);
        for shard in 0..3 {
            state.info.stored_copies.insert(
                ShardId::new("logs", "uuid-1", shard),
                vec![StoredCopy { node_id: "node-1".to_string(), allocation_id: AllocationId::fresh() }],
            );
        }
        let mut allocation = context(state);
        initialize(&mut allocation, 0, "node-1");
        initialize(&mut allocation, 1, "node-1");
        let next = take_copy(&mut allocation, "logs", 2, true);

        // Two recoveries already exceed the incoming limit, but initial
        // primaries are judged against their own, larger budget.
        let node = allocation.routing_nodes.node("node-1").unwrap().clone();
        assert!(decider.can_allocate(&next, &node, &allocation).is_yes());
    }

    #[test]
    fn test_outgoing_recoveries_throttle_rebalance() {
        let decider = ThrottlingAllocationDecider::new(&bus_with(|s| {
            s.node_concurrent_outgoing_recoveries = 1;
        }));
        let mut allocation = context(state(2));
        let first = assign(&mut allocation, "logs", 0, true, "node-1");
        let second = assign(&mut allocation, "logs", 1, true, "node-1");

        assert!(decider.can_rebalance(&second, &allocation).is_yes());
        allocation.routing_nodes.relocate_shard(&first.shard_id, "node-1", "node-2");
        assert!(decider.can_rebalance(&second, &allocation).is_throttle());
    }

    #[test]
    fn test_force_allocate_ignores_limits() {
        let decider = ThrottlingAllocationDecider::new(&bus_with(|s| {
            s.node_concurrent_incoming_recoveries = 1;
        }));
        let mut allocation = context(state(3));
        initialize(&mut allocation, 0, "node-1");
        let next = take_copy(&mut allocation, "logs", 1, true);
        let busy = allocation.routing_nodes.node("node-1").unwrap().clone();
        assert!(decider.can_force_allocate_primary(&next, &busy, &allocation).is_yes());
    }
}
