//! Snapshot-in-progress decider.
//!
//! A shard whose data is being snapshotted must not relocate: moving the
//! copy mid-stream would abort the snapshot. Ordinary allocation of
//! unassigned copies is unaffected.

use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing::ShardRouting;

use super::AllocationDecider;

const NAME: &str = "snapshot_in_progress";

/// Pins shards that are currently being snapshotted.
#[derive(Debug, Default)]
pub struct SnapshotInProgressAllocationDecider;

impl SnapshotInProgressAllocationDecider {
    /// Creates the decider.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl AllocationDecider for SnapshotInProgressAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_rebalance(&self, shard: &ShardRouting, allocation: &RoutingAllocation) -> Decision {
        if allocation.state.snapshots.shards.contains(&shard.shard_id) {
            return Decision::no(
                NAME,
                format!("a snapshot of {} is in progress", shard.shard_id),
            );
        }
        Decision::yes(NAME, "no snapshot in progress for this shard")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterState, DiscoveryNode, IndexMetadata};
    use crate::routing::ShardId;
    use crate::test_util::{assign, context, take_copy};

    fn snapshotting_state() -> ClusterState {
        let mut state = ClusterState::new()
            .with_node(DiscoveryNode::new("node-1", "host-a"))
            .with_node(DiscoveryNode::new("node-2", "host-b"))
            .with_index(IndexMetadata::new("logs", "uuid-1", 2, 0));
        state.snapshots.shards.insert(ShardId::new("logs", "uuid-1", 0));
        state
    }

    #[test]
    fn test_snapshotted_shard_may_not_rebalance() {
        let decider = SnapshotInProgressAllocationDecider::new();
        let mut allocation = context(snapshotting_state());
        let pinned = assign(&mut allocation, "logs", 0, true, "node-1");
        let free = assign(&mut allocation, "logs", 1, true, "node-1");

        assert!(decider.can_rebalance(&pinned, &allocation).is_no());
        assert!(decider.can_rebalance(&free, &allocation).is_yes());
    }

    #[test]
    fn test_allocation_is_unaffected() {
        let decider = SnapshotInProgressAllocationDecider::new();
        let mut allocation = context(snapshotting_state());
        let shard = take_copy(&mut allocation, "logs", 0, true);
        let node = allocation.routing_nodes.node("node-2").unwrap().clone();
        assert!(decider.can_allocate(&shard, &node, &allocation).is_yes());
    }
}
