//! Restore-in-progress decider.
//!
//! A shard being restored from a snapshot recovers onto the node the restore
//! chose; the engine must neither re-allocate nor rebalance it until the
//! restore completes.

use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing::{RoutingNode, ShardRouting};

use super::AllocationDecider;

const NAME: &str = "restore_in_progress";

/// Pins shards that are currently being restored from a snapshot.
#[derive(Debug, Default)]
pub struct RestoreInProgressAllocationDecider;

impl RestoreInProgressAllocationDecider {
    /// Creates the decider.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl AllocationDecider for RestoreInProgressAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        _node: &RoutingNode,
        allocation: &RoutingAllocation,
    ) -> Decision {
        if allocation.state.restores.shards.contains(&shard.shard_id) {
            return Decision::no(
                NAME,
                format!("{} is being restored from a snapshot", shard.shard_id),
            );
        }
        Decision::yes(NAME, "no restore in progress for this shard")
    }

    fn can_rebalance(&self, shard: &ShardRouting, allocation: &RoutingAllocation) -> Decision {
        if allocation.state.restores.shards.contains(&shard.shard_id) {
            return Decision::no(
                NAME,
                format!("{} is being restored from a snapshot", shard.shard_id),
            );
        }
        Decision::yes(NAME, "no restore in progress for this shard")
    }
}
