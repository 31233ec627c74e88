//! Replica allocation gate.
//!
//! A replica recovers its data from its primary, so there is nothing to
//! recover from until the primary is active. Keeping replicas unassigned
//! until then also guarantees a replica can never reach `Started` under a
//! primary that has not started itself.

use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing::{RoutingNode, ShardRouting};

use super::AllocationDecider;

const NAME: &str = "replica_after_primary_active";

/// Holds replicas unassigned until their primary is active.
#[derive(Debug, Default)]
pub struct ReplicaAfterPrimaryActiveAllocationDecider;

impl ReplicaAfterPrimaryActiveAllocationDecider {
    /// Creates the decider.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl AllocationDecider for ReplicaAfterPrimaryActiveAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        _node: &RoutingNode,
        allocation: &RoutingAllocation,
    ) -> Decision {
        if shard.primary {
            return Decision::yes(NAME, "shard is a primary");
        }
        if allocation.routing_nodes.active_primary(&shard.shard_id).is_some() {
            Decision::yes(NAME, "the primary of this shard is active")
        } else {
            Decision::no(
                NAME,
                format!("the primary of {} is not active yet", shard.shard_id),
            )
        }
    }
}
