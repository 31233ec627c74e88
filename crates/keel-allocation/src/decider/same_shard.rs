//! Same-shard exclusion.
//!
//! Two copies of one shard on the same node defeat replication entirely, so
//! that is always forbidden. With `same_host` enabled the rule extends to
//! nodes sharing a physical host.

use keel_core::{Setting, SettingsBus};

use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing::{RoutingNode, ShardRouting};

use super::AllocationDecider;

const NAME: &str = "same_shard";

/// Forbids placing a copy next to another copy of the same shard.
pub struct SameShardAllocationDecider {
    same_host: Setting<bool>,
}

impl SameShardAllocationDecider {
    /// Creates the decider wired to the settings bus.
    #[must_use]
    pub fn new(bus: &SettingsBus) -> Self {
        let same_host = Setting::new(bus.current().same_host);
        let cell = same_host.clone();
        bus.subscribe(move |s| cell.set(s.same_host));
        Self { same_host }
    }
}

impl AllocationDecider for SameShardAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation,
    ) -> Decision {
        if node.has_copy_of(&shard.shard_id) {
            return Decision::no(
                NAME,
                format!("a copy of {} is already allocated to this node", shard.shard_id),
            );
        }
        if self.same_host.get() {
            let Some(candidate_host) = allocation.host_of(node.node_id()) else {
                return Decision::yes(NAME, "candidate host unknown");
            };
            for copy in allocation.routing_nodes.assigned_copies(&shard.shard_id) {
                let holder = copy.current_node_id.as_deref().expect("assigned copy has a node");
                if holder != node.node_id()
                    && allocation.host_of(holder) == Some(candidate_host)
                {
                    return Decision::no(
                        NAME,
                        format!(
                            "a copy of {} is allocated to node [{holder}] on the \
                             same host [{candidate_host}]",
                            shard.shard_id
                        ),
                    );
                }
            }
        }
        Decision::yes(NAME, "no other copy on this node or host")
    }
}
