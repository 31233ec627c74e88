//! Existing-copy allocator.
//!
//! Copies that failed over or came back after a restart usually still have
//! their data on disk somewhere. Reusing such a copy turns a full recovery
//! into a catch-up, so this allocator runs before the balancer. A primary
//! *must* come back on a node holding its data (allocating it empty anywhere
//! else would silently discard writes); a replica merely prefers one.

use std::sync::Arc;

use tracing::debug;

use crate::allocation::RoutingAllocation;
use crate::cluster::StoredCopy;
use crate::routing::AllocationStatus;

use super::{record_status, ExistingShardsAllocator};

const NAME: &str = "gateway";

/// Reuses on-disk shard copies retained from previous assignments.
#[derive(Debug, Default)]
pub struct GatewayAllocator;

impl GatewayAllocator {
    /// Creates the allocator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ExistingShardsAllocator for GatewayAllocator {
    fn name(&self) -> &'static str {
        NAME
    }

    fn allocate_unassigned(&self, allocation: &mut RoutingAllocation) {
        let deciders = Arc::clone(&allocation.deciders);
        let pending = allocation.routing_nodes.take_unassigned();

        for shard in pending {
            let mut stored: Vec<StoredCopy> =
                allocation.stored_copies(&shard.shard_id).to_vec();
            if stored.is_empty() {
                // Nothing on disk anywhere; the balancer decides.
                allocation.routing_nodes.push_unassigned(shard, false);
                continue;
            }
            stored.sort_by(|a, b| a.node_id.cmp(&b.node_id));

            let mut any_live = false;
            let mut throttled = false;
            let mut chosen: Option<StoredCopy> = None;
            for copy in &stored {
                let Some(node) = allocation.routing_nodes.node(&copy.node_id) else {
                    continue;
                };
                any_live = true;
                let decision = deciders.can_allocate(&shard, node, allocation);
                if decision.is_yes() {
                    chosen = Some(copy.clone());
                    break;
                }
                if decision.is_throttle() {
                    throttled = true;
                }
            }

            if let Some(copy) = chosen {
                debug!(shard = %shard, node = %copy.node_id, "reusing on-disk shard copy");
                allocation.routing_nodes.initialize_shard(
                    shard,
                    &copy.node_id,
                    Some(copy.allocation_id),
                );
            } else if shard.primary {
                // A primary with retained data never allocates empty on its
                // own; it waits for a copy-holding node or an explicit
                // empty-primary command.
                let status = if throttled {
                    AllocationStatus::DecidersThrottled
                } else if any_live {
                    AllocationStatus::DecidersNo
                } else {
                    AllocationStatus::NoValidShardCopy
                };
                debug!(shard = %shard, ?status, "primary has stored copies but none is usable");
                let (shard, changed) = record_status(shard, status);
                allocation.routing_nodes.ignore(shard, changed);
            } else {
                // Replicas can always rebuild from the primary elsewhere.
                allocation.routing_nodes.push_unassigned(shard, false);
            }
        }
    }
}
