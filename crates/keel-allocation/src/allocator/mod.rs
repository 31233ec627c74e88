//! Shard allocators.
//!
//! Allocators decide *which* node gets each shard copy, within the bounds the
//! deciders set. Two kinds run per pass, in order: existing-shards allocators
//! place copies that have retained on-disk data ([`GatewayAllocator`]), then
//! the general allocator places the rest and keeps the cluster balanced
//! ([`BalancedShardsAllocator`]).

mod balanced;
mod gateway;

pub use balanced::BalancedShardsAllocator;
pub use gateway::GatewayAllocator;

use crate::allocation::RoutingAllocation;
use crate::routing::{AllocationStatus, ShardRouting};

/// The general-purpose allocator: places unassigned copies, moves copies that
/// may no longer remain, and rebalances.
pub trait ShardsAllocator: Send + Sync {
    /// Runs one full allocation pass over the working copy.
    fn allocate(&self, allocation: &mut RoutingAllocation);
}

/// An allocator that reuses existing on-disk shard data. Runs before the
/// general allocator; copies it does not place fall through.
pub trait ExistingShardsAllocator: Send + Sync {
    /// Stable tag identifying the allocator.
    fn name(&self) -> &'static str;

    /// Places unassigned copies that have retained data somewhere.
    fn allocate_unassigned(&self, allocation: &mut RoutingAllocation);
}

/// Records the outcome of this pass's attempt on an unplaced copy. Returns
/// the (possibly updated) copy and whether its info actually changed; an
/// unchanged status must not mark the pass as changed.
pub(crate) fn record_status(
    shard: ShardRouting,
    status: AllocationStatus,
) -> (ShardRouting, bool) {
    match &shard.unassigned_info {
        Some(info) if info.last_allocation_status != status => {
            let info = info.with_status(status);
            (ShardRouting { unassigned_info: Some(info), ..shard }, true)
        }
        _ => (shard, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{ShardId, UnassignedInfo, UnassignedReason};

    #[test]
    fn test_record_status_marks_change_only_once() {
        let shard = ShardRouting::unassigned(
            ShardId::new("logs", "uuid-1", 0),
            true,
            UnassignedInfo::new(UnassignedReason::IndexCreated, "index created"),
        );
        let (shard, changed) = record_status(shard, AllocationStatus::DecidersNo);
        assert!(changed);
        let (_, changed) = record_status(shard, AllocationStatus::DecidersNo);
        assert!(!changed, "re-recording the same status is not a change");
    }
}
