//! Allocation deciders: the chain-of-responsibility placement policy.
//!
//! Each decider rules on exactly one concern (disk, awareness, retry budget,
//! ...). [`AllocationDeciders`] holds them in registration order and combines
//! their verdicts: the first `No` wins and short-circuits, otherwise any
//! `Throttle` downgrades the aggregate, otherwise `Yes`. In explain mode no
//! short-circuiting happens and every verdict is retained.

mod awareness;
mod cluster_rebalance;
mod concurrent_rebalance;
mod disk_threshold;
mod filter;
mod max_retry;
mod replica_after_primary_active;
mod restore_in_progress;
mod same_shard;
mod shards_limit;
mod snapshot_in_progress;
mod throttling;

use std::collections::BTreeSet;
use std::sync::Arc;

pub use awareness::AwarenessAllocationDecider;
pub use cluster_rebalance::ClusterRebalanceAllocationDecider;
pub use concurrent_rebalance::ConcurrentRebalanceAllocationDecider;
pub use disk_threshold::DiskThresholdDecider;
pub use filter::FilterAllocationDecider;
pub use max_retry::MaxRetryAllocationDecider;
pub use replica_after_primary_active::ReplicaAfterPrimaryActiveAllocationDecider;
pub use restore_in_progress::RestoreInProgressAllocationDecider;
pub use same_shard::SameShardAllocationDecider;
pub use shards_limit::ShardsLimitAllocationDecider;
pub use snapshot_in_progress::SnapshotInProgressAllocationDecider;
pub use throttling::ThrottlingAllocationDecider;

use keel_core::{Error, Result, SettingsBus};

use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing::{RoutingNode, ShardRouting};

/// One placement-policy concern.
///
/// Implementations are stateless apart from settings cells; every method is
/// a pure function of its arguments and the current settings.
pub trait AllocationDecider: Send + Sync {
    /// Stable tag identifying the decider's concern. Registering two
    /// deciders with the same tag is a configuration error.
    fn name(&self) -> &'static str;

    /// Can this copy be allocated to this node?
    fn can_allocate(
        &self,
        _shard: &ShardRouting,
        _node: &RoutingNode,
        _allocation: &RoutingAllocation,
    ) -> Decision {
        Decision::YES
    }

    /// Can this copy stay where it is?
    fn can_remain(
        &self,
        _shard: &ShardRouting,
        _node: &RoutingNode,
        _allocation: &RoutingAllocation,
    ) -> Decision {
        Decision::YES
    }

    /// May this copy be moved purely to improve balance?
    fn can_rebalance(&self, _shard: &ShardRouting, _allocation: &RoutingAllocation) -> Decision {
        Decision::YES
    }

    /// Can an operator force-allocate this primary to this node? Defaults to
    /// the ordinary allocation verdict.
    fn can_force_allocate_primary(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation,
    ) -> Decision {
        self.can_allocate(shard, node, allocation)
    }
}

/// The ordered decider chain.
pub struct AllocationDeciders {
    deciders: Vec<Box<dyn AllocationDecider>>,
}

impl AllocationDeciders {
    /// Builds a chain from deciders in registration order.
    ///
    /// Fails fast if two deciders share a concern tag.
    pub fn new(deciders: Vec<Box<dyn AllocationDecider>>) -> Result<Self> {
        let mut seen = BTreeSet::new();
        for decider in &deciders {
            if !seen.insert(decider.name()) {
                return Err(Error::Config(format!(
                    "allocation decider '{}' registered twice",
                    decider.name()
                )));
            }
        }
        Ok(Self { deciders })
    }

    /// Builds the default production chain, wired to the settings bus.
    pub fn standard(bus: &SettingsBus) -> Result<Arc<Self>> {
        Ok(Arc::new(Self::new(vec![
            Box::new(MaxRetryAllocationDecider::new(bus)),
            Box::new(ReplicaAfterPrimaryActiveAllocationDecider::new()),
            Box::new(SnapshotInProgressAllocationDecider::new()),
            Box::new(RestoreInProgressAllocationDecider::new()),
            Box::new(FilterAllocationDecider::new(bus)),
            Box::new(SameShardAllocationDecider::new(bus)),
            Box::new(DiskThresholdDecider::new(bus)),
            Box::new(ShardsLimitAllocationDecider::new(bus)),
            Box::new(AwarenessAllocationDecider::new(bus)),
            Box::new(ClusterRebalanceAllocationDecider::new(bus)),
            Box::new(ConcurrentRebalanceAllocationDecider::new(bus)),
            Box::new(ThrottlingAllocationDecider::new(bus)),
        ])?))
    }

    /// The registered decider tags, in order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.deciders.iter().map(|d| d.name())
    }

    fn combine<F>(&self, allocation: &RoutingAllocation, mut evaluate: F) -> Decision
    where
        F: FnMut(&dyn AllocationDecider) -> Decision,
    {
        if allocation.explain {
            let decisions: Vec<Decision> =
                self.deciders.iter().map(|d| evaluate(d.as_ref())).collect();
            return Decision::Multi { decisions };
        }
        let mut throttled: Option<Decision> = None;
        for decider in &self.deciders {
            let decision = evaluate(decider.as_ref());
            if decision.is_no() {
                return decision;
            }
            if decision.is_throttle() && throttled.is_none() {
                throttled = Some(decision);
            }
        }
        throttled.unwrap_or(Decision::YES)
    }

    /// Aggregate allocation verdict for a copy on a node.
    #[must_use]
    pub fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation,
    ) -> Decision {
        self.combine(allocation, |d| d.can_allocate(shard, node, allocation))
    }

    /// Aggregate verdict on whether a copy may stay on its node.
    #[must_use]
    pub fn can_remain(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation,
    ) -> Decision {
        self.combine(allocation, |d| d.can_remain(shard, node, allocation))
    }

    /// Aggregate verdict on whether a copy may rebalance.
    #[must_use]
    pub fn can_rebalance(&self, shard: &ShardRouting, allocation: &RoutingAllocation) -> Decision {
        self.combine(allocation, |d| d.can_rebalance(shard, allocation))
    }

    /// Aggregate verdict on force-allocating a primary to a node.
    #[must_use]
    pub fn can_force_allocate_primary(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation,
    ) -> Decision {
        self.combine(allocation, |d| d.can_force_allocate_primary(shard, node, allocation))
    }
}

impl std::fmt::Debug for AllocationDeciders {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
