//! Cluster-wide rebalance gate.
//!
//! Rebalancing a half-recovered cluster wastes recovery bandwidth on moves
//! that the remaining recoveries will invalidate. The policy decides how
//! settled the cluster must be before balance-driven moves are allowed.

use keel_core::{RebalancePolicy, Setting, SettingsBus};

use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing::ShardRouting;

use super::AllocationDecider;

const NAME: &str = "cluster_rebalance";

/// Holds rebalancing until the cluster is settled enough per policy.
pub struct ClusterRebalanceAllocationDecider {
    policy: Setting<RebalancePolicy>,
}

impl ClusterRebalanceAllocationDecider {
    /// Creates the decider wired to the settings bus.
    #[must_use]
    pub fn new(bus: &SettingsBus) -> Self {
        let policy = Setting::new(bus.current().rebalance_policy);
        let cell = policy.clone();
        bus.subscribe(move |s| cell.set(s.rebalance_policy));
        Self { policy }
    }
}

impl AllocationDecider for ClusterRebalanceAllocationDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_rebalance(&self, _shard: &ShardRouting, allocation: &RoutingAllocation) -> Decision {
        match self.policy.get() {
            RebalancePolicy::Always => Decision::yes(NAME, "rebalancing is always permitted"),
            RebalancePolicy::IndicesPrimariesActive => {
                if allocation.routing_nodes.all_primaries_active() {
                    Decision::yes(NAME, "all primaries are active")
                } else {
                    Decision::no(NAME, "waiting for all primaries to become active")
                }
            }
            RebalancePolicy::IndicesAllActive => {
                if allocation.routing_nodes.all_active() {
                    Decision::yes(NAME, "all shard copies are active")
                } else {
                    Decision::no(NAME, "waiting for all shard copies to become active")
                }
            }
        }
    }
}
