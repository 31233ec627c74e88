//! Weight-based balanced allocator.
//!
//! Every (node, index) pair gets a weight measuring how much more loaded the
//! node is than the cluster average; copies go to the lowest-weight node the
//! deciders accept, and rebalancing moves copies from the heaviest node to
//! the lightest while the gap exceeds the configured threshold. All inputs
//! iterate in sorted order and ties break on node id, so a pass over the same
//! snapshot always produces the same placement.

use std::sync::Arc;

use keel_core::{Setting, SettingsBus};
use tracing::debug;

use crate::allocation::RoutingAllocation;
use crate::routing::{
    AllocationStatus, RoutingNodes, ShardId, ShardRouting, ShardRoutingState,
};

use super::{record_status, ShardsAllocator};

#[derive(Debug, Clone, Copy)]
struct WeightFactors {
    shard: f64,
    index: f64,
    disk: f64,
    threshold: f64,
}

/// Greedy weight-based allocator: place, move, rebalance.
pub struct BalancedShardsAllocator {
    factors: Setting<WeightFactors>,
}

/// Copies a node will end up hosting: everything assigned there except
/// departing relocation sources, plus incoming relocation targets.
fn projected_count(nodes: &RoutingNodes, node_id: &str, index: Option<&str>) -> usize {
    let staying = nodes.node(node_id).map_or(0, |n| {
        n.shards()
            .iter()
            .filter(|s| s.state != ShardRoutingState::Relocating)
            .filter(|s| index.is_none_or(|i| s.shard_id.index == i))
            .count()
    });
    let arriving = nodes
        .nodes()
        .flat_map(|n| n.shards().iter())
        .filter(|s| s.relocating_node_id.as_deref() == Some(node_id))
        .filter(|s| index.is_none_or(|i| s.shard_id.index == i))
        .count();
    staying + arriving
}

impl BalancedShardsAllocator {
    /// Creates the allocator wired to the settings bus.
    #[must_use]
    pub fn new(bus: &SettingsBus) -> Self {
        let current = bus.current();
        let factors = Setting::new(WeightFactors {
            shard: current.balance_shard,
            index: current.balance_index,
            disk: current.balance_disk,
            threshold: current.balance_threshold,
        });
        let cell = factors.clone();
        bus.subscribe(move |s| {
            cell.set(WeightFactors {
                shard: s.balance_shard,
                index: s.balance_index,
                disk: s.balance_disk,
                threshold: s.balance_threshold,
            });
        });
        Self { factors }
    }

    /// The imbalance weight of a node with respect to one index: positive
    /// means more loaded than the cluster average.
    fn weight(
        &self,
        factors: WeightFactors,
        allocation: &RoutingAllocation,
        node_id: &str,
        index: &str,
    ) -> f64 {
        let nodes = &allocation.routing_nodes;
        let node_count = nodes.node_ids().count().max(1) as f64;

        let total: usize =
            nodes.node_ids().map(|id| projected_count(nodes, id, None)).sum();
        let total_index: usize =
            nodes.node_ids().map(|id| projected_count(nodes, id, Some(index))).sum();
        let shard_part =
            projected_count(nodes, node_id, None) as f64 - total as f64 / node_count;
        let index_part =
            projected_count(nodes, node_id, Some(index)) as f64 - total_index as f64 / node_count;

        let disk_part = if factors.disk > 0.0 {
            let fraction = |id: &str| allocation.disk_usage(id).map_or(0.0, |u| u.used_fraction());
            let avg: f64 = nodes.node_ids().map(fraction).sum::<f64>() / node_count;
            fraction(node_id) - avg
        } else {
            0.0
        };

        factors.shard * shard_part + factors.index * index_part + factors.disk * disk_part
    }

    /// Places unassigned copies on the lightest node the deciders accept,
    /// primaries first, older indices first.
    fn allocate_unassigned(&self, allocation: &mut RoutingAllocation) {
        let deciders = Arc::clone(&allocation.deciders);
        let factors = self.factors.get();

        let mut pending = allocation.routing_nodes.take_unassigned();
        pending.sort_by_key(|s| {
            let creation_order =
                allocation.metadata(&s.shard_id.index).map_or(u64::MAX, |m| m.creation_order);
            (!s.primary, creation_order, s.shard_id.clone())
        });

        for shard in pending {
            let mut best: Option<(f64, String)> = None;
            let mut throttled = false;
            for node in allocation.routing_nodes.nodes() {
                let decision = deciders.can_allocate(&shard, node, allocation);
                if decision.is_no() {
                    continue;
                }
                if decision.is_throttle() {
                    throttled = true;
                    continue;
                }
                let weight =
                    self.weight(factors, allocation, node.node_id(), &shard.shard_id.index);
                let better = best
                    .as_ref()
                    .is_none_or(|(w, id)| weight < *w || (weight == *w && node.node_id() < id.as_str()));
                if better {
                    best = Some((weight, node.node_id().to_string()));
                }
            }
            match best {
                Some((_, node_id)) => {
                    allocation.routing_nodes.initialize_shard(shard, &node_id, None);
                }
                None if throttled => {
                    debug!(shard = %shard, "allocation throttled, deferring");
                    let (shard, changed) =
                        record_status(shard, AllocationStatus::DecidersThrottled);
                    allocation.routing_nodes.ignore(shard, changed);
                }
                None => {
                    debug!(shard = %shard, "no node can accept this copy");
                    let (shard, changed) = record_status(shard, AllocationStatus::DecidersNo);
                    allocation.routing_nodes.ignore(shard, changed);
                }
            }
        }
    }

    /// Moves started copies that may no longer remain on their node (filter
    /// change, disk flood stage). A copy with nowhere to go stays put.
    fn move_shards(&self, allocation: &mut RoutingAllocation) {
        let deciders = Arc::clone(&allocation.deciders);
        let factors = self.factors.get();
        let node_ids: Vec<String> =
            allocation.routing_nodes.node_ids().map(str::to_string).collect();

        for node_id in &node_ids {
            let copies: Vec<ShardRouting> = allocation
                .routing_nodes
                .node(node_id)
                .map_or_else(Vec::new, |n| {
                    n.shards()
                        .iter()
                        .filter(|s| s.state == ShardRoutingState::Started)
                        .cloned()
                        .collect()
                });
            for copy in copies {
                let node = allocation.routing_nodes.node(node_id).expect("node exists").clone();
                if !deciders.can_remain(&copy, &node, allocation).is_no() {
                    continue;
                }
                let target = self.best_target(factors, allocation, &copy, node_id);
                if let Some(target) = target {
                    debug!(shard = %copy, from = %node_id, to = %target, "moving shard that cannot remain");
                    allocation.routing_nodes.relocate_shard(&copy.shard_id, node_id, &target);
                } else {
                    debug!(shard = %copy, node = %node_id, "copy cannot remain but no node accepts it");
                }
            }
        }
    }

    /// The lightest node (other than `exclude`) the deciders accept for this
    /// copy, if any.
    fn best_target(
        &self,
        factors: WeightFactors,
        allocation: &RoutingAllocation,
        shard: &ShardRouting,
        exclude: &str,
    ) -> Option<String> {
        let deciders = Arc::clone(&allocation.deciders);
        let mut best: Option<(f64, String)> = None;
        for node in allocation.routing_nodes.nodes() {
            if node.node_id() == exclude {
                continue;
            }
            if !deciders.can_allocate(shard, node, allocation).is_yes() {
                continue;
            }
            let weight = self.weight(factors, allocation, node.node_id(), &shard.shard_id.index);
            let better = best
                .as_ref()
                .is_none_or(|(w, id)| weight < *w || (weight == *w && node.node_id() < id.as_str()));
            if better {
                best = Some((weight, node.node_id().to_string()));
            }
        }
        best.map(|(_, id)| id)
    }

    /// Moves copies from the heaviest to the lightest node while the weight
    /// gap exceeds the threshold and the deciders allow it.
    fn rebalance(&self, allocation: &mut RoutingAllocation) {
        let deciders = Arc::clone(&allocation.deciders);
        let factors = self.factors.get();
        let indices: Vec<String> = allocation.state.indices.keys().cloned().collect();

        loop {
            let mut proposal: Option<(f64, ShardId, String, String)> = None;
            for index in &indices {
                let mut weights: Vec<(f64, String)> = allocation
                    .routing_nodes
                    .node_ids()
                    .map(|id| (self.weight(factors, allocation, id, index), id.to_string()))
                    .collect();
                weights.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
                let Some(((lightest_w, lightest), (heaviest_w, heaviest))) =
                    weights.first().cloned().zip(weights.last().cloned())
                else {
                    continue;
                };
                let delta = heaviest_w - lightest_w;
                if delta <= factors.threshold {
                    continue;
                }
                // Candidate copies on the heavy node, in shard order.
                let candidates: Vec<ShardRouting> = allocation
                    .routing_nodes
                    .node(&heaviest)
                    .map_or_else(Vec::new, |n| {
                        n.shards()
                            .iter()
                            .filter(|s| {
                                s.shard_id.index == *index
                                    && s.state == ShardRoutingState::Started
                            })
                            .cloned()
                            .collect()
                    });
                for copy in candidates {
                    if !deciders.can_rebalance(&copy, allocation).is_yes() {
                        continue;
                    }
                    let target =
                        allocation.routing_nodes.node(&lightest).expect("node exists");
                    if !deciders.can_allocate(&copy, target, allocation).is_yes() {
                        continue;
                    }
                    let better = proposal.as_ref().is_none_or(|(d, ..)| delta > *d);
                    if better {
                        proposal =
                            Some((delta, copy.shard_id.clone(), heaviest.clone(), lightest.clone()));
                    }
                    break;
                }
            }
            let Some((delta, shard_id, from, to)) = proposal else {
                break;
            };
            debug!(shard = %shard_id, from = %from, to = %to, delta, "rebalancing shard copy");
            allocation.routing_nodes.relocate_shard(&shard_id, &from, &to);
        }
    }
}

impl ShardsAllocator for BalancedShardsAllocator {
    fn allocate(&self, allocation: &mut RoutingAllocation) {
        self.allocate_unassigned(allocation);
        self.move_shards(allocation);
        self.rebalance(allocation);
    }
}
