//! Shared fixtures for unit tests.

use std::sync::Arc;

use keel_core::{AllocationSettings, SettingsBus};

use crate::allocation::RoutingAllocation;
use crate::cluster::ClusterState;
use crate::decider::AllocationDeciders;
use crate::routing::ShardRouting;

/// A settings bus with default settings.
pub(crate) fn bus() -> SettingsBus {
    SettingsBus::new(AllocationSettings::default()).unwrap()
}

/// A settings bus with tweaked settings.
pub(crate) fn bus_with(tweak: impl FnOnce(&mut AllocationSettings)) -> SettingsBus {
    let mut settings = AllocationSettings::default();
    tweak(&mut settings);
    SettingsBus::new(settings).unwrap()
}

/// An allocation context over the given state with an empty decider chain.
pub(crate) fn context(state: ClusterState) -> RoutingAllocation {
    RoutingAllocation::new(
        Arc::new(AllocationDeciders::new(vec![]).unwrap()),
        Arc::new(state),
        false,
    )
}

/// Initializes and starts one unassigned copy on a node, returning the
/// started routing.
pub(crate) fn assign(
    allocation: &mut RoutingAllocation,
    index: &str,
    shard: u32,
    primary: bool,
    node: &str,
) -> ShardRouting {
    let mut drained = allocation.routing_nodes.take_unassigned();
    let pos = drained
        .iter()
        .position(|s| s.shard_id.index == index && s.shard_id.shard == shard && s.primary == primary)
        .expect("no such unassigned copy");
    let copy = drained.remove(pos);
    for rest in drained {
        allocation.routing_nodes.push_unassigned(rest, false);
    }
    let initialized = allocation.routing_nodes.initialize_shard(copy, node, None);
    allocation.routing_nodes.start_shard(&initialized).expect("copy starts")
}

/// Pulls one unassigned copy out of the queue without placing it.
pub(crate) fn take_copy(
    allocation: &mut RoutingAllocation,
    index: &str,
    shard: u32,
    primary: bool,
) -> ShardRouting {
    let mut drained = allocation.routing_nodes.take_unassigned();
    let pos = drained
        .iter()
        .position(|s| s.shard_id.index == index && s.shard_id.shard == shard && s.primary == primary)
        .expect("no such unassigned copy");
    let copy = drained.remove(pos);
    for rest in drained {
        allocation.routing_nodes.push_unassigned(rest, false);
    }
    copy
}
