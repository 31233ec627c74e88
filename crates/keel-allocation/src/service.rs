//! Allocation orchestration.
//!
//! [`AllocationService`] is the engine's entry point. Every operation takes
//! an `Arc<ClusterState>` snapshot and returns a new one; a pass that changes
//! nothing returns the *same* `Arc`, so callers can detect no-ops with
//! `Arc::ptr_eq` and skip publishing. The service itself holds no routing
//! state between calls.

use std::sync::Arc;

use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use keel_core::{Result, SettingsBus};

use crate::allocation::RoutingAllocation;
use crate::allocator::{
    BalancedShardsAllocator, ExistingShardsAllocator, GatewayAllocator, ShardsAllocator,
};
use crate::cluster::ClusterState;
use crate::command::{AllocationCommand, CommandExplanation};
use crate::decider::AllocationDeciders;
use crate::routing::{RoutingTable, ShardRouting, ShardRoutingState};

/// A shard copy that failed on its node, as reported by the cluster.
#[derive(Debug, Clone)]
pub struct FailedShard {
    /// The copy that failed, as last published.
    pub routing: ShardRouting,
    /// What went wrong, recorded on the unassigned copy.
    pub message: String,
}

/// Outcome of a command-driven reroute.
#[derive(Debug)]
pub struct CommandsResult {
    /// The resulting cluster state.
    pub state: Arc<ClusterState>,
    /// One explanation per executed command, in order.
    pub explanations: Vec<CommandExplanation>,
}

/// Runs allocation passes: gateway allocators first, then the general
/// allocator, then the routing table rebuild.
pub struct AllocationService {
    deciders: Arc<AllocationDeciders>,
    gateway_allocators: Vec<Box<dyn ExistingShardsAllocator>>,
    allocator: Box<dyn ShardsAllocator>,
}

impl AllocationService {
    /// Creates a service from explicit parts.
    #[must_use]
    pub fn new(
        deciders: Arc<AllocationDeciders>,
        gateway_allocators: Vec<Box<dyn ExistingShardsAllocator>>,
        allocator: Box<dyn ShardsAllocator>,
    ) -> Self {
        Self { deciders, gateway_allocators, allocator }
    }

    /// Creates the production setup: the standard decider chain, the gateway
    /// allocator, and the balanced allocator, all wired to the settings bus.
    pub fn standard(bus: &SettingsBus) -> Result<Self> {
        Ok(Self::new(
            AllocationDeciders::standard(bus)?,
            vec![Box::new(GatewayAllocator::new())],
            Box::new(BalancedShardsAllocator::new(bus)),
        ))
    }

    /// The decider chain this service consults.
    #[must_use]
    pub fn deciders(&self) -> &Arc<AllocationDeciders> {
        &self.deciders
    }

    /// Runs a full allocation pass. Returns the same `Arc` when the pass
    /// changes nothing.
    #[must_use]
    pub fn reroute(&self, state: &Arc<ClusterState>, reason: &str) -> Arc<ClusterState> {
        let mut allocation =
            RoutingAllocation::new(Arc::clone(&self.deciders), Arc::clone(state), false);
        self.run_allocators(&mut allocation);
        self.finish(state, allocation, reason)
    }

    /// Applies shard failures and reroutes. Each failure moves the copy back
    /// to unassigned with its failure counter bumped and the failing node
    /// recorded; a failed relocation reverts to its source, and a failed
    /// primary hands over to an active replica when one exists.
    #[must_use]
    pub fn apply_failed_shards(
        &self,
        state: &Arc<ClusterState>,
        failures: &[FailedShard],
    ) -> Arc<ClusterState> {
        let mut allocation =
            RoutingAllocation::new(Arc::clone(&self.deciders), Arc::clone(state), false);
        for failure in failures {
            warn!(shard = %failure.routing, message = %failure.message, "shard failed");
            allocation.routing_nodes.fail_shard(&failure.routing, &failure.message);
            counter!("allocation_failed_shards_total").increment(1);
        }
        self.run_allocators(&mut allocation);
        self.finish(state, allocation, "shards failed")
    }

    /// Marks recoveries as completed and reroutes. Starting a copy clears its
    /// failure bookkeeping; starting a relocating copy completes the move.
    #[must_use]
    pub fn apply_started_shards(
        &self,
        state: &Arc<ClusterState>,
        started: &[ShardRouting],
    ) -> Arc<ClusterState> {
        let mut allocation =
            RoutingAllocation::new(Arc::clone(&self.deciders), Arc::clone(state), false);
        for routing in started {
            if allocation.routing_nodes.start_shard(routing).is_some() {
                debug!(shard = %routing, "shard started");
            } else {
                debug!(shard = %routing, "stale start notification ignored");
            }
        }
        self.run_allocators(&mut allocation);
        self.finish(state, allocation, "shards started")
    }

    /// Executes operator commands, then runs the automatic pass.
    ///
    /// All-or-nothing: the first rejected command aborts the call with `Err`
    /// and the input state stands. With `retry_failed`, failure counters on
    /// every unassigned copy are cleared before anything else, giving
    /// exhausted shards a fresh retry budget. With `explain`, deciders do not
    /// short-circuit and the returned explanations carry every verdict.
    pub fn reroute_with_commands(
        &self,
        state: &Arc<ClusterState>,
        commands: &[AllocationCommand],
        explain: bool,
        retry_failed: bool,
    ) -> Result<CommandsResult> {
        let mut allocation =
            RoutingAllocation::new(Arc::clone(&self.deciders), Arc::clone(state), explain);
        if retry_failed {
            Self::reset_failure_counters(&mut allocation);
        }
        let mut explanations = Vec::with_capacity(commands.len());
        for command in commands {
            info!(%command, "executing allocation command");
            explanations.push(command.execute(&mut allocation)?);
        }
        self.run_allocators(&mut allocation);
        let state = self.finish(state, allocation, "operator commands");
        Ok(CommandsResult { state, explanations })
    }

    fn reset_failure_counters(allocation: &mut RoutingAllocation) {
        let pending = allocation.routing_nodes.take_unassigned();
        for shard in pending {
            match &shard.unassigned_info {
                Some(info)
                    if info.failed_allocations > 0 || !info.failed_node_ids.is_empty() =>
                {
                    debug!(shard = %shard, "clearing allocation failure counters");
                    let reset = info.reset_failures();
                    allocation.routing_nodes.push_unassigned(
                        ShardRouting { unassigned_info: Some(reset), ..shard },
                        true,
                    );
                }
                _ => allocation.routing_nodes.push_unassigned(shard, false),
            }
        }
    }

    fn run_allocators(&self, allocation: &mut RoutingAllocation) {
        for gateway in &self.gateway_allocators {
            gateway.allocate_unassigned(allocation);
        }
        self.allocator.allocate(allocation);
    }

    /// Rebuilds the routing table from the working copy, or returns the
    /// input state untouched when the pass changed nothing.
    fn finish(
        &self,
        previous: &Arc<ClusterState>,
        allocation: RoutingAllocation,
        reason: &str,
    ) -> Arc<ClusterState> {
        if !allocation.routing_nodes.changed() {
            debug!(reason, "reroute changed nothing");
            return Arc::clone(previous);
        }
        let RoutingAllocation { routing_nodes, started_at, .. } = allocation;
        let table = RoutingTable::rebuild(&previous.routing_table, routing_nodes.into_copies());

        counter!("allocation_reroutes_total").increment(1);
        gauge!("allocation_unassigned_shards")
            .set(table.count_with_state(ShardRoutingState::Unassigned) as f64);
        gauge!("allocation_initializing_shards")
            .set(table.count_with_state(ShardRoutingState::Initializing) as f64);
        gauge!("allocation_relocating_shards")
            .set(table.count_with_state(ShardRoutingState::Relocating) as f64);

        let next = Arc::new(previous.as_ref().clone().with_routing_table(table));
        info!(
            reason,
            version = next.version,
            elapsed_us = started_at.elapsed().as_micros() as u64,
            "reroute changed the routing table"
        );
        next
    }
}

impl std::fmt::Debug for AllocationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationService")
            .field("deciders", &self.deciders)
            .field(
                "gateway_allocators",
                &self.gateway_allocators.iter().map(|a| a.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{DiscoveryNode, IndexMetadata};
    use crate::test_util::bus;

    fn service_and_state() -> (AllocationService, Arc<ClusterState>) {
        let bus = bus();
        let service = AllocationService::standard(&bus).unwrap();
        let state = Arc::new(
            ClusterState::new()
                .with_node(DiscoveryNode::new("node-1", "host-a"))
                .with_node(DiscoveryNode::new("node-2", "host-b"))
                .with_index(IndexMetadata::new("logs", "uuid-1", 2, 0)),
        );
        (service, state)
    }

    /// Drives every initializing copy to started, the way the cluster would
    /// acknowledge recoveries.
    fn start_all(service: &AllocationService, state: &Arc<ClusterState>) -> Arc<ClusterState> {
        let initializing: Vec<ShardRouting> = state
            .routing_table
            .all_copies()
            .filter(|c| c.state == ShardRoutingState::Initializing)
            .cloned()
            .collect();
        service.apply_started_shards(state, &initializing)
    }

    #[test]
    fn test_reroute_allocates_new_index() {
        let (service, state) = service_and_state();
        let next = service.reroute(&state, "index created");

        assert!(!Arc::ptr_eq(&state, &next));
        assert_eq!(next.version, state.version + 1);
        assert_eq!(next.routing_table.count_with_state(ShardRoutingState::Initializing), 2);
        assert_eq!(next.routing_table.count_with_state(ShardRoutingState::Unassigned), 0);
    }

    #[test]
    fn test_noop_reroute_returns_same_arc() {
        let (service, state) = service_and_state();
        let state = service.reroute(&state, "index created");
        let state = start_all(&service, &state);

        let again = service.reroute(&state, "periodic");
        assert!(Arc::ptr_eq(&state, &again), "settled cluster reroutes to the same state");
    }

    #[test]
    fn test_started_shards_complete_recovery() {
        let (service, state) = service_and_state();
        let state = service.reroute(&state, "index created");
        let state = start_all(&service, &state);

        assert_eq!(state.routing_table.count_with_state(ShardRoutingState::Started), 2);
        for copy in state.routing_table.all_copies() {
            assert!(copy.unassigned_info.is_none(), "start clears unassigned info");
        }
    }

    #[test]
    fn test_failed_shard_is_retried_elsewhere_or_again() {
        let (service, state) = service_and_state();
        let state = service.reroute(&state, "index created");
        let victim = state
            .routing_table
            .all_copies()
            .find(|c| c.state == ShardRoutingState::Initializing)
            .cloned()
            .unwrap();

        let next = service.apply_failed_shards(
            &state,
            &[FailedShard { routing: victim.clone(), message: "disk error".to_string() }],
        );

        // The copy is re-initialized somewhere (the other node, or the same
        // one if it remains the best candidate) with its failure recorded.
        let copy = next
            .routing_table
            .all_copies()
            .find(|c| c.shard_id == victim.shard_id && c.primary)
            .unwrap();
        assert_eq!(copy.state, ShardRoutingState::Initializing);
        assert_eq!(copy.unassigned_info.as_ref().unwrap().failed_allocations, 1);
    }

    #[test]
    fn test_commands_are_all_or_nothing() {
        let (service, state) = service_and_state();
        let good = AllocationCommand::AllocateEmptyPrimary {
            index: "logs".to_string(),
            shard: 0,
            node: "node-1".to_string(),
            accept_data_loss: true,
        };
        let bad = AllocationCommand::MoveShard {
            index: "logs".to_string(),
            shard: 1,
            from_node: "node-1".to_string(),
            to_node: "missing".to_string(),
        };
        let result = service.reroute_with_commands(&state, &[good, bad], false, false);
        assert!(result.is_err(), "one bad command rejects the batch");
        assert_eq!(
            state.routing_table.count_with_state(ShardRoutingState::Unassigned),
            2,
            "input state is untouched"
        );
    }

    #[test]
    fn test_explain_mode_collects_full_rationale() {
        let (service, state) = service_and_state();
        let state = service.reroute(&state, "index created");
        let state = start_all(&service, &state);

        let command = AllocationCommand::MoveShard {
            index: "logs".to_string(),
            shard: 0,
            from_node: state
                .routing_table
                .shard("logs", 0)
                .unwrap()
                .primary()
                .current_node_id
                .clone()
                .unwrap(),
            to_node: "node-2".to_string(),
        };
        // The move may be rejected (copy already there); either way the
        // explanation, when produced, is a Multi of all decider verdicts.
        if let Ok(result) = service.reroute_with_commands(&state, &[command], true, false) {
            let decision = result.explanations[0].decision.as_ref().unwrap();
            assert!(matches!(decision, crate::decision::Decision::Multi { .. }));
        }
    }
}
