//! Per-pass allocation context.
//!
//! A [`RoutingAllocation`] bundles everything one allocation pass needs: the
//! decider chain, the mutable routing working copy, and the immutable
//! cluster-state snapshot. It lives for exactly one pass and is never
//! persisted or shared across passes.

use std::sync::Arc;
use std::time::Instant;

use crate::cluster::{ClusterState, DiskUsage, IndexMetadata, StoredCopy};
use crate::decider::AllocationDeciders;
use crate::routing::{RoutingNodes, ShardId};

/// Transient context for a single allocation pass.
#[derive(Debug)]
pub struct RoutingAllocation {
    /// The decider chain consulted for every candidate placement.
    pub deciders: Arc<AllocationDeciders>,
    /// The mutable working copy of the routing table.
    pub routing_nodes: RoutingNodes,
    /// The immutable cluster-state snapshot the pass is based on.
    pub state: Arc<ClusterState>,
    /// When true, deciders do not short-circuit and full rationale is kept.
    pub explain: bool,
    /// Monotonic reading taken when the pass started.
    pub started_at: Instant,
}

impl RoutingAllocation {
    /// Creates the context for one pass over the given snapshot.
    #[must_use]
    pub fn new(deciders: Arc<AllocationDeciders>, state: Arc<ClusterState>, explain: bool) -> Self {
        let routing_nodes = RoutingNodes::build(state.nodes.keys().cloned(), &state.routing_table);
        Self { deciders, routing_nodes, state, explain, started_at: Instant::now() }
    }

    /// Metadata of an index, if it exists.
    #[must_use]
    pub fn metadata(&self, index: &str) -> Option<&IndexMetadata> {
        self.state.indices.get(index)
    }

    /// Estimated size of a shard in bytes (zero when unknown).
    #[must_use]
    pub fn shard_size(&self, shard_id: &ShardId) -> u64 {
        self.state.info.shard_size(shard_id)
    }

    /// Disk usage of a node, if reported.
    #[must_use]
    pub fn disk_usage(&self, node_id: &str) -> Option<DiskUsage> {
        self.state.info.disk_usage.get(node_id).copied()
    }

    /// On-disk copies of a shard retained from previous assignments.
    #[must_use]
    pub fn stored_copies(&self, shard_id: &ShardId) -> &[StoredCopy] {
        self.state
            .info
            .stored_copies
            .get(shard_id)
            .map_or(&[], Vec::as_slice)
    }

    /// The host a node runs on, if known.
    #[must_use]
    pub fn host_of(&self, node_id: &str) -> Option<&str> {
        self.state.host_of(node_id)
    }
}
