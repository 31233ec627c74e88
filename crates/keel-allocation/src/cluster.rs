//! Cluster-state snapshot types consumed by the allocation engine.
//!
//! The engine does not own discovery, consensus, or info collection; it is
//! handed an immutable [`ClusterState`] snapshot and produces a new one.
//! States are shared as `Arc<ClusterState>` so an allocation pass that
//! changes nothing can hand back the very same instance, which callers use
//! to skip spurious publications.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use keel_core::FilterRules;

use crate::routing::{AllocationId, RoutingTable, ShardId};

/// A node known to the cluster, with its placement-relevant attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    /// Unique node id.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Host the node runs on; used by same-host exclusion.
    pub host: String,
    /// Arbitrary attributes (zone, tier, ...) consulted by deciders.
    pub attributes: BTreeMap<String, String>,
}

impl DiscoveryNode {
    /// Creates a node with no attributes.
    #[must_use]
    pub fn new(id: impl Into<String>, host: impl Into<String>) -> Self {
        let id = id.into();
        Self { name: id.clone(), id, host: host.into(), attributes: BTreeMap::new() }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Per-index metadata the engine needs for allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Index name.
    pub index: String,
    /// Index UUID.
    pub uuid: String,
    /// Number of primary shards (fixed at creation).
    pub number_of_shards: u32,
    /// Number of replicas per shard.
    pub number_of_replicas: u32,
    /// Creation order, used as a deterministic allocation tie-break.
    pub creation_order: u64,
    /// Index-level node filters.
    pub filters: FilterRules,
}

impl IndexMetadata {
    /// Creates metadata for an index.
    #[must_use]
    pub fn new(
        index: impl Into<String>,
        uuid: impl Into<String>,
        number_of_shards: u32,
        number_of_replicas: u32,
    ) -> Self {
        Self {
            index: index.into(),
            uuid: uuid.into(),
            number_of_shards,
            number_of_replicas,
            creation_order: 0,
            filters: FilterRules::default(),
        }
    }

    /// Sets the creation order.
    #[must_use]
    pub fn with_creation_order(mut self, order: u64) -> Self {
        self.creation_order = order;
        self
    }

    /// Sets index-level filters.
    #[must_use]
    pub fn with_filters(mut self, filters: FilterRules) -> Self {
        self.filters = filters;
        self
    }
}

/// Disk usage of one node, as reported by the info-collection service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    /// Total capacity in bytes.
    pub total_bytes: u64,
    /// Bytes currently used.
    pub used_bytes: u64,
}

impl DiskUsage {
    /// Fraction of capacity in use.
    #[must_use]
    pub fn used_fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64
    }

    /// Fraction of capacity in use after writing `extra_bytes` more.
    #[must_use]
    pub fn fraction_after(&self, extra_bytes: u64) -> f64 {
        if self.total_bytes == 0 {
            return 1.0;
        }
        (self.used_bytes + extra_bytes) as f64 / self.total_bytes as f64
    }
}

/// An on-disk shard copy left on a node by a previous assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCopy {
    /// Node holding the data.
    pub node_id: String,
    /// Allocation id the data was written under.
    pub allocation_id: AllocationId,
}

/// Point-in-time cluster information collected outside the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    /// Disk usage per node id.
    pub disk_usage: BTreeMap<String, DiskUsage>,
    /// Size in bytes of each shard (primary copy size).
    pub shard_sizes: BTreeMap<ShardId, u64>,
    /// On-disk copies retained from previous assignments, per shard.
    pub stored_copies: BTreeMap<ShardId, Vec<StoredCopy>>,
}

impl ClusterInfo {
    /// Estimated size of a shard, zero when unknown.
    #[must_use]
    pub fn shard_size(&self, shard_id: &ShardId) -> u64 {
        self.shard_sizes.get(shard_id).copied().unwrap_or(0)
    }
}

/// Shards with a snapshot currently being taken.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotsInProgress {
    /// Shard ids being snapshotted.
    pub shards: std::collections::BTreeSet<ShardId>,
}

/// Shards currently being restored from a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreInProgress {
    /// Shard ids being restored.
    pub shards: std::collections::BTreeSet<ShardId>,
}

/// An immutable snapshot of everything the engine needs for one pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Monotonic state version; bumped whenever routing changes.
    pub version: u64,
    /// Live nodes by id.
    pub nodes: BTreeMap<String, DiscoveryNode>,
    /// Index metadata by name.
    pub indices: BTreeMap<String, IndexMetadata>,
    /// The published routing table.
    pub routing_table: RoutingTable,
    /// Disk/shard-size/stored-copy info.
    pub info: ClusterInfo,
    /// In-flight snapshots.
    pub snapshots: SnapshotsInProgress,
    /// In-flight restores.
    pub restores: RestoreInProgress,
}

impl ClusterState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a state with a node added.
    #[must_use]
    pub fn with_node(mut self, node: DiscoveryNode) -> Self {
        self.nodes.insert(node.id.clone(), node);
        self
    }

    /// Returns a state with a node removed.
    #[must_use]
    pub fn without_node(mut self, node_id: &str) -> Self {
        self.nodes.remove(node_id);
        self
    }

    /// Returns a state with an index created: metadata registered and all
    /// its copies unassigned in the routing table.
    #[must_use]
    pub fn with_index(mut self, mut metadata: IndexMetadata) -> Self {
        if metadata.creation_order == 0 {
            metadata.creation_order = self.indices.len() as u64 + 1;
        }
        self.routing_table = self.routing_table.with_new_index(
            metadata.index.clone(),
            metadata.uuid.clone(),
            metadata.number_of_shards,
            metadata.number_of_replicas,
        );
        self.indices.insert(metadata.index.clone(), metadata);
        self
    }

    /// Returns a state with an index deleted.
    #[must_use]
    pub fn without_index(mut self, index: &str) -> Self {
        self.indices.remove(index);
        self.routing_table = self.routing_table.without_index(index);
        self
    }

    /// Returns a state with updated cluster info.
    #[must_use]
    pub fn with_info(mut self, info: ClusterInfo) -> Self {
        self.info = info;
        self
    }

    /// Returns a state with a replaced routing table and a bumped version.
    #[must_use]
    pub fn with_routing_table(mut self, routing_table: RoutingTable) -> Self {
        self.routing_table = routing_table;
        self.version += 1;
        self
    }

    /// The host a node runs on, if the node is known.
    #[must_use]
    pub fn host_of(&self, node_id: &str) -> Option<&str> {
        self.nodes.get(node_id).map(|n| n.host.as_str())
    }
}
