//! Shard allocation engine.
//!
//! This crate decides which node hosts each copy of each shard: it places
//! unassigned copies, moves copies off nodes that can no longer hold them,
//! and rebalances load across the cluster.
//!
//! # Overview
//!
//! The engine is a pure function over cluster-state snapshots:
//! - Takes an `Arc<ClusterState>` and returns a new one (or the *same* `Arc`
//!   when nothing changed, detectable with `Arc::ptr_eq`)
//! - Holds no routing state between passes; the only mutable state is the
//!   dynamic settings cells
//! - Is deterministic: the same snapshot always produces the same placement
//!
//! # Architecture
//!
//! ```text
//!                        ┌──────────────────────┐
//!   Arc<ClusterState> ──▶│  AllocationService   │──▶ Arc<ClusterState>
//!                        │ reroute / commands / │    (same Arc on no-op)
//!                        │ failed / started     │
//!                        └──────────┬───────────┘
//!                                   │ builds per pass
//!                        ┌──────────▼───────────┐
//!                        │  RoutingAllocation   │  working copy (RoutingNodes)
//!                        └──────────┬───────────┘
//!                  ┌────────────────┼────────────────┐
//!                  ▼                ▼                ▼
//!          ┌──────────────┐ ┌──────────────┐ ┌──────────────┐
//!          │   Gateway    │ │   Balanced   │ │  Allocation  │
//!          │  Allocator   │ │  Allocator   │ │   Deciders   │
//!          │ (reuse disk  │ │ (weight-based│ │ (Yes/Throttle│
//!          │   copies)    │ │  placement)  │ │     /No)     │
//!          └──────────────┘ └──────────────┘ └──────────────┘
//! ```
//!
//! Both allocators consult the decider chain for every candidate placement;
//! deciders rule on one concern each (disk watermarks, awareness zones, retry
//! budgets, recovery throttling, ...) and are reconfigurable at runtime
//! through the [`keel_core::SettingsBus`].
//!
//! # Usage
//!
//! ```
//! use std::sync::Arc;
//! use keel_core::{AllocationSettings, SettingsBus};
//! use keel_allocation::{AllocationService, ClusterState, DiscoveryNode, IndexMetadata};
//!
//! let bus = SettingsBus::new(AllocationSettings::default()).unwrap();
//! let service = AllocationService::standard(&bus).unwrap();
//!
//! let state = Arc::new(
//!     ClusterState::new()
//!         .with_node(DiscoveryNode::new("node-1", "host-a"))
//!         .with_node(DiscoveryNode::new("node-2", "host-b"))
//!         .with_index(IndexMetadata::new("logs", "logs-uuid", 2, 1)),
//! );
//!
//! // Place the new index's shards.
//! let state = service.reroute(&state, "index created");
//! assert_eq!(state.version, 1);
//!
//! // A settled cluster reroutes to the exact same state.
//! let again = service.reroute(&state, "periodic");
//! assert!(Arc::ptr_eq(&state, &again));
//! ```

#![warn(missing_docs)]

pub mod allocation;
pub mod allocator;
pub mod cluster;
pub mod command;
pub mod decider;
pub mod decision;
pub mod routing;
pub mod service;

#[cfg(test)]
mod test_util;

pub use allocation::RoutingAllocation;
pub use allocator::{
    BalancedShardsAllocator, ExistingShardsAllocator, GatewayAllocator, ShardsAllocator,
};
pub use cluster::{
    ClusterInfo, ClusterState, DiscoveryNode, DiskUsage, IndexMetadata, RestoreInProgress,
    SnapshotsInProgress, StoredCopy,
};
pub use command::{AllocationCommand, CommandExplanation};
pub use decider::{AllocationDecider, AllocationDeciders};
pub use decision::{Decision, DecisionKind};
pub use routing::{
    AllocationId, AllocationStatus, RoutingNode, RoutingNodes, RoutingTable, ShardId,
    ShardRouting, ShardRoutingState, UnassignedInfo, UnassignedReason,
};
pub use service::{AllocationService, CommandsResult, FailedShard};
