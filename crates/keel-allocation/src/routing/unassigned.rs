//! Bookkeeping for unassigned shard copies.
//!
//! [`UnassignedInfo`] records why a copy is unassigned, how often allocation
//! has failed, and on which nodes. The failure counters are what keeps a
//! flapping shard from being retried forever: the max-retry decider refuses
//! placements once `failed_allocations` crosses its bound, and only an
//! explicit retry-failed reroute (or a successful start) resets them.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a shard copy is unassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnassignedReason {
    /// The index was just created.
    IndexCreated,
    /// The node holding the copy left the cluster.
    NodeLeft,
    /// The replica count of the index was raised.
    ReplicaAdded,
    /// Allocation of the copy failed on a node.
    AllocationFailed,
    /// The primary this replica was recovering from failed or was removed.
    PrimaryFailed,
    /// An operator force-allocated the primary as empty.
    ForcedEmptyPrimary,
    /// An operator cancelled the copy's allocation.
    ManualCancel,
    /// The copy was displaced by a reroute (e.g. it could no longer remain).
    Rerouted,
}

/// Outcome of the most recent allocation attempt for an unassigned copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    /// No allocation attempt has been made yet.
    #[default]
    NoAttempt,
    /// Every candidate node was refused by the deciders.
    DecidersNo,
    /// The best candidate was throttled; allocation is deferred.
    DecidersThrottled,
    /// The copy has on-disk data somewhere but no valid copy was usable.
    NoValidShardCopy,
}

/// Metadata attached to an unassigned shard copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnassignedInfo {
    /// Why the copy is unassigned.
    pub reason: UnassignedReason,
    /// Human-readable detail (failure message, command description, ...).
    pub message: String,
    /// Consecutive allocation failures since the last successful start.
    pub failed_allocations: u32,
    /// Nodes on which allocation has failed since the last reset.
    pub failed_node_ids: BTreeSet<String>,
    /// Outcome of the most recent allocation attempt.
    pub last_allocation_status: AllocationStatus,
    /// When the copy became unassigned.
    pub at: DateTime<Utc>,
}

impl UnassignedInfo {
    /// Creates info for a freshly unassigned copy.
    #[must_use]
    pub fn new(reason: UnassignedReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            failed_allocations: 0,
            failed_node_ids: BTreeSet::new(),
            last_allocation_status: AllocationStatus::NoAttempt,
            at: Utc::now(),
        }
    }

    /// Creates info for a copy that just failed on `node_id`, carrying the
    /// failure history forward from the previous info (if any).
    #[must_use]
    pub fn failure(
        previous: Option<&UnassignedInfo>,
        node_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let mut failed_node_ids =
            previous.map(|p| p.failed_node_ids.clone()).unwrap_or_default();
        failed_node_ids.insert(node_id.into());
        Self {
            reason: UnassignedReason::AllocationFailed,
            message: message.into(),
            failed_allocations: previous.map_or(0, |p| p.failed_allocations) + 1,
            failed_node_ids,
            last_allocation_status: AllocationStatus::NoAttempt,
            at: Utc::now(),
        }
    }

    /// Returns a copy with the failure counters cleared, as performed by a
    /// retry-failed reroute.
    #[must_use]
    pub fn reset_failures(&self) -> Self {
        Self {
            failed_allocations: 0,
            failed_node_ids: BTreeSet::new(),
            last_allocation_status: AllocationStatus::NoAttempt,
            ..self.clone()
        }
    }

    /// Returns a copy with an updated last-attempt status.
    #[must_use]
    pub fn with_status(&self, status: AllocationStatus) -> Self {
        Self { last_allocation_status: status, ..self.clone() }
    }
}
