//! Shard identity and per-copy routing state.
//!
//! A [`ShardRouting`] describes one copy (primary or replica) of a shard and
//! moves through a small state machine:
//!
//! ```text
//! Unassigned ──initialize──▶ Initializing ──started──▶ Started
//!     ▲                           │                       │
//!     └────────── fail ───────────┘          relocate ────▼
//!                                            Relocating ──started──▶ Started (on target)
//!                                                 │
//!                                          cancel_relocation ──▶ Started (on source)
//! ```
//!
//! Routings are immutable value types; every transition returns a new value.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::unassigned::UnassignedInfo;

/// Identity of a shard: one partition of one index.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShardId {
    /// Index name.
    pub index: String,
    /// Shard number within the index.
    pub shard: u32,
    /// UUID of the index, distinguishing recreated indices of the same name.
    pub index_uuid: String,
}

impl ShardId {
    /// Creates a new shard id.
    #[must_use]
    pub fn new(index: impl Into<String>, index_uuid: impl Into<String>, shard: u32) -> Self {
        Self { index: index.into(), shard, index_uuid: index_uuid.into() }
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}][{}]", self.index, self.shard)
    }
}

/// Opaque token identifying one attempt to host a shard copy on a node.
///
/// A fresh id is minted when a copy starts initializing; a copy recovered
/// from on-disk data keeps the id it was stored under.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AllocationId(Uuid);

impl AllocationId {
    /// Mints a fresh allocation id.
    #[must_use]
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for AllocationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a shard copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardRoutingState {
    /// Not allocated to any node.
    Unassigned,
    /// Allocated to a node and recovering.
    Initializing,
    /// Active and serving.
    Started,
    /// Active on the source node while moving to another node.
    Relocating,
}

/// One copy of a shard and where it lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRouting {
    /// The shard this copy belongs to.
    pub shard_id: ShardId,
    /// Whether this copy is the primary.
    pub primary: bool,
    /// Node currently holding the copy (None iff unassigned).
    pub current_node_id: Option<String>,
    /// Relocation target node (Some iff state is Relocating).
    pub relocating_node_id: Option<String>,
    /// Allocation id (Some iff initializing/started/relocating).
    pub allocation_id: Option<AllocationId>,
    /// Lifecycle state.
    pub state: ShardRoutingState,
    /// Why the copy is (or was last) unassigned. Retained through recovery
    /// and cleared once the copy starts.
    pub unassigned_info: Option<UnassignedInfo>,
}

impl ShardRouting {
    /// Creates an unassigned copy.
    #[must_use]
    pub fn unassigned(shard_id: ShardId, primary: bool, info: UnassignedInfo) -> Self {
        Self {
            shard_id,
            primary,
            current_node_id: None,
            relocating_node_id: None,
            allocation_id: None,
            state: ShardRoutingState::Unassigned,
            unassigned_info: Some(info),
        }
    }

    /// Begins initializing this copy on a node.
    ///
    /// `existing` carries the allocation id of an on-disk copy being reused;
    /// a fresh id is minted otherwise. The unassigned info is retained until
    /// the copy starts, so failure counters survive a failed recovery.
    ///
    /// # Panics
    ///
    /// Panics if the copy is not unassigned.
    #[must_use]
    pub fn initialize(self, node_id: impl Into<String>, existing: Option<AllocationId>) -> Self {
        assert_eq!(self.state, ShardRoutingState::Unassigned, "can only initialize unassigned");
        Self {
            current_node_id: Some(node_id.into()),
            allocation_id: Some(existing.unwrap_or_else(AllocationId::fresh)),
            state: ShardRoutingState::Initializing,
            ..self
        }
    }

    /// Marks an initializing copy as started, or completes a relocation by
    /// moving the copy onto its target node.
    ///
    /// # Panics
    ///
    /// Panics if the copy is neither initializing nor relocating.
    #[must_use]
    pub fn started(self) -> Self {
        match self.state {
            ShardRoutingState::Initializing => Self {
                state: ShardRoutingState::Started,
                unassigned_info: None,
                ..self
            },
            ShardRoutingState::Relocating => Self {
                current_node_id: self.relocating_node_id.clone(),
                relocating_node_id: None,
                allocation_id: Some(AllocationId::fresh()),
                state: ShardRoutingState::Started,
                unassigned_info: None,
                ..self
            },
            other => panic!("cannot start a shard copy in state {other:?}"),
        }
    }

    /// Begins relocating this started copy to another node.
    ///
    /// # Panics
    ///
    /// Panics if the copy is not started.
    #[must_use]
    pub fn relocate(self, target_node_id: impl Into<String>) -> Self {
        assert_eq!(self.state, ShardRoutingState::Started, "can only relocate started");
        Self {
            relocating_node_id: Some(target_node_id.into()),
            state: ShardRoutingState::Relocating,
            ..self
        }
    }

    /// Cancels an in-flight relocation, leaving the copy started on its
    /// source node.
    ///
    /// # Panics
    ///
    /// Panics if the copy is not relocating.
    #[must_use]
    pub fn cancel_relocation(self) -> Self {
        assert_eq!(self.state, ShardRoutingState::Relocating, "not relocating");
        Self {
            relocating_node_id: None,
            state: ShardRoutingState::Started,
            ..self
        }
    }

    /// Moves this copy back to unassigned with the given info.
    #[must_use]
    pub fn moved_to_unassigned(self, info: UnassignedInfo) -> Self {
        Self {
            current_node_id: None,
            relocating_node_id: None,
            allocation_id: None,
            state: ShardRoutingState::Unassigned,
            unassigned_info: Some(info),
            ..self
        }
    }

    /// Demotes or promotes this copy.
    #[must_use]
    pub fn with_primary(self, primary: bool) -> Self {
        Self { primary, ..self }
    }

    /// True if the copy is started or relocating (serving traffic).
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self.state, ShardRoutingState::Started | ShardRoutingState::Relocating)
    }

    /// True if the copy is unassigned.
    #[must_use]
    pub fn is_unassigned(&self) -> bool {
        self.state == ShardRoutingState::Unassigned
    }

    /// True if the copy is assigned to the given node (as current holder).
    #[must_use]
    pub fn assigned_to(&self, node_id: &str) -> bool {
        self.current_node_id.as_deref() == Some(node_id)
    }

    /// Checks the state-machine invariants; used by the working copy.
    pub(crate) fn assert_consistent(&self) {
        debug_assert_eq!(
            self.relocating_node_id.is_some(),
            self.state == ShardRoutingState::Relocating,
            "relocating_node_id set iff relocating: {self:?}"
        );
        debug_assert_eq!(
            self.allocation_id.is_some(),
            self.state != ShardRoutingState::Unassigned,
            "allocation_id set iff assigned: {self:?}"
        );
        debug_assert_eq!(
            self.current_node_id.is_some(),
            self.state != ShardRoutingState::Unassigned,
            "current_node_id set iff assigned: {self:?}"
        );
    }
}

impl std::fmt::Display for ShardRouting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[{}], node[{}], state[{:?}]",
            self.shard_id,
            if self.primary { "P" } else { "R" },
            self.current_node_id.as_deref().unwrap_or("-"),
            self.state
        )?;
        if let Some(target) = &self.relocating_node_id {
            write!(f, ", relocating to [{target}]")?;
        }
        Ok(())
    }
}
