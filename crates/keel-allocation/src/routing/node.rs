//! Per-node view of assigned shard copies.

use serde::{Deserialize, Serialize};

use super::shard::{ShardId, ShardRouting, ShardRoutingState};

/// The shard copies currently assigned to one node.
///
/// This is a working view used during an allocation pass; the copies are kept
/// in insertion order and a `Relocating` copy lives on its *source* node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingNode {
    node_id: String,
    shards: Vec<ShardRouting>,
}

impl RoutingNode {
    /// Creates an empty view for a node.
    #[must_use]
    pub fn new(node_id: impl Into<String>) -> Self {
        Self { node_id: node_id.into(), shards: Vec::new() }
    }

    /// The node's id.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The copies assigned to this node, in assignment order.
    #[must_use]
    pub fn shards(&self) -> &[ShardRouting] {
        &self.shards
    }

    /// Number of copies in the given state.
    #[must_use]
    pub fn shards_with_state(&self, state: ShardRoutingState) -> usize {
        self.shards.iter().filter(|s| s.state == state).count()
    }

    /// Number of copies this node owns. A relocation source no longer
    /// counts; its copy is on the way to the target node.
    #[must_use]
    pub fn owning_shard_count(&self) -> usize {
        self.shards.iter().filter(|s| s.state != ShardRoutingState::Relocating).count()
    }

    /// Number of copies of the given index on this node.
    #[must_use]
    pub fn index_shard_count(&self, index: &str) -> usize {
        self.shards.iter().filter(|s| s.shard_id.index == index).count()
    }

    /// Returns the copy of the given shard on this node, if any.
    #[must_use]
    pub fn copy_of(&self, shard_id: &ShardId) -> Option<&ShardRouting> {
        self.shards.iter().find(|s| &s.shard_id == shard_id)
    }

    /// True if this node holds a copy of the given shard.
    #[must_use]
    pub fn has_copy_of(&self, shard_id: &ShardId) -> bool {
        self.copy_of(shard_id).is_some()
    }

    pub(crate) fn add(&mut self, shard: ShardRouting) {
        debug_assert!(shard.assigned_to(&self.node_id), "copy must be assigned here");
        debug_assert!(!self.has_copy_of(&shard.shard_id), "one copy per shard per node");
        shard.assert_consistent();
        self.shards.push(shard);
    }

    pub(crate) fn remove(&mut self, shard_id: &ShardId) -> Option<ShardRouting> {
        let pos = self.shards.iter().position(|s| &s.shard_id == shard_id)?;
        Some(self.shards.remove(pos))
    }

    pub(crate) fn replace(&mut self, shard: ShardRouting) {
        let pos = self
            .shards
            .iter()
            .position(|s| s.shard_id == shard.shard_id)
            .expect("replace requires an existing copy");
        shard.assert_consistent();
        self.shards[pos] = shard;
    }
}
