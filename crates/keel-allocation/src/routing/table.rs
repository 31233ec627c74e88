//! The published routing table.
//!
//! The routing table is the durable output of an allocation pass: for every
//! index, for every shard, where each copy lives (or that it is unassigned).
//! It is an immutable value; passes rebuild it wholesale from the working
//! copy rather than mutating it in place.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::shard::{ShardId, ShardRouting, ShardRoutingState};
use super::unassigned::{UnassignedInfo, UnassignedReason};

/// All copies of one shard: the primary first, then replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTable {
    /// The shard these copies belong to.
    pub shard_id: ShardId,
    /// The copies; exactly one has `primary == true` and it is first.
    pub copies: Vec<ShardRouting>,
}

impl ShardTable {
    fn new(shard_id: ShardId, mut copies: Vec<ShardRouting>) -> Self {
        debug_assert_eq!(
            copies.iter().filter(|c| c.primary).count(),
            1,
            "exactly one primary per shard: {shard_id}"
        );
        // Primary first, then replicas by node id for stable output.
        copies.sort_by(|a, b| {
            b.primary.cmp(&a.primary).then_with(|| a.current_node_id.cmp(&b.current_node_id))
        });
        Self { shard_id, copies }
    }

    /// The primary copy.
    #[must_use]
    pub fn primary(&self) -> &ShardRouting {
        &self.copies[0]
    }

    /// The replica copies.
    #[must_use]
    pub fn replicas(&self) -> &[ShardRouting] {
        &self.copies[1..]
    }

    /// True if every copy is started or relocating.
    #[must_use]
    pub fn all_active(&self) -> bool {
        self.copies.iter().all(ShardRouting::is_active)
    }
}

/// Routing for all shards of one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRoutingTable {
    /// Index name.
    pub index: String,
    /// Index UUID.
    pub index_uuid: String,
    /// One entry per shard number, in order.
    pub shards: Vec<ShardTable>,
}

/// The assignment of every shard copy to a node (or to nothing).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    indices: BTreeMap<String, IndexRoutingTable>,
}

impl RoutingTable {
    /// Creates an empty routing table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a table with routing for a freshly created index added: every
    /// copy unassigned with reason `IndexCreated`.
    #[must_use]
    pub fn with_new_index(
        mut self,
        index: impl Into<String>,
        index_uuid: impl Into<String>,
        number_of_shards: u32,
        number_of_replicas: u32,
    ) -> Self {
        let index = index.into();
        let index_uuid = index_uuid.into();
        let shards = (0..number_of_shards)
            .map(|n| {
                let shard_id = ShardId::new(index.clone(), index_uuid.clone(), n);
                let mut copies = vec![ShardRouting::unassigned(
                    shard_id.clone(),
                    true,
                    UnassignedInfo::new(UnassignedReason::IndexCreated, "index created"),
                )];
                for _ in 0..number_of_replicas {
                    copies.push(ShardRouting::unassigned(
                        shard_id.clone(),
                        false,
                        UnassignedInfo::new(UnassignedReason::IndexCreated, "index created"),
                    ));
                }
                ShardTable::new(shard_id, copies)
            })
            .collect();
        self.indices.insert(
            index.clone(),
            IndexRoutingTable { index, index_uuid, shards },
        );
        self
    }

    /// Returns a table with the index's replica count changed: new replicas
    /// appear unassigned with reason `ReplicaAdded`; surplus unassigned
    /// replicas are dropped first, then assigned ones.
    #[must_use]
    pub fn with_replica_count(mut self, index: &str, number_of_replicas: u32) -> Self {
        let Some(index_table) = self.indices.get_mut(index) else {
            return self;
        };
        for shard in &mut index_table.shards {
            let current = shard.copies.len() - 1;
            let target = number_of_replicas as usize;
            if target > current {
                for _ in current..target {
                    shard.copies.push(ShardRouting::unassigned(
                        shard.shard_id.clone(),
                        false,
                        UnassignedInfo::new(UnassignedReason::ReplicaAdded, "replica added"),
                    ));
                }
            } else if target < current {
                let mut to_remove = current - target;
                // Unassigned replicas go first; they carry no data.
                shard.copies.retain(|c| {
                    if to_remove > 0 && !c.primary && c.is_unassigned() {
                        to_remove -= 1;
                        false
                    } else {
                        true
                    }
                });
                while to_remove > 0 {
                    let pos = shard
                        .copies
                        .iter()
                        .rposition(|c| !c.primary)
                        .expect("replica to remove");
                    shard.copies.remove(pos);
                    to_remove -= 1;
                }
            }
        }
        self
    }

    /// Returns a table without the given index.
    #[must_use]
    pub fn without_index(mut self, index: &str) -> Self {
        self.indices.remove(index);
        self
    }

    /// Rebuilds a table from all copies produced by an allocation pass.
    ///
    /// `copies` must contain every copy of every shard of every index in the
    /// previous table.
    #[must_use]
    pub fn rebuild(previous: &RoutingTable, copies: Vec<ShardRouting>) -> Self {
        let mut by_shard: BTreeMap<ShardId, Vec<ShardRouting>> = BTreeMap::new();
        for copy in copies {
            by_shard.entry(copy.shard_id.clone()).or_default().push(copy);
        }
        let indices = previous
            .indices
            .values()
            .map(|index_table| {
                let shards = index_table
                    .shards
                    .iter()
                    .map(|shard| {
                        let copies = by_shard
                            .remove(&shard.shard_id)
                            .expect("pass must preserve every shard");
                        debug_assert_eq!(copies.len(), shard.copies.len());
                        ShardTable::new(shard.shard_id.clone(), copies)
                    })
                    .collect();
                (
                    index_table.index.clone(),
                    IndexRoutingTable {
                        index: index_table.index.clone(),
                        index_uuid: index_table.index_uuid.clone(),
                        shards,
                    },
                )
            })
            .collect();
        Self { indices }
    }

    /// Routing for one index.
    #[must_use]
    pub fn index(&self, index: &str) -> Option<&IndexRoutingTable> {
        self.indices.get(index)
    }

    /// The indices in the table, in name order.
    pub fn indices(&self) -> impl Iterator<Item = &IndexRoutingTable> {
        self.indices.values()
    }

    /// Routing for one shard.
    #[must_use]
    pub fn shard(&self, index: &str, shard: u32) -> Option<&ShardTable> {
        self.indices.get(index)?.shards.get(shard as usize)
    }

    /// Every copy of every shard, in deterministic order.
    pub fn all_copies(&self) -> impl Iterator<Item = &ShardRouting> {
        self.indices.values().flat_map(|i| i.shards.iter()).flat_map(|s| s.copies.iter())
    }

    /// Number of copies in the given state across the whole table.
    #[must_use]
    pub fn count_with_state(&self, state: ShardRoutingState) -> usize {
        self.all_copies().filter(|c| c.state == state).count()
    }
}
