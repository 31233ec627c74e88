//! Mutable working copy of the routing table for one allocation pass.
//!
//! [`RoutingNodes`] is rebuilt fresh from the immutable [`RoutingTable`] at
//! the start of every pass and discarded afterwards; nothing aliases it
//! across passes. All state transitions performed by allocators and the
//! service go through the operations here, which keep the per-node views,
//! the unassigned list, and the `changed` flag consistent.

use std::collections::BTreeMap;

use tracing::debug;

use super::node::RoutingNode;
use super::shard::{AllocationId, ShardId, ShardRouting, ShardRoutingState};
use super::table::RoutingTable;
use super::unassigned::{UnassignedInfo, UnassignedReason};

/// The working copy: node id → assigned copies, plus the unassigned queue.
#[derive(Debug)]
pub struct RoutingNodes {
    nodes: BTreeMap<String, RoutingNode>,
    /// Unassigned copies awaiting allocation, primaries first.
    unassigned: Vec<ShardRouting>,
    /// Copies set aside for this pass (throttled or no usable copy).
    ignored: Vec<ShardRouting>,
    changed: bool,
}

fn unassigned_order(shard: &ShardRouting) -> (bool, ShardId) {
    (!shard.primary, shard.shard_id.clone())
}

impl RoutingNodes {
    /// Builds the working copy from the published table and the set of live
    /// nodes. Copies assigned to departed nodes move to the unassigned queue
    /// with reason `NodeLeft`; relocations targeting departed nodes are
    /// cancelled.
    #[must_use]
    pub fn build<I, S>(node_ids: I, table: &RoutingTable) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut nodes: BTreeMap<String, RoutingNode> = node_ids
            .into_iter()
            .map(Into::into)
            .map(|id| (id.clone(), RoutingNode::new(id)))
            .collect();
        let mut unassigned = Vec::new();
        let mut changed = false;

        for copy in table.all_copies() {
            let mut copy = copy.clone();
            match copy.state {
                ShardRoutingState::Unassigned => {
                    unassigned.push(copy);
                    continue;
                }
                ShardRoutingState::Relocating => {
                    let target_alive = copy
                        .relocating_node_id
                        .as_deref()
                        .is_some_and(|t| nodes.contains_key(t));
                    if !target_alive {
                        debug!(shard = %copy, "relocation target left, cancelling move");
                        copy = copy.cancel_relocation();
                        changed = true;
                    }
                }
                ShardRoutingState::Initializing | ShardRoutingState::Started => {}
            }
            let node_id = copy.current_node_id.clone().expect("assigned copy has a node");
            if let Some(node) = nodes.get_mut(&node_id) {
                node.add(copy);
            } else {
                debug!(shard = %copy, node = %node_id, "node left, copy unassigned");
                unassigned.push(copy.moved_to_unassigned(UnassignedInfo::new(
                    UnassignedReason::NodeLeft,
                    format!("node [{node_id}] left the cluster"),
                )));
                changed = true;
            }
        }

        let mut this = Self { nodes, unassigned, ignored: Vec::new(), changed };
        // A primary that lost its node hands over to an active replica.
        for i in 0..this.unassigned.len() {
            if !this.unassigned[i].primary {
                continue;
            }
            let shard_id = this.unassigned[i].shard_id.clone();
            if let Some(replacement) = this.promote_replica(&shard_id) {
                debug!(shard = %shard_id, node = %replacement, "promoted replica for lost primary");
                this.unassigned[i] = this.unassigned[i].clone().with_primary(false);
                this.changed = true;
            }
        }
        this.unassigned.sort_by_key(unassigned_order);
        this
    }

    /// The per-node view, in node-id order.
    pub fn nodes(&self) -> impl Iterator<Item = &RoutingNode> {
        self.nodes.values()
    }

    /// The live node ids, in order.
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    /// One node's view.
    #[must_use]
    pub fn node(&self, node_id: &str) -> Option<&RoutingNode> {
        self.nodes.get(node_id)
    }

    /// The unassigned queue (primaries first, then by shard id).
    #[must_use]
    pub fn unassigned(&self) -> &[ShardRouting] {
        &self.unassigned
    }

    /// Drains the unassigned queue for an allocator to process. Copies the
    /// allocator does not place must be returned via [`Self::push_unassigned`]
    /// or [`Self::ignore`].
    #[must_use]
    pub fn take_unassigned(&mut self) -> Vec<ShardRouting> {
        std::mem::take(&mut self.unassigned)
    }

    /// Returns a copy to the unassigned queue, keeping it ordered.
    ///
    /// Only a change to the copy's unassigned info marks the pass as changed;
    /// merely failing to place a copy is not a routing change.
    pub fn push_unassigned(&mut self, shard: ShardRouting, info_changed: bool) {
        debug_assert!(shard.is_unassigned());
        let pos = self
            .unassigned
            .binary_search_by_key(&unassigned_order(&shard), unassigned_order)
            .unwrap_or_else(|p| p);
        self.unassigned.insert(pos, shard);
        if info_changed {
            self.changed = true;
        }
    }

    /// Sets a copy aside for the rest of this pass (throttled, or a primary
    /// whose on-disk copies are all unreachable).
    pub fn ignore(&mut self, shard: ShardRouting, info_changed: bool) {
        debug_assert!(shard.is_unassigned());
        self.ignored.push(shard);
        if info_changed {
            self.changed = true;
        }
    }

    /// Moves ignored copies back to the unassigned queue at the end of a
    /// pass so they appear in the rebuilt table.
    pub fn restore_ignored(&mut self) {
        let ignored = std::mem::take(&mut self.ignored);
        for shard in ignored {
            let pos = self
                .unassigned
                .binary_search_by_key(&unassigned_order(&shard), unassigned_order)
                .unwrap_or_else(|p| p);
            self.unassigned.insert(pos, shard);
        }
    }

    /// Assigns an unassigned copy to a node, beginning recovery. The copy
    /// must have been drained via [`Self::take_unassigned`].
    pub fn initialize_shard(
        &mut self,
        shard: ShardRouting,
        node_id: &str,
        existing: Option<AllocationId>,
    ) -> ShardRouting {
        let initialized = shard.initialize(node_id, existing);
        self.nodes
            .get_mut(node_id)
            .expect("initialize on a live node")
            .add(initialized.clone());
        self.changed = true;
        debug!(shard = %initialized, "initializing shard copy");
        initialized
    }

    /// Transitions an initializing copy to started, or completes a
    /// relocation by starting the copy on its target node. Returns the
    /// started routing, or `None` if no matching copy exists.
    pub fn start_shard(&mut self, routing: &ShardRouting) -> Option<ShardRouting> {
        let node_id = routing.current_node_id.as_deref()?;
        let current = self.nodes.get(node_id)?.copy_of(&routing.shard_id)?.clone();
        match current.state {
            ShardRoutingState::Initializing => {
                let started = current.started();
                self.nodes.get_mut(node_id).expect("node exists").replace(started.clone());
                self.changed = true;
                Some(started)
            }
            ShardRoutingState::Relocating => {
                let target = current.relocating_node_id.clone().expect("relocating has target");
                let started = current.started();
                self.nodes.get_mut(node_id).expect("node exists").remove(&routing.shard_id);
                self.nodes
                    .get_mut(&target)
                    .expect("relocation target is live")
                    .add(started.clone());
                self.changed = true;
                Some(started)
            }
            _ => None,
        }
    }

    /// Begins relocating a started copy between nodes.
    pub fn relocate_shard(&mut self, shard_id: &ShardId, from: &str, to: &str) {
        let copy = self
            .nodes
            .get(from)
            .and_then(|n| n.copy_of(shard_id))
            .expect("relocate source copy exists")
            .clone();
        self.nodes.get_mut(from).expect("node exists").replace(copy.relocate(to));
        self.changed = true;
        debug!(shard = %shard_id, from = %from, to = %to, "relocating shard copy");
    }

    /// Cancels an in-flight relocation, keeping the copy on its source node.
    pub fn cancel_relocation(&mut self, shard_id: &ShardId, node_id: &str) {
        let copy = self
            .nodes
            .get(node_id)
            .and_then(|n| n.copy_of(shard_id))
            .expect("relocating copy exists")
            .clone();
        self.nodes.get_mut(node_id).expect("node exists").replace(copy.cancel_relocation());
        self.changed = true;
    }

    /// Records a failed copy: the copy moves to the unassigned queue with an
    /// incremented failure counter and the failing node recorded. A failed
    /// relocation reverts to started on its source; a failed primary hands
    /// its role to an active replica when one exists.
    pub fn fail_shard(&mut self, routing: &ShardRouting, message: &str) {
        let Some(node_id) = routing.current_node_id.clone() else {
            return;
        };
        let Some(current) = self.nodes.get(&node_id).and_then(|n| n.copy_of(&routing.shard_id))
        else {
            return;
        };
        let current = current.clone();

        if current.state == ShardRoutingState::Relocating {
            // The move failed; the source copy is still active.
            self.cancel_relocation(&routing.shard_id, &node_id);
            return;
        }

        let removed = self
            .nodes
            .get_mut(&node_id)
            .expect("node exists")
            .remove(&routing.shard_id)
            .expect("copy exists");

        let mut failed = removed;
        if failed.primary {
            if let Some(replacement) = self.promote_replica(&failed.shard_id) {
                debug!(shard = %failed.shard_id, node = %replacement, "promoted replica to primary");
                failed = failed.with_primary(false);
            }
            self.cancel_recovering_replicas(&failed.shard_id, &node_id);
        }

        let info = UnassignedInfo::failure(failed.unassigned_info.as_ref(), &node_id, message);
        let unassigned = failed.moved_to_unassigned(info);
        let pos = self
            .unassigned
            .binary_search_by_key(&unassigned_order(&unassigned), unassigned_order)
            .unwrap_or_else(|p| p);
        self.unassigned.insert(pos, unassigned);
        self.changed = true;
    }

    /// Removes an assigned copy to the unassigned queue with the given info,
    /// leaving its failure counters alone (operator cancel, not a failure).
    /// A removed primary hands its role to an active replica when one exists.
    pub fn unassign_shard(&mut self, shard_id: &ShardId, node_id: &str, info: UnassignedInfo) {
        let Some(removed) = self.nodes.get_mut(node_id).and_then(|n| n.remove(shard_id)) else {
            return;
        };
        let mut removed = removed;
        if removed.primary {
            if let Some(replacement) = self.promote_replica(shard_id) {
                debug!(shard = %shard_id, node = %replacement, "promoted replica to primary");
                removed = removed.with_primary(false);
            }
            self.cancel_recovering_replicas(shard_id, node_id);
        }
        let unassigned = removed.moved_to_unassigned(info);
        let pos = self
            .unassigned
            .binary_search_by_key(&unassigned_order(&unassigned), unassigned_order)
            .unwrap_or_else(|p| p);
        self.unassigned.insert(pos, unassigned);
        self.changed = true;
    }

    /// Cancels replicas still recovering from a primary that just went away.
    /// They cannot finish the recovery and restart from the next primary.
    fn cancel_recovering_replicas(&mut self, shard_id: &ShardId, primary_node: &str) {
        let holders: Vec<String> = self
            .nodes
            .values()
            .filter(|n| {
                n.copy_of(shard_id).is_some_and(|c| {
                    !c.primary && c.state == ShardRoutingState::Initializing
                })
            })
            .map(|n| n.node_id().to_string())
            .collect();
        for holder in holders {
            debug!(shard = %shard_id, node = %holder, "primary gone, cancelling replica recovery");
            let removed = self
                .nodes
                .get_mut(&holder)
                .expect("node exists")
                .remove(shard_id)
                .expect("copy exists");
            let unassigned = removed.moved_to_unassigned(UnassignedInfo::new(
                UnassignedReason::PrimaryFailed,
                format!("primary was removed from node [{primary_node}] during recovery"),
            ));
            let pos = self
                .unassigned
                .binary_search_by_key(&unassigned_order(&unassigned), unassigned_order)
                .unwrap_or_else(|p| p);
            self.unassigned.insert(pos, unassigned);
            self.changed = true;
        }
    }

    /// Promotes the active replica on the lowest node id, returning the node.
    fn promote_replica(&mut self, shard_id: &ShardId) -> Option<String> {
        let node_id = self
            .nodes
            .values()
            .find(|n| n.copy_of(shard_id).is_some_and(|c| !c.primary && c.is_active()))
            .map(|n| n.node_id().to_string())?;
        let promoted = self
            .nodes
            .get(&node_id)
            .and_then(|n| n.copy_of(shard_id))
            .expect("copy exists")
            .clone()
            .with_primary(true);
        self.nodes.get_mut(&node_id).expect("node exists").replace(promoted);
        Some(node_id)
    }

    /// All assigned copies of a shard, across nodes.
    pub fn assigned_copies<'a>(
        &'a self,
        shard_id: &'a ShardId,
    ) -> impl Iterator<Item = &'a ShardRouting> + 'a {
        self.nodes.values().filter_map(move |n| n.copy_of(shard_id))
    }

    /// The active primary of a shard, if any.
    #[must_use]
    pub fn active_primary<'a>(&'a self, shard_id: &'a ShardId) -> Option<&'a ShardRouting> {
        self.assigned_copies(shard_id).find(|c| c.primary && c.is_active())
    }

    /// Cluster-wide number of in-flight relocations.
    #[must_use]
    pub fn relocating_count(&self) -> usize {
        self.nodes
            .values()
            .map(|n| n.shards_with_state(ShardRoutingState::Relocating))
            .sum()
    }

    /// Recoveries landing on a node: copies initializing there plus
    /// relocations targeting it.
    #[must_use]
    pub fn incoming_recoveries(&self, node_id: &str) -> usize {
        let initializing = self
            .node(node_id)
            .map_or(0, |n| n.shards_with_state(ShardRoutingState::Initializing));
        let relocating_in = self
            .nodes
            .values()
            .flat_map(|n| n.shards().iter())
            .filter(|s| s.relocating_node_id.as_deref() == Some(node_id))
            .count();
        initializing + relocating_in
    }

    /// Recoveries streaming off a node (relocation sources).
    #[must_use]
    pub fn outgoing_recoveries(&self, node_id: &str) -> usize {
        self.node(node_id).map_or(0, |n| n.shards_with_state(ShardRoutingState::Relocating))
    }

    /// True if every copy of every shard is active.
    #[must_use]
    pub fn all_active(&self) -> bool {
        self.unassigned.is_empty()
            && self.ignored.is_empty()
            && self
                .nodes
                .values()
                .all(|n| n.shards_with_state(ShardRoutingState::Initializing) == 0)
    }

    /// True if every primary is active.
    #[must_use]
    pub fn all_primaries_active(&self) -> bool {
        self.unassigned.iter().chain(self.ignored.iter()).all(|s| !s.primary)
            && self
                .nodes
                .values()
                .flat_map(|n| n.shards().iter())
                .filter(|s| s.primary)
                .all(ShardRouting::is_active)
    }

    /// True if any operation changed the routing during this pass.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.changed
    }

    pub(crate) fn mark_changed(&mut self) {
        self.changed = true;
    }

    /// Consumes the working copy, yielding every copy (assigned, unassigned,
    /// and ignored) for rebuilding the routing table.
    #[must_use]
    pub fn into_copies(mut self) -> Vec<ShardRouting> {
        self.restore_ignored();
        let mut copies: Vec<ShardRouting> =
            self.nodes.into_values().flat_map(|n| n.shards().to_vec()).collect();
        copies.extend(self.unassigned);
        copies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RoutingTable {
        RoutingTable::new().with_new_index("logs", "uuid-1", 2, 1)
    }

    #[test]
    fn test_build_orders_unassigned_primaries_first() {
        let nodes = RoutingNodes::build(["node-1", "node-2"], &table());
        assert!(!nodes.changed());
        let unassigned = nodes.unassigned();
        assert_eq!(unassigned.len(), 4);
        assert!(unassigned[0].primary && unassigned[1].primary);
        assert!(!unassigned[2].primary && !unassigned[3].primary);
        assert!(unassigned[0].shard_id <= unassigned[1].shard_id);
    }

    #[test]
    fn test_build_unassigns_copies_of_departed_nodes() {
        let mut nodes = RoutingNodes::build(["node-1", "node-2"], &table());
        let mut drained = nodes.take_unassigned();
        let primary = drained.remove(0);
        let started = nodes.initialize_shard(primary, "node-1", None);
        let started = nodes.start_shard(&started).unwrap();
        for shard in drained {
            nodes.push_unassigned(shard, false);
        }
        let rebuilt = RoutingTable::rebuild(&table(), nodes.into_copies());

        // node-1 disappears; its copy must come back unassigned with NodeLeft.
        let nodes = RoutingNodes::build(["node-2"], &rebuilt);
        assert!(nodes.changed());
        let info = nodes
            .unassigned()
            .iter()
            .find(|s| s.shard_id == started.shard_id && s.primary)
            .and_then(|s| s.unassigned_info.clone())
            .unwrap();
        assert_eq!(info.reason, UnassignedReason::NodeLeft);
    }

    #[test]
    fn test_node_left_promotes_active_replica() {
        let table = RoutingTable::new().with_new_index("logs", "uuid-1", 1, 1);
        let mut nodes = RoutingNodes::build(["node-1", "node-2"], &table);
        for shard in nodes.take_unassigned() {
            let node = if shard.primary { "node-1" } else { "node-2" };
            let init = nodes.initialize_shard(shard, node, None);
            nodes.start_shard(&init).unwrap();
        }
        let rebuilt = RoutingTable::rebuild(&table, nodes.into_copies());

        let nodes = RoutingNodes::build(["node-2"], &rebuilt);
        let survivor = nodes.node("node-2").unwrap().shards()[0].clone();
        assert!(survivor.primary, "active replica takes over the lost primary");
        let lost = &nodes.unassigned()[0];
        assert!(!lost.primary, "lost copy comes back as a replica");
        assert_eq!(lost.unassigned_info.as_ref().unwrap().reason, UnassignedReason::NodeLeft);
    }

    #[test]
    fn test_initialize_start_relocate_complete() {
        let mut nodes = RoutingNodes::build(["node-1", "node-2"], &table());
        let mut drained = nodes.take_unassigned();
        let shard = drained.remove(0);
        for rest in drained {
            nodes.push_unassigned(rest, false);
        }

        let init = nodes.initialize_shard(shard, "node-1", None);
        assert_eq!(nodes.incoming_recoveries("node-1"), 1);

        let started = nodes.start_shard(&init).unwrap();
        assert_eq!(started.state, ShardRoutingState::Started);

        nodes.relocate_shard(&started.shard_id, "node-1", "node-2");
        assert_eq!(nodes.relocating_count(), 1);
        assert_eq!(nodes.outgoing_recoveries("node-1"), 1);
        assert_eq!(nodes.incoming_recoveries("node-2"), 1);

        let relocating = nodes.node("node-1").unwrap().copy_of(&started.shard_id).unwrap().clone();
        let done = nodes.start_shard(&relocating).unwrap();
        assert!(done.assigned_to("node-2"));
        assert!(!nodes.node("node-1").unwrap().has_copy_of(&started.shard_id));
        assert!(nodes.node("node-2").unwrap().has_copy_of(&started.shard_id));
    }

    #[test]
    fn test_assigned_copies_and_active_primary() {
        let table = RoutingTable::new().with_new_index("logs", "uuid-1", 1, 1);
        let mut nodes = RoutingNodes::build(["node-1", "node-2"], &table);
        let shard_id = ShardId::new("logs", "uuid-1", 0);

        let mut primary = None;
        for shard in nodes.take_unassigned() {
            let node = if shard.primary { "node-1" } else { "node-2" };
            let init = nodes.initialize_shard(shard, node, None);
            if init.primary {
                primary = Some(init);
            }
        }
        assert_eq!(nodes.assigned_copies(&shard_id).count(), 2);
        assert!(nodes.active_primary(&shard_id).is_none(), "initializing is not active");

        nodes.start_shard(&primary.unwrap()).unwrap();
        let active = nodes.active_primary(&shard_id).unwrap();
        assert!(active.primary);
        assert!(active.assigned_to("node-1"));
    }

    #[test]
    fn test_fail_shard_increments_and_records_node() {
        let mut nodes = RoutingNodes::build(["node-1"], &table());
        let mut drained = nodes.take_unassigned();
        let shard = drained.remove(0);
        for rest in drained {
            nodes.push_unassigned(rest, false);
        }
        let init = nodes.initialize_shard(shard, "node-1", None);

        nodes.fail_shard(&init, "recovery blew up");
        let failed = nodes
            .unassigned()
            .iter()
            .find(|s| s.shard_id == init.shard_id && s.primary)
            .unwrap();
        let info = failed.unassigned_info.as_ref().unwrap();
        assert_eq!(info.reason, UnassignedReason::AllocationFailed);
        assert_eq!(info.failed_allocations, 1);
        assert!(info.failed_node_ids.contains("node-1"));
    }

    #[test]
    fn test_failed_primary_promotes_active_replica() {
        let mut nodes = RoutingNodes::build(["node-1", "node-2"], &table());
        let drained = nodes.take_unassigned();
        let mut primary = None;
        for shard in drained {
            if shard.shard_id.shard == 0 {
                let node = if shard.primary { "node-1" } else { "node-2" };
                let init = nodes.initialize_shard(shard, node, None);
                let started = nodes.start_shard(&init).unwrap();
                if started.primary {
                    primary = Some(started);
                }
            } else {
                nodes.push_unassigned(shard, false);
            }
        }

        nodes.fail_shard(&primary.unwrap(), "node crashed");
        let promoted = nodes.node("node-2").unwrap().shards()[0].clone();
        assert!(promoted.primary, "replica on node-2 takes over as primary");
        let unassigned_replica =
            nodes.unassigned().iter().find(|s| s.shard_id.shard == 0).unwrap();
        assert!(!unassigned_replica.primary, "failed copy comes back as a replica");
    }

    #[test]
    fn test_failed_primary_cancels_recovering_replicas() {
        let table = RoutingTable::new().with_new_index("logs", "uuid-1", 1, 2);
        let mut nodes = RoutingNodes::build(["node-1", "node-2", "node-3"], &table);
        let mut primary = None;
        let mut replica_nodes = ["node-2", "node-3"].iter();
        for shard in nodes.take_unassigned() {
            if shard.primary {
                let init = nodes.initialize_shard(shard, "node-1", None);
                primary = Some(nodes.start_shard(&init).unwrap());
            } else {
                let node = *replica_nodes.next().unwrap();
                let init = nodes.initialize_shard(shard, node, None);
                if node == "node-2" {
                    nodes.start_shard(&init).unwrap();
                }
            }
        }

        nodes.fail_shard(&primary.unwrap(), "node crashed");

        let promoted = nodes.node("node-2").unwrap().shards()[0].clone();
        assert!(promoted.primary, "active replica on node-2 takes over");
        assert!(
            !nodes.node("node-3").unwrap().has_copy_of(&promoted.shard_id),
            "the replica recovering from the failed primary is cancelled"
        );
        let cancelled = nodes
            .unassigned()
            .iter()
            .find(|s| {
                s.unassigned_info.as_ref().map(|i| i.reason)
                    == Some(UnassignedReason::PrimaryFailed)
            })
            .unwrap();
        assert!(!cancelled.primary);
        assert_eq!(
            cancelled.unassigned_info.as_ref().unwrap().failed_allocations,
            0,
            "cancellation is not the replica's failure"
        );
    }

    #[test]
    fn test_failed_relocation_reverts_to_source() {
        let mut nodes = RoutingNodes::build(["node-1", "node-2"], &table());
        let mut drained = nodes.take_unassigned();
        let shard = drained.remove(0);
        for rest in drained {
            nodes.push_unassigned(rest, false);
        }
        let init = nodes.initialize_shard(shard, "node-1", None);
        let started = nodes.start_shard(&init).unwrap();
        nodes.relocate_shard(&started.shard_id, "node-1", "node-2");

        let relocating = nodes.node("node-1").unwrap().copy_of(&started.shard_id).unwrap().clone();
        nodes.fail_shard(&relocating, "target ran out of disk");

        let reverted = nodes.node("node-1").unwrap().copy_of(&started.shard_id).unwrap();
        assert_eq!(reverted.state, ShardRoutingState::Started);
        assert_eq!(nodes.relocating_count(), 0);
    }
}
