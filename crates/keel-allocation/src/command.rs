//! Explicit allocation commands.
//!
//! Operators can override the automatic allocators for one pass: place a
//! replica, force an empty primary online, move a shard, or cancel an
//! allocation. Commands are validated against the decider chain and the
//! current routing before they mutate anything; a rejected command surfaces
//! as [`Error::InvalidCommand`] and the caller aborts the whole batch.

use serde::{Deserialize, Serialize};

use keel_core::{Error, Result};

use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing::{
    RoutingNodes, ShardId, ShardRouting, ShardRoutingState, UnassignedInfo, UnassignedReason,
};

/// One operator override, addressed by index name and shard number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum AllocationCommand {
    /// Allocates an unassigned replica to a node.
    AllocateReplica {
        /// Index name.
        index: String,
        /// Shard number.
        shard: u32,
        /// Target node id.
        node: String,
    },
    /// Force-allocates an unassigned primary as an empty shard, discarding
    /// whatever data previous copies held.
    AllocateEmptyPrimary {
        /// Index name.
        index: String,
        /// Shard number.
        shard: u32,
        /// Target node id.
        node: String,
        /// Must be set when on-disk copies of this shard still exist.
        accept_data_loss: bool,
    },
    /// Relocates a started shard copy between nodes.
    MoveShard {
        /// Index name.
        index: String,
        /// Shard number.
        shard: u32,
        /// Node currently holding the copy.
        from_node: String,
        /// Node to move the copy to.
        to_node: String,
    },
    /// Cancels a copy's allocation or an in-flight relocation.
    CancelAllocation {
        /// Index name.
        index: String,
        /// Shard number.
        shard: u32,
        /// Node holding the copy.
        node: String,
        /// Required to cancel a started primary.
        allow_primary: bool,
    },
}

/// What a command did and what the deciders said about it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandExplanation {
    /// The command, rendered for the operator.
    pub command: String,
    /// The decider verdict, for commands that consult the chain.
    pub decision: Option<Decision>,
}

fn resolve_shard(allocation: &RoutingAllocation, index: &str, shard: u32) -> Result<ShardId> {
    let metadata = allocation
        .metadata(index)
        .ok_or_else(|| Error::IndexNotFound(index.to_string()))?;
    if shard >= metadata.number_of_shards {
        return Err(Error::ShardNotFound { index: index.to_string(), shard });
    }
    Ok(ShardId::new(index, metadata.uuid.clone(), shard))
}

fn require_node(allocation: &RoutingAllocation, node: &str) -> Result<()> {
    if allocation.routing_nodes.node(node).is_none() {
        return Err(Error::NodeNotFound(node.to_string()));
    }
    Ok(())
}

/// Pulls a matching copy out of the unassigned queue, leaving the rest.
fn extract_unassigned(
    nodes: &mut RoutingNodes,
    shard_id: &ShardId,
    primary: bool,
) -> Option<ShardRouting> {
    let mut drained = nodes.take_unassigned();
    let pos = drained.iter().position(|s| &s.shard_id == shard_id && s.primary == primary);
    let found = pos.map(|p| drained.remove(p));
    for rest in drained {
        nodes.push_unassigned(rest, false);
    }
    found
}

impl AllocationCommand {
    /// Validates and applies the command to the working copy.
    pub fn execute(&self, allocation: &mut RoutingAllocation) -> Result<CommandExplanation> {
        match self {
            Self::AllocateReplica { index, shard, node } => {
                self.allocate_replica(allocation, index, *shard, node)
            }
            Self::AllocateEmptyPrimary { index, shard, node, accept_data_loss } => {
                self.allocate_empty_primary(allocation, index, *shard, node, *accept_data_loss)
            }
            Self::MoveShard { index, shard, from_node, to_node } => {
                self.move_shard(allocation, index, *shard, from_node, to_node)
            }
            Self::CancelAllocation { index, shard, node, allow_primary } => {
                self.cancel(allocation, index, *shard, node, *allow_primary)
            }
        }
    }

    fn allocate_replica(
        &self,
        allocation: &mut RoutingAllocation,
        index: &str,
        shard: u32,
        node: &str,
    ) -> Result<CommandExplanation> {
        let shard_id = resolve_shard(allocation, index, shard)?;
        require_node(allocation, node)?;
        if allocation.routing_nodes.active_primary(&shard_id).is_none() {
            return Err(Error::invalid_command(format!(
                "cannot allocate a replica of {shard_id} while its primary is not active"
            )));
        }
        let Some(replica) = extract_unassigned(&mut allocation.routing_nodes, &shard_id, false)
        else {
            return Err(Error::invalid_command(format!(
                "no unassigned replica of {shard_id} to allocate"
            )));
        };
        let target = allocation.routing_nodes.node(node).expect("node checked").clone();
        let decision = allocation.deciders.clone().can_allocate(&replica, &target, allocation);
        if decision.is_no() {
            allocation.routing_nodes.push_unassigned(replica, false);
            return Err(Error::invalid_command(format!(
                "cannot allocate replica of {shard_id} to [{node}]: {}",
                decision.explanation().unwrap_or("deciders refused")
            )));
        }
        allocation.routing_nodes.initialize_shard(replica, node, None);
        Ok(CommandExplanation { command: self.to_string(), decision: Some(decision) })
    }

    fn allocate_empty_primary(
        &self,
        allocation: &mut RoutingAllocation,
        index: &str,
        shard: u32,
        node: &str,
        accept_data_loss: bool,
    ) -> Result<CommandExplanation> {
        let shard_id = resolve_shard(allocation, index, shard)?;
        require_node(allocation, node)?;
        if !accept_data_loss && !allocation.stored_copies(&shard_id).is_empty() {
            return Err(Error::invalid_command(format!(
                "allocating {shard_id} as an empty primary discards its existing \
                 on-disk copies; set accept_data_loss to proceed"
            )));
        }
        let Some(primary) = extract_unassigned(&mut allocation.routing_nodes, &shard_id, true)
        else {
            return Err(Error::invalid_command(format!(
                "no unassigned primary of {shard_id} to allocate"
            )));
        };
        let target = allocation.routing_nodes.node(node).expect("node checked").clone();
        let decision =
            allocation.deciders.clone().can_force_allocate_primary(&primary, &target, allocation);
        if decision.is_no() {
            allocation.routing_nodes.push_unassigned(primary, false);
            return Err(Error::invalid_command(format!(
                "cannot force-allocate primary {shard_id} to [{node}]: {}",
                decision.explanation().unwrap_or("deciders refused")
            )));
        }
        // The copy starts over as a brand-new empty shard.
        let forced = ShardRouting {
            unassigned_info: Some(UnassignedInfo::new(
                UnassignedReason::ForcedEmptyPrimary,
                format!("forced empty primary on [{node}]"),
            )),
            ..primary
        };
        allocation.routing_nodes.initialize_shard(forced, node, None);
        Ok(CommandExplanation { command: self.to_string(), decision: Some(decision) })
    }

    fn move_shard(
        &self,
        allocation: &mut RoutingAllocation,
        index: &str,
        shard: u32,
        from_node: &str,
        to_node: &str,
    ) -> Result<CommandExplanation> {
        let shard_id = resolve_shard(allocation, index, shard)?;
        require_node(allocation, from_node)?;
        require_node(allocation, to_node)?;
        let Some(copy) = allocation
            .routing_nodes
            .node(from_node)
            .and_then(|n| n.copy_of(&shard_id))
            .cloned()
        else {
            return Err(Error::invalid_command(format!(
                "no copy of {shard_id} on node [{from_node}]"
            )));
        };
        if copy.state != ShardRoutingState::Started {
            return Err(Error::invalid_command(format!(
                "copy of {shard_id} on [{from_node}] is {:?}, only started shards move",
                copy.state
            )));
        }
        let target = allocation.routing_nodes.node(to_node).expect("node checked").clone();
        let decision = allocation.deciders.clone().can_allocate(&copy, &target, allocation);
        if decision.is_no() {
            return Err(Error::invalid_command(format!(
                "cannot move {shard_id} to [{to_node}]: {}",
                decision.explanation().unwrap_or("deciders refused")
            )));
        }
        allocation.routing_nodes.relocate_shard(&shard_id, from_node, to_node);
        Ok(CommandExplanation { command: self.to_string(), decision: Some(decision) })
    }

    fn cancel(
        &self,
        allocation: &mut RoutingAllocation,
        index: &str,
        shard: u32,
        node: &str,
        allow_primary: bool,
    ) -> Result<CommandExplanation> {
        let shard_id = resolve_shard(allocation, index, shard)?;
        require_node(allocation, node)?;
        let Some(copy) =
            allocation.routing_nodes.node(node).and_then(|n| n.copy_of(&shard_id)).cloned()
        else {
            return Err(Error::invalid_command(format!(
                "no copy of {shard_id} on node [{node}]"
            )));
        };
        match copy.state {
            ShardRoutingState::Relocating => {
                allocation.routing_nodes.cancel_relocation(&shard_id, node);
            }
            ShardRoutingState::Started if copy.primary && !allow_primary => {
                return Err(Error::invalid_command(format!(
                    "cancelling the started primary of {shard_id} requires allow_primary"
                )));
            }
            ShardRoutingState::Started | ShardRoutingState::Initializing => {
                allocation.routing_nodes.unassign_shard(
                    &shard_id,
                    node,
                    UnassignedInfo::new(
                        UnassignedReason::ManualCancel,
                        format!("allocation on [{node}] cancelled by operator"),
                    ),
                );
            }
            ShardRoutingState::Unassigned => unreachable!("copy came from a node"),
        }
        Ok(CommandExplanation { command: self.to_string(), decision: None })
    }
}

impl std::fmt::Display for AllocationCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllocateReplica { index, shard, node } => {
                write!(f, "allocate_replica [{index}][{shard}] to [{node}]")
            }
            Self::AllocateEmptyPrimary { index, shard, node, .. } => {
                write!(f, "allocate_empty_primary [{index}][{shard}] to [{node}]")
            }
            Self::MoveShard { index, shard, from_node, to_node } => {
                write!(f, "move_shard [{index}][{shard}] from [{from_node}] to [{to_node}]")
            }
            Self::CancelAllocation { index, shard, node, .. } => {
                write!(f, "cancel_allocation [{index}][{shard}] on [{node}]")
            }
        }
    }
}
