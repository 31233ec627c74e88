//! Routing data model: shard identities, per-copy routing state, the
//! published routing table, and the per-pass mutable working copy.

pub mod node;
pub mod nodes;
pub mod shard;
pub mod table;
pub mod unassigned;

pub use node::RoutingNode;
pub use nodes::RoutingNodes;
pub use shard::{AllocationId, ShardId, ShardRouting, ShardRoutingState};
pub use table::{IndexRoutingTable, RoutingTable, ShardTable};
pub use unassigned::{AllocationStatus, UnassignedInfo, UnassignedReason};
