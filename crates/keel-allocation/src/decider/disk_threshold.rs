//! Disk watermark decider.
//!
//! Placement is judged against the *projected* usage of the target node,
//! i.e. its current usage plus the estimated size of the incoming shard.
//! Above the low watermark new allocations are throttled, above the high
//! watermark they are refused, and a node above the flood stage must shed
//! shards (`can_remain` is NO).

use keel_core::{Setting, SettingsBus};

use crate::allocation::RoutingAllocation;
use crate::decision::Decision;
use crate::routing::{RoutingNode, ShardRouting};

use super::AllocationDecider;

const NAME: &str = "disk_threshold";

#[derive(Debug, Clone, Copy)]
struct Watermarks {
    low: f64,
    high: f64,
    flood: f64,
}

/// Refuses or throttles placements that would overfill a node's disk.
pub struct DiskThresholdDecider {
    watermarks: Setting<Watermarks>,
}

impl DiskThresholdDecider {
    /// Creates the decider wired to the settings bus.
    #[must_use]
    pub fn new(bus: &SettingsBus) -> Self {
        let current = bus.current();
        let watermarks = Setting::new(Watermarks {
            low: current.watermark_low,
            high: current.watermark_high,
            flood: current.watermark_flood,
        });
        let cell = watermarks.clone();
        bus.subscribe(move |s| {
            cell.set(Watermarks {
                low: s.watermark_low,
                high: s.watermark_high,
                flood: s.watermark_flood,
            });
        });
        Self { watermarks }
    }
}

impl AllocationDecider for DiskThresholdDecider {
    fn name(&self) -> &'static str {
        NAME
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation,
    ) -> Decision {
        let Some(usage) = allocation.disk_usage(node.node_id()) else {
            return Decision::yes(NAME, "no disk usage reported for node");
        };
        let watermarks = self.watermarks.get();
        let projected = usage.fraction_after(allocation.shard_size(&shard.shard_id));
        if projected > watermarks.high {
            return Decision::no(
                NAME,
                format!(
                    "allocating {} would raise disk usage on [{}] to {projected:.2}, \
                     above the high watermark {:.2}",
                    shard.shard_id,
                    node.node_id(),
                    watermarks.high
                ),
            );
        }
        if projected > watermarks.low {
            return Decision::throttle(
                NAME,
                format!(
                    "projected disk usage {projected:.2} on [{}] is above the low \
                     watermark {:.2}",
                    node.node_id(),
                    watermarks.low
                ),
            );
        }
        Decision::yes(NAME, "projected disk usage below the low watermark")
    }

    fn can_remain(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation,
    ) -> Decision {
        let Some(usage) = allocation.disk_usage(node.node_id()) else {
            return Decision::yes(NAME, "no disk usage reported for node");
        };
        let watermarks = self.watermarks.get();
        let fraction = usage.used_fraction();
        if fraction > watermarks.flood {
            return Decision::no(
                NAME,
                format!(
                    "disk usage {fraction:.2} on [{}] is above the flood stage {:.2}; \
                     {} must move off this node",
                    node.node_id(),
                    watermarks.flood,
                    shard.shard_id
                ),
            );
        }
        Decision::yes(NAME, "disk usage below the flood stage")
    }
}
