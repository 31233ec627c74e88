//! Dynamic allocation settings.
//!
//! Every decider and the balancer are driven by settings that operators can
//! change at runtime. Components do not re-read a global settings object;
//! instead they hold [`Setting`] cells registered against a [`SettingsBus`].
//! Applying an update validates the whole settings document first and only
//! then notifies listeners, so an invalid update never partially applies.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Node-attribute filter rules (require / include / exclude).
///
/// A node passes when it carries every `require` attribute, at least one
/// `include` attribute (if any are set), and no `exclude` attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterRules {
    /// Attributes a node must carry with the given value.
    pub require: BTreeMap<String, String>,
    /// Attributes of which a node must match at least one (when non-empty).
    pub include: BTreeMap<String, String>,
    /// Attributes a node must not carry with the given value.
    pub exclude: BTreeMap<String, String>,
}

impl FilterRules {
    /// Returns true if no rules are configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.require.is_empty() && self.include.is_empty() && self.exclude.is_empty()
    }

    /// Evaluates the rules against a node's attributes.
    #[must_use]
    pub fn matches(&self, attributes: &BTreeMap<String, String>) -> bool {
        for (key, value) in &self.require {
            if attributes.get(key) != Some(value) {
                return false;
            }
        }
        if !self.include.is_empty()
            && !self.include.iter().any(|(k, v)| attributes.get(k) == Some(v))
        {
            return false;
        }
        for (key, value) in &self.exclude {
            if attributes.get(key) == Some(value) {
                return false;
            }
        }
        true
    }
}

/// When automatic rebalancing is permitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalancePolicy {
    /// Rebalance at any time.
    Always,
    /// Rebalance only once all primaries are started.
    IndicesPrimariesActive,
    /// Rebalance only once all shard copies are started.
    #[default]
    IndicesAllActive,
}

/// The complete allocation settings document.
///
/// Defaults are production-shaped; every field can be changed at runtime
/// through [`SettingsBus::apply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationSettings {
    /// Consecutive allocation failures after which a shard is left
    /// unassigned until an explicit retry-failed reroute.
    pub max_retries: u32,

    /// Forbid two copies of a shard on nodes sharing the same host.
    pub same_host: bool,

    /// Disk usage fraction above which new allocations are throttled.
    pub watermark_low: f64,
    /// Disk usage fraction above which new allocations are refused.
    pub watermark_high: f64,
    /// Disk usage fraction above which shards must move off the node.
    pub watermark_flood: f64,

    /// Maximum shard copies per node (-1 = unbounded).
    pub shards_per_node: i32,
    /// Maximum shard copies of a single index per node (-1 = unbounded).
    pub index_shards_per_node: i32,

    /// Node attributes across whose values copies must be balanced.
    pub awareness_attributes: Vec<String>,

    /// When automatic rebalancing is permitted.
    pub rebalance_policy: RebalancePolicy,
    /// Cluster-wide concurrent relocation cap (-1 = unbounded).
    pub concurrent_rebalance: i32,

    /// Per-node concurrent incoming recovery limit.
    pub node_concurrent_incoming_recoveries: u32,
    /// Per-node concurrent outgoing recovery limit.
    pub node_concurrent_outgoing_recoveries: u32,
    /// Per-node limit for initial primary recoveries from local data.
    pub initial_primaries_recoveries: u32,

    /// Balancer weight multiplier for total shard count imbalance.
    pub balance_shard: f64,
    /// Balancer weight multiplier for per-index shard count imbalance.
    pub balance_index: f64,
    /// Balancer weight multiplier for disk usage imbalance.
    pub balance_disk: f64,
    /// Minimum weight improvement required to propose a relocation.
    pub balance_threshold: f64,

    /// Cluster-level node filters applied to every shard.
    pub filters: FilterRules,
}

impl Default for AllocationSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            same_host: false,
            watermark_low: 0.85,
            watermark_high: 0.90,
            watermark_flood: 0.95,
            shards_per_node: -1,
            index_shards_per_node: -1,
            awareness_attributes: Vec::new(),
            rebalance_policy: RebalancePolicy::IndicesAllActive,
            concurrent_rebalance: 2,
            node_concurrent_incoming_recoveries: 2,
            node_concurrent_outgoing_recoveries: 2,
            initial_primaries_recoveries: 4,
            balance_shard: 0.45,
            balance_index: 0.55,
            balance_disk: 0.0,
            balance_threshold: 1.0,
            filters: FilterRules::default(),
        }
    }
}

impl AllocationSettings {
    /// Load settings from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Load settings from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        let settings: Self =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validates the settings document, failing fast on the first problem.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("watermark_low", self.watermark_low),
            ("watermark_high", self.watermark_high),
            ("watermark_flood", self.watermark_flood),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(Error::Config(format!(
                    "{name} must be within (0, 1], got {value}"
                )));
            }
        }
        if self.watermark_low > self.watermark_high
            || self.watermark_high > self.watermark_flood
        {
            return Err(Error::Config(format!(
                "watermarks must be ordered low <= high <= flood, got {} / {} / {}",
                self.watermark_low, self.watermark_high, self.watermark_flood
            )));
        }
        if self.shards_per_node < -1 || self.shards_per_node == 0 {
            return Err(Error::Config(format!(
                "shards_per_node must be positive or -1, got {}",
                self.shards_per_node
            )));
        }
        if self.index_shards_per_node < -1 || self.index_shards_per_node == 0 {
            return Err(Error::Config(format!(
                "index_shards_per_node must be positive or -1, got {}",
                self.index_shards_per_node
            )));
        }
        if self.concurrent_rebalance < -1 {
            return Err(Error::Config(format!(
                "concurrent_rebalance must be >= -1, got {}",
                self.concurrent_rebalance
            )));
        }
        for (name, value) in [
            ("balance_shard", self.balance_shard),
            ("balance_index", self.balance_index),
            ("balance_disk", self.balance_disk),
            ("balance_threshold", self.balance_threshold),
        ] {
            if value < 0.0 || !value.is_finite() {
                return Err(Error::Config(format!(
                    "{name} must be a non-negative finite number, got {value}"
                )));
            }
        }
        if self.balance_shard + self.balance_index + self.balance_disk <= 0.0 {
            return Err(Error::Config(
                "at least one balance factor must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// A thread-safe settings cell held by a decider or the balancer.
///
/// Reads never block writers for long: the cell clones out the current value.
/// This is the only concurrently-mutated state inside the engine.
#[derive(Debug, Clone)]
pub struct Setting<T>(Arc<RwLock<T>>);

impl<T: Clone> Setting<T> {
    /// Creates a cell holding the given value.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    /// Returns a clone of the current value.
    #[must_use]
    pub fn get(&self) -> T {
        self.0.read().clone()
    }

    /// Replaces the current value.
    pub fn set(&self, value: T) {
        *self.0.write() = value;
    }
}

type Listener = Box<dyn Fn(&AllocationSettings) + Send + Sync>;

/// Distributes validated settings updates to registered listeners.
pub struct SettingsBus {
    current: RwLock<AllocationSettings>,
    listeners: RwLock<Vec<Listener>>,
}

impl SettingsBus {
    /// Creates a bus seeded with validated initial settings.
    pub fn new(initial: AllocationSettings) -> Result<Self> {
        initial.validate()?;
        Ok(Self { current: RwLock::new(initial), listeners: RwLock::new(Vec::new()) })
    }

    /// Returns a copy of the current settings.
    #[must_use]
    pub fn current(&self) -> AllocationSettings {
        self.current.read().clone()
    }

    /// Registers a listener, invoking it immediately with the current
    /// settings so the subscriber's cells start out populated.
    pub fn subscribe(&self, listener: impl Fn(&AllocationSettings) + Send + Sync + 'static) {
        listener(&self.current.read());
        self.listeners.write().push(Box::new(listener));
    }

    /// Validates and applies a settings update, notifying all listeners.
    ///
    /// An invalid update is rejected without notifying anyone.
    pub fn apply(&self, settings: AllocationSettings) -> Result<()> {
        settings.validate()?;
        *self.current.write() = settings.clone();
        for listener in self.listeners.read().iter() {
            listener(&settings);
        }
        debug!("applied allocation settings update");
        Ok(())
    }
}

impl std::fmt::Debug for SettingsBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsBus")
            .field("current", &*self.current.read())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = AllocationSettings::default();
        assert_eq!(settings.max_retries, 5);
        assert!(!settings.same_host);
        assert_eq!(settings.concurrent_rebalance, 2);
        assert_eq!(settings.rebalance_policy, RebalancePolicy::IndicesAllActive);
        settings.validate().unwrap();
    }

    #[test]
    fn test_parse_toml() {
        let settings = AllocationSettings::parse(
            r#"
            max_retries = 3
            same_host = true
            awareness_attributes = ["zone"]
            rebalance_policy = "always"

            [filters.require]
            tier = "hot"
            "#,
        )
        .unwrap();
        assert_eq!(settings.max_retries, 3);
        assert!(settings.same_host);
        assert_eq!(settings.awareness_attributes, vec!["zone".to_string()]);
        assert_eq!(settings.rebalance_policy, RebalancePolicy::Always);
        assert_eq!(settings.filters.require.get("tier"), Some(&"hot".to_string()));
    }

    #[test]
    fn test_validate_rejects_unordered_watermarks() {
        let settings =
            AllocationSettings { watermark_low: 0.95, watermark_high: 0.90, ..Default::default() };
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_out_of_range_watermarks() {
        for low in [0.0, -0.1, 1.5, f64::NAN] {
            let settings = AllocationSettings { watermark_low: low, ..Default::default() };
            assert!(matches!(settings.validate(), Err(Error::Config(_))), "low = {low}");
        }
        let settings = AllocationSettings {
            watermark_low: 0.8,
            watermark_high: 0.9,
            watermark_flood: 1.0,
            ..Default::default()
        };
        settings.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_shard_limit() {
        let settings = AllocationSettings { shards_per_node: 0, ..Default::default() };
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_filter_rules() {
        let mut rules = FilterRules::default();
        rules.require.insert("tier".to_string(), "hot".to_string());
        rules.exclude.insert("decommissioned".to_string(), "true".to_string());

        let mut attrs = BTreeMap::new();
        attrs.insert("tier".to_string(), "hot".to_string());
        assert!(rules.matches(&attrs));

        attrs.insert("decommissioned".to_string(), "true".to_string());
        assert!(!rules.matches(&attrs));

        let cold: BTreeMap<String, String> =
            [("tier".to_string(), "cold".to_string())].into_iter().collect();
        assert!(!rules.matches(&cold));
    }

    #[test]
    fn test_bus_rejects_invalid_update_without_notifying() {
        let bus = SettingsBus::new(AllocationSettings::default()).unwrap();
        let seen = Setting::new(0u32);
        let seen_cell = seen.clone();
        bus.subscribe(move |s| seen_cell.set(s.max_retries));
        assert_eq!(seen.get(), 5);

        let bad = AllocationSettings { watermark_low: 2.0, ..Default::default() };
        assert!(bus.apply(bad).is_err());
        assert_eq!(seen.get(), 5);

        let good = AllocationSettings { max_retries: 7, ..Default::default() };
        bus.apply(good).unwrap();
        assert_eq!(seen.get(), 7);
    }
}
