//! Shared foundation for Keel.
//!
//! This crate carries the concerns every Keel crate needs: the error type and
//! the dynamic settings layer (validated settings documents, runtime-updatable
//! [`Setting`] cells, and the [`SettingsBus`] that distributes updates).

pub mod error;
pub mod settings;

pub use error::{Error, Result};
pub use settings::{
    AllocationSettings, FilterRules, RebalancePolicy, Setting, SettingsBus,
};
