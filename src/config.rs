//! Configuration (spec §6 "Configuration keys read"). Deserialized with
//! `serde` the way `shadow-shadow`'s `configuration.rs` structures its
//! option groups, minus the `clap`/`schemars` CLI-flattening half — loading
//! a config *file* and parsing a CLI are both external collaborators here
//! (spec §1).
//!
//! Per-policy sub-keys (`StaticSched/A<n>`, `StaticAffin/A<n>`,
//! `MutableMap/A<n>`) are modeled as `BTreeMap<AppId, _>` fields: the same
//! lookup the original performs by formatting a key string per app, done
//! here by keying a map directly.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::ids::{AppId, CoreId};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub sched_app: String,
    pub sched_ctx: String,
    pub swap: String,

    #[serde(default)]
    pub swap_suppress_guess: bool,
    #[serde(default)]
    pub csched_deduct_nonrun: bool,
    #[serde(default)]
    pub swapgate_deduct_nonrun: bool,
    #[serde(default)]
    pub swapgate_deduct_swapout: bool,

    #[serde(default)]
    pub inst_spill_fill: bool,
    #[serde(default)]
    pub inst_spill_fill_early: bool,
    #[serde(default)]
    pub spill_dirty_only: bool,
    #[serde(default)]
    pub spill_ghr: bool,
    #[serde(default)]
    pub spill_retstack_size: u32,
    #[serde(default)]
    pub spill_dtlb_size: u32,

    #[serde(default)]
    pub thread_swapin_cyc: u64,
    #[serde(default)]
    pub thread_swapout_cyc: u64,
    #[serde(default)]
    pub min_swapin_commits: u64,
    #[serde(default)]
    pub min_swapin_cyc: u64,

    #[serde(default)]
    pub regs_per_sf_block: u32,
    #[serde(default)]
    pub migrate_fills_are_free: bool,

    #[serde(default)]
    pub static_sched: StaticSchedConfig,
    #[serde(default)]
    pub static_affin: StaticAffinConfig,
    #[serde(default)]
    pub mutable_map: MutableMapConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticSchedConfig {
    #[serde(default)]
    pub apps: BTreeMap<AppId, u32>,
    #[serde(default)]
    pub allow_missing_apps: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticAffinConfig {
    #[serde(default)]
    pub apps: BTreeMap<AppId, Vec<CoreId>>,
    #[serde(default)]
    pub force_sched: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MutableMapConfig {
    #[serde(default)]
    pub apps: BTreeMap<AppId, CoreId>,
}

// `AppId`/`CoreId` need to be usable as serde map keys (which requires
// `Deserialize` via a string or number, not the derived struct form serde
// would otherwise expect for a newtype). We deserialize them as plain
// integers, matching the original's bare `int` ids.
impl<'de> Deserialize<'de> for crate::ids::AppId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self::new(u32::deserialize(deserializer)?))
    }
}

impl<'de> Deserialize<'de> for crate::ids::CoreId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self::new(u32::deserialize(deserializer)?))
    }
}
