//! Configuration types for StripeFS
//!
//! This module defines configuration structures used across components.

use serde::{Deserialize, Serialize};

/// Config key for [`PurgeConfig::max_purge_ops`]
pub const KEY_MAX_PURGE_OPS: &str = "max_purge_ops";
/// Config key for [`PurgeConfig::max_purge_ops_per_pg`]
pub const KEY_MAX_PURGE_OPS_PER_PG: &str = "max_purge_ops_per_pg";
/// Config key for [`PurgeConfig::max_purge_files`]
pub const KEY_MAX_PURGE_FILES: &str = "max_purge_files";

/// Tuning knobs for the metadata server's purge queue
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgeConfig {
    /// Hard ceiling on concurrent purge op cost (0 = no ceiling)
    pub max_purge_ops: u64,
    /// Op budget granted per placement group when deriving the dynamic ceiling
    pub max_purge_ops_per_pg: f64,
    /// Maximum purge items executing at once (0 pauses the queue)
    pub max_purge_files: u64,
    /// Per-item cap on concurrent stripe object deletions, honored by the
    /// object store client
    pub filer_max_purge_ops: u32,
    /// Skip removing the backtrace object when a stripe purge with no pool
    /// namespace already deletes object zero
    pub drop_covered_backtrace: bool,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            max_purge_ops: 8192,
            max_purge_ops_per_pg: 0.5,
            max_purge_files: 64,
            filer_max_purge_ops: 10,
            drop_covered_backtrace: false,
        }
    }
}
