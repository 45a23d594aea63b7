//! Read-only views of the cluster maps
//!
//! The metadata rank map names the data pools and the active rank count;
//! the object store map carries per-pool placement group counts. The two
//! maps are distributed independently, so a consumer may hold views from
//! different epochs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use stripefs_common::PoolId;

/// View of the metadata server rank map
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RankMap {
    /// Map epoch (incremented on changes)
    pub epoch: u64,
    /// Highest number of concurrently active metadata ranks
    pub max_active_ranks: u32,
    /// Pools that hold file data for this file system
    pub data_pools: Vec<PoolId>,
}

impl RankMap {
    #[must_use]
    pub fn new(epoch: u64, max_active_ranks: u32, data_pools: Vec<PoolId>) -> Self {
        Self {
            epoch,
            max_active_ranks,
            data_pools,
        }
    }
}

/// Snapshot of the object store map
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OsdMapView {
    /// Map epoch (incremented on changes)
    pub epoch: u64,
    pools: BTreeMap<PoolId, PoolInfo>,
}

/// Per-pool state carried by the object store map
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolInfo {
    /// Number of placement groups in the pool
    pub pg_num: u32,
}

impl OsdMapView {
    #[must_use]
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            pools: BTreeMap::new(),
        }
    }

    /// Add or update a pool.
    pub fn upsert_pool(&mut self, pool: PoolId, pg_num: u32) {
        self.pools.insert(pool, PoolInfo { pg_num });
    }

    /// Placement group count of `pool`, if this map epoch knows the pool.
    #[must_use]
    pub fn pg_num(&self, pool: PoolId) -> Option<u32> {
        self.pools.get(&pool).map(|p| p.pg_num)
    }

    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pg_num_lookup() {
        let mut map = OsdMapView::new(7);
        map.upsert_pool(PoolId::new(1), 64);
        map.upsert_pool(PoolId::new(3), 128);

        assert_eq!(map.pg_num(PoolId::new(1)), Some(64));
        assert_eq!(map.pg_num(PoolId::new(3)), Some(128));
        // the map can lag the rank map and miss a newly added pool
        assert_eq!(map.pg_num(PoolId::new(9)), None);
        assert_eq!(map.pool_count(), 2);
    }

    #[test]
    fn test_upsert_replaces() {
        let mut map = OsdMapView::new(1);
        map.upsert_pool(PoolId::new(1), 64);
        map.upsert_pool(PoolId::new(1), 256);
        assert_eq!(map.pg_num(PoolId::new(1)), Some(256));
        assert_eq!(map.pool_count(), 1);
    }
}
