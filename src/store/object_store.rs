//! Top-level object store
//!
//! Routes objects to per-size pools and keeps the lookup table: one entry
//! per live slab across all pools, sorted by address, descending. Slabs
//! are non-overlapping regions and a valid object handle points strictly
//! inside one of them, so the owning slab of a handle is the greatest
//! table entry `<=` the handle, found by binary search. The slab's size
//! tag then identifies the pool.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::store::pool::SlabPool;
use crate::store::slab::Slab;
use crate::store::{ObjAddr, SlabAddr};
use serde::Serialize;
use std::collections::HashMap;
use std::slice;
use tracing::debug;

/// In-process store for immutable byte strings of 1..=255 bytes.
///
/// An object's handle is the address of its first payload byte; it stays
/// valid until the object is deleted or the store is dropped. All
/// mutating operations require exclusive access; [`search`](Self::search)
/// only needs a shared borrow and parallelizes internally.
pub struct ObjectStore {
    /// One pool per object size, created lazily.
    pools: HashMap<u8, SlabPool>,
    /// Every live slab of every pool, sorted by address, descending.
    lookup_table: Vec<SlabAddr>,
    config: StoreConfig,
}

impl ObjectStore {
    /// Creates a store with default configuration.
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    /// Creates a store with the given configuration.
    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            pools: HashMap::new(),
            lookup_table: Vec::new(),
            config,
        }
    }

    /// Adds an object and returns its handle.
    ///
    /// Equal byte strings may be added multiple times; each add hands out
    /// its own handle. Fails with [`Error::InvalidSize`] for empty or
    /// over-long input and propagates [`Error::AllocFailed`] when the OS
    /// refuses the mapping for a needed slab (in which case nothing was
    /// added).
    pub fn add(&mut self, obj: &[u8]) -> Result<ObjAddr> {
        if obj.is_empty() || obj.len() > 255 {
            return Err(Error::InvalidSize(obj.len()));
        }
        let size = obj.len() as u8;

        let config = &self.config;
        let pool = self.pools.entry(size).or_insert_with(|| {
            debug!(obj_size = size, "creating pool");
            SlabPool::new(size, config.base_objects_per_slab, config.growth_factor)
        });

        let (obj_addr, new_slab) = pool.add(obj)?;

        if new_slab != 0 {
            let insert_at = self.lookup_table.partition_point(|&a| a > new_slab);
            self.lookup_table.insert(insert_at, new_slab);
        }

        Ok(obj_addr)
    }

    /// Returns a view of the object behind `obj`.
    pub fn get(&self, obj: ObjAddr) -> Result<&[u8]> {
        let slab_addr = self.resolve_slab(obj)?;
        let obj_size = unsafe { Slab::from_addr(slab_addr) }.obj_size();

        // SAFETY: the lookup table resolved obj into a live slab whose
        // size tag bounds the payload view
        Ok(unsafe { slice::from_raw_parts(obj as *const u8, obj_size as usize) })
    }

    /// Deletes the object behind `obj`. When the delete empties its slab,
    /// the slab is unmapped and dropped from the lookup table; a pool
    /// whose last slab went away is dropped too.
    pub fn delete(&mut self, obj: ObjAddr) -> Result<()> {
        let slab_addr = self.resolve_slab(obj)?;
        let obj_size = unsafe { Slab::from_addr(slab_addr) }.obj_size();

        let pool = self
            .pools
            .get_mut(&obj_size)
            .ok_or(Error::SlabNotFound(slab_addr))?;

        if pool.delete(obj, slab_addr)? {
            let idx = self.lookup_table.partition_point(|&a| a > slab_addr);
            debug_assert!(self.lookup_table.get(idx) == Some(&slab_addr));
            self.lookup_table.remove(idx);

            if pool.slab_count() == 0 {
                debug!(obj_size, "dropping empty pool");
                self.pools.remove(&obj_size);
            }
        }

        Ok(())
    }

    /// Searches the pool serving `term.len()` for an equal object.
    /// Returns `(0, false)` when no such pool exists or nothing matches.
    pub fn search(&self, term: &[u8]) -> (ObjAddr, bool) {
        if term.is_empty() || term.len() > 255 {
            return (0, false);
        }
        match self.pools.get(&(term.len() as u8)) {
            Some(pool) => pool.search(term),
            None => (0, false),
        }
    }

    /// Total bytes mapped for the pool serving `obj_size`.
    pub fn mem_stats_by_obj_size(&self, obj_size: u8) -> Result<usize> {
        self.pools
            .get(&obj_size)
            .map(SlabPool::mem_stats)
            .ok_or(Error::PoolNotFound(obj_size))
    }

    /// Total bytes mapped across all pools.
    pub fn mem_stats(&self) -> usize {
        self.pools.values().map(SlabPool::mem_stats).sum()
    }

    /// Mean slab fill ratio of the pool serving `obj_size`.
    pub fn frag_stats_by_obj_size(&self, obj_size: u8) -> Result<f32> {
        self.pools
            .get(&obj_size)
            .map(SlabPool::frag_stats)
            .ok_or(Error::PoolNotFound(obj_size))
    }

    /// Mean slab fill ratio across every slab of every pool. 0 when the
    /// store is empty.
    pub fn frag_stats(&self) -> f32 {
        let slab_count = self.lookup_table.len();
        if slab_count == 0 {
            return 0.0;
        }
        let weighted: f32 = self
            .pools
            .values()
            .map(|p| p.frag_stats() * p.slab_count() as f32)
            .sum();
        weighted / slab_count as f32
    }

    /// Number of live pools.
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Number of live slabs across all pools.
    pub fn slab_count(&self) -> usize {
        self.lookup_table.len()
    }

    /// Snapshot of the store's bookkeeping.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            pool_count: self.pool_count(),
            slab_count: self.slab_count(),
            mapped_bytes: self.mem_stats(),
            mean_fill: self.frag_stats(),
        }
    }

    /// Base address of the slab owning `obj`: the greatest lookup-table
    /// entry `<= obj`.
    fn resolve_slab(&self, obj: ObjAddr) -> Result<SlabAddr> {
        let idx = self.lookup_table.partition_point(|&a| a > obj);
        if idx == self.lookup_table.len() {
            return Err(Error::AddressNotResolved(obj));
        }
        Ok(self.lookup_table[idx])
    }
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Bookkeeping snapshot returned by [`ObjectStore::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub pool_count: usize,
    pub slab_count: usize,
    pub mapped_bytes: usize,
    pub mean_fill: f32,
}
