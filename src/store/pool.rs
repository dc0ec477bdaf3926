//! Per-size slab pools
//!
//! A pool owns every slab serving one object size. The slab sequence is
//! kept sorted by address, descending, and the free-slab bitmap mirrors it
//! index for index: bit `i` set ⇔ slab `i` has no free slot left. Slot
//! allocation always lands in the first not-full slab; when none exists
//! the pool maps a new slab whose capacity follows the geometric growth
//! rule `floor(base * growth_factor^slab_count)`, so early slabs stay
//! compact while inserts remain amortized O(1) at any pool size.
//!
//! Searches are linear scans over all slabs, parallelized by handing slab
//! indices to a small pool of worker threads. They are read-only: callers
//! must not mutate the pool concurrently.

use crate::error::{Error, Result};
use crate::store::bitmap::SlabSetBitmap;
use crate::store::slab::Slab;
use crate::store::{ObjAddr, SlabAddr};
use std::slice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use tracing::debug;

/// All slabs serving one object size.
pub struct SlabPool {
    /// Sorted by address, descending.
    slabs: Vec<Slab>,
    obj_size: u8,
    base_objects_per_slab: usize,
    growth_factor: f64,
    /// Bit `i` set ⇔ `slabs[i]` is full.
    free_slabs: SlabSetBitmap,
}

impl SlabPool {
    /// Creates an empty pool for objects of `obj_size` bytes.
    pub fn new(obj_size: u8, base_objects_per_slab: usize, growth_factor: f64) -> Self {
        debug_assert!(base_objects_per_slab >= 1);
        debug_assert!(growth_factor >= 1.0);
        Self {
            slabs: Vec::new(),
            obj_size,
            base_objects_per_slab,
            growth_factor,
            free_slabs: SlabSetBitmap::new(),
        }
    }

    /// The object size this pool serves.
    pub fn obj_size(&self) -> u8 {
        self.obj_size
    }

    /// Number of live slabs.
    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }

    /// Adds an object, reusing the first free slot of the first not-full
    /// slab, or mapping a new slab when every slab is full.
    ///
    /// Returns the object's address and, when a slab had to be created,
    /// its address (`0` otherwise) so the store can track it.
    pub fn add(&mut self, obj: &[u8]) -> Result<(ObjAddr, SlabAddr)> {
        debug_assert_eq!(obj.len(), self.obj_size as usize);

        debug_assert_eq!(self.free_slabs.len(), self.slabs.len());

        let free_slot = self
            .free_slabs
            .next_clear(0)
            .and_then(|i| self.slabs[i].first_free_slot().map(|idx| (i, idx)));
        debug_assert!(free_slot.map_or(true, |(i, _)| !self.free_slabs.test(i)));

        let mut new_slab_addr = 0;
        let (slab_idx, obj_idx) = match free_slot {
            Some(found) => found,
            None => {
                let slab_idx = self.add_slab()?;
                new_slab_addr = self.slabs[slab_idx].addr();
                (slab_idx, 0)
            }
        };

        let (obj_addr, full) = self.slabs[slab_idx].add_obj(obj, obj_idx);
        if full {
            self.free_slabs.set(slab_idx);
        }

        Ok((obj_addr, new_slab_addr))
    }

    /// Maps a new slab sized by the growth rule and inserts it at its
    /// sorted position. Returns the insertion index.
    fn add_slab(&mut self) -> Result<usize> {
        let obj_count = (self.base_objects_per_slab as f64
            * self.growth_factor.powi(self.slabs.len() as i32))
        .floor() as usize;

        let slab = Slab::new(self.obj_size, obj_count.max(1))?;
        let addr = slab.addr();

        let insert_at = self.slabs.partition_point(|s| s.addr() > addr);
        self.slabs.insert(insert_at, slab);
        self.free_slabs.insert_at(insert_at);

        debug!(
            obj_size = self.obj_size,
            obj_count,
            slab_count = self.slabs.len(),
            "pool grew by one slab"
        );
        Ok(insert_at)
    }

    /// Deletes the object at `obj` from the slab at `slab_addr`. When the
    /// delete empties the slab, the slab is removed and its mapping
    /// returned to the OS; the return value is true in that case.
    pub fn delete(&mut self, obj: ObjAddr, slab_addr: SlabAddr) -> Result<bool> {
        let slab_idx = self
            .find_slab(slab_addr)
            .ok_or(Error::SlabNotFound(slab_addr))?;

        let empty = self.slabs[slab_idx].delete(obj);
        if empty {
            let slab = self.slabs.remove(slab_idx);
            self.free_slabs.delete_at(slab_idx);
            slab.unmap();
            return Ok(true);
        }

        // one slot just opened up, the slab can't be full anymore
        self.free_slabs.clear(slab_idx);
        Ok(false)
    }

    /// Index of the slab with base address `slab_addr`, if it is ours.
    fn find_slab(&self, slab_addr: SlabAddr) -> Option<usize> {
        let idx = self.slabs.partition_point(|s| s.addr() > slab_addr);
        (idx < self.slabs.len() && self.slabs[idx].addr() == slab_addr).then_some(idx)
    }

    /// View of the object at `obj`.
    ///
    /// The address must come from a previous [`add`](Self::add) on this
    /// pool and must not have been deleted.
    pub fn get(&self, obj: ObjAddr) -> &[u8] {
        unsafe { slice::from_raw_parts(obj as *const u8, self.obj_size as usize) }
    }

    /// Searches all slabs for an object equal to `term`. Returns its
    /// address and `true` when found.
    ///
    /// The scan is partitioned across worker threads; when equal objects
    /// exist in several slabs, whichever copy a worker reaches first wins.
    /// Read-only: no `add`/`delete` may run concurrently on this pool.
    pub fn search(&self, term: &[u8]) -> (ObjAddr, bool) {
        debug_assert_eq!(term.len(), self.obj_size as usize);

        if self.slabs.is_empty() {
            return (0, false);
        }

        let found = AtomicUsize::new(0);
        let (index_tx, index_rx) = crossbeam_channel::bounded::<usize>(self.worker_count());

        thread::scope(|scope| {
            for _ in 0..self.worker_count() {
                let index_rx = index_rx.clone();
                let found = &found;
                scope.spawn(move || {
                    for slab_idx in index_rx {
                        if found.load(Ordering::Acquire) != 0 {
                            return;
                        }
                        let slab = &self.slabs[slab_idx];
                        for obj_idx in 0..slab.obj_count() {
                            if slab.is_bit_set(obj_idx) && slab.get_obj_by_idx(obj_idx) == term {
                                // first writer wins
                                let _ = found.compare_exchange(
                                    0,
                                    slab.obj_addr(obj_idx),
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                );
                                return;
                            }
                        }
                    }
                });
            }
            drop(index_rx);

            for slab_idx in 0..self.slabs.len() {
                if found.load(Ordering::Acquire) != 0 {
                    break;
                }
                if index_tx.send(slab_idx).is_err() {
                    break;
                }
            }
            drop(index_tx);
        });

        let addr = found.into_inner();
        (addr, addr != 0)
    }

    /// Searches for every term in `terms` at once. The result has the
    /// same length as `terms`; entry `i` is the address of the object
    /// equal to `terms[i]`, or `0` when no such object exists.
    ///
    /// Each worker scans whole slabs, comparing every stored object
    /// against the still-unresolved terms. The first match per term wins.
    /// Read-only, like [`search`](Self::search).
    pub fn search_batched(&self, terms: &[&[u8]]) -> Vec<ObjAddr> {
        let results: Vec<AtomicUsize> = terms.iter().map(|_| AtomicUsize::new(0)).collect();

        if self.slabs.is_empty() || terms.is_empty() {
            return results.into_iter().map(AtomicUsize::into_inner).collect();
        }

        let remaining = AtomicUsize::new(terms.len());
        let (index_tx, index_rx) = crossbeam_channel::bounded::<usize>(self.worker_count());

        thread::scope(|scope| {
            for _ in 0..self.worker_count() {
                let index_rx = index_rx.clone();
                let results = &results;
                let remaining = &remaining;
                scope.spawn(move || {
                    for slab_idx in index_rx {
                        if remaining.load(Ordering::Acquire) == 0 {
                            return;
                        }
                        let slab = &self.slabs[slab_idx];
                        for obj_idx in 0..slab.obj_count() {
                            if !slab.is_bit_set(obj_idx) {
                                continue;
                            }
                            let stored = slab.get_obj_by_idx(obj_idx);
                            for (term_idx, term) in terms.iter().enumerate() {
                                if results[term_idx].load(Ordering::Acquire) != 0
                                    || stored != *term
                                {
                                    continue;
                                }
                                if results[term_idx]
                                    .compare_exchange(
                                        0,
                                        slab.obj_addr(obj_idx),
                                        Ordering::AcqRel,
                                        Ordering::Acquire,
                                    )
                                    .is_ok()
                                    && remaining.fetch_sub(1, Ordering::AcqRel) == 1
                                {
                                    return;
                                }
                            }
                        }
                    }
                });
            }
            drop(index_rx);

            for slab_idx in 0..self.slabs.len() {
                if remaining.load(Ordering::Acquire) == 0 {
                    break;
                }
                if index_tx.send(slab_idx).is_err() {
                    break;
                }
            }
            drop(index_tx);
        });

        results.into_iter().map(AtomicUsize::into_inner).collect()
    }

    fn worker_count(&self) -> usize {
        thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(1)
            .min(self.slabs.len())
    }

    /// Mean fill ratio (`used slots / capacity`) across slabs, 0..=1.
    /// An empty pool reports 0.
    pub fn frag_stats(&self) -> f32 {
        if self.slabs.is_empty() {
            return 0.0;
        }
        let sum: f32 = self
            .slabs
            .iter()
            .map(|s| s.used_slots() as f32 / s.obj_count() as f32)
            .sum();
        sum / self.slabs.len() as f32
    }

    /// Total bytes currently mapped for this pool.
    pub fn mem_stats(&self) -> usize {
        self.slabs.iter().map(Slab::total_length).sum()
    }

    /// Base addresses of the pool's slabs, descending.
    pub fn slab_addrs(&self) -> impl Iterator<Item = SlabAddr> + '_ {
        self.slabs.iter().map(Slab::addr)
    }
}

impl Drop for SlabPool {
    fn drop(&mut self) {
        for slab in self.slabs.drain(..) {
            slab.unmap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill_pool(pool: &mut SlabPool, count: usize, width: usize) -> Vec<(Vec<u8>, ObjAddr, SlabAddr)> {
        let mut added = Vec::new();
        let mut current_slab = 0;
        for i in 0..count {
            let value = format!("{:0width$}", i, width = width).into_bytes();
            let (obj_addr, slab_addr) = pool.add(&value).unwrap();
            if slab_addr != 0 {
                current_slab = slab_addr;
            }
            added.push((value, obj_addr, current_slab));
        }
        added
    }

    #[test]
    fn test_adding_deleting_slabs() {
        let mut pool = SlabPool::new(10, 1, 1.0);
        let added = fill_pool(&mut pool, 3, 10);
        assert_eq!(pool.slab_count(), 3);

        for (_, obj, slab) in &added {
            pool.delete(*obj, *slab).unwrap();
        }
        assert_eq!(pool.slab_count(), 0);
        assert_eq!(pool.mem_stats(), 0);
    }

    #[test]
    fn test_adding_getting_many_objects() {
        for (obj_size, base, growth) in
            [(8usize, 10, 1.3), (10, 10, 100.0), (13, 2, 1.0), (16, 2, 3.0)]
        {
            let mut pool = SlabPool::new(obj_size as u8, base, growth);
            let added = fill_pool(&mut pool, base * 75, obj_size);

            for (value, obj, _) in &added {
                assert_eq!(pool.get(*obj), &value[..]);
            }
        }
    }

    #[test]
    fn test_delete_all_but_one_then_refill() {
        let mut pool = SlabPool::new(13, 2, 1.0);
        let added = fill_pool(&mut pool, 150, 13);

        for (_, obj, slab) in added.iter().skip(1) {
            pool.delete(*obj, *slab).unwrap();
        }
        assert_eq!(pool.slab_count(), 1);

        // refilling must reuse the surviving slab before growing again
        let before = pool.slab_count();
        let (_, slab_addr) = pool.add(b"0000000000000").unwrap();
        assert_eq!(slab_addr, 0);
        assert_eq!(pool.slab_count(), before);
    }

    #[test]
    fn test_growth_ladder_and_reclaim() {
        // capacities double: 1, 2, 4, 8, 16, 32
        let mut pool = SlabPool::new(10, 1, 2.0);
        let mut objs = Vec::new();
        let mut new_slabs = 0;

        for i in 0..63u64 {
            let value = format!("{:010}", i).into_bytes();
            let (obj, slab) = pool.add(&value).unwrap();
            // a new slab appears exactly when the total reaches 2^k - 1
            if (i + 1).is_power_of_two() {
                assert_ne!(slab, 0, "object {} should have opened a slab", i);
                new_slabs += 1;
            } else {
                assert_eq!(slab, 0, "object {} should not have opened a slab", i);
            }
            objs.push(obj);
        }

        assert_eq!(new_slabs, 6);
        assert_eq!(pool.slab_count(), 6);

        // delete everything but the last object; slabs empty out in
        // insertion order and get unmapped one by one
        let mut unmapped = 0;
        for obj in objs.iter().take(62) {
            let slab_addr = resolve_slab(&pool, *obj);
            if pool.delete(*obj, slab_addr).unwrap() {
                unmapped += 1;
            }
        }
        assert_eq!(unmapped, 5);
        assert_eq!(pool.slab_count(), 1);

        // the surviving slab holds 32 slots, one occupied
        for i in 0..31u64 {
            let value = format!("{:010}", i + 100).into_bytes();
            let (_, slab) = pool.add(&value).unwrap();
            assert_eq!(slab, 0, "re-add {} must not grow the pool", i);
        }
        assert_eq!(pool.slab_count(), 1);

        // one more and the pool grows, restarting the ladder at the
        // current slab count
        let (_, slab) = pool.add(b"0000000000").unwrap();
        assert_ne!(slab, 0);
        assert_eq!(pool.slab_count(), 2);
    }

    fn resolve_slab(pool: &SlabPool, obj: ObjAddr) -> SlabAddr {
        pool.slabs
            .iter()
            .find(|s| {
                let base = s.addr();
                obj >= base && obj < base + s.total_length()
            })
            .map(Slab::addr)
            .unwrap()
    }

    #[test]
    fn test_slab_sequence_stays_descending() {
        let mut pool = SlabPool::new(4, 3, 1.0);
        fill_pool(&mut pool, 40, 4);

        let addrs: Vec<SlabAddr> = pool.slab_addrs().collect();
        for pair in addrs.windows(2) {
            assert!(pair[0] > pair[1]);
        }
    }

    #[test]
    fn test_delete_with_foreign_slab_addr() {
        let mut pool = SlabPool::new(3, 2, 1.0);
        let (obj, slab) = pool.add(b"abc").unwrap();

        let err = pool.delete(obj, slab + 1).unwrap_err();
        assert!(matches!(err, Error::SlabNotFound(_)));

        // the object is still there
        assert_eq!(pool.get(obj), b"abc");
    }

    #[test]
    fn test_search_finds_added_objects() {
        let mut pool = SlabPool::new(5, 1, 1.0);
        pool.add(b"abcde").unwrap();
        pool.add(b"aaaaa").unwrap();

        let (addr, found) = pool.search(b"abcde");
        assert!(found);
        assert_eq!(pool.get(addr), b"abcde");

        let (addr, found) = pool.search(b"aaaaa");
        assert!(found);
        assert_eq!(pool.get(addr), b"aaaaa");
    }

    #[test]
    fn test_search_across_many_slabs() {
        let mut pool = SlabPool::new(5, 10, 1.0);
        fill_pool(&mut pool, 1000, 5);
        assert_eq!(pool.slab_count(), 100);

        for term in ["00325", "00999", "00000", "00010"] {
            let (addr, found) = pool.search(term.as_bytes());
            assert!(found, "{} should be found", term);
            assert_eq!(pool.get(addr), term.as_bytes());
        }

        let (_, found) = pool.search(b"abcde");
        assert!(!found);
    }

    #[test]
    fn test_search_empty_pool() {
        let pool = SlabPool::new(5, 10, 1.0);
        assert_eq!(pool.search(b"xxxxx"), (0, false));
    }

    #[test]
    fn test_search_batched_partial_hit() {
        let mut pool = SlabPool::new(5, 10, 1.0);
        fill_pool(&mut pool, 1000, 5);

        let terms: Vec<&[u8]> = vec![
            b"00100", b"00320", b"ccccc", b"00999", b"00998", b"abcde", b"00000", b"00345",
        ];
        let results = pool.search_batched(&terms);
        assert_eq!(results.len(), terms.len());

        assert_eq!(results[2], 0);
        assert_eq!(results[5], 0);
        for (i, term) in terms.iter().enumerate() {
            if i == 2 || i == 5 {
                continue;
            }
            assert_ne!(results[i], 0, "term {} should resolve", i);
            assert_eq!(pool.get(results[i]), *term);
        }
    }

    #[test]
    fn test_search_batched_empty_inputs() {
        let pool = SlabPool::new(5, 10, 1.0);
        assert!(pool.search_batched(&[]).is_empty());
        assert_eq!(pool.search_batched(&[b"xxxxx".as_slice()]), vec![0]);
    }

    #[test]
    fn test_frag_and_mem_stats() {
        let mut pool = SlabPool::new(10, 4, 1.0);
        assert_eq!(pool.frag_stats(), 0.0);
        assert_eq!(pool.mem_stats(), 0);

        // 4-slot slab, 2 occupied
        pool.add(b"0123456789").unwrap();
        pool.add(b"9876543210").unwrap();
        assert_eq!(pool.frag_stats(), 0.5);
        assert_eq!(pool.mem_stats(), 1 + 32 + 8 + 10 * 4);

        // first slab fills to 4/4, second opens at 1/4: mean 0.625
        pool.add(b"aaaaaaaaaa").unwrap();
        pool.add(b"bbbbbbbbbb").unwrap();
        pool.add(b"cccccccccc").unwrap();
        assert_eq!(pool.slab_count(), 2);
        assert_eq!(pool.frag_stats(), 0.625);
        assert_eq!(pool.mem_stats(), 2 * (1 + 32 + 8 + 10 * 4));
    }
}
