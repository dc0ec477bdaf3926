//! Slab-backed object storage
//!
//! Stores very large numbers of short immutable byte strings with low
//! per-object overhead. Objects are grouped by length; each length has its
//! own pool of slabs mapped directly from the OS.
//!
//! # Architecture
//!
//! ```text
//! ObjectStore
//!   ├─→ lookup table: [slab addr, descending] ──→ owning slab in O(log N)
//!   ├─→ SlabPool(size=3)  → slabs: [0x7f..e000, 0x7f..9000]
//!   ├─→ SlabPool(size=10) → slabs: [0x7f..c000]
//!   └─→ SlabPool(size=42) → slabs: []
//!
//! Slab (one anonymous mapping)
//!   ├─→ byte 0          object size tag
//!   ├─→ bytes 1..33     bitmap length + data descriptor
//!   ├─→ bitmap words    occupancy, bit i ⇔ slot i
//!   └─→ object slots    slot i at data_offset + i*obj_size
//! ```
//!
//! An object's address inside its slab is stable for its lifetime and is
//! handed out as the object's opaque handle. The slab's size tag at byte 0
//! lets any holder of a handle recover the object length from the slab
//! base alone.

mod bitmap;
mod mmap;
mod slab;

pub mod object_store;
pub mod pool;

pub use object_store::{ObjectStore, StoreStats};
pub use pool::SlabPool;

/// Address of an object's first payload byte; the object's opaque handle.
/// Non-zero for every live object, `0` is the "not found" sentinel.
pub type ObjAddr = usize;

/// Address of a slab's first byte (its size tag).
pub type SlabAddr = usize;
