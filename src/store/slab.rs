//! Raw slab regions
//!
//! A slab is one contiguous anonymous mapping holding up to 256 objects of
//! a single fixed size:
//!
//! ```text
//! offset 0              obj_size (u8)
//! offset 1              bitmap descriptor: len + (ptr, words, cap)
//! offset 33             occupancy bitmap, ceil(obj_count/64) words
//! offset 33 + words*8   object slots, slot i at + i*obj_size
//! ```
//!
//! The size tag at byte 0 is what allows the store to recover an object's
//! length from its slab base without a side table. Every offset below is
//! derived from `obj_size` and the bitmap length; the slab keeps no
//! out-of-line metadata, so the mapping itself is the whole data
//! structure and a `Slab` is just a typed view of its base address.

use crate::error::Result;
use crate::store::mmap;
use crate::store::ObjAddr;
use crate::store::SlabAddr;
use std::mem;
use std::ptr::{self, NonNull};
use std::slice;
use tracing::debug;

/// Occupancy bitmap header embedded at offset 1 of every slab. Length in
/// bits, then a slice descriptor addressing the words that immediately
/// follow the header.
#[derive(Clone, Copy)]
#[repr(C)]
struct BitmapDescriptor {
    len: usize,
    data: *mut u64,
    words: usize,
    cap: usize,
}

const SIZE_TAG_LEN: usize = 1;
const DESCRIPTOR_LEN: usize = mem::size_of::<BitmapDescriptor>();
const HEADER_LEN: usize = SIZE_TAG_LEN + DESCRIPTOR_LEN;

const WORD_BITS: usize = 64;

/// Words needed to hold `len` occupancy bits.
fn bitmap_words_for(len: usize) -> usize {
    (len + WORD_BITS - 1) / WORD_BITS
}

/// A typed view over one mapped slab region.
///
/// `Slab` is a plain address wrapper; copying it copies the view, not the
/// region. The pool owning the slab is the single writer. During searches
/// the region is shared read-only across worker threads, which is why the
/// `Send`/`Sync` impls below are sound: mutation and traversal are never
/// concurrent on the same pool.
#[derive(Clone, Copy)]
pub(crate) struct Slab {
    base: NonNull<u8>,
}

unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Slab {
    /// Maps a new slab for `obj_count` objects of `obj_size` bytes. The
    /// mapping is sized exactly to header + bitmap + slots; all occupancy
    /// bits start clear.
    pub(crate) fn new(obj_size: u8, obj_count: usize) -> Result<Self> {
        debug_assert!(obj_size >= 1);
        debug_assert!(obj_count >= 1);

        let words = bitmap_words_for(obj_count);
        let total_len = HEADER_LEN + words * 8 + obj_size as usize * obj_count;

        let base = mmap::map_anon(total_len)?;
        unsafe {
            base.as_ptr().write(obj_size);

            let descriptor = BitmapDescriptor {
                len: obj_count,
                data: base.as_ptr().add(HEADER_LEN).cast(),
                words,
                cap: words,
            };
            // offset 1 is not aligned for the descriptor
            ptr::write_unaligned(
                base.as_ptr().add(SIZE_TAG_LEN).cast::<BitmapDescriptor>(),
                descriptor,
            );
        }

        let slab = Self { base };
        debug!(
            addr = slab.addr(),
            obj_size,
            obj_count,
            total_len,
            "mapped new slab"
        );
        Ok(slab)
    }

    /// Reconstructs the view from a slab address.
    ///
    /// # Safety
    ///
    /// `addr` must be the base address of a live slab created by
    /// [`Slab::new`] and not yet unmapped.
    pub(crate) unsafe fn from_addr(addr: SlabAddr) -> Self {
        debug_assert!(addr != 0);
        Self {
            base: NonNull::new_unchecked(addr as *mut u8),
        }
    }

    pub(crate) fn addr(&self) -> SlabAddr {
        self.base.as_ptr() as SlabAddr
    }

    /// The size tag at byte 0.
    pub(crate) fn obj_size(&self) -> u8 {
        unsafe { self.base.as_ptr().read() }
    }

    /// The embedded bitmap header at offset 1.
    fn descriptor(&self) -> BitmapDescriptor {
        unsafe {
            ptr::read_unaligned(self.base.as_ptr().add(SIZE_TAG_LEN).cast::<BitmapDescriptor>())
        }
    }

    /// Slot capacity, read from the embedded bitmap length.
    pub(crate) fn obj_count(&self) -> usize {
        self.descriptor().len
    }

    /// Offset of slot 0 from the slab base.
    pub(crate) fn data_offset(&self) -> usize {
        HEADER_LEN + self.descriptor().words * 8
    }

    /// Full mapped size of this slab in bytes.
    pub(crate) fn total_length(&self) -> usize {
        self.data_offset() + self.obj_size() as usize * self.obj_count()
    }

    /// Address of slot `idx`.
    pub(crate) fn obj_addr(&self, idx: usize) -> ObjAddr {
        self.addr() + self.data_offset() + idx * self.obj_size() as usize
    }

    /// Writes `obj` into slot `idx` and marks it occupied. Returns the
    /// object's address and whether the slab is now full.
    ///
    /// The pool guarantees `obj.len() == obj_size`, `idx < obj_count` and
    /// that the slot is free.
    pub(crate) fn add_obj(&mut self, obj: &[u8], idx: usize) -> (ObjAddr, bool) {
        debug_assert_eq!(obj.len(), self.obj_size() as usize);
        debug_assert!(idx < self.obj_count());
        debug_assert!(!self.is_bit_set(idx));

        let addr = self.obj_addr(idx);
        unsafe {
            ptr::copy_nonoverlapping(obj.as_ptr(), addr as *mut u8, obj.len());
        }
        self.set_bit(idx);

        (addr, self.all_set())
    }

    /// Clears the occupancy bit of the slot holding `obj`. Returns true
    /// when the slab is empty afterwards.
    ///
    /// The pool guarantees `obj` points into this slab.
    pub(crate) fn delete(&mut self, obj: ObjAddr) -> bool {
        let idx = (obj - self.addr() - self.data_offset()) / self.obj_size() as usize;
        self.clear_bit(idx);
        self.none_set()
    }

    /// View of the `obj_size` bytes in slot `idx`.
    pub(crate) fn get_obj_by_idx(&self, idx: usize) -> &[u8] {
        debug_assert!(idx < self.obj_count());
        unsafe { slice::from_raw_parts(self.obj_addr(idx) as *const u8, self.obj_size() as usize) }
    }

    /// Returns the mapping to the OS. The view must not be used again.
    pub(crate) fn unmap(self) {
        let total_len = self.total_length();
        debug!(addr = self.addr(), total_len, "unmapping empty slab");
        unsafe { mmap::unmap(self.base, total_len) };
    }

    // -- occupancy bitmap ---------------------------------------------

    fn word(&self, w: usize) -> u64 {
        let descriptor = self.descriptor();
        debug_assert!(w < descriptor.cap);
        unsafe { ptr::read_unaligned(descriptor.data.add(w)) }
    }

    fn set_word(&mut self, w: usize, value: u64) {
        let descriptor = self.descriptor();
        debug_assert!(w < descriptor.cap);
        unsafe { ptr::write_unaligned(descriptor.data.add(w), value) }
    }

    pub(crate) fn is_bit_set(&self, idx: usize) -> bool {
        self.word(idx / WORD_BITS) >> (idx % WORD_BITS) & 1 == 1
    }

    fn set_bit(&mut self, idx: usize) {
        let word = self.word(idx / WORD_BITS);
        self.set_word(idx / WORD_BITS, word | 1 << (idx % WORD_BITS));
    }

    fn clear_bit(&mut self, idx: usize) {
        let word = self.word(idx / WORD_BITS);
        self.set_word(idx / WORD_BITS, word & !(1 << (idx % WORD_BITS)));
    }

    /// Index of the first free slot, if the slab has one.
    pub(crate) fn first_free_slot(&self) -> Option<usize> {
        let obj_count = self.obj_count();
        for w in 0..self.descriptor().words {
            let word = self.word(w);
            if word != u64::MAX {
                let idx = w * WORD_BITS + word.trailing_ones() as usize;
                // bits past obj_count in the last word stay clear, so a
                // hit there means the slab is full
                return (idx < obj_count).then_some(idx);
            }
        }
        None
    }

    /// True when every slot is occupied.
    pub(crate) fn all_set(&self) -> bool {
        self.first_free_slot().is_none()
    }

    /// True when no slot is occupied.
    fn none_set(&self) -> bool {
        (0..self.descriptor().words).all(|w| self.word(w) == 0)
    }

    /// Number of occupied slots.
    pub(crate) fn used_slots(&self) -> usize {
        (0..self.descriptor().words)
            .map(|w| self.word(w).count_ones() as usize)
            .sum()
    }
}
