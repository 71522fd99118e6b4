//! In-process stand-in for the out-of-scope memory-mapped file allocator.
//!
//! The real system maps a file shared across processes (see the teacher's
//! `shm::region::ShmRegion`, which owns an `MmapMut` and hands out raw base
//! pointers). The allocator itself — file sizing, mapping, persistence — is
//! named out of scope by the spec; what this crate needs is something that
//! behaves like it from the segment/tier code's point of view: a stable,
//! zeroed, word-aligned byte region that outlives every handle into it.
//!
//! `MapStorage` provides exactly that over a heap allocation. A real
//! deployment would swap this for a `memmap2::MmapMut`-backed type sharing
//! the same base-pointer contract; nothing above this module would change.

use std::sync::Arc;

/// Owns the backing bytes for an open map. Cheaply cloneable (an `Arc`
/// around the allocation) so segments and contexts can hold their own
/// handle without lifetime gymnastics.
#[derive(Clone)]
pub struct MapStorage {
    bytes: Arc<Box<[u64]>>,
    len: usize,
}

impl MapStorage {
    /// Allocate a zeroed region of at least `size_bytes`, rounded up to a
    /// whole number of `u64` words so every offset used by `layout` stays
    /// naturally aligned for the atomics built on top of it.
    pub fn new(size_bytes: usize) -> Self {
        let words = size_bytes.div_ceil(8);
        let bytes: Box<[u64]> = vec![0u64; words].into_boxed_slice();
        MapStorage {
            bytes: Arc::new(bytes),
            len: size_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base pointer to byte 0 of the region.
    ///
    /// # Safety
    /// The returned pointer is valid for `self.len()` bytes for as long as
    /// `self` (or any clone sharing its `Arc`) is alive. Callers are
    /// responsible for not constructing overlapping `&mut` and `&`
    /// references to the same bytes outside of the atomic/volatile
    /// accessors `layout` and `slots` define for that purpose.
    pub fn base_ptr(&self) -> *mut u8 {
        self.bytes.as_ptr() as *mut u8
    }

    /// Byte pointer at `offset` from the base. Panics if out of range.
    pub fn ptr_at(&self, offset: usize) -> *mut u8 {
        assert!(offset <= self.len, "offset {offset} out of range (len {})", self.len);
        unsafe { self.base_ptr().add(offset) }
    }
}

unsafe impl Send for MapStorage {}
unsafe impl Sync for MapStorage {}
