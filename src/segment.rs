//! Segment header (component B): the inter-process RWU lock state, tier
//! chain anchor, and live entry count for one independently lockable shard
//! of the map.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::diagnostics::ContextRegistry;
use crate::file::MapStorage;
use crate::layout::{self, segment_header};

struct SegmentShared {
    storage: MapStorage,
    header_offset: usize,
    tier0_offset: usize,
    index: u32,
    tier_slots: u32,
    max_entry_bytes: u32,
    pool_tier_count: u32,
    num_segments: u32,
    registry: Arc<ContextRegistry>,
}

/// Cheaply cloneable handle to one segment's shared-memory state. Every
/// `LockContext` and every probe/insert call goes through a `Segment`
/// clone rather than borrowing, so contexts can outlive any particular
/// call stack frame without fighting Rust's borrow checker over a region
/// that, semantically, is shared mutable state by design.
#[derive(Clone)]
pub struct Segment {
    shared: Arc<SegmentShared>,
}

impl Segment {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: MapStorage,
        index: u32,
        tier_slots: u32,
        max_entry_bytes: u32,
        pool_tier_count: u32,
        num_segments: u32,
        registry: Arc<ContextRegistry>,
    ) -> Self {
        let header_offset = layout::segment_header_offset(index, tier_slots, max_entry_bytes);
        let tier0_offset = layout::segment_tier0_offset(index, tier_slots, max_entry_bytes);
        Segment {
            shared: Arc::new(SegmentShared {
                storage,
                header_offset,
                tier0_offset,
                index,
                tier_slots,
                max_entry_bytes,
                pool_tier_count,
                num_segments,
                registry,
            }),
        }
    }

    pub fn index(&self) -> u32 {
        self.shared.index
    }

    pub fn tier_slots(&self) -> u32 {
        self.shared.tier_slots
    }

    pub fn max_entry_bytes(&self) -> u32 {
        self.shared.max_entry_bytes
    }

    pub fn pool_tier_count(&self) -> u32 {
        self.shared.pool_tier_count
    }

    pub fn num_segments(&self) -> u32 {
        self.shared.num_segments
    }

    pub fn storage(&self) -> &MapStorage {
        &self.shared.storage
    }

    pub fn tier0_offset(&self) -> usize {
        self.shared.tier0_offset
    }

    pub fn registry(&self) -> &ContextRegistry {
        &self.shared.registry
    }

    /// # Safety (internally upheld)
    /// The pointer is 8-byte aligned because `MapStorage` allocates in
    /// `u64` words and every offset computed by `layout` is a multiple of
    /// 8 for 8-byte fields.
    pub fn lock_word(&self) -> &AtomicU64 {
        let ptr = self
            .shared
            .storage
            .ptr_at(self.shared.header_offset + segment_header::OFF_LOCK_WORD);
        unsafe { &*(ptr as *const AtomicU64) }
    }

    pub fn live_count(&self) -> &AtomicU64 {
        let ptr = self
            .shared
            .storage
            .ptr_at(self.shared.header_offset + segment_header::OFF_LIVE_COUNT);
        unsafe { &*(ptr as *const AtomicU64) }
    }

    pub fn tier_count(&self) -> &AtomicU32 {
        let ptr = self
            .shared
            .storage
            .ptr_at(self.shared.header_offset + segment_header::OFF_TIER_COUNT);
        unsafe { &*(ptr as *const AtomicU32) }
    }

    pub fn version(&self) -> &AtomicU32 {
        let ptr = self
            .shared
            .storage
            .ptr_at(self.shared.header_offset + segment_header::OFF_VERSION);
        unsafe { &*(ptr as *const AtomicU32) }
    }

    pub fn len(&self) -> u64 {
        self.live_count().load(Ordering::Acquire)
    }

    /// Offset of the `n`th tier in this segment's chain, where `n == 0` is
    /// the resident tier0 and `n >= 1` indexes into the shared overflow
    /// pool at the index recorded in each tier's `next_tier` pointer.
    ///
    /// Walking the chain never needs the segment lock to be held at more
    /// than read level: each `next_tier` pointer is published with a
    /// release store and observed with an acquire load (see `tier`).
    pub fn pool_tier_offset(&self, pool_idx: i32) -> usize {
        layout::pool_tier_offset(
            pool_idx as u32,
            self.shared.num_segments,
            self.shared.tier_slots,
            self.shared.max_entry_bytes,
        )
    }
}

pub fn tier_none() -> i32 {
    layout::NONE_IDX
}
