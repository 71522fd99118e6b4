//! Whole-map region: global header, the segment array, and the shared
//! overflow tier pool's bump allocator.
//!
//! Generalizes the teacher's `shm::region::ShmRegion::create`, which
//! carves a single `MmapMut` into a header plus N buckets; here the
//! region is carved into a global header, N segments (each with a
//! resident tier0), and a shared pool of chainable overflow tiers.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::config::MapConfig;
use crate::diagnostics::ContextRegistry;
use crate::error::{MapError, Result};
use crate::file::MapStorage;
use crate::layout::{self, global};
use crate::segment::Segment;

pub struct Region {
    storage: MapStorage,
    segments: Vec<Segment>,
    registry: Arc<ContextRegistry>,
    hash_seed: u64,
    num_segments: u32,
    tier_slots: u32,
    max_entry_bytes: u32,
    pool_tier_count: u32,
    node_id: u8,
    replication_enabled: bool,
}

fn u64_atomic(storage: &MapStorage, offset: usize) -> &std::sync::atomic::AtomicU64 {
    unsafe { &*(storage.ptr_at(offset) as *const std::sync::atomic::AtomicU64) }
}

fn u32_atomic(storage: &MapStorage, offset: usize) -> &AtomicU32 {
    unsafe { &*(storage.ptr_at(offset) as *const AtomicU32) }
}

impl Region {
    /// Creates a fresh region sized for `config`, with a freshly seeded
    /// hash function persisted into the global header so every process
    /// that later attaches derives the same `(segIdx, searchKey)` split
    /// for the same key.
    pub fn create(config: &MapConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let size = layout::region_size(config.segments, config.pool_tier_count, config.tier_slots, config.max_entry_bytes);
        let storage = MapStorage::new(size);

        unsafe {
            std::ptr::copy_nonoverlapping(layout::MAGIC.as_ptr(), storage.ptr_at(global::OFF_MAGIC), layout::MAGIC.len());
        }
        u64_atomic(&storage, global::OFF_HASH_SEED).store(seed, Ordering::Relaxed);
        u32_atomic(&storage, global::OFF_VERSION).store(1, Ordering::Relaxed);
        u32_atomic(&storage, global::OFF_NUM_SEGMENTS).store(config.segments, Ordering::Relaxed);
        u32_atomic(&storage, global::OFF_TIER_SLOTS).store(config.tier_slots, Ordering::Relaxed);
        u32_atomic(&storage, global::OFF_MAX_ENTRY_BYTES).store(config.max_entry_bytes, Ordering::Relaxed);
        u32_atomic(&storage, global::OFF_POOL_TIER_COUNT).store(config.pool_tier_count, Ordering::Relaxed);
        u32_atomic(&storage, global::OFF_POOL_ALLOC_CURSOR).store(0, Ordering::Relaxed);
        let node_id = config.replication.map(|r| r.node_id).unwrap_or(0);
        unsafe {
            *(storage.ptr_at(global::OFF_NODE_ID)) = node_id;
            *(storage.ptr_at(global::OFF_REPLICATION_ENABLED)) = config.replication.is_some() as u8;
        }

        let registry = Arc::new(ContextRegistry::new());
        let mut segments = Vec::with_capacity(config.segments as usize);
        for idx in 0..config.segments {
            let seg = Segment::new(
                storage.clone(),
                idx,
                config.tier_slots,
                config.max_entry_bytes,
                config.pool_tier_count,
                config.segments,
                registry.clone(),
            );
            let layout_ = crate::tier::TierLayout::new(seg.tier0_offset(), config.tier_slots, config.max_entry_bytes);
            crate::tier::init_tier(&storage, &layout_);
            segments.push(seg);
        }

        Ok(Region {
            storage,
            segments,
            registry,
            hash_seed: seed,
            num_segments: config.segments,
            tier_slots: config.tier_slots,
            max_entry_bytes: config.max_entry_bytes,
            pool_tier_count: config.pool_tier_count,
            node_id,
            replication_enabled: config.replication.is_some(),
        })
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn replication_enabled(&self) -> bool {
        self.replication_enabled
    }

    pub fn num_segments(&self) -> u32 {
        self.num_segments
    }

    pub fn max_entry_bytes(&self) -> u32 {
        self.max_entry_bytes
    }

    pub fn segment(&self, idx: u32) -> &Segment {
        &self.segments[idx as usize]
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Splits a 64-bit key hash into a segment index (upper bits) and a
    /// 32-bit search key (lower bits), matching the spec's "upper bits
    /// select segment, lower bits form the in-segment search key" rule.
    pub fn route(&self, key_bytes: &[u8]) -> (u32, u32) {
        let mut hasher = DefaultHasher::new();
        self.hash_seed.hash(&mut hasher);
        key_bytes.hash(&mut hasher);
        let h = hasher.finish();
        let seg_idx = ((h >> 32) as u32) & (self.num_segments - 1);
        let search_key = h as u32;
        (seg_idx, search_key)
    }

    /// Claims the next unused pool tier for chaining, bumping the shared
    /// allocation cursor. Returns `TierPoolExhausted` once every pool
    /// tier has been handed out — the spec treats the overflow pool as
    /// the allocator's problem, but a finite in-process pool has to
    /// surface exhaustion somehow.
    pub fn alloc_pool_tier(&self) -> Result<i32> {
        let cursor = u32_atomic(&self.storage, global::OFF_POOL_ALLOC_CURSOR);
        loop {
            let cur = cursor.load(Ordering::Acquire);
            if cur >= self.pool_tier_count {
                return Err(MapError::TierPoolExhausted {
                    pool_size: self.pool_tier_count,
                });
            }
            if cursor
                .compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(cur as i32);
            }
        }
    }

    pub fn total_len(&self) -> u64 {
        self.segments.iter().map(|s| s.len()).sum()
    }

    pub fn registry(&self) -> &Arc<ContextRegistry> {
        &self.registry
    }
}

impl Drop for Region {
    /// Releases the process-wide context registry on map close so any
    /// thread-local-like `LockContext` state it still references becomes
    /// reclaimable even if the owning thread outlives the map.
    fn drop(&mut self) {
        self.registry.clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;

    #[test]
    fn route_is_deterministic_for_same_seed() {
        let config = MapConfig::default();
        let region = Region::create(&config, 42).unwrap();
        let a = region.route(b"hello");
        let b = region.route(b"hello");
        assert_eq!(a, b);
    }

    #[test]
    fn pool_allocator_exhausts() {
        let config = MapConfig::builder().pool_tier_count(2).build().unwrap();
        let region = Region::create(&config, 1).unwrap();
        assert_eq!(region.alloc_pool_tier().unwrap(), 0);
        assert_eq!(region.alloc_pool_tier().unwrap(), 1);
        assert!(matches!(region.alloc_pool_tier(), Err(MapError::TierPoolExhausted { .. })));
    }
}
