//! Tier storage (component C): one tier is a header, a hash slot array
//! (component A, `slots`), and an arena of fixed-size entry records used
//! as a free-list when empty and as key/value backing storage when
//! occupied.
//!
//! A segment's resident tier0 is never freed; once the arena fills, a
//! tier is chained onto it from the shared overflow pool via
//! `next_tier`, and per the spec that chain link is permanent for the
//! lifetime of the open map (tiers are never unchained, only entries
//! within them come and go).

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::clock::ClockSource;
use crate::error::{MapError, Result};
use crate::file::MapStorage;
use crate::layout::{self, entry_header, tier_header, NONE_IDX};

/// A tier's layout relative to its own base offset:
/// `[header][slots: tier_slots * 8 bytes][arena: arena_capacity entries]`.
#[derive(Clone, Copy)]
pub struct TierLayout {
    pub base: usize,
    pub slots_base: usize,
    pub arena_base: usize,
    pub tier_slots: u32,
    pub arena_capacity: u32,
    pub max_entry_bytes: u32,
}

impl TierLayout {
    pub fn new(base: usize, tier_slots: u32, max_entry_bytes: u32) -> Self {
        TierLayout {
            base,
            slots_base: base + layout::TIER_HEADER_SIZE,
            arena_base: base + layout::TIER_HEADER_SIZE + tier_slots as usize * layout::SLOT_WORD_SIZE,
            tier_slots,
            arena_capacity: layout::arena_capacity(tier_slots),
            max_entry_bytes,
        }
    }

    pub fn entry_offset(&self, slot_idx: u32) -> usize {
        self.arena_base + slot_idx as usize * layout::entry_slot_size(self.max_entry_bytes)
    }
}

fn next_tier_atomic(storage: &MapStorage, base: usize) -> &AtomicI32 {
    let ptr = storage.ptr_at(base + tier_header::OFF_NEXT_TIER);
    unsafe { &*(ptr as *const AtomicI32) }
}

fn free_head_atomic(storage: &MapStorage, base: usize) -> &AtomicI32 {
    let ptr = storage.ptr_at(base + tier_header::OFF_FREE_HEAD);
    unsafe { &*(ptr as *const AtomicI32) }
}

pub fn next_tier(storage: &MapStorage, base: usize) -> i32 {
    next_tier_atomic(storage, base).load(Ordering::Acquire)
}

/// Chains a newly claimed pool tier onto `base`. Must be called while the
/// segment is held at write level; publishes with release so any reader
/// that observes the new pointer also observes the freshly initialized
/// tier it points to.
pub fn set_next_tier(storage: &MapStorage, base: usize, pool_idx: i32) {
    next_tier_atomic(storage, base).store(pool_idx, Ordering::Release);
}

/// Initializes a freshly claimed tier: clears every hash slot and links
/// every arena entry into a singly linked free list via `next_free`.
pub fn init_tier(storage: &MapStorage, layout_: &TierLayout) {
    next_tier_atomic(storage, layout_.base).store(NONE_IDX, Ordering::Release);
    crate::slots::init_slots(storage, layout_.slots_base, layout_.tier_slots);

    for i in 0..layout_.arena_capacity {
        let off = layout_.entry_offset(i);
        occupied_atomic(storage, off).store(0, Ordering::Relaxed);
        let next = if i + 1 < layout_.arena_capacity { (i + 1) as i32 } else { NONE_IDX };
        next_free_atomic(storage, off).store(next, Ordering::Relaxed);
    }
    free_head_atomic(storage, layout_.base).store(
        if layout_.arena_capacity > 0 { 0 } else { NONE_IDX },
        Ordering::Release,
    );
}

fn occupied_atomic(storage: &MapStorage, entry_off: usize) -> &AtomicU32 {
    let ptr = storage.ptr_at(entry_off + entry_header::OFF_OCCUPIED);
    unsafe { &*(ptr as *const AtomicU32) }
}

fn next_free_atomic(storage: &MapStorage, entry_off: usize) -> &AtomicI32 {
    let ptr = storage.ptr_at(entry_off + entry_header::OFF_NEXT_FREE);
    unsafe { &*(ptr as *const AtomicI32) }
}

pub fn is_occupied(storage: &MapStorage, entry_off: usize) -> bool {
    occupied_atomic(storage, entry_off).load(Ordering::Acquire) != 0
}

/// Pops the head of the free list. Returns `None` if the arena is full,
/// which the caller (component E) treats as "this tier is exhausted,
/// chain or walk to the next one".
pub fn alloc_slot(storage: &MapStorage, layout_: &TierLayout) -> Option<u32> {
    let head = free_head_atomic(storage, layout_.base).load(Ordering::Acquire);
    if head == NONE_IDX {
        return None;
    }
    let off = layout_.entry_offset(head as u32);
    let next = next_free_atomic(storage, off).load(Ordering::Relaxed);
    free_head_atomic(storage, layout_.base).store(next, Ordering::Release);
    occupied_atomic(storage, off).store(1, Ordering::Release);
    Some(head as u32)
}

/// Returns an entry to the free list. Caller must hold the segment write
/// lock and must have already cleared the entry's hash slot.
pub fn free_slot(storage: &MapStorage, layout_: &TierLayout, idx: u32) {
    let off = layout_.entry_offset(idx);
    occupied_atomic(storage, off).store(0, Ordering::Release);
    let head = free_head_atomic(storage, layout_.base).load(Ordering::Acquire);
    next_free_atomic(storage, off).store(head, Ordering::Relaxed);
    free_head_atomic(storage, layout_.base).store(idx as i32, Ordering::Release);
}

/// A decoded view of one occupied entry's fixed-width header fields.
#[derive(Debug, Clone, Copy)]
pub struct EntryMeta {
    pub key_len: u32,
    pub value_len: u32,
    pub origin_ts: u64,
    pub origin_id: u8,
    pub tombstone: bool,
}

pub fn read_meta(storage: &MapStorage, entry_off: usize) -> EntryMeta {
    let key_len = unsafe { (*(storage.ptr_at(entry_off + entry_header::OFF_KEY_LEN) as *const AtomicU32)).load(Ordering::Acquire) };
    let value_len = unsafe { (*(storage.ptr_at(entry_off + entry_header::OFF_VALUE_LEN) as *const AtomicU32)).load(Ordering::Acquire) };
    let origin_ts = unsafe { (*(storage.ptr_at(entry_off + entry_header::OFF_ORIGIN_TS) as *const AtomicU64)).load(Ordering::Acquire) };
    let origin_id = unsafe { *(storage.ptr_at(entry_off + entry_header::OFF_ORIGIN_ID)) };
    let tombstone = unsafe { *(storage.ptr_at(entry_off + entry_header::OFF_TOMBSTONE)) } != 0;
    EntryMeta { key_len, value_len, origin_ts, origin_id, tombstone }
}

fn key_bytes_offset() -> usize {
    layout::ENTRY_HEADER_SIZE
}

pub fn read_key_bytes<'a>(storage: &'a MapStorage, entry_off: usize, meta: &EntryMeta) -> &'a [u8] {
    let off = entry_off + key_bytes_offset();
    let ptr = storage.ptr_at(off);
    unsafe { std::slice::from_raw_parts(ptr, meta.key_len as usize) }
}

pub fn read_value_bytes<'a>(storage: &'a MapStorage, entry_off: usize, meta: &EntryMeta) -> &'a [u8] {
    let off = entry_off + key_bytes_offset() + meta.key_len as usize;
    let ptr = storage.ptr_at(off);
    unsafe { std::slice::from_raw_parts(ptr, meta.value_len as usize) }
}

/// Writes a full entry record: key bytes, value bytes, and replication
/// metadata. Must be called before the owning hash slot is published
/// (component A's release store is what makes this visible to readers).
#[allow(clippy::too_many_arguments)]
pub fn write_entry(
    storage: &MapStorage,
    layout_: &TierLayout,
    entry_off: usize,
    key: &[u8],
    value: &[u8],
    origin_ts: u64,
    origin_id: u8,
    tombstone: bool,
) -> Result<()> {
    let total = key.len() + value.len();
    if total > layout_.max_entry_bytes as usize {
        return Err(MapError::EntryTooLarge {
            actual: total,
            max: layout_.max_entry_bytes as usize,
        });
    }
    let base = entry_off + key_bytes_offset();
    unsafe {
        std::ptr::copy_nonoverlapping(key.as_ptr(), storage.ptr_at(base), key.len());
        std::ptr::copy_nonoverlapping(value.as_ptr(), storage.ptr_at(base + key.len()), value.len());
    }
    unsafe {
        (*(storage.ptr_at(entry_off + entry_header::OFF_KEY_LEN) as *const AtomicU32)).store(key.len() as u32, Ordering::Relaxed);
        (*(storage.ptr_at(entry_off + entry_header::OFF_VALUE_LEN) as *const AtomicU32)).store(value.len() as u32, Ordering::Relaxed);
        (*(storage.ptr_at(entry_off + entry_header::OFF_ORIGIN_TS) as *const AtomicU64)).store(origin_ts, Ordering::Relaxed);
        *(storage.ptr_at(entry_off + entry_header::OFF_ORIGIN_ID) as *mut u8) = origin_id;
        *(storage.ptr_at(entry_off + entry_header::OFF_TOMBSTONE) as *mut u8) = tombstone as u8;
    }
    Ok(())
}

pub fn set_tombstone(storage: &MapStorage, entry_off: usize, tombstone: bool) {
    unsafe {
        *(storage.ptr_at(entry_off + entry_header::OFF_TOMBSTONE) as *mut u8) = tombstone as u8;
    }
}

/// Marks an entry as tombstoned and restamps its origin to the deleting
/// node/timestamp, so the replication acceptance rule sees the deletion
/// itself as the entry's most recent write.
pub fn tombstone_with_origin(storage: &MapStorage, entry_off: usize, origin_ts: u64, origin_id: u8) {
    unsafe {
        (*(storage.ptr_at(entry_off + entry_header::OFF_ORIGIN_TS) as *const AtomicU64)).store(origin_ts, Ordering::Relaxed);
        *(storage.ptr_at(entry_off + entry_header::OFF_ORIGIN_ID) as *mut u8) = origin_id;
        *(storage.ptr_at(entry_off + entry_header::OFF_TOMBSTONE) as *mut u8) = 1;
    }
}

pub fn stamp_now(clock: &dyn ClockSource) -> u64 {
    clock.now_micros()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MapStorage;

    fn make(tier_slots: u32, max_entry_bytes: u32) -> (MapStorage, TierLayout) {
        let size = layout::tier_size(tier_slots, max_entry_bytes);
        let storage = MapStorage::new(size);
        let layout_ = TierLayout::new(0, tier_slots, max_entry_bytes);
        init_tier(&storage, &layout_);
        (storage, layout_)
    }

    #[test]
    fn alloc_and_free_roundtrip() {
        let (storage, layout_) = make(8, 64);
        let a = alloc_slot(&storage, &layout_).unwrap();
        let b = alloc_slot(&storage, &layout_).unwrap();
        assert_ne!(a, b);
        free_slot(&storage, &layout_, a);
        let c = alloc_slot(&storage, &layout_).unwrap();
        assert_eq!(c, a, "freed slot should be reused before fresh ones");
    }

    #[test]
    fn arena_exhaustion_returns_none() {
        let (storage, layout_) = make(4, 32);
        let mut count = 0;
        while alloc_slot(&storage, &layout_).is_some() {
            count += 1;
        }
        assert_eq!(count, layout_.arena_capacity);
        assert!(alloc_slot(&storage, &layout_).is_none());
    }

    #[test]
    fn write_and_read_entry_roundtrip() {
        let (storage, layout_) = make(8, 64);
        let idx = alloc_slot(&storage, &layout_).unwrap();
        let off = layout_.entry_offset(idx);
        write_entry(&storage, &layout_, off, b"hello", b"world", 42, 3, false).unwrap();
        let meta = read_meta(&storage, off);
        assert_eq!(meta.key_len, 5);
        assert_eq!(meta.value_len, 5);
        assert_eq!(meta.origin_ts, 42);
        assert_eq!(meta.origin_id, 3);
        assert!(!meta.tombstone);
        assert_eq!(read_key_bytes(&storage, off, &meta), b"hello");
        assert_eq!(read_value_bytes(&storage, off, &meta), b"world");
    }

    #[test]
    fn oversized_entry_is_rejected() {
        let (storage, layout_) = make(8, 4);
        let idx = alloc_slot(&storage, &layout_).unwrap();
        let off = layout_.entry_offset(idx);
        let err = write_entry(&storage, &layout_, off, b"toolong", b"x", 0, 0, false).unwrap_err();
        assert!(matches!(err, MapError::EntryTooLarge { .. }));
    }
}
