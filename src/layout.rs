//! Fixed-width regions laid out over a single contiguous backing buffer.
//!
//! All offsets are computed from a handful of header fields so the layout
//! is identical across processes attached to the same region. Field
//! ordering within each header follows the teacher's convention (8-byte
//! fields first, then 4-byte fields, then explicit padding) so nothing
//! relies on implicit alignment padding.

pub const MAGIC: [u8; 8] = *b"RIDXMAP1";

pub const GLOBAL_HEADER_SIZE: usize = 64;
pub const SEGMENT_HEADER_SIZE: usize = 64;
pub const TIER_HEADER_SIZE: usize = 32;
pub const SLOT_WORD_SIZE: usize = 8;
pub const ENTRY_HEADER_SIZE: usize = 32;

/// Sentinel stored in a hash slot word meaning "no entry here".
pub const UNSET_SLOT: u64 = u64::MAX;
/// Sentinel for "no next tier" / "no free slot" linked-list pointers.
pub const NONE_IDX: i32 = -1;

// ---- Global header -------------------------------------------------

pub mod global {
    use super::*;

    pub const OFF_MAGIC: usize = 0;
    pub const OFF_HASH_SEED: usize = 8;
    pub const OFF_VERSION: usize = 16;
    pub const OFF_NUM_SEGMENTS: usize = 20;
    pub const OFF_TIER_SLOTS: usize = 24;
    pub const OFF_MAX_ENTRY_BYTES: usize = 28;
    pub const OFF_POOL_TIER_COUNT: usize = 32;
    pub const OFF_POOL_ALLOC_CURSOR: usize = 36;
    pub const OFF_NODE_ID: usize = 40;
    pub const OFF_REPLICATION_ENABLED: usize = 41;

    const _: () = assert!(GLOBAL_HEADER_SIZE >= OFF_REPLICATION_ENABLED + 1);
}

/// Byte size of one arena entry slot, given the per-entry byte budget.
///
/// Rounded up to a multiple of 8 so every entry lands on an 8-byte
/// boundary regardless of `max_entry_bytes` — the `AtomicU64` fields in
/// the entry header (`OFF_ORIGIN_TS`) and in whatever header follows the
/// arena stay naturally aligned.
pub fn entry_slot_size(max_entry_bytes: u32) -> usize {
    let raw = ENTRY_HEADER_SIZE + max_entry_bytes as usize;
    (raw + 7) & !7
}

/// Number of arena entries a tier holds, given `tier_slots` (the hash
/// table's bucket count, always a power of two). Sized at half the hash
/// table's capacity to keep load factor at or under 50%, the same ratio
/// the teacher's `ShmRegion::create` uses (`ht_capacity = capacity * 2`).
pub fn arena_capacity(tier_slots: u32) -> u32 {
    (tier_slots / 2).max(1)
}

pub fn tier_size(tier_slots: u32, max_entry_bytes: u32) -> usize {
    TIER_HEADER_SIZE
        + tier_slots as usize * SLOT_WORD_SIZE
        + arena_capacity(tier_slots) as usize * entry_slot_size(max_entry_bytes)
}

pub fn segment_area_size(tier_slots: u32, max_entry_bytes: u32) -> usize {
    SEGMENT_HEADER_SIZE + tier_size(tier_slots, max_entry_bytes)
}

/// Total byte size of the backing region for the given parameters.
pub fn region_size(num_segments: u32, pool_tier_count: u32, tier_slots: u32, max_entry_bytes: u32) -> usize {
    GLOBAL_HEADER_SIZE
        + num_segments as usize * segment_area_size(tier_slots, max_entry_bytes)
        + pool_tier_count as usize * tier_size(tier_slots, max_entry_bytes)
}

pub fn segment_header_offset(seg_idx: u32, tier_slots: u32, max_entry_bytes: u32) -> usize {
    GLOBAL_HEADER_SIZE + seg_idx as usize * segment_area_size(tier_slots, max_entry_bytes)
}

/// Offset of a segment's resident tier 0, relative to the region base.
pub fn segment_tier0_offset(seg_idx: u32, tier_slots: u32, max_entry_bytes: u32) -> usize {
    segment_header_offset(seg_idx, tier_slots, max_entry_bytes) + SEGMENT_HEADER_SIZE
}

/// Offset of the shared overflow pool, relative to the region base.
pub fn pool_offset(num_segments: u32, tier_slots: u32, max_entry_bytes: u32) -> usize {
    GLOBAL_HEADER_SIZE + num_segments as usize * segment_area_size(tier_slots, max_entry_bytes)
}

/// Offset of pool tier `idx`, relative to the region base.
pub fn pool_tier_offset(idx: u32, num_segments: u32, tier_slots: u32, max_entry_bytes: u32) -> usize {
    pool_offset(num_segments, tier_slots, max_entry_bytes) + idx as usize * tier_size(tier_slots, max_entry_bytes)
}

// ---- Segment header (offsets relative to the segment header base) --

pub mod segment_header {
    pub const OFF_LOCK_WORD: usize = 0;
    pub const OFF_LIVE_COUNT: usize = 8;
    pub const OFF_TIER_COUNT: usize = 16;
    pub const OFF_VERSION: usize = 20;
}

// ---- Tier header (offsets relative to a tier block's base) ---------

pub mod tier_header {
    pub const OFF_NEXT_TIER: usize = 0;
    pub const OFF_FREE_HEAD: usize = 4;
    pub const OFF_CHECKSUM: usize = 8;
}

// ---- Entry slot header (offsets relative to a slot's base) ---------

pub mod entry_header {
    pub const OFF_OCCUPIED: usize = 0;
    pub const OFF_KEY_LEN: usize = 4;
    pub const OFF_VALUE_LEN: usize = 8;
    pub const OFF_NEXT_FREE: usize = 12;
    pub const OFF_ORIGIN_TS: usize = 16;
    pub const OFF_ORIGIN_ID: usize = 24;
    pub const OFF_TOMBSTONE: usize = 25;
}

const _: () = assert!(GLOBAL_HEADER_SIZE >= 42);
const _: () = assert!(SEGMENT_HEADER_SIZE >= 24);
const _: () = assert!(TIER_HEADER_SIZE >= 12);
const _: () = assert!(ENTRY_HEADER_SIZE >= 26);
