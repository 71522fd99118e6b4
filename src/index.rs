//! Key search & insertion protocol (component E): coordinates the slot
//! array (A), tier storage (C), and the segment's tier chain (B) into
//! find/insert/remove operations that walk from a segment's resident
//! tier0 out through chained overflow tiers as needed.
//!
//! Callers are expected to already hold the appropriate `LockContext`
//! level: `find` only needs read, `insert`/`remove` need write.

use crate::error::{MapError, Result};
use crate::segment::Segment;
use crate::slots::{self, hl_pos, step, unpack};
use crate::tier::{self, EntryMeta, TierLayout};

/// Upper bound on probes within a single tier before concluding the
/// table is corrupt (every slot full with no sentinel reached). This
/// should never trigger given the arena-capacity/table-capacity ratio in
/// `layout::arena_capacity`, which keeps load factor at or under 50%.
fn max_probe(tier_slots: u32) -> u32 {
    tier_slots
}

pub struct Located {
    pub tier_base: usize,
    pub slot_pos: u32,
    pub entry_off: usize,
    pub meta: EntryMeta,
}

/// One tier in a segment's chain, paired with its base offset.
fn tier_layout_at(segment: &Segment, base: usize) -> TierLayout {
    TierLayout::new(base, segment.tier_slots(), segment.max_entry_bytes())
}

fn pool_tier_base(segment: &Segment, pool_idx: i32) -> usize {
    segment.pool_tier_offset(pool_idx)
}

/// Walks from tier0 through the chain looking for `search_key` matching
/// `key`. Returns the located entry, or `None` if absent anywhere in the
/// chain. Tombstoned entries are returned too (with `meta.tombstone`
/// set) rather than skipped — callers that mean "is this key live"
/// (`get`, `contains`) must check the flag themselves; replication needs
/// to see the tombstone to compare its origin timestamp against an
/// incoming remote op.
pub fn find(
    segment: &Segment,
    search_key: u32,
    key: &[u8],
) -> Result<Option<Located>> {
    let mut base = segment.tier0_offset();
    loop {
        let layout_ = tier_layout_at(segment, base);
        let capacity = layout_.tier_slots;
        let mut pos = hl_pos(search_key, capacity);
        let mut probes = 0;
        loop {
            let word = slots::read_entry_volatile(segment.storage(), layout_.slots_base, pos);
            if slots::is_empty(word) {
                break;
            }
            let (sk, entry_idx) = unpack(word);
            if sk == search_key {
                let entry_off = layout_.entry_offset(entry_idx);
                let meta = tier::read_meta(segment.storage(), entry_off);
                if tier::read_key_bytes(segment.storage(), entry_off, &meta) == key {
                    return Ok(Some(Located {
                        tier_base: base,
                        slot_pos: pos,
                        entry_off,
                        meta,
                    }));
                }
            }
            pos = step(pos, capacity);
            probes += 1;
            if probes > max_probe(capacity) {
                return Err(MapError::HashLookupOverflow {
                    detail: format!("probed {probes} slots in tier at offset {base} without hitting an empty slot"),
                });
            }
        }
        let next = tier::next_tier(segment.storage(), layout_.base);
        if next == crate::layout::NONE_IDX {
            return Ok(None);
        }
        base = pool_tier_base(segment, next);
    }
}

pub enum InsertOutcome {
    Inserted,
    Replaced { previous_len: u32 },
}

/// Inserts or replaces the entry for `key`, walking the tier chain and
/// chaining a fresh pool tier if every existing tier's arena is full.
/// Caller must hold the segment's write lock.
#[allow(clippy::too_many_arguments)]
pub fn insert(
    segment: &Segment,
    search_key: u32,
    key: &[u8],
    value: &[u8],
    origin_ts: u64,
    origin_id: u8,
    next_pool_tier: &mut dyn FnMut() -> Result<i32>,
) -> Result<InsertOutcome> {
    if let Some(found) = find(segment, search_key, key)? {
        let layout_ = tier_layout_at(segment, found.tier_base);
        let previous_len = found.meta.value_len;
        tier::write_entry(segment.storage(), &layout_, found.entry_off, key, value, origin_ts, origin_id, false)?;
        return Ok(InsertOutcome::Replaced { previous_len });
    }

    let mut base = segment.tier0_offset();
    loop {
        let layout_ = tier_layout_at(segment, base);
        if let Some(idx) = tier::alloc_slot(segment.storage(), &layout_) {
            let entry_off = layout_.entry_offset(idx);
            tier::write_entry(segment.storage(), &layout_, entry_off, key, value, origin_ts, origin_id, false)?;

            let capacity = layout_.tier_slots;
            let mut pos = hl_pos(search_key, capacity);
            let mut probes = 0;
            loop {
                let word = slots::read_entry_volatile(segment.storage(), layout_.slots_base, pos);
                if slots::is_empty(word) {
                    break;
                }
                pos = step(pos, capacity);
                probes += 1;
                if probes > max_probe(capacity) {
                    tier::free_slot(segment.storage(), &layout_, idx);
                    return Err(MapError::HashLookupOverflow {
                        detail: format!("no empty slot found after {probes} probes during insert"),
                    });
                }
            }
            slots::write_entry_volatile(segment.storage(), layout_.slots_base, pos, search_key, idx);
            segment.live_count().fetch_add(1, std::sync::atomic::Ordering::AcqRel);
            return Ok(InsertOutcome::Inserted);
        }

        let next = tier::next_tier(segment.storage(), layout_.base);
        if next != crate::layout::NONE_IDX {
            base = pool_tier_base(segment, next);
            continue;
        }

        let pool_idx = next_pool_tier()?;
        let new_base = pool_tier_base(segment, pool_idx);
        let new_layout = tier_layout_at(segment, new_base);
        tier::init_tier(segment.storage(), &new_layout);
        tier::set_next_tier(segment.storage(), layout_.base, pool_idx);
        segment.tier_count().fetch_add(1, std::sync::atomic::Ordering::AcqRel);
        base = new_base;
    }
}

/// Removes the entry for `key` if present. Caller must hold the
/// segment's write lock. Returns whether anything was removed.
pub fn remove(segment: &Segment, search_key: u32, key: &[u8]) -> Result<bool> {
    let Some(found) = find(segment, search_key, key)? else {
        return Ok(false);
    };
    let layout_ = tier_layout_at(segment, found.tier_base);
    let (_, entry_idx) = unpack(slots::read_entry_volatile(
        segment.storage(),
        layout_.slots_base,
        found.slot_pos,
    ));
    slots::remove(segment.storage(), layout_.slots_base, layout_.tier_slots, found.slot_pos);
    tier::free_slot(segment.storage(), &layout_, entry_idx);
    segment.live_count().fetch_sub(1, std::sync::atomic::Ordering::AcqRel);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MapStorage;
    use crate::layout;
    use crate::segment::Segment;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn make_segment(tier_slots: u32, max_entry_bytes: u32, pool_tier_count: u32) -> Segment {
        let num_segments = 1;
        let size = layout::region_size(num_segments, pool_tier_count, tier_slots, max_entry_bytes);
        let storage = MapStorage::new(size);
        let tier0_off = layout::segment_tier0_offset(0, tier_slots, max_entry_bytes);
        let registry = std::sync::Arc::new(crate::diagnostics::ContextRegistry::new());
        let seg = Segment::new(storage.clone(), 0, tier_slots, max_entry_bytes, pool_tier_count, num_segments, registry);
        let layout_ = TierLayout::new(tier0_off, tier_slots, max_entry_bytes);
        tier::init_tier(&storage, &layout_);
        seg
    }

    fn dummy_pool_allocator(cursor: &AtomicI32) -> impl FnMut() -> Result<i32> + '_ {
        move || {
            let idx = cursor.fetch_add(1, Ordering::Relaxed);
            Ok(idx)
        }
    }

    #[test]
    fn insert_find_remove_roundtrip() {
        let seg = make_segment(16, 64, 2);
        let cursor = AtomicI32::new(0);
        let mut alloc = dummy_pool_allocator(&cursor);
        insert(&seg, 100, b"k1", b"v1", 1, 0, &mut alloc).unwrap();
        let found = find(&seg, 100, b"k1").unwrap().unwrap();
        assert_eq!(tier::read_value_bytes(seg.storage(), found.entry_off, &found.meta), b"v1");
        assert!(remove(&seg, 100, b"k1").unwrap());
        assert!(find(&seg, 100, b"k1").unwrap().is_none());
    }

    #[test]
    fn overflow_chains_pool_tier() {
        let seg = make_segment(4, 32, 4);
        let cursor = AtomicI32::new(0);
        let mut alloc = dummy_pool_allocator(&cursor);
        for i in 0..6u32 {
            let k = format!("key{i}");
            insert(&seg, i, k.as_bytes(), b"v", i as u64, 0, &mut alloc).unwrap();
        }
        for i in 0..6u32 {
            let k = format!("key{i}");
            assert!(find(&seg, i, k.as_bytes()).unwrap().is_some(), "missing key{i}");
        }
        assert!(seg.tier_count().load(Ordering::Acquire) >= 1);
    }

    #[test]
    fn replace_existing_key_updates_value() {
        let seg = make_segment(16, 64, 2);
        let cursor = AtomicI32::new(0);
        let mut alloc = dummy_pool_allocator(&cursor);
        insert(&seg, 7, b"k", b"v1", 1, 0, &mut alloc).unwrap();
        let outcome = insert(&seg, 7, b"k", b"v2", 2, 0, &mut alloc).unwrap();
        assert!(matches!(outcome, InsertOutcome::Replaced { .. }));
        let found = find(&seg, 7, b"k").unwrap().unwrap();
        assert_eq!(tier::read_value_bytes(seg.storage(), found.entry_off, &found.meta), b"v2");
    }
}
