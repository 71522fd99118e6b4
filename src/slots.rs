//! Compact open-addressed hash slot array (component A).
//!
//! One `u64` per slot, bit-packed as `searchKey:32 | entryPos:32`, read
//! with acquire ordering and published with release ordering so a reader
//! that observes a freshly written slot is guaranteed to also observe the
//! entry bytes the writer stored before publishing it. Generalizes the
//! teacher's `shm::hashtable` (`Bucket { hash: u64, slot_index: i32 }`)
//! from a 64-bit hash down to the packed 32/32 word the spec calls for,
//! since here the full hash is split between `segIdx` (upper bits) and
//! `searchKey` (lower bits) rather than stored whole per slot.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::file::MapStorage;
use crate::layout::{SLOT_WORD_SIZE, UNSET_SLOT};

#[inline]
pub fn pack(search_key: u32, entry_pos: u32) -> u64 {
    ((search_key as u64) << 32) | entry_pos as u64
}

#[inline]
pub fn unpack(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, word as u32)
}

#[inline]
pub fn hl_pos(search_key: u32, capacity: u32) -> u32 {
    debug_assert!(capacity.is_power_of_two());
    search_key & (capacity - 1)
}

#[inline]
pub fn step(pos: u32, capacity: u32) -> u32 {
    (pos + 1) & (capacity - 1)
}

#[inline]
pub fn step_back(pos: u32, capacity: u32) -> u32 {
    pos.wrapping_sub(1) & (capacity - 1)
}

fn slot_atomic(storage: &MapStorage, slots_base: usize, pos: u32) -> &AtomicU64 {
    let ptr = storage.ptr_at(slots_base + pos as usize * SLOT_WORD_SIZE);
    unsafe { &*(ptr as *const AtomicU64) }
}

/// Acquire-ordered read of one slot. Safe to call without holding any
/// lock: the happens-before edge with the writer is established by the
/// release store in `write_entry_volatile`.
pub fn read_entry_volatile(storage: &MapStorage, slots_base: usize, pos: u32) -> u64 {
    slot_atomic(storage, slots_base, pos).load(Ordering::Acquire)
}

/// Plain (non-atomic-ordering) read. Only safe when the caller is the
/// same thread that performed the last mutation to this slot, per the
/// spec's "within-thread self-check" allowance — expressed here as a
/// relaxed load since there is no other thread's write this load needs
/// to synchronize with.
pub fn read_entry(storage: &MapStorage, slots_base: usize, pos: u32) -> u64 {
    slot_atomic(storage, slots_base, pos).load(Ordering::Relaxed)
}

/// Release-ordered publish of a newly filled slot. Must only be called
/// while holding the segment's write lock.
pub fn write_entry_volatile(storage: &MapStorage, slots_base: usize, pos: u32, search_key: u32, entry_pos: u32) {
    slot_atomic(storage, slots_base, pos).store(pack(search_key, entry_pos), Ordering::Release);
}

pub fn clear_slot(storage: &MapStorage, slots_base: usize, pos: u32) {
    slot_atomic(storage, slots_base, pos).store(UNSET_SLOT, Ordering::Release);
}

pub fn is_empty(word: u64) -> bool {
    word == UNSET_SLOT
}

pub fn init_slots(storage: &MapStorage, slots_base: usize, capacity: u32) {
    for pos in 0..capacity {
        clear_slot(storage, slots_base, pos);
    }
}

/// Back-shift deletion: clears the slot at `empty`, then walks forward
/// moving any slot whose ideal position no longer reaches it without
/// crossing the walk, until an empty slot is reached. Returns the
/// position the probe should resume from, matching the teacher's
/// `hashtable::ht_remove`.
pub fn remove(storage: &MapStorage, slots_base: usize, capacity: u32, start_empty: u32) -> u32 {
    let mut empty = start_empty;
    let mut j = step(empty, capacity);
    loop {
        let w = read_entry_volatile(storage, slots_base, j);
        if is_empty(w) {
            break;
        }
        let (search_key, _) = unpack(w);
        let ideal = hl_pos(search_key, capacity);
        let should_move = if empty <= j {
            ideal <= empty || ideal > j
        } else {
            ideal <= empty && ideal > j
        };
        if should_move {
            slot_atomic(storage, slots_base, empty).store(w, Ordering::Release);
            empty = j;
        }
        j = step(j, capacity);
    }
    clear_slot(storage, slots_base, empty);
    empty
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::MapStorage;

    #[test]
    fn pack_unpack_roundtrip() {
        let w = pack(0xdead_beef, 0x1234_5678);
        assert_eq!(unpack(w), (0xdead_beef, 0x1234_5678));
    }

    #[test]
    fn probe_and_backshift_preserve_lookup() {
        let capacity = 8u32;
        let storage = MapStorage::new(capacity as usize * SLOT_WORD_SIZE);
        init_slots(&storage, 0, capacity);

        // Force three keys to collide on the same starting bucket.
        let base_key = 3u32;
        let colliding = [base_key, base_key + capacity, base_key + 2 * capacity];
        for (i, k) in colliding.iter().enumerate() {
            let mut pos = hl_pos(*k, capacity);
            while !is_empty(read_entry_volatile(&storage, 0, pos)) {
                pos = step(pos, capacity);
            }
            write_entry_volatile(&storage, 0, pos, *k, i as u32);
        }

        // Remove the middle occupant (at the ideal position) and confirm
        // the last one is still reachable by linear probe.
        let ideal = hl_pos(base_key, capacity);
        remove(&storage, 0, capacity, ideal);

        let mut pos = hl_pos(colliding[2], capacity);
        let mut found = false;
        for _ in 0..capacity {
            let w = read_entry_volatile(&storage, 0, pos);
            if is_empty(w) {
                break;
            }
            let (sk, ep) = unpack(w);
            if sk == colliding[2] && ep == 2 {
                found = true;
                break;
            }
            pos = step(pos, capacity);
        }
        assert!(found, "back-shift removal broke probe reachability");
    }
}
