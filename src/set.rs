//! Public set facade: shares the region/lock/index machinery with `Map`
//! but stores no value payload, per the spec's "keys only" variant.
//!
//! `Set` never tombstones an entry itself (`remove` always frees the
//! arena slot outright), but `contains`/`insert` still treat a
//! tombstoned entry as absent for consistency with `Map` and in case a
//! future remote-apply path lands on a shared, replicated region.

use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{ClockSource, SystemClock};
use crate::codec::KeyCodec;
use crate::config::MapConfig;
use crate::context::{LockContext, LockLevel};
use crate::error::{MapError, Result};
use crate::index::{self, InsertOutcome};
use crate::region::Region;
use crate::segment::Segment;
use crate::tier;

/// Adds `key` if absent, reviving a tombstoned slot if that's what's
/// there. Returns `true` if the key was newly present afterward. Shared
/// between `Set::insert`'s direct API and `SetContext::insert`.
fn insert_key(segment: &Segment, region: &Region, clock: &dyn ClockSource, search_key: u32, key_bytes: &[u8]) -> Result<bool> {
    if index::find(segment, search_key, key_bytes)?.is_some_and(|loc| !loc.meta.tombstone) {
        return Ok(false);
    }
    let origin_ts = tier::stamp_now(clock);
    let origin_id = region.node_id();
    let outcome = index::insert(segment, search_key, key_bytes, &[], origin_ts, origin_id, &mut || region.alloc_pool_tier())?;
    // `Replaced` here only ever means reviving a tombstoned slot (a live
    // match already returned above), which `index::insert` doesn't count
    // as a fresh live entry on its own.
    if let InsertOutcome::Replaced { .. } = outcome {
        segment.live_count().fetch_add(1, Ordering::AcqRel);
    }
    Ok(true)
}

pub struct Set<K> {
    region: Arc<Region>,
    clock: Arc<dyn ClockSource>,
    _marker: PhantomData<K>,
}

impl<K> Clone for Set<K> {
    fn clone(&self) -> Self {
        Set {
            region: self.region.clone(),
            clock: self.clock.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K: KeyCodec> Set<K> {
    pub fn create(config: MapConfig, seed: u64) -> Result<Self> {
        let region = Region::create(&config, seed)?;
        Ok(Set {
            region: Arc::new(region),
            clock: Arc::new(SystemClock),
            _marker: PhantomData,
        })
    }

    fn context_for(&self, key_bytes: &[u8]) -> (LockContext, u32, u32) {
        let (seg_idx, search_key) = self.region.route(key_bytes);
        let segment = self.region.segment(seg_idx).clone();
        (LockContext::new(segment), seg_idx, search_key)
    }

    pub fn contains(&self, key: &K) -> Result<bool> {
        let key_bytes = key.encode();
        let (mut ctx, seg_idx, search_key) = self.context_for(&key_bytes);
        ctx.lock_read()?;
        let segment = self.region.segment(seg_idx);
        let found = index::find(segment, search_key, &key_bytes)?.is_some_and(|loc| !loc.meta.tombstone);
        ctx.unlock()?;
        Ok(found)
    }

    /// Adds `key`. Returns `true` if it was newly inserted.
    pub fn insert(&self, key: &K) -> Result<bool> {
        let key_bytes = key.encode();
        let (mut ctx, seg_idx, search_key) = self.context_for(&key_bytes);
        ctx.lock_write()?;
        let segment = self.region.segment(seg_idx).clone();
        let inserted = insert_key(&segment, &self.region, self.clock.as_ref(), search_key, &key_bytes)?;
        ctx.unlock()?;
        Ok(inserted)
    }

    /// Opens a context-scoped handle on `key`, read-biased.
    pub fn query_context(&self, key: &K) -> SetContext<K> {
        self.context_handle(key)
    }

    /// Opens a context-scoped handle on `key`, write-biased.
    pub fn update_context(&self, key: &K) -> SetContext<K> {
        self.context_handle(key)
    }

    fn context_handle(&self, key: &K) -> SetContext<K> {
        let key_bytes = key.encode();
        let (ctx, _, search_key) = self.context_for(&key_bytes);
        SetContext {
            ctx,
            region: self.region.clone(),
            clock: self.clock.clone(),
            key_bytes,
            search_key,
            _marker: PhantomData,
        }
    }

    /// Removes `key`. Returns `true` if it was present.
    pub fn remove(&self, key: &K) -> Result<bool> {
        let key_bytes = key.encode();
        let (mut ctx, seg_idx, search_key) = self.context_for(&key_bytes);
        ctx.lock_write()?;
        let segment = self.region.segment(seg_idx).clone();
        let removed = index::remove(&segment, search_key, &key_bytes)?;
        ctx.unlock()?;
        Ok(removed)
    }

    pub fn len(&self) -> u64 {
        self.region.total_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> Result<Vec<K>> {
        let mut out = Vec::new();
        for segment in self.region.segments() {
            let mut ctx = LockContext::new(segment.clone());
            ctx.lock_read()?;
            let mut base = segment.tier0_offset();
            loop {
                let layout_ = tier::TierLayout::new(base, segment.tier_slots(), segment.max_entry_bytes());
                for pos in 0..layout_.tier_slots {
                    let word = crate::slots::read_entry_volatile(segment.storage(), layout_.slots_base, pos);
                    if crate::slots::is_empty(word) {
                        continue;
                    }
                    let (_, entry_idx) = crate::slots::unpack(word);
                    let entry_off = layout_.entry_offset(entry_idx);
                    let meta = tier::read_meta(segment.storage(), entry_off);
                    if meta.tombstone {
                        continue;
                    }
                    let key = K::decode(tier::read_key_bytes(segment.storage(), entry_off, &meta));
                    out.push(key);
                }
                let next = tier::next_tier(segment.storage(), layout_.base);
                if next == crate::layout::NONE_IDX {
                    break;
                }
                base = segment.pool_tier_offset(next);
            }
            ctx.unlock()?;
        }
        Ok(out)
    }
}

/// A context-scoped handle on one key, returned by `Set::query_context`/
/// `Set::update_context`. See `map::MapContext` for the full rationale —
/// this is the same shape minus a value payload.
pub struct SetContext<K> {
    ctx: LockContext,
    region: Arc<Region>,
    clock: Arc<dyn ClockSource>,
    key_bytes: Vec<u8>,
    search_key: u32,
    _marker: PhantomData<K>,
}

impl<K> SetContext<K> {
    pub fn level(&self) -> LockLevel {
        self.ctx.level()
    }

    pub fn read_lock(&mut self) -> Result<()> {
        self.ctx.lock_read()
    }

    pub fn update_lock(&mut self) -> Result<()> {
        self.ctx.lock_update()
    }

    pub fn write_lock(&mut self) -> Result<()> {
        self.ctx.lock_write()
    }

    pub fn try_update_lock(&mut self, timeout: Duration) -> Result<bool> {
        self.ctx.try_lock_update(timeout)
    }

    pub fn read_lock_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.ctx.lock_read_timeout(timeout)
    }

    pub fn update_lock_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.ctx.lock_update_timeout(timeout)
    }

    pub fn write_lock_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.ctx.lock_write_timeout(timeout)
    }

    pub fn read_lock_interruptible(&mut self, cancel: &dyn Fn() -> bool) -> Result<()> {
        self.ctx.lock_read_interruptible(cancel)
    }

    pub fn update_lock_interruptible(&mut self, cancel: &dyn Fn() -> bool) -> Result<()> {
        self.ctx.lock_update_interruptible(cancel)
    }

    pub fn write_lock_interruptible(&mut self, cancel: &dyn Fn() -> bool) -> Result<()> {
        self.ctx.lock_write_interruptible(cancel)
    }

    pub fn unlock(&mut self) -> Result<()> {
        self.ctx.unlock()
    }

    fn require(&self, minimum: LockLevel) -> Result<()> {
        let held = self.ctx.level();
        let sufficient = match minimum {
            LockLevel::Read => held != LockLevel::Unlocked,
            LockLevel::Update => matches!(held, LockLevel::Update | LockLevel::Write),
            LockLevel::Write => held == LockLevel::Write,
            LockLevel::Unlocked => true,
        };
        if sufficient {
            Ok(())
        } else {
            Err(MapError::IllegalMonitorState)
        }
    }

    /// Checks whether the key is present. Requires at least `read_lock`.
    pub fn contains(&self) -> Result<bool> {
        self.require(LockLevel::Read)?;
        Ok(index::find(self.ctx.segment(), self.search_key, &self.key_bytes)?.is_some_and(|loc| !loc.meta.tombstone))
    }

    /// Adds the key. Requires `write_lock`.
    pub fn insert(&self) -> Result<bool> {
        self.require(LockLevel::Write)?;
        insert_key(self.ctx.segment(), &self.region, self.clock.as_ref(), self.search_key, &self.key_bytes)
    }

    /// Removes the key. Requires `write_lock`.
    pub fn remove(&self) -> Result<bool> {
        self.require(LockLevel::Write)?;
        index::remove(self.ctx.segment(), self.search_key, &self.key_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_set() -> Set<String> {
        let cfg = MapConfig::builder()
            .segments(2)
            .tier_slots(16)
            .max_entry_bytes(64)
            .pool_tier_count(4)
            .build()
            .unwrap();
        Set::create(cfg, 3).unwrap()
    }

    #[test]
    fn insert_contains_remove_roundtrip() {
        let set = small_set();
        assert!(!set.contains(&"a".to_string()).unwrap());
        assert!(set.insert(&"a".to_string()).unwrap());
        assert!(!set.insert(&"a".to_string()).unwrap());
        assert!(set.contains(&"a".to_string()).unwrap());
        assert!(set.remove(&"a".to_string()).unwrap());
        assert!(!set.contains(&"a".to_string()).unwrap());
    }

    #[test]
    fn iter_returns_all_members() {
        let set = small_set();
        set.insert(&"a".to_string()).unwrap();
        set.insert(&"b".to_string()).unwrap();
        let mut members = set.iter().unwrap();
        members.sort();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn context_insert_contains_remove_roundtrip() {
        let set = small_set();
        let mut ctx = set.update_context(&"a".to_string());
        ctx.write_lock().unwrap();
        assert!(!ctx.contains().unwrap());
        assert!(ctx.insert().unwrap());
        assert!(ctx.contains().unwrap());
        assert!(ctx.remove().unwrap());
        assert!(!ctx.contains().unwrap());
        ctx.unlock().unwrap();
    }

    #[test]
    fn context_entry_access_without_lock_is_illegal_monitor_state() {
        let set = small_set();
        let ctx = set.query_context(&"a".to_string());
        assert!(matches!(ctx.contains(), Err(MapError::IllegalMonitorState)));
    }
}
