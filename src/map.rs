//! Public map facade: ties the region, lock contexts, the key search
//! protocol, and (optionally) replication together behind a typed API.

use std::marker::PhantomData;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{ClockSource, SystemClock};
use crate::codec::{KeyCodec, ValueCodec};
use crate::config::MapConfig;
use crate::context::{LockContext, LockLevel};
use crate::error::{MapError, Result};
use crate::index::{self, InsertOutcome};
use crate::region::Region;
use crate::replication::{self, Decision, LocalOrigin, RemoteOp};
use crate::segment::Segment;
use crate::tier;

/// Reads `key`'s value if present and live. Shared between `Map::get`'s
/// direct API and `MapContext::get`.
fn read_value<V: ValueCodec>(segment: &Segment, search_key: u32, key_bytes: &[u8]) -> Result<Option<V>> {
    let found = index::find(segment, search_key, key_bytes)?;
    Ok(found
        .filter(|loc| !loc.meta.tombstone)
        .map(|loc| V::decode(tier::read_value_bytes(segment.storage(), loc.entry_off, &loc.meta))))
}

/// Inserts/replaces `key`'s value, keeping `live_count` correct whether
/// the slot was truly absent or reviving a tombstoned one. Shared between
/// `Map::put`/`put_if_absent`'s direct API and `MapContext::put`.
fn write_value<V: ValueCodec>(
    segment: &Segment,
    region: &Region,
    clock: &dyn ClockSource,
    search_key: u32,
    key_bytes: &[u8],
    value_bytes: &[u8],
) -> Result<Option<V>> {
    let existing = index::find(segment, search_key, key_bytes)?;
    let was_tombstoned = existing.as_ref().is_some_and(|loc| loc.meta.tombstone);
    let prior = existing
        .filter(|loc| !loc.meta.tombstone)
        .map(|loc| V::decode(tier::read_value_bytes(segment.storage(), loc.entry_off, &loc.meta)));
    let origin_ts = tier::stamp_now(clock);
    let origin_id = region.node_id();
    let outcome = index::insert(segment, search_key, key_bytes, value_bytes, origin_ts, origin_id, &mut || {
        region.alloc_pool_tier()
    })?;
    if was_tombstoned && matches!(outcome, InsertOutcome::Replaced { .. }) {
        segment.live_count().fetch_add(1, Ordering::AcqRel);
    }
    Ok(prior)
}

/// Removes `key`, tombstoning rather than freeing when replication is
/// enabled. Shared between `Map::remove`'s direct API and
/// `MapContext::remove`.
fn remove_value<V: ValueCodec>(
    segment: &Segment,
    region: &Region,
    clock: &dyn ClockSource,
    search_key: u32,
    key_bytes: &[u8],
) -> Result<Option<V>> {
    let found = index::find(segment, search_key, key_bytes)?.filter(|loc| !loc.meta.tombstone);
    let prior = found
        .as_ref()
        .map(|loc| V::decode(tier::read_value_bytes(segment.storage(), loc.entry_off, &loc.meta)));
    if let Some(loc) = &found {
        if region.replication_enabled() {
            let ts = tier::stamp_now(clock);
            tier::tombstone_with_origin(segment.storage(), loc.entry_off, ts, region.node_id());
            segment.live_count().fetch_sub(1, Ordering::AcqRel);
        } else {
            index::remove(segment, search_key, key_bytes)?;
        }
    }
    Ok(prior)
}

/// A replicated, process-shareable hash map keyed by `K` with values
/// `V`. Every operation acquires exactly the lock level it needs on the
/// owning segment and releases it on return.
pub struct Map<K, V> {
    region: Arc<Region>,
    clock: Arc<dyn ClockSource>,
    _marker: PhantomData<(K, V)>,
}

impl<K, V> Clone for Map<K, V> {
    fn clone(&self) -> Self {
        Map {
            region: self.region.clone(),
            clock: self.clock.clone(),
            _marker: PhantomData,
        }
    }
}

impl<K: KeyCodec, V: ValueCodec> Map<K, V> {
    pub fn create(config: MapConfig, seed: u64) -> Result<Self> {
        let region = Region::create(&config, seed)?;
        Ok(Map {
            region: Arc::new(region),
            clock: Arc::new(SystemClock),
            _marker: PhantomData,
        })
    }

    /// Constructs a map with an explicit clock source, bypassing
    /// `SystemClock`. Primarily useful for deterministic replication
    /// tests (see `FixedClock`).
    pub fn with_clock(config: MapConfig, seed: u64, clock: Arc<dyn ClockSource>) -> Result<Self> {
        let region = Region::create(&config, seed)?;
        Ok(Map {
            region: Arc::new(region),
            clock,
            _marker: PhantomData,
        })
    }

    fn context_for(&self, key_bytes: &[u8]) -> (LockContext, u32, u32) {
        let (seg_idx, search_key) = self.region.route(key_bytes);
        let segment = self.region.segment(seg_idx).clone();
        (LockContext::new(segment), seg_idx, search_key)
    }

    pub fn get(&self, key: &K) -> Result<Option<V>> {
        let key_bytes = key.encode();
        let (mut ctx, seg_idx, search_key) = self.context_for(&key_bytes);
        ctx.lock_read()?;
        let segment = self.region.segment(seg_idx);
        let result = read_value::<V>(segment, search_key, &key_bytes)?;
        ctx.unlock()?;
        Ok(result)
    }

    /// Opens a context-scoped handle on `key`, read-biased: the caller is
    /// expected to take `read_lock` first and optionally upgrade to
    /// `update_lock`/`write_lock` from there. The handle's lock state
    /// starts `Unlocked` either way — `query_context`/`update_context`
    /// differ only in the caller's intent, not in what they return.
    pub fn query_context(&self, key: &K) -> MapContext<K, V> {
        self.context_handle(key)
    }

    /// Opens a context-scoped handle on `key`, write-biased: the caller
    /// is expected to take `update_lock`/`write_lock` directly.
    pub fn update_context(&self, key: &K) -> MapContext<K, V> {
        self.context_handle(key)
    }

    fn context_handle(&self, key: &K) -> MapContext<K, V> {
        let key_bytes = key.encode();
        let (ctx, _, search_key) = self.context_for(&key_bytes);
        MapContext {
            ctx,
            region: self.region.clone(),
            clock: self.clock.clone(),
            key_bytes,
            search_key,
            _marker: PhantomData,
        }
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Unconditional insert/replace. Returns the previous value, if any.
    pub fn put(&self, key: &K, value: &V) -> Result<Option<V>> {
        let key_bytes = key.encode();
        let value_bytes = value.encode();
        let (mut ctx, seg_idx, search_key) = self.context_for(&key_bytes);
        ctx.lock_write()?;
        let segment = self.region.segment(seg_idx).clone();
        let prior = write_value::<V>(&segment, &self.region, self.clock.as_ref(), search_key, &key_bytes, &value_bytes)?;
        ctx.unlock()?;
        Ok(prior)
    }

    /// Inserts only if `key` is absent (a tombstoned key counts as
    /// absent). Returns `true` if the insert happened.
    pub fn put_if_absent(&self, key: &K, value: &V) -> Result<bool> {
        let key_bytes = key.encode();
        let value_bytes = value.encode();
        let (mut ctx, seg_idx, search_key) = self.context_for(&key_bytes);
        ctx.lock_write()?;
        let segment = self.region.segment(seg_idx).clone();
        if index::find(&segment, search_key, &key_bytes)?.is_some_and(|loc| !loc.meta.tombstone) {
            ctx.unlock()?;
            return Ok(false);
        }
        let origin_ts = tier::stamp_now(self.clock.as_ref());
        let origin_id = self.region.node_id();
        let region = self.region.clone();
        let outcome = index::insert(&segment, search_key, &key_bytes, &value_bytes, origin_ts, origin_id, &mut || {
            region.alloc_pool_tier()
        })?;
        // A `Replaced` outcome here only ever means reviving a tombstoned
        // slot (a live match would have returned `false` above), and
        // `index::insert` only bumps `live_count` on its `Inserted` branch.
        if let InsertOutcome::Replaced { .. } = outcome {
            segment.live_count().fetch_add(1, Ordering::AcqRel);
        }
        ctx.unlock()?;
        Ok(matches!(outcome, InsertOutcome::Inserted | InsertOutcome::Replaced { .. }))
    }

    /// Removes `key`. When replication is enabled the entry is
    /// tombstoned rather than physically reclaimed, so the acceptance
    /// rule can still compare its origin timestamp against a remote op
    /// that arrives late; otherwise it is freed and back-shifted
    /// immediately.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        let key_bytes = key.encode();
        let (mut ctx, seg_idx, search_key) = self.context_for(&key_bytes);
        ctx.lock_write()?;
        let segment = self.region.segment(seg_idx).clone();
        let prior = remove_value::<V>(&segment, &self.region, self.clock.as_ref(), search_key, &key_bytes)?;
        ctx.unlock()?;
        Ok(prior)
    }

    /// Replaces the value for `key` only if it is already present (a
    /// tombstoned key counts as absent). Returns `true` if a replacement
    /// happened.
    pub fn replace(&self, key: &K, value: &V) -> Result<bool> {
        let key_bytes = key.encode();
        let value_bytes = value.encode();
        let (mut ctx, seg_idx, search_key) = self.context_for(&key_bytes);
        ctx.lock_write()?;
        let segment = self.region.segment(seg_idx).clone();
        if !index::find(&segment, search_key, &key_bytes)?.is_some_and(|loc| !loc.meta.tombstone) {
            ctx.unlock()?;
            return Ok(false);
        }
        let origin_ts = tier::stamp_now(self.clock.as_ref());
        let origin_id = self.region.node_id();
        let region = self.region.clone();
        index::insert(&segment, search_key, &key_bytes, &value_bytes, origin_ts, origin_id, &mut || {
            region.alloc_pool_tier()
        })?;
        ctx.unlock()?;
        Ok(true)
    }

    /// Applies a remote write/delete operation, honoring the replication
    /// acceptance rule. No-op (returns `Decision::Discard`) if this map
    /// was not configured with replication enabled.
    pub fn remote_apply(&self, key: &K, value: &V, remote_ts: u64, remote_id: u8, tombstone: bool) -> Result<Decision> {
        if !self.region.replication_enabled() {
            return Ok(Decision::Discard);
        }
        let key_bytes = key.encode();
        let value_bytes = value.encode();
        let (mut ctx, seg_idx, search_key) = self.context_for(&key_bytes);
        ctx.lock_write()?;
        let segment = self.region.segment(seg_idx).clone();
        let existing = index::find(&segment, search_key, &key_bytes)?;
        let was_live = existing.as_ref().is_some_and(|loc| !loc.meta.tombstone);
        let decision = match &existing {
            Some(loc) => replication::decide(
                LocalOrigin { ts: loc.meta.origin_ts, id: loc.meta.origin_id },
                RemoteOp { ts: remote_ts, id: remote_id },
                self.region.node_id(),
            ),
            None => Decision::Accept,
        };
        if decision == Decision::Accept {
            if tombstone {
                if let Some(loc) = &existing {
                    tier::tombstone_with_origin(segment.storage(), loc.entry_off, remote_ts, remote_id);
                    if was_live {
                        segment.live_count().fetch_sub(1, Ordering::AcqRel);
                    }
                } else {
                    // Nothing local to tombstone; record it anyway so a later,
                    // older write cannot resurrect a value that should stay
                    // deleted, per the spec's tombstone-retention rule.
                    let region = self.region.clone();
                    index::insert(&segment, search_key, &key_bytes, &[], remote_ts, remote_id, &mut || {
                        region.alloc_pool_tier()
                    })?;
                    if let Some(loc) = index::find(&segment, search_key, &key_bytes)? {
                        tier::set_tombstone(segment.storage(), loc.entry_off, true);
                    }
                    // `index::insert` just counted this fresh entry as live
                    // (truly-absent key); it is tombstoned in the same
                    // breath, so the net live-count effect must be zero.
                    segment.live_count().fetch_sub(1, Ordering::AcqRel);
                }
            } else {
                let region = self.region.clone();
                let outcome = index::insert(&segment, search_key, &key_bytes, &value_bytes, remote_ts, remote_id, &mut || {
                    region.alloc_pool_tier()
                })?;
                if !was_live && matches!(outcome, InsertOutcome::Replaced { .. }) {
                    segment.live_count().fetch_add(1, Ordering::AcqRel);
                }
            }
        }
        ctx.unlock()?;
        Ok(decision)
    }

    pub fn len(&self) -> u64 {
        self.region.total_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates every live (non-tombstoned) entry across every segment
    /// and tier. Takes a read lock on each segment in turn rather than
    /// across the whole map, so this does not serialize concurrent
    /// writers on unrelated segments — the tradeoff is that entries
    /// inserted or removed during the scan on a not-yet-visited segment
    /// may or may not be observed, which the spec leaves unspecified.
    pub fn iter(&self) -> Result<Vec<(K, V)>> {
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
                    let value = V::decode(tier::read_value_bytes(segment.storage(), entry_off, &meta));
                    out.push((key, value));
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

    pub fn entry_count(&self) -> u64 {
        self.len()
    }
}

/// A context-scoped handle on one key, returned by `Map::query_context`/
/// `Map::update_context`. Wraps a `LockContext` so `read_lock`/
/// `update_lock`/`write_lock` are re-entrant the same way direct `Map`
/// calls are internally, but lets the caller hold the lock across several
/// entry accesses instead of taking and releasing it once per call —
/// this is what makes `ForbiddenUpgrade` (an outer read-locked context
/// refusing an inner update-locked one on the same segment) observable
/// from outside the crate.
///
/// Resources are released on every exit path: `unlock` falls back to the
/// weakest held level the same way the underlying `LockContext` does, and
/// dropping the handle without calling `unlock` fully releases whatever
/// is still held.
pub struct MapContext<K, V> {
    ctx: LockContext,
    region: Arc<Region>,
    clock: Arc<dyn ClockSource>,
    key_bytes: Vec<u8>,
    search_key: u32,
    _marker: PhantomData<(K, V)>,
}

impl<K, V: ValueCodec> MapContext<K, V> {
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

    /// Non-blocking update-lock attempt; `false` on expiry rather than an
    /// error, matching `tryUpdateLock(time)`'s boolean contract.
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

    /// Reads the entry's current value. Requires at least `read_lock`.
    pub fn get(&self) -> Result<Option<V>> {
        self.require(LockLevel::Read)?;
        read_value::<V>(self.ctx.segment(), self.search_key, &self.key_bytes)
    }

    /// Writes the entry's value. Requires `write_lock`.
    pub fn put(&self, value: &V) -> Result<Option<V>> {
        self.require(LockLevel::Write)?;
        write_value::<V>(self.ctx.segment(), &self.region, self.clock.as_ref(), self.search_key, &self.key_bytes, &value.encode())
    }

    /// Removes the entry. Requires `write_lock`.
    pub fn remove(&self) -> Result<Option<V>> {
        self.require(LockLevel::Write)?;
        remove_value::<V>(self.ctx.segment(), &self.region, self.clock.as_ref(), self.search_key, &self.key_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::MapConfig;

    fn small_map() -> Map<String, String> {
        let cfg = MapConfig::builder()
            .segments(2)
            .tier_slots(16)
            .max_entry_bytes(64)
            .pool_tier_count(4)
            .build()
            .unwrap();
        Map::create(cfg, 7).unwrap()
    }

    #[test]
    fn put_get_remove_roundtrip() {
        let map = small_map();
        assert_eq!(map.get(&"a".to_string()).unwrap(), None);
        assert_eq!(map.put(&"a".to_string(), &"1".to_string()).unwrap(), None);
        assert_eq!(map.get(&"a".to_string()).unwrap(), Some("1".to_string()));
        assert_eq!(map.put(&"a".to_string(), &"2".to_string()).unwrap(), Some("1".to_string()));
        assert_eq!(map.remove(&"a".to_string()).unwrap(), Some("2".to_string()));
        assert_eq!(map.get(&"a".to_string()).unwrap(), None);
    }

    #[test]
    fn put_if_absent_respects_existing_value() {
        let map = small_map();
        assert!(map.put_if_absent(&"k".to_string(), &"v1".to_string()).unwrap());
        assert!(!map.put_if_absent(&"k".to_string(), &"v2".to_string()).unwrap());
        assert_eq!(map.get(&"k".to_string()).unwrap(), Some("v1".to_string()));
    }

    #[test]
    fn replace_requires_existing_key() {
        let map = small_map();
        assert!(!map.replace(&"k".to_string(), &"v".to_string()).unwrap());
        map.put(&"k".to_string(), &"v0".to_string()).unwrap();
        assert!(map.replace(&"k".to_string(), &"v1".to_string()).unwrap());
        assert_eq!(map.get(&"k".to_string()).unwrap(), Some("v1".to_string()));
    }

    #[test]
    fn len_tracks_live_entries() {
        let map = small_map();
        assert_eq!(map.len(), 0);
        map.put(&"a".to_string(), &"1".to_string()).unwrap();
        map.put(&"b".to_string(), &"2".to_string()).unwrap();
        assert_eq!(map.len(), 2);
        map.remove(&"a".to_string()).unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn iter_returns_all_live_entries() {
        let map = small_map();
        map.put(&"a".to_string(), &"1".to_string()).unwrap();
        map.put(&"b".to_string(), &"2".to_string()).unwrap();
        let mut entries = map.iter().unwrap();
        entries.sort();
        assert_eq!(entries, vec![("a".to_string(), "1".to_string()), ("b".to_string(), "2".to_string())]);
    }

    #[test]
    fn remote_apply_accepts_newer_write() {
        let cfg = MapConfig::builder()
            .segments(2)
            .tier_slots(16)
            .max_entry_bytes(64)
            .pool_tier_count(4)
            .replication(5)
            .build()
            .unwrap();
        let clock: Arc<dyn ClockSource> = Arc::new(FixedClock::new(vec![10]));
        let map: Map<String, String> = Map::with_clock(cfg, 7, clock).unwrap();
        map.put(&"k".to_string(), &"local".to_string()).unwrap();
        let decision = map.remote_apply(&"k".to_string(), &"remote".to_string(), 999, 1, false).unwrap();
        assert_eq!(decision, Decision::Accept);
        assert_eq!(map.get(&"k".to_string()).unwrap(), Some("remote".to_string()));
    }

    #[test]
    fn remote_apply_discards_stale_write() {
        let cfg = MapConfig::builder()
            .segments(2)
            .tier_slots(16)
            .max_entry_bytes(64)
            .pool_tier_count(4)
            .replication(5)
            .build()
            .unwrap();
        let clock: Arc<dyn ClockSource> = Arc::new(FixedClock::new(vec![1000]));
        let map: Map<String, String> = Map::with_clock(cfg, 7, clock).unwrap();
        map.put(&"k".to_string(), &"local".to_string()).unwrap();
        let decision = map.remote_apply(&"k".to_string(), &"remote".to_string(), 1, 1, false).unwrap();
        assert_eq!(decision, Decision::Discard);
        assert_eq!(map.get(&"k".to_string()).unwrap(), Some("local".to_string()));
    }

    #[test]
    fn query_context_get_put_remove_roundtrip() {
        let map = small_map();
        let mut ctx = map.update_context(&"a".to_string());
        ctx.write_lock().unwrap();
        assert_eq!(ctx.get().unwrap(), None);
        assert_eq!(ctx.put(&"1".to_string()).unwrap(), None);
        assert_eq!(ctx.get().unwrap(), Some("1".to_string()));
        assert_eq!(ctx.remove().unwrap(), Some("1".to_string()));
        ctx.unlock().unwrap();
    }

    #[test]
    fn context_entry_access_without_lock_is_illegal_monitor_state() {
        let map = small_map();
        let ctx = map.query_context(&"a".to_string());
        assert!(matches!(ctx.get(), Err(MapError::IllegalMonitorState)));
    }

    #[test]
    fn nested_update_on_outer_read_context_is_forbidden_upgrade() {
        let map = small_map();
        let mut ctx = map.query_context(&"a".to_string());
        ctx.read_lock().unwrap();
        // Attempting to upgrade the same held context from read to
        // update must fail cleanly rather than risk two readers racing
        // to become the single updater.
        assert!(matches!(ctx.update_lock(), Err(MapError::ForbiddenUpgrade { from: LockLevel::Read })));
        assert_eq!(ctx.level(), LockLevel::Read);
        ctx.unlock().unwrap();
    }

    #[test]
    fn try_update_lock_reports_contention() {
        let map = small_map();
        let mut holder = map.update_context(&"a".to_string());
        holder.update_lock().unwrap();
        let mut contender = map.update_context(&"a".to_string());
        assert!(!contender.try_update_lock(Duration::from_millis(5)).unwrap());
        holder.unlock().unwrap();
    }
}
