//! End-to-end replication scenarios against the public `Map` facade,
//! mirroring the concrete walk-throughs in the specification's own
//! worked examples (tie-break by origin, lower-id wins, newer-remote
//! wins, tier overflow under concurrent insert).

use std::sync::Arc;

use ridx_map::clock::{ClockSource, FixedClock};
use ridx_map::config::MapConfig;
use ridx_map::map::Map;
use ridx_map::Decision;

fn init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn replicated_map(node_id: u8, ticks: Vec<u64>) -> Map<String, String> {
    let cfg = MapConfig::builder()
        .segments(4)
        .tier_slots(16)
        .max_entry_bytes(64)
        .pool_tier_count(4)
        .replication(node_id)
        .build()
        .unwrap();
    let clock: Arc<dyn ClockSource> = Arc::new(FixedClock::new(ticks));
    Map::with_clock(cfg, 99, clock).unwrap()
}

#[test]
fn tie_break_local_origin_keeps_local_value() {
    init();
    let map = replicated_map(7, vec![100]);
    map.put(&"k".to_string(), &"mine".to_string()).unwrap();
    let decision = map.remote_apply(&"k".to_string(), &"echo".to_string(), 100, 7, false).unwrap();
    assert_eq!(decision, Decision::Discard);
    assert_eq!(map.get(&"k".to_string()).unwrap(), Some("mine".to_string()));
}

#[test]
fn tie_break_remote_origin_accepts_remote_value() {
    init();
    let map = replicated_map(3, vec![100]);
    map.put(&"k".to_string(), &"stale".to_string()).unwrap();
    let decision = map.remote_apply(&"k".to_string(), &"theirs".to_string(), 100, 7, false).unwrap();
    assert_eq!(decision, Decision::Accept);
    assert_eq!(map.get(&"k".to_string()).unwrap(), Some("theirs".to_string()));
}

#[test]
fn lower_origin_id_wins_on_equal_timestamp() {
    init();
    let map = replicated_map(9, vec![100]);
    map.put(&"k".to_string(), &"node9".to_string()).unwrap();
    let decision = map.remote_apply(&"k".to_string(), &"node2".to_string(), 100, 2, false).unwrap();
    assert_eq!(decision, Decision::Accept);
    assert_eq!(map.get(&"k".to_string()).unwrap(), Some("node2".to_string()));
}

#[test]
fn newer_remote_timestamp_overwrites_regardless_of_id() {
    init();
    let map = replicated_map(2, vec![100]);
    map.put(&"k".to_string(), &"old".to_string()).unwrap();
    let decision = map.remote_apply(&"k".to_string(), &"new".to_string(), 101, 9, false).unwrap();
    assert_eq!(decision, Decision::Accept);
    assert_eq!(map.get(&"k".to_string()).unwrap(), Some("new".to_string()));
}

#[test]
fn tier_overflow_insert_keeps_every_key_reachable() {
    init();
    let cfg = MapConfig::builder()
        .segments(1)
        .tier_slots(8)
        .max_entry_bytes(32)
        .pool_tier_count(16)
        .build()
        .unwrap();
    let map: Map<u32, u32> = Map::create(cfg, 11).unwrap();
    for i in 0..40u32 {
        map.put(&i, &(i * 10)).unwrap();
    }
    for i in 0..40u32 {
        assert_eq!(map.get(&i).unwrap(), Some(i * 10), "lost key {i} to tier-chain overflow");
    }
    assert_eq!(map.len(), 40);
}

#[test]
fn non_replicated_map_discards_remote_apply() {
    init();
    let cfg = MapConfig::builder()
        .segments(2)
        .tier_slots(16)
        .max_entry_bytes(64)
        .pool_tier_count(4)
        .build()
        .unwrap();
    let map: Map<String, String> = Map::create(cfg, 1).unwrap();
    let decision = map.remote_apply(&"k".to_string(), &"v".to_string(), 100, 1, false).unwrap();
    assert_eq!(decision, Decision::Discard);
    assert_eq!(map.get(&"k".to_string()).unwrap(), None);
}
