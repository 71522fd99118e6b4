//! Clock source for replicable entries' `originTimestamp`.
//!
//! Out of scope per the spec as a consumed capability ("monotone-ish,
//! comparable across nodes at microsecond granularity; ties broken by node
//! id") — this module provides the trait plus the one implementation this
//! crate needs to be exercisable end to end.

use std::time::{SystemTime, UNIX_EPOCH};

pub trait ClockSource: Send + Sync {
    /// Microsecond-granularity wall-clock reading. Ties across nodes are
    /// broken by node id in the replication acceptance rule, not here.
    fn now_micros(&self) -> u64;
}

/// Wall-clock source backed by `SystemTime`. Wraps within an operational
/// lifetime is treated as impossible per the spec's own stated assumption.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_micros() as u64
    }
}

/// Deterministic clock for tests: returns values from a caller-supplied
/// sequence, advancing on each call (sticking at the last value once
/// exhausted), so replication scenarios can pin exact timestamps. Public
/// (not `#[cfg(test)]`-gated) so integration tests outside this crate's
/// own test binary can drive `Map::with_clock` deterministically too.
pub struct FixedClock {
    ticks: std::sync::Mutex<Vec<u64>>,
}

impl FixedClock {
    pub fn new(ticks: Vec<u64>) -> Self {
        FixedClock {
            ticks: std::sync::Mutex::new(ticks),
        }
    }
}

impl ClockSource for FixedClock {
    fn now_micros(&self) -> u64 {
        let mut t = self.ticks.lock().unwrap();
        if t.len() > 1 {
            t.remove(0)
        } else {
            *t.first().unwrap_or(&0)
        }
    }
}
