//! Deadlock diagnostics: a process-wide registry of which contexts hold
//! which locks, snapshotted into `DeadLockDetected` when a lock
//! acquisition cannot make progress within its bounded budget.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::context::LockLevel;

#[derive(Debug, Clone)]
pub struct HeldLockInfo {
    pub segment: u32,
    pub level: LockLevel,
}

/// Snapshot of every lock held by this process at the moment a
/// `DeadLockDetected` error was raised.
#[derive(Debug, Clone, Default)]
pub struct DeadlockSnapshot {
    pub holders: Vec<(u64, Vec<HeldLockInfo>)>,
}

/// Process-wide table of context-id -> locks currently held. One instance
/// per open map, shared by every segment and context so teardown (map
/// close) can clear it in one place rather than relying on thread-local
/// finalization, per the spec's "context leak prevention" design note.
#[derive(Default)]
pub struct ContextRegistry {
    inner: Mutex<HashMap<u64, Vec<HeldLockInfo>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, context_id: u64, segment: u32, level: LockLevel) {
        let mut map = self.inner.lock().unwrap();
        let entry = map.entry(context_id).or_default();
        if let Some(existing) = entry.iter_mut().find(|h| h.segment == segment) {
            existing.level = level;
        } else {
            entry.push(HeldLockInfo { segment, level });
        }
    }

    pub fn clear_segment(&self, context_id: u64, segment: u32) {
        let mut map = self.inner.lock().unwrap();
        if let Some(entry) = map.get_mut(&context_id) {
            entry.retain(|h| h.segment != segment);
            if entry.is_empty() {
                map.remove(&context_id);
            }
        }
    }

    /// Drop all bookkeeping for a context (called on context close).
    pub fn clear_context(&self, context_id: u64) {
        self.inner.lock().unwrap().remove(&context_id);
    }

    pub fn snapshot(&self) -> DeadlockSnapshot {
        let map = self.inner.lock().unwrap();
        DeadlockSnapshot {
            holders: map.iter().map(|(id, locks)| (*id, locks.clone())).collect(),
        }
    }

    /// Drop every entry. Called on map close so thread-local-like state
    /// becomes reclaimable promptly instead of waiting on finalization.
    pub fn clear_all(&self) {
        self.inner.lock().unwrap().clear();
    }
}
