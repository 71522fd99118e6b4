//! The shared (process-wide) half of the three-level read/update/write
//! lock protocol: a single `AtomicU64` "lock state word" living in a
//! segment's header, transitioned via compare-and-swap loops.
//!
//! Generalizes the teacher's `ShmRwLock` (a two-state POSIX
//! `pthread_rwlock_t` wrapper over `PTHREAD_PROCESS_SHARED` memory) to the
//! three states (read / update / write) the spec requires, built on plain
//! atomics instead of libc so the same code works whether the word lives
//! in an anonymous in-process allocation or real shared memory.
//!
//! This module only implements the shared-state transitions. Per-thread
//! re-entrancy, upgrade refusal, and the "fall back to read on unlock"
//! policy live one level up, in `context`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::diagnostics::ContextRegistry;
use crate::error::{MapError, Result};

const READERS_MASK: u64 = 0x00FF_FFFF;
const UPDATER_BIT: u64 = 1 << 24;
const WRITER_BIT: u64 = 1 << 25;

const SPIN_ITERS: u32 = 64;
/// Bounded wait budget before a lock acquisition gives up with
/// `DeadLockDetected`. The spec leaves the exact threshold to the
/// implementer (see DESIGN.md Open Questions); 50ms is generous enough
/// not to misfire under ordinary contention while still being a useful
/// backstop against genuine deadlock.
const MAX_WAIT: Duration = Duration::from_millis(50);

#[inline]
fn readers(word: u64) -> u64 {
    word & READERS_MASK
}

#[inline]
fn has_updater(word: u64) -> bool {
    word & UPDATER_BIT != 0
}

#[inline]
fn has_writer(word: u64) -> bool {
    word & WRITER_BIT != 0
}

/// Spin-then-yield until `condition(word)` holds, honoring an optional
/// cancellation check and an optional caller-supplied timeout on top of
/// the hard process-wide deadline.
///
/// Three ways out besides success: the `cancel` probe returns `true`
/// (`Interrupted`), the caller's own `timeout` elapses first (`Timeout`),
/// or nothing budged before the hard `MAX_WAIT` ceiling, in which case a
/// `DeadLockDetected` snapshot is raised regardless of whether a shorter
/// `timeout` was requested.
fn wait_until(
    word: &AtomicU64,
    mut condition: impl FnMut(u64) -> bool,
    registry: &ContextRegistry,
    cancel: Option<&dyn Fn() -> bool>,
    timeout: Option<Duration>,
) -> Result<u64> {
    let start = Instant::now();
    let mut spins = 0u32;
    loop {
        let w = word.load(Ordering::Acquire);
        if condition(w) {
            return Ok(w);
        }
        if let Some(cancel) = cancel {
            if cancel() {
                return Err(MapError::Interrupted);
            }
        }
        let elapsed = start.elapsed();
        if let Some(t) = timeout {
            if elapsed > t {
                return Err(MapError::Timeout);
            }
        }
        if elapsed > MAX_WAIT {
            tracing::warn!("lock word stuck past {MAX_WAIT:?}, raising DeadLockDetected");
            return Err(MapError::DeadLockDetected {
                snapshot: registry.snapshot(),
            });
        }
        if spins < SPIN_ITERS {
            std::hint::spin_loop();
            spins += 1;
        } else {
            tracing::trace!("lock contention backoff, yielding");
            std::thread::yield_now();
        }
    }
}

pub fn shared_read_lock(word: &AtomicU64, registry: &ContextRegistry) -> Result<()> {
    loop {
        let w = wait_until(word, |w| !has_writer(w), registry, None, None)?;
        let new = w + 1;
        if word
            .compare_exchange_weak(w, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(());
        }
    }
}

/// As `shared_read_lock`, but polls `cancel` before each contended wait
/// and returns `Interrupted` with no lock held if it ever answers `true`.
pub fn shared_read_lock_interruptible(word: &AtomicU64, registry: &ContextRegistry, cancel: &dyn Fn() -> bool) -> Result<()> {
    loop {
        let w = wait_until(word, |w| !has_writer(w), registry, Some(cancel), None)?;
        let new = w + 1;
        if word
            .compare_exchange_weak(w, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(());
        }
    }
}

/// As `shared_read_lock`, but gives up with `Timeout` once `timeout`
/// elapses rather than waiting out the full deadlock budget.
pub fn shared_read_lock_timeout(word: &AtomicU64, registry: &ContextRegistry, timeout: Duration) -> Result<()> {
    loop {
        let w = wait_until(word, |w| !has_writer(w), registry, None, Some(timeout))?;
        let new = w + 1;
        if word
            .compare_exchange_weak(w, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(());
        }
    }
}

pub fn shared_read_unlock(word: &AtomicU64) -> Result<()> {
    loop {
        let w = word.load(Ordering::Acquire);
        if readers(w) == 0 {
            return Err(MapError::IllegalMonitorState);
        }
        let new = w - 1;
        if word
            .compare_exchange_weak(w, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(());
        }
    }
}

pub fn shared_update_lock(word: &AtomicU64, registry: &ContextRegistry) -> Result<()> {
    loop {
        let w = wait_until(word, |w| !has_updater(w) && !has_writer(w), registry, None, None)?;
        let new = w | UPDATER_BIT;
        if word
            .compare_exchange_weak(w, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(());
        }
    }
}

pub fn shared_update_lock_interruptible(word: &AtomicU64, registry: &ContextRegistry, cancel: &dyn Fn() -> bool) -> Result<()> {
    loop {
        let w = wait_until(word, |w| !has_updater(w) && !has_writer(w), registry, Some(cancel), None)?;
        let new = w | UPDATER_BIT;
        if word
            .compare_exchange_weak(w, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(());
        }
    }
}

pub fn shared_update_lock_timeout(word: &AtomicU64, registry: &ContextRegistry, timeout: Duration) -> Result<()> {
    loop {
        let w = wait_until(word, |w| !has_updater(w) && !has_writer(w), registry, None, Some(timeout))?;
        let new = w | UPDATER_BIT;
        if word
            .compare_exchange_weak(w, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(());
        }
    }
}

/// Non-blocking update-lock attempt: polls for up to `timeout` and
/// returns `false` on expiry rather than raising an error, matching
/// `tryUpdateLock(time)`'s boolean outcome. `timeout` of zero still
/// succeeds if the lock is uncontended on the first check.
pub fn try_shared_update_lock(word: &AtomicU64, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        let w = word.load(Ordering::Acquire);
        if !has_updater(w) && !has_writer(w) {
            let new = w | UPDATER_BIT;
            if word
                .compare_exchange_weak(w, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
            continue;
        }
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::yield_now();
    }
}

/// Wait for all readers to drain, then claim the writer bit. Caller must
/// already hold the updater bit — acquiring write always goes through
/// update first, so there is never more than one party racing to become
/// writer (matches the spec: "single updater is the unique upgrade
/// candidate, so no deadlock from mutual upgrade").
pub fn shared_claim_writer(word: &AtomicU64, registry: &ContextRegistry) -> Result<()> {
    loop {
        let w = wait_until(word, |w| readers(w) == 0, registry, None, None)?;
        debug_assert!(has_updater(w), "claiming writer without holding updater bit");
        let new = w | WRITER_BIT;
        if word
            .compare_exchange_weak(w, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(());
        }
    }
}

pub fn shared_claim_writer_interruptible(word: &AtomicU64, registry: &ContextRegistry, cancel: &dyn Fn() -> bool) -> Result<()> {
    loop {
        let w = wait_until(word, |w| readers(w) == 0, registry, Some(cancel), None)?;
        debug_assert!(has_updater(w), "claiming writer without holding updater bit");
        let new = w | WRITER_BIT;
        if word
            .compare_exchange_weak(w, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(());
        }
    }
}

pub fn shared_claim_writer_timeout(word: &AtomicU64, registry: &ContextRegistry, timeout: Duration) -> Result<()> {
    loop {
        let w = wait_until(word, |w| readers(w) == 0, registry, None, Some(timeout))?;
        debug_assert!(has_updater(w), "claiming writer without holding updater bit");
        let new = w | WRITER_BIT;
        if word
            .compare_exchange_weak(w, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return Ok(());
        }
    }
}

pub fn shared_downgrade_write_to_update(word: &AtomicU64) {
    word.fetch_and(!WRITER_BIT, Ordering::AcqRel);
}

/// Clears the updater bit and adds one reader in a single CAS, so the
/// context always lands on a held lock rather than momentarily holding
/// none (the spec's "falls back to the weakest held level" rule).
pub fn shared_downgrade_update_to_read(word: &AtomicU64) {
    loop {
        let w = word.load(Ordering::Acquire);
        let new = (w & !UPDATER_BIT) + 1;
        if word
            .compare_exchange_weak(w, new, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_lock_excludes_writer_bit_only() {
        let word = AtomicU64::new(0);
        let registry = ContextRegistry::new();
        shared_read_lock(&word, &registry).unwrap();
        shared_read_lock(&word, &registry).unwrap();
        assert_eq!(readers(word.load(Ordering::Acquire)), 2);
        shared_read_unlock(&word).unwrap();
        shared_read_unlock(&word).unwrap();
        assert_eq!(readers(word.load(Ordering::Acquire)), 0);
    }

    #[test]
    fn update_then_write_then_downgrade() {
        let word = AtomicU64::new(0);
        let registry = ContextRegistry::new();
        shared_update_lock(&word, &registry).unwrap();
        assert!(has_updater(word.load(Ordering::Acquire)));
        shared_claim_writer(&word, &registry).unwrap();
        assert!(has_writer(word.load(Ordering::Acquire)));
        shared_downgrade_write_to_update(&word);
        assert!(!has_writer(word.load(Ordering::Acquire)));
        assert!(has_updater(word.load(Ordering::Acquire)));
        shared_downgrade_update_to_read(&word);
        assert!(!has_updater(word.load(Ordering::Acquire)));
        assert_eq!(readers(word.load(Ordering::Acquire)), 1);
    }

    #[test]
    fn unlock_without_lock_is_illegal_monitor_state() {
        let word = AtomicU64::new(0);
        assert!(matches!(shared_read_unlock(&word), Err(MapError::IllegalMonitorState)));
    }

    #[test]
    fn try_update_lock_succeeds_uncontended_with_zero_timeout() {
        let word = AtomicU64::new(0);
        assert!(try_shared_update_lock(&word, Duration::ZERO));
    }

    #[test]
    fn try_update_lock_fails_when_contended() {
        let word = AtomicU64::new(UPDATER_BIT);
        assert!(!try_shared_update_lock(&word, Duration::from_millis(5)));
    }

    #[test]
    fn read_lock_interruptible_returns_interrupted_on_cancel() {
        let word = AtomicU64::new(WRITER_BIT);
        let registry = ContextRegistry::new();
        let cancel = || true;
        assert!(matches!(
            shared_read_lock_interruptible(&word, &registry, &cancel),
            Err(MapError::Interrupted)
        ));
    }

    #[test]
    fn update_lock_timeout_expires_with_timeout_error() {
        let word = AtomicU64::new(UPDATER_BIT);
        let registry = ContextRegistry::new();
        assert!(matches!(
            shared_update_lock_timeout(&word, &registry, Duration::from_millis(5)),
            Err(MapError::Timeout)
        ));
    }
}
