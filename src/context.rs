//! Per-thread lock state machine atop the shared segment lock (component D).
//!
//! Each `LockContext` tracks nested acquisitions locally so the shared
//! header is only touched when a counter transitions through zero, and
//! enforces the hard invariant that a context already holding `read`
//! cannot upgrade to `update`/`write` in place (deadlock risk: two readers
//! both wanting update).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{MapError, Result};
use crate::lock;
use crate::segment::Segment;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockLevel {
    Unlocked,
    Read,
    Update,
    Write,
}

/// A context scoped to one segment. Acquiring `read`/`update`/`write` is
/// re-entrant on the same context; the underlying shared lock is only
/// touched on the first acquisition of a level and the last release.
pub struct LockContext {
    segment: Segment,
    id: u64,
    state: LockLevel,
    read: u32,
    update: u32,
    write: u32,
}

impl LockContext {
    pub fn new(segment: Segment) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        LockContext {
            segment,
            id,
            state: LockLevel::Unlocked,
            read: 0,
            update: 0,
            write: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn level(&self) -> LockLevel {
        self.state
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    fn register(&self, level: LockLevel) {
        self.segment
            .registry()
            .record(self.id, self.segment.index(), level);
    }

    pub fn lock_read(&mut self) -> Result<()> {
        if self.state == LockLevel::Unlocked {
            lock::shared_read_lock(self.segment.lock_word(), self.segment.registry())?;
            self.state = LockLevel::Read;
        }
        self.read += 1;
        self.register(self.state);
        Ok(())
    }

    pub fn lock_update(&mut self) -> Result<()> {
        if self.state == LockLevel::Read {
            return Err(MapError::ForbiddenUpgrade { from: LockLevel::Read });
        }
        if self.state == LockLevel::Unlocked {
            lock::shared_update_lock(self.segment.lock_word(), self.segment.registry())?;
            self.state = LockLevel::Update;
        }
        self.update += 1;
        self.register(self.state);
        Ok(())
    }

    pub fn lock_write(&mut self) -> Result<()> {
        if self.state == LockLevel::Read {
            return Err(MapError::ForbiddenUpgrade { from: LockLevel::Read });
        }
        match self.state {
            LockLevel::Unlocked => {
                lock::shared_update_lock(self.segment.lock_word(), self.segment.registry())?;
                lock::shared_claim_writer(self.segment.lock_word(), self.segment.registry())?;
                self.state = LockLevel::Write;
            }
            LockLevel::Update => {
                lock::shared_claim_writer(self.segment.lock_word(), self.segment.registry())?;
                self.state = LockLevel::Write;
            }
            _ => {}
        }
        self.write += 1;
        self.register(self.state);
        Ok(())
    }

    /// Non-blocking update-lock attempt: returns `Ok(false)` rather than
    /// waiting out the contention budget if `timeout` elapses first.
    /// Re-entrant like `lock_update` — a context already holding
    /// `update`/`write` always succeeds without touching shared state.
    pub fn try_lock_update(&mut self, timeout: Duration) -> Result<bool> {
        if self.state == LockLevel::Read {
            return Err(MapError::ForbiddenUpgrade { from: LockLevel::Read });
        }
        if self.state == LockLevel::Unlocked {
            if !lock::try_shared_update_lock(self.segment.lock_word(), timeout) {
                return Ok(false);
            }
            self.state = LockLevel::Update;
        }
        self.update += 1;
        self.register(self.state);
        Ok(true)
    }

    /// As `lock_read`, but polls `cancel` before each contended wait and
    /// returns `Interrupted` with no lock state change if it answers
    /// `true` before the lock is acquired.
    pub fn lock_read_interruptible(&mut self, cancel: &dyn Fn() -> bool) -> Result<()> {
        if self.state == LockLevel::Unlocked {
            lock::shared_read_lock_interruptible(self.segment.lock_word(), self.segment.registry(), cancel)?;
            self.state = LockLevel::Read;
        }
        self.read += 1;
        self.register(self.state);
        Ok(())
    }

    /// As `lock_read`, but fails with `Timeout` once `timeout` elapses.
    pub fn lock_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        if self.state == LockLevel::Unlocked {
            lock::shared_read_lock_timeout(self.segment.lock_word(), self.segment.registry(), timeout)?;
            self.state = LockLevel::Read;
        }
        self.read += 1;
        self.register(self.state);
        Ok(())
    }

    /// As `lock_update`, but polls `cancel` before each contended wait.
    pub fn lock_update_interruptible(&mut self, cancel: &dyn Fn() -> bool) -> Result<()> {
        if self.state == LockLevel::Read {
            return Err(MapError::ForbiddenUpgrade { from: LockLevel::Read });
        }
        if self.state == LockLevel::Unlocked {
            lock::shared_update_lock_interruptible(self.segment.lock_word(), self.segment.registry(), cancel)?;
            self.state = LockLevel::Update;
        }
        self.update += 1;
        self.register(self.state);
        Ok(())
    }

    /// As `lock_update`, but fails with `Timeout` once `timeout` elapses.
    pub fn lock_update_timeout(&mut self, timeout: Duration) -> Result<()> {
        if self.state == LockLevel::Read {
            return Err(MapError::ForbiddenUpgrade { from: LockLevel::Read });
        }
        if self.state == LockLevel::Unlocked {
            lock::shared_update_lock_timeout(self.segment.lock_word(), self.segment.registry(), timeout)?;
            self.state = LockLevel::Update;
        }
        self.update += 1;
        self.register(self.state);
        Ok(())
    }

    /// As `lock_write`, but polls `cancel` before each contended wait.
    pub fn lock_write_interruptible(&mut self, cancel: &dyn Fn() -> bool) -> Result<()> {
        if self.state == LockLevel::Read {
            return Err(MapError::ForbiddenUpgrade { from: LockLevel::Read });
        }
        match self.state {
            LockLevel::Unlocked => {
                lock::shared_update_lock_interruptible(self.segment.lock_word(), self.segment.registry(), cancel)?;
                lock::shared_claim_writer_interruptible(self.segment.lock_word(), self.segment.registry(), cancel)?;
                self.state = LockLevel::Write;
            }
            LockLevel::Update => {
                lock::shared_claim_writer_interruptible(self.segment.lock_word(), self.segment.registry(), cancel)?;
                self.state = LockLevel::Write;
            }
            _ => {}
        }
        self.write += 1;
        self.register(self.state);
        Ok(())
    }

    /// As `lock_write`, but fails with `Timeout` once `timeout` elapses.
    pub fn lock_write_timeout(&mut self, timeout: Duration) -> Result<()> {
        if self.state == LockLevel::Read {
            return Err(MapError::ForbiddenUpgrade { from: LockLevel::Read });
        }
        match self.state {
            LockLevel::Unlocked => {
                lock::shared_update_lock_timeout(self.segment.lock_word(), self.segment.registry(), timeout)?;
                lock::shared_claim_writer_timeout(self.segment.lock_word(), self.segment.registry(), timeout)?;
                self.state = LockLevel::Write;
            }
            LockLevel::Update => {
                lock::shared_claim_writer_timeout(self.segment.lock_word(), self.segment.registry(), timeout)?;
                self.state = LockLevel::Write;
            }
            _ => {}
        }
        self.write += 1;
        self.register(self.state);
        Ok(())
    }

    /// Release one nested acquisition of whichever level is currently
    /// held. On the last release of `update`/`write`, the context falls
    /// back to the next lower non-empty level rather than releasing
    /// fully — full release only happens when the context is dropped.
    pub fn unlock(&mut self) -> Result<()> {
        match self.state {
            LockLevel::Write => {
                self.write -= 1;
                if self.write == 0 {
                    lock::shared_downgrade_write_to_update(self.segment.lock_word());
                    if self.update > 0 {
                        self.state = LockLevel::Update;
                    } else {
                        lock::shared_downgrade_update_to_read(self.segment.lock_word());
                        self.state = LockLevel::Read;
                        self.read += 1;
                    }
                }
            }
            LockLevel::Update => {
                self.update -= 1;
                if self.update == 0 {
                    lock::shared_downgrade_update_to_read(self.segment.lock_word());
                    self.state = LockLevel::Read;
                    self.read += 1;
                }
            }
            LockLevel::Read => {
                self.read -= 1;
                if self.read == 0 {
                    lock::shared_read_unlock(self.segment.lock_word())?;
                    self.state = LockLevel::Unlocked;
                    self.segment.registry().clear_segment(self.id, self.segment.index());
                    return Ok(());
                }
            }
            LockLevel::Unlocked => return Err(MapError::IllegalMonitorState),
        }
        self.register(self.state);
        Ok(())
    }
}

impl Drop for LockContext {
    fn drop(&mut self) {
        // Full release on every exit path, regardless of how many nested
        // acquisitions remain, satisfying "resources released on context
        // close on every exit path".
        match self.state {
            LockLevel::Write => {
                lock::shared_downgrade_write_to_update(self.segment.lock_word());
                lock::shared_downgrade_update_to_read(self.segment.lock_word());
                let _ = lock::shared_read_unlock(self.segment.lock_word());
            }
            LockLevel::Update => {
                lock::shared_downgrade_update_to_read(self.segment.lock_word());
                let _ = lock::shared_read_unlock(self.segment.lock_word());
            }
            LockLevel::Read => {
                let _ = lock::shared_read_unlock(self.segment.lock_word());
            }
            LockLevel::Unlocked => {}
        }
        self.segment.registry().clear_context(self.id);
    }
}
