//! Error kinds surfaced at the crate boundary.
//!
//! Mirrors the error taxonomy of the spec this crate implements: invariant
//! violations are non-recoverable bugs, lock-contention failures are
//! retryable at the caller's discretion, and upgrade misuse is reported
//! with an actionable message rather than silently deadlocking.

use crate::diagnostics::DeadlockSnapshot;
use crate::context::LockLevel;

pub type Result<T> = std::result::Result<T, MapError>;

#[derive(Debug, thiserror::Error)]
pub enum MapError {
    /// A lock acquisition could not make progress within its bounded
    /// spin+park budget. Carries a snapshot of what the current process
    /// was holding at the time, for diagnosis.
    #[error("deadlock detected while acquiring a segment lock: {snapshot:?}")]
    DeadLockDetected { snapshot: DeadlockSnapshot },

    /// An inner lock call tried to acquire `update` or `write` while an
    /// enclosing context on the same thread already holds `read`.
    #[error("cannot upgrade from {from:?} to update/write; acquire the higher lock at the outer scope instead")]
    ForbiddenUpgrade { from: LockLevel },

    /// `unlock` was called on a context that holds no lock.
    #[error("unlock called without a matching lock held")]
    IllegalMonitorState,

    /// The probe loop walked every slot in a tier without finding an
    /// empty slot. This is an invariant violation: tiers are sized so
    /// load factor never reaches 100%.
    #[error("hash lookup overflow in tier (invariant violation, this is a bug): {detail}")]
    HashLookupOverflow { detail: String },

    /// The calling operation was cancelled before a lock was acquired.
    #[error("operation interrupted before lock was acquired")]
    Interrupted,

    /// A deadline-bounded lock acquisition expired.
    #[error("lock acquisition timed out")]
    Timeout,

    /// The shared overflow tier pool is exhausted. Not named in the core
    /// protocol (which treats the allocator as an out-of-scope
    /// collaborator) but a finite in-process pool must surface this
    /// somehow; modeled as its own variant rather than overloading `Io`.
    #[error("tier pool exhausted: all {pool_size} overflow tiers are already chained")]
    TierPoolExhausted { pool_size: u32 },

    /// A key or value exceeded the configured maximum entry size.
    #[error("entry of {actual} bytes exceeds the configured maximum of {max}")]
    EntryTooLarge { actual: usize, max: usize },

    /// Propagated from the out-of-scope serialization/allocator boundary.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
