//! fork()-duplication hooks (§4.7 `fork_mode`, C7).
//!
//! A `fork()`'d child keeps only the calling thread; the ping/watch loops'
//! tasks and the Tokio runtime worker threads that drove them do not exist
//! in the child at all. So the hook installed here cannot itself restart
//! anything (it runs between `fork()` and `exec()`/return, where async-
//! signal-safety rules forbid allocating or locking a runtime) -- it only
//! records which side needs attention. The host calls
//! [`crate::lifecycle::Cluster::handle_fork`] after the `fork()` call
//! returns to act on it.
//!
//! `pthread_atfork` handlers are bare `extern "C" fn()` with no user-data
//! slot, so the pending side lives in a process-wide static. Only one
//! cluster's hook can be armed at a time, matching the original library's
//! single global hook.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkSide {
    Parent,
    Child,
}

const NONE: u8 = 0;
const PARENT: u8 = 1;
const CHILD: u8 = 2;

static PENDING: AtomicU8 = AtomicU8::new(NONE);
static ARMED: AtomicU8 = AtomicU8::new(0);

/// Arm the process-wide `pthread_atfork` hooks, idempotently. Safe to call
/// from multiple `Cluster`s; the hooks themselves are unconditional --
/// which side gets acted on is decided later by whoever calls
/// `take_pending` and knows its own `fork_mode`.
pub fn arm() {
    if ARMED.swap(1, Ordering::SeqCst) == 0 {
        unsafe {
            libc::pthread_atfork(None, Some(mark_parent), Some(mark_child));
        }
    }
}

extern "C" fn mark_parent() {
    PENDING.store(PARENT, Ordering::SeqCst);
}

extern "C" fn mark_child() {
    PENDING.store(CHILD, Ordering::SeqCst);
}

/// Consume and clear the pending fork notification, if any.
pub fn take_pending() -> Option<ForkSide> {
    match PENDING.swap(NONE, Ordering::SeqCst) {
        PARENT => Some(ForkSide::Parent),
        CHILD => Some(ForkSide::Child),
        _ => None,
    }
}

/// Test-only stand-in for the `pthread_atfork` callbacks firing, so
/// `Cluster::handle_fork` can be exercised without an actual `fork()`.
#[cfg(test)]
pub(crate) fn simulate(side: ForkSide) {
    match side {
        ForkSide::Parent => mark_parent(),
        ForkSide::Child => mark_child(),
    }
}

/// `PENDING`/`ARMED` are process-wide by design (one global hook, matching
/// the original library), so any test touching them must hold this for its
/// duration or risk another test's fork notification racing it.
#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_pending_is_empty_until_marked() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        assert_eq!(take_pending(), None);
        mark_child();
        assert_eq!(take_pending(), Some(ForkSide::Child));
        assert_eq!(take_pending(), None);
    }
}
