//! Delegation surface: the shape a fiber uses to describe what it wants to
//! wait for before a suspension point reenables it.
//!
//! Only the timed variant is wired all the way through to a real wakeup
//! (via [`crate::runtime::sleep_ms`], which bypasses this enum entirely
//! and talks to the scheduler's timer queue directly). The I/O and
//! inter-uthread-communication variants exist so the shape of a multi-way
//! wait is in place, but nothing in this crate ever registers their
//! descriptor with a scheduler's bus yet; their `triggered` flag never
//! flips. Composing one into a [`delegate`] call compiles and returns, it
//! just never completes.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What a fiber is waiting for and whether it has happened yet.
pub enum Delegation {
    /// Wait for `fd` to become readable or writable (direction left to the
    /// caller to interpret; not wired to epoll in this implementation).
    Io { fd: RawFd, triggered: Arc<AtomicBool> },
    /// Wait for an inter-uthread-communication signal (not wired).
    Iuc { triggered: Arc<AtomicBool> },
    /// Wait for `after_ms` to elapse.
    Timed { after_ms: u64, triggered: Arc<AtomicBool> },
}

impl Delegation {
    pub fn io(fd: RawFd) -> Self {
        Delegation::Io {
            fd,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn iuc() -> Self {
        Delegation::Iuc {
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn timed(after_ms: u64) -> Self {
        Delegation::Timed {
            after_ms,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_triggered(&self) -> bool {
        let flag = match self {
            Delegation::Io { triggered, .. } => triggered,
            Delegation::Iuc { triggered, .. } => triggered,
            Delegation::Timed { triggered, .. } => triggered,
        };
        flag.load(Ordering::Acquire)
    }
}

/// Bundles several delegations into the shape a single suspension point
/// waits on. Present for API-compatibility with the described wait
/// surface; the only delegation kind that can ever actually resolve today
/// is [`Delegation::Timed`], and only through [`crate::runtime::sleep_ms`]
/// rather than through this combinator.
pub fn delegate(events: Vec<Delegation>) -> Vec<Delegation> {
    events
}
