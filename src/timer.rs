//! Ordered timer queue.
//!
//! Backed by a `BTreeMap` keyed by `(expiry_ms, sequence)`: insertion order
//! breaks ties between equal timestamps (the `sequence` field), though ties
//! are never semantically significant — expiry handling is monotone
//! regardless of which same-millisecond timer goes first.

use crate::fiber::FiberId;
use std::collections::BTreeMap;

/// Handle to a timer registered with a [`TimerQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u64);

struct TimerCore {
    expiry_ms: u64,
    sequence: u64,
    fiber: FiberId,
    triggered: bool,
}

/// A scheduler's ordered set of pending timed waits.
#[derive(Default)]
pub struct TimerQueue {
    by_key: BTreeMap<(u64, u64), TimerId>,
    cores: std::collections::HashMap<u64, TimerCore>,
    next_sequence: u64,
    next_id: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        TimerQueue::default()
    }

    /// Registers a new timer expiring at `expiry_ms`, waiting on behalf of
    /// `fiber`. Returns the handle needed to [`TimerQueue::detach`] it
    /// before expiry (e.g. on cancellation by the delegation layer).
    pub fn insert(&mut self, expiry_ms: u64, fiber: FiberId) -> TimerId {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let id = TimerId(self.next_id);
        self.next_id += 1;

        self.by_key.insert((expiry_ms, sequence), id);
        self.cores.insert(
            id.0,
            TimerCore {
                expiry_ms,
                sequence,
                fiber,
                triggered: false,
            },
        );
        id
    }

    /// Removes a timer regardless of whether it has expired. No-op if
    /// already detached (e.g. detached by a prior expiry).
    pub fn detach(&mut self, id: TimerId) {
        if let Some(core) = self.cores.remove(&id.0) {
            self.by_key.remove(&(core.expiry_ms, core.sequence));
        }
    }

    /// The fiber waiting on `id`, if the timer is still registered.
    pub fn fiber_of(&self, id: TimerId) -> Option<FiberId> {
        self.cores.get(&id.0).map(|c| c.fiber)
    }

    /// Timestamp of the earliest still-pending timer, if any.
    pub fn earliest(&self) -> Option<u64> {
        self.by_key.keys().next().map(|(ms, _)| *ms)
    }

    /// Detaches and returns the earliest timer if its expiry is `<= now_ms`,
    /// marking it triggered. Call in a loop to drain every timer due at
    /// `now_ms` (bus-refresh Phase 2).
    pub fn pop_expired(&mut self, now_ms: u64) -> Option<(TimerId, FiberId)> {
        let (&key, &id) = self.by_key.iter().next()?;
        if key.0 > now_ms {
            return None;
        }
        self.by_key.remove(&key);
        let core = self.cores.get_mut(&id.0).expect("key/core desync");
        debug_assert!(!core.triggered, "a timer must expire exactly once");
        core.triggered = true;
        let fiber = core.fiber;
        self.cores.remove(&id.0);
        Some((id, fiber))
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }
}
