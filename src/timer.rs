// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer heap (conc.runtime/timer, §4.3, C1).
//!
//! Portable fallback implementation per spec: entries are kept in reverse
//! trigger-time order so the *last* element always fires soonest. Inserting
//! walks back from the end until the correct slot is found; each tick pops
//! every entry whose trigger time has passed. Cancellation does a linear
//! scan by handle id — acceptable for the handful of in-flight timers a
//! cooperative scheduler holds at once, and it keeps the heap free of any
//! native-timer dependency (§4.3: "a native-timer-backed implementation may
//! substitute; both satisfy the same contract").

use std::time::{Duration, Instant};

use crate::coroutine::Value;
use crate::error::WeaveError;
use crate::task::TaskId;

/// What happens to the owning task when a timer fires.
pub enum TimerEffect {
    /// Send this value into the task and reschedule it.
    Resume(Value),
    /// Inject this error into the task and reschedule it.
    Throw(WeaveError),
}

/// A cancellable handle into the heap. Stopping the handle before it fires
/// prevents the callback entirely (§5: "cancelling the timer before it
/// fires prevents it entirely").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

struct Entry {
    id: u64,
    trigger: Instant,
    owner: TaskId,
    effect: TimerEffect,
}

pub struct TimerHeap {
    /// Reverse trigger-time order: `entries.last()` fires soonest.
    entries: Vec<Entry>,
    next_id: u64,
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 0,
        }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            entries: Vec::with_capacity(cap),
            next_id: 0,
        }
    }

    /// Arm a timer that fires `delay` from `now`.
    pub fn arm(&mut self, now: Instant, delay: Duration, owner: TaskId, effect: TimerEffect) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        let trigger = now + delay;
        let entry = Entry {
            id,
            trigger,
            owner,
            effect,
        };

        // Back-walk from the end (soonest-first) until we find where this
        // entry's trigger time belongs: entries after it must fire no later.
        let mut idx = self.entries.len();
        while idx > 0 && self.entries[idx - 1].trigger <= trigger {
            idx -= 1;
        }
        self.entries.insert(idx, entry);
        TimerHandle(id)
    }

    /// Stop and remove a timer. Returns `false` if it already fired or was
    /// never armed (a cancel on an unknown/expired id is a no-op).
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        if let Some(pos) = self.entries.iter().position(|e| e.id == handle.0) {
            self.entries.remove(pos);
            true
        } else {
            false
        }
    }

    /// Remove every timer owned by `task` (used when a task terminates or
    /// is cancelled while still carrying a timer handle).
    pub fn cancel_owner(&mut self, task: TaskId) {
        self.entries.retain(|e| e.owner != task);
    }

    /// Pop every entry due at or before `now`, in non-decreasing trigger
    /// order (ties broken by insertion order, per §5).
    pub fn pop_due(&mut self, now: Instant) -> Vec<(TaskId, TimerEffect)> {
        let mut fired = Vec::new();
        while let Some(last) = self.entries.last() {
            if last.trigger <= now {
                let entry = self.entries.pop().unwrap();
                fired.push((entry.owner, entry.effect));
            } else {
                break;
            }
        }
        fired
    }

    /// How long until the next timer is due, if any.
    pub fn next_due_in(&self, now: Instant) -> Option<Duration> {
        self.entries
            .last()
            .map(|e| e.trigger.saturating_duration_since(now))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
