// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task group supervision (conc.runtime/group, §4.10, C7).
//!
//! A `TaskGroup` is a pure bookkeeping structure: running set, finished map,
//! a wait policy, and a queue of tasks parked in `next_done`/`next_result`.
//! It never resumes a task itself — `record_finished` returns which waiter
//! (if any) should be woken, and the scheduler (the only thing allowed to
//! resume a coroutine) does the actual wake. This keeps the group free of
//! the "cyclic task ↔ group ↔ task" reference the source has: it only ever
//! holds `TaskId`s, same as the rest of the runtime (§9 REDESIGN FLAGS).

use std::any::Any;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use crate::error::WeaveError;
use crate::task::TaskId;

/// Monotonic, scheduler-scoped task-group identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(pub(crate) u64);

impl GroupId {
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Group({})", self.0)
    }
}

/// Outcome of a finished group member.
pub type MemberOutcome = Result<Box<dyn Any + Send>, WeaveError>;

/// `join()` wait policy (§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Wait for every member to finish.
    All,
    /// Wait for the first member to finish, regardless of outcome.
    Any,
    /// Wait for the first member that finishes with a non-null result.
    Object,
    /// Cancel everything immediately instead of waiting.
    None,
}

pub struct TaskGroup {
    pub id: GroupId,
    pub(crate) running: HashSet<TaskId>,
    pub(crate) finished: HashMap<TaskId, MemberOutcome>,
    pub policy: WaitPolicy,
    pub joined: bool,
    /// Finished ids not yet claimed by a `next_done`/`next_result` call.
    pending: VecDeque<TaskId>,
    /// Tasks currently suspended inside `next_done`/`next_result`, in arrival order.
    waiters: VecDeque<TaskId>,
}

impl TaskGroup {
    pub fn new(id: GroupId, policy: WaitPolicy) -> Self {
        Self {
            id,
            running: HashSet::new(),
            finished: HashMap::new(),
            policy,
            joined: false,
            pending: VecDeque::new(),
            waiters: VecDeque::new(),
        }
    }

    /// Adopt a task into this group. Invariant: a task belongs to at most one group.
    pub fn adopt(&mut self, task: TaskId) -> Result<(), WeaveError> {
        if self.joined {
            return Err(WeaveError::invalid_state(format!(
                "cannot add task {task} to group {}: already joined",
                self.id
            )));
        }
        self.running.insert(task);
        Ok(())
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.running.contains(&task) || self.finished.contains_key(&task)
    }

    /// Record that a member finished. Returns a waiter to wake, if any was
    /// parked in `next_done`/`next_result` (oldest first, matching the
    /// ready-queue FIFO ordering guarantee in §5).
    pub fn record_finished(&mut self, task: TaskId, outcome: MemberOutcome) -> Option<TaskId> {
        self.running.remove(&task);
        self.finished.insert(task, outcome);
        match self.waiters.pop_front() {
            Some(waiter) => Some(waiter),
            None => {
                self.pending.push_back(task);
                None
            }
        }
    }

    /// Non-blocking: take the next already-finished id, if one is queued.
    pub fn take_pending(&mut self) -> Option<TaskId> {
        self.pending.pop_front()
    }

    /// Park a task as a waiter; the scheduler suspends it (no enqueue).
    pub fn park_waiter(&mut self, task: TaskId) {
        self.waiters.push_back(task);
    }

    /// Drop `task` from the waiter queue if it's parked there (cancellation).
    pub fn remove_waiter(&mut self, task: TaskId) {
        self.waiters.retain(|&t| t != task);
    }

    pub fn is_empty_running(&self) -> bool {
        self.running.is_empty()
    }

    pub fn running_ids(&self) -> Vec<TaskId> {
        self.running.iter().copied().collect()
    }

    pub fn finished_outcome(&self, task: TaskId) -> Option<&MemberOutcome> {
        self.finished.get(&task)
    }

    /// Claim (remove) a finished member's outcome — the "one real consumer"
    /// rule: once `next_result` takes it, it's gone.
    pub fn take_finished(&mut self, task: TaskId) -> Option<MemberOutcome> {
        self.finished.remove(&task)
    }

    /// Any member finished at all, claimed or not (`join(Any)`).
    pub fn has_any_finished(&self) -> bool {
        !self.finished.is_empty()
    }

    /// Any member finished with a result other than `()`, or with an
    /// exception — either counts as "not nothing" for `join(Object)`.
    pub fn any_finished_non_null(&self) -> bool {
        self.finished.values().any(|o| match o {
            Ok(v) => v.downcast_ref::<()>().is_none(),
            Err(_) => true,
        })
    }

    pub fn mark_joined(&mut self) {
        self.joined = true;
    }
}
