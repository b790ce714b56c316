// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task representation (conc.runtime/task, data model §3).
//!
//! A `Task` wraps a restartable coroutine plus the bookkeeping the
//! scheduler needs: lifecycle state, resume count, result/exception slots,
//! caller, group membership, and an active timer handle. Tasks are held in
//! the scheduler's id-indexed table; nothing outside the scheduler holds a
//! strong reference to one, which is the "id-indexed tables (arena +
//! integer id)" substitution REDESIGN FLAGS §9 calls for in place of the
//! cyclic task/group references the source used.

use std::any::Any;
use std::fmt;
use std::os::unix::io::RawFd;

use crate::coroutine::Coroutine;
use crate::error::WeaveError;
use crate::group::GroupId;

/// Monotonic, scheduler-scoped task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    /// Construct from a raw id. Exposed for tests and adapters that persist
    /// ids (e.g. logging); the scheduler is the only allocator in normal use.
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// Lifecycle state (data model §3). Exactly one holds at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Rescheduled,
    /// Blocked on a future (subprocess/worker).
    Process,
    Completed,
    Erred,
    Cancelled,
    Signaled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Erred | TaskState::Cancelled | TaskState::Signaled
        )
    }
}

/// Type tag (data model §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Default: created and awaited directly.
    Awaited,
    /// Created by a named registered async function.
    Async,
    /// Tied to a `Future` (subprocess/worker).
    Paralleled,
    /// No result retained at termination; never visible in the completed map.
    Stateless,
    /// Drives a background loop dispatching a handler (signal/progress/monitor).
    Networked,
    /// Produced by a self-cancel.
    Cancellation,
}

/// What a `Future`, reader/writer wait, timer, or channel registration needs
/// to find and re-drive when its event fires. Stored on the task so the
/// scheduler can unregister it on cancellation without the primitive's
/// closure having to be reachable independently (§5: "primitives must
/// unregister the task from readiness/timer/channel/future waiters as part
/// of observing the throw").
#[derive(Debug, Clone, Copy)]
pub enum Waiting {
    Reader(RawFd),
    Writer(RawFd),
    Timer,
    Channel,
    Future,
    Join(TaskId),
    Gather,
    Signal(i32),
    Progress,
    /// Parked in `next_done`/`next_result` on a `TaskGroup`.
    GroupNext(GroupId),
    /// Parked in a policy-driven `TaskGroup::join()`.
    GroupJoin(GroupId),
}

/// The fundamental unit of cooperative work.
pub struct Task {
    pub id: TaskId,
    pub(crate) coroutine: Box<dyn Coroutine>,
    pub state: TaskState,
    pub kind: TaskKind,
    pub cycles: u64,
    pub result: Option<Box<dyn Any + Send>>,
    pub exception: Option<WeaveError>,
    /// Task-group membership (back-reference, not ownership).
    pub group: Option<GroupId>,
    /// What this task is currently blocked on, if anything.
    pub waiting: Option<Waiting>,
    /// Opaque adapter state: attached future, channel pair, external handle.
    pub custom: Option<Box<dyn Any + Send>>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("kind", &self.kind)
            .field("cycles", &self.cycles)
            .field("group", &self.group)
            .finish()
    }
}

impl Task {
    pub(crate) fn new(id: TaskId, coroutine: Box<dyn Coroutine>, kind: TaskKind) -> Self {
        Self {
            id,
            coroutine,
            state: TaskState::Pending,
            kind,
            cycles: 0,
            result: None,
            exception: None,
            group: None,
            waiting: None,
            custom: None,
        }
    }

    pub fn is_stateless(&self) -> bool {
        self.kind == TaskKind::Stateless
    }

    /// Result retrieval per §4.2: throws a recorded exception, or raises
    /// `InvalidStateError` if queried before completion on a non-stateless task.
    pub fn try_result(&self) -> Result<&Box<dyn Any + Send>, WeaveError> {
        if !self.state.is_terminal() {
            return Err(WeaveError::invalid_state(format!(
                "task {} has not terminated",
                self.id
            )));
        }
        if let Some(e) = &self.exception {
            return Err(e.clone());
        }
        self.result
            .as_ref()
            .ok_or_else(|| WeaveError::invalid_state(format!("task {} produced no result", self.id)))
    }
}
