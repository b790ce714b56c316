// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Kernel primitives: the tagged values a coroutine yields to ask the
//! scheduler for something (conc.runtime/kernel, §4.8, C8).
//!
//! The source dispatches on the *dynamic type* of whatever a coroutine
//! yields. Rust has no open dynamic-dispatch-by-downcast story that reads
//! well, so every yieldable operation here is one variant of a closed
//! `Primitive` enum instead (§9 REDESIGN FLAGS: "dynamic dispatch over
//! yielded values" → "tagged variant"). `Scheduler::dispatch` is the single
//! place that matches on it; nothing else needs to know the set exists.

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::coroutine::{Coroutine, Value};
use crate::channel::ChannelId;
use crate::error::WeaveError;
use crate::future::Work;
use crate::gather::GatherOptions;
use crate::group::GroupId;
use crate::task::{TaskId, TaskKind};

/// Everything a coroutine can suspend on.
pub enum Primitive {
    /// Ask for the id of the task currently running.
    CurrentTask,

    /// Spawn `coroutine` as a fire-and-forget task: no result is retained,
    /// its outcome is never visible to `join`/`gather` (§3: `Stateless`).
    StatelessTask(Box<dyn Coroutine>),

    /// Spawn `coroutine` as a normal child task, optionally adopted into
    /// `group`. Resolves with the new task's id.
    CreateTask {
        coroutine: Box<dyn Coroutine>,
        kind: TaskKind,
        group: Option<GroupId>,
    },

    /// Request cooperative cancellation of `TaskId`.
    CancelTask(TaskId),

    /// Suspend until `TaskId` reaches a terminal state, resolving with its
    /// result or propagating its exception.
    JoinTask(TaskId),

    /// Suspend like `JoinTask`, but without consuming the result: resolves
    /// as soon as the target becomes terminal, for a supervisor that only
    /// needs to know *that* something finished.
    MonitorTask(TaskId),

    /// Suspend for at least `Duration`.
    SleepFor(Duration),

    /// Suspend until `fd` is readable.
    ReadWait(RawFd),

    /// Suspend until `fd` is writable.
    WriteWait(RawFd),

    /// Suspend until `members` (per `GatherOptions`) report in.
    GatherWait {
        members: Vec<TaskId>,
        options: GatherOptions,
    },

    /// Wrap another primitive with a deadline: if `inner` hasn't resolved
    /// within `timeout`, resolve with `WeaveError::Timeout` instead (the
    /// wrapped primitive keeps running; compare `TimeoutAfter`, which
    /// instead aborts the whole remaining coroutine body).
    WaitFor {
        inner: Box<Primitive>,
        timeout: Duration,
    },

    /// Open a scope: if the coroutine doesn't finish its next step within
    /// `Duration`, inject `WeaveError::TaskTimeout` at the next suspension
    /// point instead of resuming normally. Per the nested-scope decision in
    /// the design notes, the outer scope always clears its own timer before
    /// the error propagates, and clearing a task's timer also clears any
    /// timer owned by a primitive the task is suspended inside.
    TimeoutAfter(Duration),

    /// Spawn `work` on its own thread as a `Future`-backed task (new task
    /// id, `TaskKind::Paralleled`).
    SpawnTask { work: Work, timeout: Option<Duration> },

    /// Attach `work` to the *current* task instead of creating a new one —
    /// used by a coroutine that wants to await a subprocess/worker inline.
    AddFuture {
        work: Work,
        timeout: Option<Duration>,
        progress_to: Option<TaskId>,
    },

    /// Send `signal` to the future-bearing task `target` (`stop()`/`kill()`).
    SpawnKill { target: TaskId, signal: i32 },

    /// Register the current task as a handler for `i32` (an OS signal
    /// number); resolves once per delivery until removed.
    SignalTask(i32),

    /// Subscribe the current task to progress events forwarded from the
    /// future-bearing task `TaskId`.
    ProgressTask(TaskId),

    /// Create a new rendezvous channel, resolving with its id.
    ChannelMake,

    /// Receive from `ChannelId`.
    ChannelReceive(ChannelId),

    /// Send `Value` into `ChannelId`.
    ChannelSend(ChannelId, Value),

    /// Adopt an already-created task into `group` (§4.10: `add_task`).
    GroupAddTask { group: GroupId, task: TaskId },

    /// Suspend until the next member of `group` finishes; resolves with its
    /// `TaskId` (§4.10: `next_done`).
    GroupNextDone(GroupId),

    /// Suspend until the next member of `group` finishes; resolves with, or
    /// propagates, its result (§4.10: `next_result`).
    GroupNextResult(GroupId),

    /// Cancel every member of `group` still running (§4.10: `cancel_remaining`).
    GroupCancelRemaining(GroupId),

    /// Policy-driven wait over `group`'s membership, then seal it against
    /// further adoption (§4.10: `join`).
    GroupJoin(GroupId),

    /// Begin an orderly shutdown (§4.1): stop every live future, cancel
    /// every task except `skip` and the scheduler's `parent` task, drain
    /// the ready queue, then stop the loop.
    Shutdown(Option<TaskId>),
}

impl std::fmt::Debug for Primitive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = match self {
            Primitive::CurrentTask => "CurrentTask",
            Primitive::StatelessTask(_) => "StatelessTask",
            Primitive::CreateTask { .. } => "CreateTask",
            Primitive::CancelTask(_) => "CancelTask",
            Primitive::JoinTask(_) => "JoinTask",
            Primitive::MonitorTask(_) => "MonitorTask",
            Primitive::SleepFor(_) => "SleepFor",
            Primitive::ReadWait(_) => "ReadWait",
            Primitive::WriteWait(_) => "WriteWait",
            Primitive::GatherWait { .. } => "GatherWait",
            Primitive::WaitFor { .. } => "WaitFor",
            Primitive::TimeoutAfter(_) => "TimeoutAfter",
            Primitive::SpawnTask { .. } => "SpawnTask",
            Primitive::AddFuture { .. } => "AddFuture",
            Primitive::SpawnKill { .. } => "SpawnKill",
            Primitive::SignalTask(_) => "SignalTask",
            Primitive::ProgressTask(_) => "ProgressTask",
            Primitive::ChannelMake => "ChannelMake",
            Primitive::ChannelReceive(_) => "ChannelReceive",
            Primitive::ChannelSend(..) => "ChannelSend",
            Primitive::GroupAddTask { .. } => "GroupAddTask",
            Primitive::GroupNextDone(_) => "GroupNextDone",
            Primitive::GroupNextResult(_) => "GroupNextResult",
            Primitive::GroupCancelRemaining(_) => "GroupCancelRemaining",
            Primitive::GroupJoin(_) => "GroupJoin",
            Primitive::Shutdown(_) => "Shutdown",
        };
        f.write_str(tag)
    }
}

/// A disambiguated error helper so callers constructing `WaitFor`/`TimeoutAfter`
/// rejections don't have to spell out the variant every time.
pub fn timeout_error(scope: bool) -> WeaveError {
    if scope {
        WeaveError::TaskTimeout
    } else {
        WeaveError::Timeout
    }
}
