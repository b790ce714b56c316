// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error taxonomy (conc.errors).
//!
//! One enum for every contract failure the scheduler can surface. Variants
//! map 1:1 onto the error kinds a coroutine can observe via `Resume::Throw`
//! or a caller can observe as a `Result::Err`.

use crate::task::TaskId;

/// Every error the runtime can raise, either into a coroutine or out to a caller.
#[derive(Debug, Clone, thiserror::Error)]
pub enum WeaveError {
    /// Cooperative cancellation of a task. Injected into the coroutine at
    /// its next resume; may be caught and cleaned up.
    #[error("task {0:?} was cancelled")]
    Cancelled(TaskId),

    /// A future-backed task was killed by an OS signal (`spawn_kill`).
    /// Injected into the coroutine at its next resume, same as `Cancelled`
    /// but distinguishable by which signal did it.
    #[error("task killed by signal {0}")]
    Signaled(i32),

    /// A timeout elapsed while a caller was awaiting the timed operation
    /// (`wait_for`, `join` with a deadline).
    #[error("operation timed out")]
    Timeout,

    /// A timeout elapsed inside a `timeout_after` scope.
    #[error("task timeout scope expired")]
    TaskTimeout,

    /// Result/exception queried before terminal transition on a
    /// non-stateless task, or a group was joined twice.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Malformed id, missing task, illegal option.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `race` exceeds the number of tasks given to `gather_wait`, or
    /// `task_done` was called more times than the queue was filled.
    #[error("length exception: {0}")]
    LengthException(String),

    /// `Queue::put_nowait` on a full queue.
    #[error("queue is full")]
    QueueFull,

    /// `Queue::get_nowait` on an empty queue.
    #[error("queue is empty")]
    QueueEmpty,

    /// All receivers/senders on a channel have gone away.
    #[error("channel closed")]
    ChannelClosed,

    /// Unrecoverable programming error: duplicate async-fn name, duplicate
    /// group membership, bad primitive invocation. Returned as `Err`, never
    /// raised as an actual Rust panic, so a caller can catch it at a boundary.
    #[error("panic: {0}")]
    Panic(String),

    /// The coroutine driving a task raised an application-level error.
    #[error("{0}")]
    Application(String),

    /// An OS-level failure (epoll, signalfd, process spawn, ...).
    #[error("io error: {0}")]
    Io(String),
}

impl WeaveError {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    pub fn is_signaled(&self) -> bool {
        matches!(self, Self::Signaled(_))
    }
}

impl From<std::io::Error> for WeaveError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// A terminal task outcome: exactly one of result or exception is meaningful.
pub type TaskResult<T> = Result<T, WeaveError>;
