// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channels and queues (conc.runtime/channel, §4.7, C5).
//!
//! `Channel` is a zero-capacity rendezvous point between task ids: a value
//! only moves when a `send` and a `receive` meet, mirroring the
//! synchronous-handoff contract in §4.7 rather than the buffered
//! `mpsc`-backed channel the teacher's `channel.rs` wraps. Like `TaskGroup`,
//! it is pure bookkeeping — it records which side is waiting and hands the
//! scheduler an outcome to act on, it never resumes a task itself (§9
//! REDESIGN FLAGS: id-indexed tables over direct references).
//!
//! `Queue<T>` sits on top for the bounded producer/consumer case and keeps
//! the teacher's `SendError`/`RecvError`/`TrySendError`/`TryRecvError`
//! naming for its own full/empty errors, folded into `WeaveError` instead of
//! bespoke per-type error enums.

use std::collections::VecDeque;

use crate::coroutine::Value;
use crate::error::WeaveError;
use crate::task::TaskId;

/// Monotonic, scheduler-scoped channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub(crate) u64);

impl ChannelId {
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

/// Result of a `receive()` call.
pub enum ReceiveOutcome {
    /// A sender was already waiting; the scheduler should resume `sender`
    /// with success and deliver `value` to the receiving task.
    Ready { sender: TaskId, value: Value },
    /// No sender waiting; the calling task has been parked.
    Parked,
}

/// Result of a `send()` call.
pub enum SendOutcome {
    /// A receiver was already waiting; the scheduler should deliver `value`
    /// into `receiver` and resume the sending task with success.
    Ready { receiver: TaskId, value: Value },
    /// No receiver waiting; the calling task (and its value) have been parked.
    Parked,
}

/// A zero-capacity rendezvous channel.
#[derive(Default)]
pub struct Channel {
    waiting_receivers: VecDeque<TaskId>,
    waiting_senders: VecDeque<(TaskId, Value)>,
    closed: bool,
}

impl Channel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receive(&mut self, receiver: TaskId) -> Result<ReceiveOutcome, WeaveError> {
        if self.closed {
            return Err(WeaveError::ChannelClosed);
        }
        if let Some((sender, value)) = self.waiting_senders.pop_front() {
            Ok(ReceiveOutcome::Ready { sender, value })
        } else {
            self.waiting_receivers.push_back(receiver);
            Ok(ReceiveOutcome::Parked)
        }
    }

    pub fn send(&mut self, sender: TaskId, value: Value) -> Result<SendOutcome, WeaveError> {
        if self.closed {
            return Err(WeaveError::ChannelClosed);
        }
        if let Some(receiver) = self.waiting_receivers.pop_front() {
            let _ = sender;
            Ok(SendOutcome::Ready { receiver, value })
        } else {
            self.waiting_senders.push_back((sender, value));
            Ok(SendOutcome::Parked)
        }
    }

    /// Remove a parked receiver (on cancellation). Returns whether it was found.
    pub fn cancel_receiver(&mut self, task: TaskId) -> bool {
        let before = self.waiting_receivers.len();
        self.waiting_receivers.retain(|t| *t != task);
        before != self.waiting_receivers.len()
    }

    /// Remove a parked sender (on cancellation), returning its value so the
    /// caller can drop or requeue it.
    pub fn cancel_sender(&mut self, task: TaskId) -> Option<Value> {
        if let Some(pos) = self.waiting_senders.iter().position(|(t, _)| *t == task) {
            Some(self.waiting_senders.remove(pos).unwrap().1)
        } else {
            None
        }
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// A bounded (or unbounded, if `capacity == 0`) producer/consumer queue with
/// the classic `put_nowait`/`get_nowait`/`task_done`/`join` contract.
pub struct Queue<T> {
    capacity: usize,
    items: VecDeque<T>,
    unfinished: usize,
    join_waiters: VecDeque<TaskId>,
}

impl<T> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::new(),
            unfinished: 0,
            join_waiters: VecDeque::new(),
        }
    }

    pub fn put_nowait(&mut self, item: T) -> Result<(), WeaveError> {
        if self.capacity != 0 && self.items.len() >= self.capacity {
            return Err(WeaveError::QueueFull);
        }
        self.items.push_back(item);
        self.unfinished += 1;
        Ok(())
    }

    pub fn get_nowait(&mut self) -> Result<T, WeaveError> {
        self.items.pop_front().ok_or(WeaveError::QueueEmpty)
    }

    /// Mark one previously-gotten item as fully processed.
    pub fn task_done(&mut self) -> Result<Vec<TaskId>, WeaveError> {
        if self.unfinished == 0 {
            return Err(WeaveError::LengthException(
                "task_done() called more times than items were put".into(),
            ));
        }
        self.unfinished -= 1;
        if self.unfinished == 0 {
            Ok(self.join_waiters.drain(..).collect())
        } else {
            Ok(Vec::new())
        }
    }

    /// Park `task` on `join()`. Returns `false` (nothing to wait for) if
    /// every put item has already been marked done.
    pub fn join_park(&mut self, task: TaskId) -> bool {
        if self.unfinished == 0 {
            false
        } else {
            self.join_waiters.push_back(task);
            true
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.capacity != 0 && self.items.len() >= self.capacity
    }

    pub fn unfinished(&self) -> usize {
        self.unfinished
    }
}
