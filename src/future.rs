// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Future handle: subprocess/worker lifecycle (conc.runtime/future, §4.6, C4).
//!
//! A `Future` is the runtime's handle onto work that genuinely runs
//! somewhere else — an OS thread here, standing in for the subprocess or
//! worker the source process model describes. It is grounded on the
//! teacher's `spawn::TaskHandle` (the `catch_unwind` + channel-based result
//! delivery) and `timeout::with_timeout` (the race between a deadline and a
//! result channel), but unlike either of those it never blocks the calling
//! thread: the scheduler polls every live future's channel with `try_recv`
//! once per tick, the same way it polls the reactor, and turns whatever it
//! finds into the matching callback (`then`/`catch`/`timeout`/`progress`) or
//! task resume.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::WeaveError;

pub type Value = Box<dyn Any + Send>;

/// Monotonic, scheduler-scoped future identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FutureId(u64);

impl FutureId {
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }
    pub fn as_raw(self) -> u64 {
        self.0
    }
}

/// Cooperative signal to the worker closure: check `should_stop()` at safe
/// points and unwind early. There is no way to force-kill an OS thread, so
/// `stop()`/`kill()` are requests, not guarantees — matching what a real
/// subprocess `SIGTERM`/`SIGKILL` distinction collapses to for in-process
/// workers.
#[derive(Clone)]
pub struct WorkContext {
    stop: Arc<AtomicBool>,
    progress: Sender<FutureEvent>,
}

impl WorkContext {
    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Report an intermediate progress value. Delivered to the owner's
    /// `progress` callback on the next scheduler tick; dropped silently if
    /// the future has already finished or been stopped.
    pub fn report_progress(&self, value: Value) {
        let _ = self.progress.send(FutureEvent::Progress(value));
    }
}

pub type Work = Box<dyn FnOnce(WorkContext) -> Result<Value, WeaveError> + Send>;

/// What a future can report back on a given tick.
pub enum FutureEvent {
    Progress(Value),
    Completed(Result<Value, WeaveError>),
    /// An OS signal was forwarded to this future's worker (§4.6: futures can
    /// be signalled the way a subprocess can).
    Signaled(i32),
}

struct Entry {
    rx: Receiver<FutureEvent>,
    tx: Sender<FutureEvent>,
    stop: Arc<AtomicBool>,
    killed: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    deadline: Option<Instant>,
    timed_out: bool,
    done: bool,
}

/// Owns every in-flight `Future` and is polled once per scheduler tick.
#[derive(Default)]
pub struct FutureTable {
    entries: std::collections::HashMap<FutureId, Entry>,
    next_id: u64,
}

impl FutureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a future's worker on its own OS thread. `timeout` is a
    /// best-effort deadline observed by `poll`, not by the thread itself.
    pub fn spawn(&mut self, work: Work, timeout: Option<Duration>) -> FutureId {
        let id = FutureId(self.next_id);
        self.next_id += 1;

        let (tx, rx) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let killed = Arc::new(AtomicBool::new(false));
        let ctx = WorkContext {
            stop: stop.clone(),
            progress: tx.clone(),
        };
        let tx_for_signal = tx.clone();

        let thread = std::thread::Builder::new()
            .name(format!("weave-future-{}", id.0))
            .spawn(move || {
                let outcome = match panic::catch_unwind(AssertUnwindSafe(|| work(ctx))) {
                    Ok(result) => result,
                    Err(payload) => Err(WeaveError::Panic(panic_message(payload))),
                };
                let _ = tx.send(FutureEvent::Completed(outcome));
            })
            .expect("failed to spawn future worker thread");

        self.entries.insert(
            id,
            Entry {
                rx,
                tx: tx_for_signal,
                stop,
                killed,
                thread: Some(thread),
                deadline: timeout.map(|d| Instant::now() + d),
                timed_out: false,
                done: false,
            },
        );
        id
    }

    /// Request cooperative termination. `signal` distinguishes a plain
    /// `stop()` (`None`) from `spawn_kill(sig)`, surfaced to the worker
    /// through `WorkContext::should_stop` either way; the distinct signal
    /// number is only meaningful to a worker that forwards it itself.
    pub fn stop(&mut self, id: FutureId, signal: Option<i32>) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        entry.stop.store(true, Ordering::Release);
        if signal.is_some() {
            entry.killed.store(true, Ordering::Release);
        }
        true
    }

    pub fn is_running(&self, id: FutureId) -> bool {
        self.entries.get(&id).is_some_and(|e| !e.done)
    }

    pub fn is_killed(&self, id: FutureId) -> bool {
        self.entries.get(&id).is_some_and(|e| e.killed.load(Ordering::Acquire))
    }

    /// Non-blocking: drain every future's channel and collect what fired.
    /// A future is dropped from the table once it delivers `Completed` (or
    /// times out) and its thread has been joined.
    pub fn poll(&mut self, now: Instant) -> Vec<(FutureId, FutureEvent)> {
        let mut fired = Vec::new();
        let mut finished = Vec::new();

        for (&id, entry) in self.entries.iter_mut() {
            if entry.done {
                continue;
            }
            loop {
                match entry.rx.try_recv() {
                    Ok(FutureEvent::Completed(result)) => {
                        entry.done = true;
                        fired.push((id, FutureEvent::Completed(result)));
                        finished.push(id);
                        break;
                    }
                    Ok(FutureEvent::Signaled(sig)) => {
                        entry.done = true;
                        fired.push((id, FutureEvent::Signaled(sig)));
                        finished.push(id);
                        break;
                    }
                    Ok(event) => fired.push((id, event)),
                    Err(mpsc::TryRecvError::Empty) => break,
                    Err(mpsc::TryRecvError::Disconnected) => {
                        entry.done = true;
                        fired.push((
                            id,
                            FutureEvent::Completed(Err(WeaveError::Panic(
                                "future worker thread vanished without a result".into(),
                            ))),
                        ));
                        finished.push(id);
                        break;
                    }
                }
            }
            if !entry.done {
                if let Some(deadline) = entry.deadline {
                    if now >= deadline && !entry.timed_out {
                        entry.timed_out = true;
                        fired.push((id, FutureEvent::Completed(Err(WeaveError::TaskTimeout))));
                    }
                }
            }
        }

        for id in finished {
            if let Some(mut entry) = self.entries.remove(&id) {
                if let Some(handle) = entry.thread.take() {
                    if entry.killed.load(Ordering::Acquire) {
                        // A killed worker only stops once it next checks
                        // `should_stop()`; don't block the scheduler tick
                        // waiting for that, just let the thread run down
                        // detached.
                        drop(handle);
                    } else {
                        let _ = handle.join();
                    }
                }
            }
        }
        fired
    }

    /// Forward `signal` to the future-bearing worker: set the cooperative
    /// stop/killed flags and deliver a `Signaled` event on the next `poll`.
    pub fn signal(&mut self, id: FutureId, signal: i32) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        entry.stop.store(true, Ordering::Release);
        entry.killed.store(true, Ordering::Release);
        let _ = entry.tx.send(FutureEvent::Signaled(signal));
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "future worker panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn wait_for<F: Fn() -> bool>(pred: F) {
        for _ in 0..200 {
            if pred() {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("condition never became true");
    }

    #[test]
    fn completes_with_value() {
        let mut table = FutureTable::new();
        let id = table.spawn(Box::new(|_ctx| Ok(Box::new(7i32) as Value)), None);
        let _ = id;
        wait_for(|| !table.poll(Instant::now()).is_empty() || table.is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn panic_becomes_application_error() {
        let mut table = FutureTable::new();
        let id = table.spawn(Box::new(|_ctx| -> Result<Value, WeaveError> { panic!("kaboom") }), None);
        wait_for(|| !table.is_running(id));
        let events = table.poll(Instant::now());
        match &events.last().unwrap().1 {
            FutureEvent::Completed(Err(WeaveError::Panic(msg))) => assert!(msg.contains("kaboom")),
            other => panic!("unexpected: {:?}", std::mem::discriminant(other)),
        }
    }

    #[test]
    fn timeout_fires_before_completion() {
        let mut table = FutureTable::new();
        let id = table.spawn(
            Box::new(|_ctx| {
                thread::sleep(Duration::from_secs(5));
                Ok(Box::new(()) as Value)
            }),
            Some(Duration::from_millis(5)),
        );
        thread::sleep(Duration::from_millis(30));
        let events = table.poll(Instant::now());
        assert!(matches!(
            events.first(),
            Some((_, FutureEvent::Completed(Err(WeaveError::TaskTimeout))))
        ));
        let _ = id;
    }

    #[test]
    fn stop_sets_cooperative_flag_observed_by_worker() {
        let mut table = FutureTable::new();
        let id = table.spawn(
            Box::new(|ctx| {
                while !ctx.should_stop() {
                    thread::sleep(Duration::from_millis(2));
                }
                Ok(Box::new(()) as Value)
            }),
            None,
        );
        table.stop(id, None);
        wait_for(|| !table.is_running(id));
        let events = table.poll(Instant::now());
        assert!(matches!(events.last(), Some((_, FutureEvent::Completed(Ok(_))))));
    }

    #[test]
    fn signal_marks_killed() {
        let mut table = FutureTable::new();
        let id = table.spawn(
            Box::new(|ctx| {
                while !ctx.should_stop() {
                    thread::sleep(Duration::from_millis(2));
                }
                Ok(Box::new(()) as Value)
            }),
            None,
        );
        table.signal(id, libc::SIGTERM);
        assert!(table.is_killed(id));
        wait_for(|| !table.is_running(id));
        let _ = table.poll(Instant::now());
    }
}
