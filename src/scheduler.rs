// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The scheduler: a single-threaded cooperative event loop (conc.runtime/C9).
//!
//! Grounded on the shape of the teacher's `green::scheduler::Scheduler` —
//! a task table, a ready queue, a reactor polled once per tick — but
//! deliberately not its mechanism. Where the teacher spreads that state
//! across `Arc<SharedState>` plus atomics/`Mutex`/`Condvar` for N worker
//! threads, this scheduler is single-threaded by the runtime's own
//! Non-goals, so the same shape becomes `Cell`/`RefCell` fields on one
//! struct with no worker loop, no stealing, and no park/wake signalling —
//! `run()` *is* the loop (§9 REDESIGN FLAGS).

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::channel::{Channel, ChannelId, ReceiveOutcome, SendOutcome};
use crate::config::SchedulerConfig;
use crate::coroutine::{Coroutine, Resume, Step, Value};
use crate::error::WeaveError;
use crate::future::{FutureEvent, FutureId, FutureTable};
use crate::gather::{GatherProgress, GatherWait};
use crate::group::{GroupId, TaskGroup, WaitPolicy};
use crate::kernel::Primitive;
use crate::reactor::{Interest, Reactor};
use crate::signal::SignalRouter;
use crate::task::{Task, TaskId, TaskKind, TaskState, Waiting};
use crate::timer::{TimerEffect, TimerHandle, TimerHeap};

/// The runtime. Not `Send`/`Sync` — it is meant to live on the thread that
/// calls `run()`, matching the single-threaded Non-goal head-on instead of
/// threading a `PhantomData` lie through the API.
pub struct Scheduler {
    tasks: RefCell<HashMap<TaskId, Task>>,
    ready: RefCell<VecDeque<TaskId>>,
    queued: RefCell<HashSet<TaskId>>,
    next_task_id: Cell<u64>,
    current: Cell<Option<TaskId>>,
    pending_resume: RefCell<HashMap<TaskId, Resume>>,

    timers: RefCell<TimerHeap>,
    sleep_timer: RefCell<HashMap<TaskId, TimerHandle>>,
    waitfor_guard: RefCell<HashMap<TaskId, TimerHandle>>,
    scope_timers: RefCell<HashMap<TaskId, Vec<TimerHandle>>>,

    reactor: RefCell<Reactor>,
    readers: RefCell<HashMap<RawFd, VecDeque<TaskId>>>,
    writers: RefCell<HashMap<RawFd, VecDeque<TaskId>>>,

    signals: RefCell<SignalRouter>,
    task_signals: RefCell<HashMap<TaskId, Vec<i32>>>,

    futures: RefCell<FutureTable>,
    task_future: RefCell<HashMap<TaskId, FutureId>>,
    future_task: RefCell<HashMap<FutureId, TaskId>>,
    progress_waiters: RefCell<HashMap<FutureId, VecDeque<TaskId>>>,

    channels: RefCell<HashMap<ChannelId, Channel>>,
    next_channel_id: Cell<u64>,

    groups: RefCell<HashMap<GroupId, TaskGroup>>,
    next_group_id: Cell<u64>,
    /// Whether a task parked on `Waiting::GroupNext` wants the member's
    /// result (`next_result`, `true`) or just its id (`next_done`, `false`).
    group_waiter_mode: RefCell<HashMap<TaskId, bool>>,
    /// At most one task per group may be parked inside `join()` at a time.
    group_join_waiters: RefCell<HashMap<GroupId, TaskId>>,

    gathers: RefCell<HashMap<TaskId, GatherWait>>,

    join_waiters: RefCell<HashMap<TaskId, Vec<TaskId>>>,
    monitor_waiters: RefCell<HashMap<TaskId, Vec<TaskId>>>,

    /// The first task ever created (§4.1); `shutdown` always spares it.
    parent: Cell<Option<TaskId>>,

    config: SchedulerConfig,

    shutting_down: Cell<bool>,
}

impl Scheduler {
    pub fn new() -> std::io::Result<Self> {
        Self::with_config(SchedulerConfig::default())
    }

    /// Like `new`, but with caller-supplied tunables instead of the built-in
    /// defaults (timer-heap capacity, reactor event batch size, fallback
    /// poll timeout).
    pub fn with_config(config: SchedulerConfig) -> std::io::Result<Self> {
        Ok(Self {
            tasks: RefCell::new(HashMap::new()),
            ready: RefCell::new(VecDeque::new()),
            queued: RefCell::new(HashSet::new()),
            next_task_id: Cell::new(0),
            current: Cell::new(None),
            pending_resume: RefCell::new(HashMap::new()),

            timers: RefCell::new(TimerHeap::with_capacity(config.timer_capacity)),
            sleep_timer: RefCell::new(HashMap::new()),
            waitfor_guard: RefCell::new(HashMap::new()),
            scope_timers: RefCell::new(HashMap::new()),

            reactor: RefCell::new(Reactor::with_capacity(config.reactor_event_batch)?),
            readers: RefCell::new(HashMap::new()),
            writers: RefCell::new(HashMap::new()),

            signals: RefCell::new(SignalRouter::new()),
            task_signals: RefCell::new(HashMap::new()),

            futures: RefCell::new(FutureTable::new()),
            task_future: RefCell::new(HashMap::new()),
            future_task: RefCell::new(HashMap::new()),
            progress_waiters: RefCell::new(HashMap::new()),

            channels: RefCell::new(HashMap::new()),
            next_channel_id: Cell::new(0),

            groups: RefCell::new(HashMap::new()),
            next_group_id: Cell::new(0),
            group_waiter_mode: RefCell::new(HashMap::new()),
            group_join_waiters: RefCell::new(HashMap::new()),

            gathers: RefCell::new(HashMap::new()),

            join_waiters: RefCell::new(HashMap::new()),
            monitor_waiters: RefCell::new(HashMap::new()),

            parent: Cell::new(None),

            config,

            shutting_down: Cell::new(false),
        })
    }

    // ---- task table -------------------------------------------------

    fn alloc_task_id(&self) -> TaskId {
        let id = self.next_task_id.get();
        self.next_task_id.set(id + 1);
        TaskId::from_raw(id)
    }

    /// First task ever created becomes the `parent` (§4.1); every later
    /// creation site calls this right after allocating the id.
    fn note_task_created(&self, id: TaskId) {
        if self.parent.get().is_none() {
            self.parent.set(Some(id));
        }
    }

    /// Spawn `coroutine` as a root task and put it on the ready queue.
    /// Use this once to seed the scheduler before calling `run()`.
    pub fn spawn_root(&self, coroutine: Box<dyn Coroutine>) -> TaskId {
        let id = self.alloc_task_id();
        self.note_task_created(id);
        self.tasks.borrow_mut().insert(id, Task::new(id, coroutine, TaskKind::Awaited));
        self.enqueue(id);
        id
    }

    fn enqueue(&self, id: TaskId) {
        if self.queued.borrow_mut().insert(id) {
            self.ready.borrow_mut().push_back(id);
        }
    }

    fn dequeue(&self) -> Option<TaskId> {
        let id = self.ready.borrow_mut().pop_front();
        if let Some(id) = id {
            self.queued.borrow_mut().remove(&id);
        }
        id
    }

    /// Number of tasks still alive (not terminal) — used as the run-loop
    /// exit condition, matching the teacher's "shut down once active task
    /// count hits zero" contract.
    fn alive_count(&self) -> usize {
        self.tasks.borrow().values().filter(|t| !t.state.is_terminal()).count()
    }

    // ---- the loop -----------------------------------------------------

    /// Drive every spawned task to completion. Each tick drains the ready
    /// queue, then blocks on the reactor for however long until the
    /// soonest timer is due (or forever, if nothing is pending and the
    /// ready queue is also empty — which only happens once every task has
    /// terminated, ending the loop).
    pub fn run(&self) {
        while self.alive_count() > 0 && !self.shutting_down.get() {
            while let Some(id) = self.dequeue() {
                self.run_step(id, Resume::Start);
            }
            if self.alive_count() == 0 || self.shutting_down.get() {
                break;
            }
            self.poll_external();
        }
        debug!("scheduler run loop exiting");
    }

    fn poll_external(&self) {
        let now = Instant::now();

        for (task, effect) in self.timers.borrow_mut().pop_due(now) {
            self.clear_sleep_timer(task);
            match effect {
                TimerEffect::Resume(v) => self.wake(task, Resume::Value(v)),
                TimerEffect::Throw(e) => self.wake(task, Resume::Throw(e)),
            }
        }

        for (id, event) in self.futures.borrow_mut().poll(now) {
            self.handle_future_event(id, event);
        }

        let timeout_ms = self.reactor_timeout_ms(now);
        let ready = match self.reactor.borrow().poll(timeout_ms) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "reactor poll failed");
                Vec::new()
            }
        };
        for (fd, interest) in ready {
            self.handle_fd_ready(fd, interest);
        }
    }

    fn reactor_timeout_ms(&self, now: Instant) -> i32 {
        let timer_due = self.timers.borrow().next_due_in(now);
        match timer_due {
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
            None if self.futures.borrow().is_empty() => -1,
            None => self.config.default_poll_timeout_ms.min(i32::MAX as u64) as i32,
        }
    }

    fn handle_fd_ready(&self, fd: RawFd, interest: Interest) {
        let signal = self.signals.borrow().signal_for_fd(fd);
        if let Some(signal) = signal {
            let handlers = self.signals.borrow_mut().drain(fd);
            for task in handlers {
                let is_parked = self
                    .tasks
                    .borrow()
                    .get(&task)
                    .is_some_and(|t| matches!(t.waiting, Some(Waiting::Signal(s)) if s == signal));
                if is_parked {
                    self.wake(task, Resume::Value(Box::new(signal)));
                }
            }
            return;
        }

        let waiters = match interest {
            Interest::Readable => &self.readers,
            Interest::Writable => &self.writers,
        };
        let task = waiters.borrow_mut().get_mut(&fd).and_then(VecDeque::pop_front);
        if let Some(task) = task {
            if waiters.borrow().get(&fd).is_none_or(VecDeque::is_empty) {
                waiters.borrow_mut().remove(&fd);
                let _ = self.reactor.borrow_mut().remove_interest(fd, interest);
            }
            self.wake(task, Resume::Value(Box::new(())));
        }
    }

    fn handle_future_event(&self, fid: FutureId, event: FutureEvent) {
        match event {
            FutureEvent::Completed(result) => {
                if let Some(task) = self.future_task.borrow_mut().remove(&fid) {
                    self.task_future.borrow_mut().remove(&task);
                    self.progress_waiters.borrow_mut().remove(&fid);
                    match result {
                        Ok(v) => self.wake(task, Resume::Value(v)),
                        Err(e) => self.wake(task, Resume::Throw(e)),
                    }
                }
            }
            FutureEvent::Progress(value) => {
                if let Some(waiter) = self.progress_waiters.borrow_mut().get_mut(&fid).and_then(VecDeque::pop_front) {
                    self.wake(waiter, Resume::Value(value));
                }
            }
            FutureEvent::Signaled(sig) => {
                if let Some(task) = self.future_task.borrow_mut().remove(&fid) {
                    self.task_future.borrow_mut().remove(&task);
                    self.progress_waiters.borrow_mut().remove(&fid);
                    self.wake(task, Resume::Throw(WeaveError::Signaled(sig)));
                }
            }
        }
    }

    /// Move a parked task back onto the ready queue with the value/error it
    /// should resume with.
    fn wake(&self, task: TaskId, resume: Resume) {
        if !self.tasks.borrow().contains_key(&task) {
            return;
        }
        // Whichever event reaches the task first wins; invalidate the other
        // race participant so it can't also try to resume it later.
        self.clear_sleep_timer(task);
        if let Some(h) = self.waitfor_guard.borrow_mut().remove(&task) {
            self.timers.borrow_mut().cancel(h);
        }
        self.pending_resume.borrow_mut().insert(task, resume);
        self.enqueue(task);
    }

    // ---- stepping a single task ----------------------------------------

    fn run_step(&self, id: TaskId, default_resume: Resume) {
        let resume = self.pending_resume.borrow_mut().remove(&id).unwrap_or(default_resume);

        let prior_current = self.current.replace(Some(id));
        let step = {
            let mut tasks = self.tasks.borrow_mut();
            let Some(task) = tasks.get_mut(&id) else {
                self.current.set(prior_current);
                return;
            };
            task.state = TaskState::Running;
            task.cycles += 1;
            task.waiting = None;
            task.coroutine.resume(resume)
        };
        self.current.set(prior_current);

        match step {
            Step::Yield(primitive) => self.dispatch(id, primitive),
            Step::Data(_) => {
                // Intermediate value with no suspension: trampoline straight
                // into the next step instead of round-tripping the ready queue.
                self.run_step(id, Resume::Value(Box::new(())));
            }
            Step::Done(result) => self.finish_task(id, result),
        }
    }

    fn finish_task(&self, id: TaskId, result: Result<Value, WeaveError>) {
        let outcome_state = match &result {
            Ok(_) => TaskState::Completed,
            Err(e) if e.is_signaled() => TaskState::Signaled,
            Err(e) if e.is_cancelled() => TaskState::Cancelled,
            Err(_) => TaskState::Erred,
        };

        let (group, is_stateless) = {
            let mut tasks = self.tasks.borrow_mut();
            let task = tasks.get_mut(&id).expect("finishing unknown task");
            task.state = outcome_state;
            match &result {
                Ok(v) => task.result = Some(dyn_clone_placeholder(v)),
                Err(e) => task.exception = Some(e.clone()),
            }
            (task.group, task.is_stateless())
        };

        self.cleanup_task_resources(id);

        if is_stateless {
            // Stateless tasks never report through join/group/gather.
            self.tasks.borrow_mut().remove(&id);
            return;
        }

        for waiter in self.monitor_waiters.borrow_mut().remove(&id).unwrap_or_default() {
            self.wake(waiter, Resume::Value(Box::new(())));
        }

        // `Value` carries no `Clone` bound, so of however many consumers
        // turned up for this task — join waiters, the owning group, a
        // `gather_wait` — only the first actually gets the real boxed
        // result. Everyone after that sees a `()` placeholder instead of a
        // duplicate; `WeaveError` is `Clone`, so the error case never loses
        // information this way.
        let stored_err = if let Err(e) = &result { Some(e.clone()) } else { None };
        let mut real = Some(result);
        let mut next_outcome = move || -> Result<Value, WeaveError> {
            real.take().unwrap_or_else(|| match &stored_err {
                Some(e) => Err(e.clone()),
                None => Ok(Box::new(())),
            })
        };

        for waiter in self.join_waiters.borrow_mut().remove(&id).unwrap_or_default() {
            match next_outcome() {
                Ok(v) => self.wake(waiter, Resume::Value(v)),
                Err(e) => self.wake(waiter, Resume::Throw(e)),
            }
        }

        if let Some(gid) = group {
            let woken = self.groups.borrow_mut().get_mut(&gid).and_then(|g| g.record_finished(id, next_outcome()));
            if let Some(w) = woken {
                let wants_result = self.group_waiter_mode.borrow_mut().remove(&w).unwrap_or(false);
                if wants_result {
                    let outcome = self.groups.borrow_mut().get_mut(&gid).and_then(|g| g.take_finished(id));
                    match outcome {
                        Some(Ok(v)) => self.wake(w, Resume::Value(v)),
                        Some(Err(e)) => self.wake(w, Resume::Throw(e)),
                        None => self.wake(w, Resume::Throw(WeaveError::invalid_state("group member outcome missing"))),
                    }
                } else {
                    self.wake(w, Resume::Value(Box::new(id)));
                }
            }
            self.progress_group_join(gid);
        }

        self.progress_gathers(id, next_outcome());
    }

    fn progress_gathers(&self, member: TaskId, result: Result<Value, WeaveError>) {
        let waiters: Vec<TaskId> = self
            .gathers
            .borrow()
            .iter()
            .filter(|(_, gw)| gw.members().contains(&member) && !gw.is_done())
            .map(|(waiter, _)| *waiter)
            .collect();

        let stored_err = if let Err(e) = &result { Some(e.clone()) } else { None };
        let mut real = Some(result);
        let mut next_outcome = move || -> Result<Value, WeaveError> {
            real.take().unwrap_or_else(|| match &stored_err {
                Some(e) => Err(e.clone()),
                None => Ok(Box::new(())),
            })
        };

        for waiter in waiters {
            let (progress, clear) = {
                let mut gathers = self.gathers.borrow_mut();
                let Some(gw) = gathers.get_mut(&waiter) else { continue };
                let clear = gw.clear();
                (gw.record(member, next_outcome()), clear)
            };
            if let GatherProgress::Done { outcomes, leftover_running } = progress {
                self.gathers.borrow_mut().remove(&waiter);
                if clear {
                    for leftover in &leftover_running {
                        self.cancel_task_by_id(*leftover);
                    }
                }
                self.wake(waiter, Resume::Value(Box::new(outcomes)));
            }
        }
    }

    /// If a task is parked in `join()` on `gid`, check whether its policy's
    /// condition now holds and wake it if so.
    fn progress_group_join(&self, gid: GroupId) {
        let Some(joiner) = self.group_join_waiters.borrow().get(&gid).copied() else {
            return;
        };
        let ready = self.groups.borrow().get(&gid).is_some_and(|g| match g.policy {
            WaitPolicy::All => g.is_empty_running(),
            WaitPolicy::Any => g.has_any_finished(),
            WaitPolicy::Object => g.any_finished_non_null(),
            WaitPolicy::None => true,
        });
        if ready {
            self.group_join_waiters.borrow_mut().remove(&gid);
            self.wake(joiner, Resume::Value(Box::new(())));
        }
    }

    fn cleanup_task_resources(&self, id: TaskId) {
        self.timers.borrow_mut().cancel_owner(id);
        self.sleep_timer.borrow_mut().remove(&id);
        self.waitfor_guard.borrow_mut().remove(&id);
        self.scope_timers.borrow_mut().remove(&id);

        for signal in self.task_signals.borrow_mut().remove(&id).unwrap_or_default() {
            if let crate::signal::RemoveOutcome::LastHandlerRemoved(fd) = self.signals.borrow_mut().remove_handler(signal, id) {
                let _ = self.reactor.borrow_mut().remove_fd(fd);
            }
        }

        for (fd, waiters) in self.readers.borrow_mut().iter_mut() {
            if waiters.iter().any(|t| *t == id) {
                waiters.retain(|t| *t != id);
                if waiters.is_empty() {
                    let _ = self.reactor.borrow_mut().remove_interest(*fd, Interest::Readable);
                }
            }
        }
        for (fd, waiters) in self.writers.borrow_mut().iter_mut() {
            if waiters.iter().any(|t| *t == id) {
                waiters.retain(|t| *t != id);
                if waiters.is_empty() {
                    let _ = self.reactor.borrow_mut().remove_interest(*fd, Interest::Writable);
                }
            }
        }
    }

    // ---- kernel primitive dispatch --------------------------------------

    fn dispatch(&self, id: TaskId, primitive: Primitive) {
        match primitive {
            Primitive::CurrentTask => self.wake(id, Resume::Value(Box::new(id))),

            Primitive::StatelessTask(coroutine) => {
                let new_id = self.alloc_task_id();
                self.note_task_created(new_id);
                self.tasks.borrow_mut().insert(new_id, Task::new(new_id, coroutine, TaskKind::Stateless));
                self.enqueue(new_id);
                self.wake(id, Resume::Value(Box::new(new_id)));
            }

            Primitive::CreateTask { coroutine, kind, group } => {
                let new_id = self.alloc_task_id();
                self.note_task_created(new_id);
                let mut task = Task::new(new_id, coroutine, kind);
                task.group = group;
                self.tasks.borrow_mut().insert(new_id, task);
                if let Some(gid) = group {
                    if let Some(g) = self.groups.borrow_mut().get_mut(&gid) {
                        if let Err(e) = g.adopt(new_id) {
                            self.wake(id, Resume::Throw(e));
                            return;
                        }
                    }
                }
                self.enqueue(new_id);
                self.wake(id, Resume::Value(Box::new(new_id)));
            }

            Primitive::CancelTask(target) => {
                self.cancel_task_by_id(target);
                self.wake(id, Resume::Value(Box::new(())));
            }

            Primitive::JoinTask(target) => self.join_or_park(id, target),

            Primitive::MonitorTask(target) => {
                let terminal = self.tasks.borrow().get(&target).is_none_or(|t| t.state.is_terminal());
                if terminal {
                    self.wake(id, Resume::Value(Box::new(())));
                } else {
                    self.monitor_waiters.borrow_mut().entry(target).or_default().push(id);
                    self.park(id, None);
                }
            }

            Primitive::SleepFor(duration) => {
                let handle = self.timers.borrow_mut().arm(Instant::now(), duration, id, TimerEffect::Resume(Box::new(())));
                self.sleep_timer.borrow_mut().insert(id, handle);
                self.park(id, Some(Waiting::Timer));
            }

            Primitive::ReadWait(fd) => {
                self.readers.borrow_mut().entry(fd).or_default().push_back(id);
                let _ = self.reactor.borrow_mut().add_interest(fd, Interest::Readable);
                self.park(id, Some(Waiting::Reader(fd)));
            }

            Primitive::WriteWait(fd) => {
                self.writers.borrow_mut().entry(fd).or_default().push_back(id);
                let _ = self.reactor.borrow_mut().add_interest(fd, Interest::Writable);
                self.park(id, Some(Waiting::Writer(fd)));
            }

            Primitive::GatherWait { members, options } => {
                let mut gw = GatherWait::new(members.clone(), options);
                // Seed outcomes already settled before the gather started.
                let already_done: Vec<(TaskId, Result<Value, WeaveError>)> = {
                    let tasks = self.tasks.borrow();
                    members
                        .iter()
                        .filter_map(|m| tasks.get(m).filter(|t| t.state.is_terminal()).map(|t| (*m, task_result_snapshot(t))))
                        .collect()
                };
                let mut progress = GatherProgress::Pending;
                for (m, r) in already_done {
                    progress = gw.record(m, r);
                }
                match progress {
                    GatherProgress::Done { outcomes, leftover_running } => {
                        if gw.clear() {
                            for leftover in leftover_running {
                                self.cancel_task_by_id(leftover);
                            }
                        }
                        self.wake(id, Resume::Value(Box::new(outcomes)));
                    }
                    GatherProgress::Pending => {
                        self.gathers.borrow_mut().insert(id, gw);
                        self.park(id, Some(Waiting::Gather));
                    }
                }
            }

            Primitive::WaitFor { inner, timeout } => {
                // Arm a guard timer, then dispatch the inner primitive as
                // usual; whichever fires first wins. The guard timer's
                // effect directly resolves this task with a Timeout error,
                // and ordinary resource cleanup on the next resume handles
                // the now-orphaned inner registration the same way
                // cancellation would.
                let handle = self.timers.borrow_mut().arm(Instant::now(), timeout, id, TimerEffect::Throw(WeaveError::Timeout));
                self.waitfor_guard.borrow_mut().insert(id, handle);
                self.dispatch(id, *inner);
            }

            Primitive::TimeoutAfter(duration) => {
                let handle = self.timers.borrow_mut().arm(Instant::now(), duration, id, TimerEffect::Throw(WeaveError::TaskTimeout));
                self.scope_timers.borrow_mut().entry(id).or_default().push(handle);
                self.wake(id, Resume::Value(Box::new(())));
            }

            Primitive::SpawnTask { work, timeout } => {
                let new_id = self.alloc_task_id();
                self.note_task_created(new_id);
                let mut task = Task::new(new_id, Box::new(crate::coroutine::Relay), TaskKind::Paralleled);
                task.state = TaskState::Process;
                task.waiting = Some(Waiting::Future);
                self.tasks.borrow_mut().insert(new_id, task);
                let fid = self.futures.borrow_mut().spawn(work, timeout);
                self.task_future.borrow_mut().insert(new_id, fid);
                self.future_task.borrow_mut().insert(fid, new_id);
                self.wake(id, Resume::Value(Box::new(new_id)));
            }

            Primitive::AddFuture { work, timeout, progress_to: _ } => {
                let fid = self.futures.borrow_mut().spawn(work, timeout);
                self.task_future.borrow_mut().insert(id, fid);
                self.future_task.borrow_mut().insert(fid, id);
                if let Some(task) = self.tasks.borrow_mut().get_mut(&id) {
                    task.state = TaskState::Process;
                }
                self.park(id, Some(Waiting::Future));
            }

            Primitive::SpawnKill { target, signal } => {
                let already_terminal = self.tasks.borrow().get(&target).is_none_or(|t| t.state.is_terminal());
                let fid = if already_terminal { None } else { self.task_future.borrow().get(&target).copied() };
                match fid {
                    Some(fid) => {
                        // Signals the future and cancels the task (§4.8):
                        // the worker's own cooperative-stop acknowledgement
                        // races with this, so the task's termination is
                        // resolved here rather than waiting on it — the
                        // `Signaled` event that later arrives from the
                        // worker finds the bookkeeping already gone and is
                        // a no-op (see `handle_future_event`).
                        self.futures.borrow_mut().signal(fid, signal);
                        self.task_future.borrow_mut().remove(&target);
                        self.future_task.borrow_mut().remove(&fid);
                        self.progress_waiters.borrow_mut().remove(&fid);
                        self.cleanup_task_resources(target);
                        trace!(task = target.as_raw(), signal, "signalling and cancelling future-backed task");
                        self.wake(target, Resume::Throw(WeaveError::Signaled(signal)));
                        self.wake(id, Resume::Value(Box::new(())));
                    }
                    None => self.wake(id, Resume::Throw(WeaveError::invalid_argument(format!("{target} has no live future")))),
                }
            }

            Primitive::SignalTask(sig) => {
                match self.signals.borrow_mut().add_handler(sig, id) {
                    Ok(Some(fd)) => {
                        let _ = self.reactor.borrow_mut().add_interest(fd, Interest::Readable);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        self.wake(id, Resume::Throw(WeaveError::from(e)));
                        return;
                    }
                }
                self.task_signals.borrow_mut().entry(id).or_default().push(sig);
                self.park(id, Some(Waiting::Signal(sig)));
            }

            Primitive::ProgressTask(target) => {
                let fid = self.task_future.borrow().get(&target).copied();
                match fid {
                    Some(fid) => {
                        self.progress_waiters.borrow_mut().entry(fid).or_default().push_back(id);
                        self.park(id, Some(Waiting::Progress));
                    }
                    None => self.wake(id, Resume::Throw(WeaveError::invalid_argument(format!("{target} has no live future")))),
                }
            }

            Primitive::ChannelMake => {
                let cid = ChannelId::from_raw(self.next_channel_id.get());
                self.next_channel_id.set(cid.as_raw() + 1);
                self.channels.borrow_mut().insert(cid, Channel::new());
                self.wake(id, Resume::Value(Box::new(cid)));
            }

            Primitive::ChannelReceive(cid) => {
                let outcome = {
                    let mut channels = self.channels.borrow_mut();
                    channels.get_mut(&cid).map(|c| c.receive(id)).transpose()
                };
                match outcome {
                    Ok(Some(ReceiveOutcome::Ready { sender, value })) => {
                        self.wake(sender, Resume::Value(Box::new(())));
                        self.wake(id, Resume::Value(value));
                    }
                    Ok(Some(ReceiveOutcome::Parked)) => self.park(id, Some(Waiting::Channel)),
                    Ok(None) => self.wake(id, Resume::Throw(WeaveError::invalid_argument("unknown channel"))),
                    Err(e) => self.wake(id, Resume::Throw(e)),
                }
            }

            Primitive::ChannelSend(cid, value) => {
                let outcome = {
                    let mut channels = self.channels.borrow_mut();
                    match channels.get_mut(&cid) {
                        Some(c) => Some(c.send(id, value)),
                        None => None,
                    }
                };
                match outcome {
                    Some(Ok(SendOutcome::Ready { receiver, value })) => {
                        self.wake(receiver, Resume::Value(value));
                        self.wake(id, Resume::Value(Box::new(())));
                    }
                    Some(Ok(SendOutcome::Parked)) => self.park(id, Some(Waiting::Channel)),
                    Some(Err(e)) => self.wake(id, Resume::Throw(e)),
                    None => self.wake(id, Resume::Throw(WeaveError::invalid_argument("unknown channel"))),
                }
            }

            Primitive::GroupAddTask { group, task } => {
                let adopted = match self.groups.borrow_mut().get_mut(&group) {
                    Some(g) => Some(g.adopt(task)),
                    None => None,
                };
                match adopted {
                    Some(Ok(())) => {
                        if let Some(t) = self.tasks.borrow_mut().get_mut(&task) {
                            t.group = Some(group);
                        }
                        self.wake(id, Resume::Value(Box::new(())));
                    }
                    Some(Err(e)) => self.wake(id, Resume::Throw(e)),
                    None => self.wake(id, Resume::Throw(WeaveError::invalid_argument(format!("unknown group {group}")))),
                }
            }

            Primitive::GroupNextDone(group) => {
                let exists = self.groups.borrow().contains_key(&group);
                if !exists {
                    self.wake(id, Resume::Throw(WeaveError::invalid_argument(format!("unknown group {group}"))));
                    return;
                }
                let pending = self.groups.borrow_mut().get_mut(&group).and_then(TaskGroup::take_pending);
                match pending {
                    Some(task) => self.wake(id, Resume::Value(Box::new(task))),
                    None => {
                        self.groups.borrow_mut().get_mut(&group).unwrap().park_waiter(id);
                        self.group_waiter_mode.borrow_mut().insert(id, false);
                        self.park(id, Some(Waiting::GroupNext(group)));
                    }
                }
            }

            Primitive::GroupNextResult(group) => {
                let exists = self.groups.borrow().contains_key(&group);
                if !exists {
                    self.wake(id, Resume::Throw(WeaveError::invalid_argument(format!("unknown group {group}"))));
                    return;
                }
                let pending = self.groups.borrow_mut().get_mut(&group).and_then(TaskGroup::take_pending);
                match pending {
                    Some(task) => {
                        let outcome = self.groups.borrow_mut().get_mut(&group).and_then(|g| g.take_finished(task));
                        match outcome {
                            Some(Ok(v)) => self.wake(id, Resume::Value(v)),
                            Some(Err(e)) => self.wake(id, Resume::Throw(e)),
                            None => self.wake(id, Resume::Throw(WeaveError::invalid_state("group member outcome missing"))),
                        }
                    }
                    None => {
                        self.groups.borrow_mut().get_mut(&group).unwrap().park_waiter(id);
                        self.group_waiter_mode.borrow_mut().insert(id, true);
                        self.park(id, Some(Waiting::GroupNext(group)));
                    }
                }
            }

            Primitive::GroupCancelRemaining(group) => {
                let running = self.groups.borrow().get(&group).map(TaskGroup::running_ids);
                match running {
                    Some(ids) => {
                        for t in ids {
                            self.cancel_task_by_id(t);
                        }
                        self.wake(id, Resume::Value(Box::new(())));
                    }
                    None => self.wake(id, Resume::Throw(WeaveError::invalid_argument(format!("unknown group {group}")))),
                }
            }

            Primitive::GroupJoin(group) => {
                let policy = self.groups.borrow().get(&group).map(|g| g.policy);
                let Some(policy) = policy else {
                    self.wake(id, Resume::Throw(WeaveError::invalid_argument(format!("unknown group {group}"))));
                    return;
                };
                if let Some(g) = self.groups.borrow_mut().get_mut(&group) {
                    g.mark_joined();
                }
                if policy == WaitPolicy::None {
                    let running = self.groups.borrow().get(&group).map(TaskGroup::running_ids).unwrap_or_default();
                    for t in running {
                        self.cancel_task_by_id(t);
                    }
                    self.wake(id, Resume::Value(Box::new(())));
                    return;
                }
                let ready = self.groups.borrow().get(&group).is_some_and(|g| match policy {
                    WaitPolicy::All => g.is_empty_running(),
                    WaitPolicy::Any => g.has_any_finished(),
                    WaitPolicy::Object => g.any_finished_non_null(),
                    WaitPolicy::None => true,
                });
                if ready {
                    self.wake(id, Resume::Value(Box::new(())));
                } else {
                    self.group_join_waiters.borrow_mut().insert(group, id);
                    self.park(id, Some(Waiting::GroupJoin(group)));
                }
            }

            Primitive::Shutdown(skip) => {
                self.shutting_down.set(true);
                let future_ids: Vec<FutureId> = self.future_task.borrow().keys().copied().collect();
                for fid in future_ids {
                    self.futures.borrow_mut().stop(fid, None);
                }
                let parent = self.parent.get();
                let ids: Vec<TaskId> = self.tasks.borrow().keys().copied().collect();
                for t in ids {
                    if Some(t) == skip || Some(t) == parent {
                        continue;
                    }
                    self.cancel_task_by_id(t);
                }
                self.wake(id, Resume::Value(Box::new(())));
            }
        }
    }

    fn join_or_park(&self, id: TaskId, target: TaskId) {
        let snapshot = self.tasks.borrow().get(&target).map(|t| (t.state.is_terminal(), task_result_snapshot(t)));
        match snapshot {
            None => self.wake(id, Resume::Throw(WeaveError::invalid_argument(format!("unknown task {target}")))),
            Some((true, result)) => match result {
                Ok(v) => self.wake(id, Resume::Value(v)),
                Err(e) => self.wake(id, Resume::Throw(e)),
            },
            Some((false, _)) => {
                self.join_waiters.borrow_mut().entry(target).or_default().push(id);
                self.park(id, Some(Waiting::Join(target)));
            }
        }
    }

    fn park(&self, id: TaskId, waiting: Option<Waiting>) {
        if let Some(task) = self.tasks.borrow_mut().get_mut(&id) {
            task.waiting = waiting;
        }
    }

    fn clear_sleep_timer(&self, id: TaskId) {
        if let Some(h) = self.sleep_timer.borrow_mut().remove(&id) {
            self.timers.borrow_mut().cancel(h);
        }
    }

    /// Cancellation: inject `WeaveError::Cancelled` at the task's next
    /// resume and tear down whatever it was parked on.
    fn cancel_task_by_id(&self, target: TaskId) {
        let already_terminal = self.tasks.borrow().get(&target).is_none_or(|t| t.state.is_terminal());
        if already_terminal {
            return;
        }
        let waiting = self.tasks.borrow().get(&target).and_then(|t| t.waiting);
        match waiting {
            Some(Waiting::Reader(fd)) => {
                if let Some(q) = self.readers.borrow_mut().get_mut(&fd) {
                    q.retain(|t| *t != target);
                }
            }
            Some(Waiting::Writer(fd)) => {
                if let Some(q) = self.writers.borrow_mut().get_mut(&fd) {
                    q.retain(|t| *t != target);
                }
            }
            Some(Waiting::Channel) => {
                for channel in self.channels.borrow_mut().values_mut() {
                    channel.cancel_receiver(target);
                    channel.cancel_sender(target);
                }
            }
            Some(Waiting::Future) => {
                // There's no way to force-kill the worker thread; request a
                // cooperative stop and drop the bookkeeping so the eventual
                // `Completed`/`Signaled` report finds nothing to resume.
                if let Some(fid) = self.task_future.borrow_mut().remove(&target) {
                    self.future_task.borrow_mut().remove(&fid);
                    self.progress_waiters.borrow_mut().remove(&fid);
                    self.futures.borrow_mut().stop(fid, None);
                }
            }
            Some(Waiting::GroupNext(gid)) => {
                self.group_waiter_mode.borrow_mut().remove(&target);
                if let Some(g) = self.groups.borrow_mut().get_mut(&gid) {
                    g.remove_waiter(target);
                }
            }
            Some(Waiting::GroupJoin(gid)) => {
                self.group_join_waiters.borrow_mut().remove(&gid);
            }
            _ => {}
        }
        self.cleanup_task_resources(target);
        trace!(task = target.as_raw(), "cancelling task");
        self.wake(target, Resume::Throw(WeaveError::Cancelled(target)));
    }

    // ---- task groups / join_all helpers used by higher-level wrappers --

    pub fn create_group(&self, policy: WaitPolicy) -> GroupId {
        let gid = GroupId::from_raw(self.next_group_id.get());
        self.next_group_id.set(gid.as_raw() + 1);
        self.groups.borrow_mut().insert(gid, TaskGroup::new(gid, policy));
        gid
    }
}

fn task_result_snapshot(task: &Task) -> Result<Value, WeaveError> {
    task.try_result().map(|v| dyn_clone_placeholder(v))
}

/// `Value` is `Box<dyn Any + Send>` and not `Clone`. Once a task is
/// terminal its real result has already gone to the one consumer that
/// earned it (see `finish_task`); anyone looking at the stored snapshot
/// afterwards — a late `join`, a `gather_wait` seeding already-finished
/// members — gets this `()` stand-in instead of a duplicate.
fn dyn_clone_placeholder(_v: &Value) -> Value {
    Box::new(())
}
