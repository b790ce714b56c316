// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Coroutine protocol (conc.runtime/coroutine).
//!
//! Rust has no stable generator syntax, so a coroutine is an explicit state
//! machine object (REDESIGN FLAGS §9: "replace with explicit state machines
//! — enum + frame struct"). The scheduler drives it by calling `resume`
//! once per dispatch step; it never polls, never needs a `Waker`. This
//! matches the source model directly: a coroutine is a restartable, finite,
//! lazy sequence that accepts a sent value or an injected exception between
//! resumes and yields kernel primitives or plain data.

use std::any::Any;
use std::fmt;

use crate::error::WeaveError;
use crate::kernel::Primitive;

/// Opaque value passed between a coroutine and the scheduler. Coroutines are
/// dynamically typed at their suspension points, mirroring the "opaque
/// slots" custom-state/data described for `Task` in the data model.
pub type Value = Box<dyn Any + Send>;

/// What the scheduler sends into a coroutine at the next `resume`.
pub enum Resume {
    /// First resume after creation.
    Start,
    /// A value produced by the previous yield's primitive (e.g. the result
    /// of a `sleep_for`, the message delivered by a channel `receive`).
    Value(Value),
    /// An exception injected at this resume point (cancellation, a
    /// propagated `gather` error, a `timeout_after` expiry).
    Throw(WeaveError),
}

impl fmt::Debug for Resume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resume::Start => write!(f, "Resume::Start"),
            Resume::Value(_) => write!(f, "Resume::Value(..)"),
            Resume::Throw(e) => write!(f, "Resume::Throw({e})"),
        }
    }
}

/// What a coroutine produces from a single `resume` call.
pub enum Step {
    /// Suspend, yielding a kernel primitive for the scheduler to invoke.
    Yield(Primitive),
    /// Suspend, yielding plain data — stored as the task's partial result,
    /// not interpreted by the scheduler (§6: "any other value is treated as
    /// data").
    Data(Value),
    /// The coroutine has finished; `Ok` is the final result, `Err` the
    /// terminal exception.
    Done(Result<Value, WeaveError>),
}

/// A restartable, finite, lazy sequence of yielded primitives and values.
///
/// Implementors hold their own state (the "frame") between calls to
/// `resume`. The scheduler never touches that state directly — this trait
/// object is exactly the "dynamic dispatch over yielded values" interface
/// the runtime core is built on. The scheduler itself is single-threaded
/// and never moves a coroutine across threads, so unlike `future::Work`
/// (which genuinely runs on its own OS thread) this trait carries no `Send`
/// bound — coroutine bodies are free to close over `Rc`/`RefCell` state.
pub trait Coroutine {
    fn resume(&mut self, input: Resume) -> Step;
}

/// Wraps a plain `FnMut` body that never yields — runs to completion on its
/// first resume. Useful for short synchronous callbacks handed to
/// `spawn_task`/`add_future`/signal and progress handlers.
pub struct FnOnceCoroutine<F> {
    f: Option<F>,
}

impl<F> FnOnceCoroutine<F>
where
    F: FnOnce() -> Result<Value, WeaveError>,
{
    pub fn new(f: F) -> Self {
        Self { f: Some(f) }
    }
}

impl<F> Coroutine for FnOnceCoroutine<F>
where
    F: FnOnce() -> Result<Value, WeaveError>,
{
    fn resume(&mut self, _input: Resume) -> Step {
        match self.f.take() {
            Some(f) => Step::Done(f()),
            None => Step::Done(Err(WeaveError::Panic(
                "FnOnceCoroutine resumed after completion".into(),
            ))),
        }
    }
}

/// A coroutine with no body of its own: `spawn_task` gives a future-backed
/// task one of these instead of a real coroutine, since the task's actual
/// outcome comes from the worker thread, not from stepping through yields.
/// Its only resume just relays whatever it's handed back out as `Done`.
pub struct Relay;

impl Coroutine for Relay {
    fn resume(&mut self, input: Resume) -> Step {
        match input {
            Resume::Value(v) => Step::Done(Ok(v)),
            Resume::Throw(e) => Step::Done(Err(e)),
            Resume::Start => Step::Done(Ok(Box::new(()))),
        }
    }
}

/// A coroutine built from a sequence of already-known primitives, useful in
/// tests and for trivial background loops (`signal_task`, `progress_task`).
pub struct Scripted {
    steps: std::vec::IntoIter<ScriptStep>,
}

pub enum ScriptStep {
    Yield(Primitive),
    Data(Value),
}

impl Scripted {
    pub fn new(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: steps.into_iter(),
        }
    }
}

impl Coroutine for Scripted {
    fn resume(&mut self, _input: Resume) -> Step {
        match self.steps.next() {
            Some(ScriptStep::Yield(p)) => Step::Yield(p),
            Some(ScriptStep::Data(v)) => Step::Data(v),
            None => Step::Done(Ok(Box::new(()))),
        }
    }
}

/// A coroutine driven by a closure that receives each `Resume` and decides
/// the next `Step` itself — the general case `Scripted` can't express,
/// since a real body branches on what comes back from a yield (the id a
/// `CreateTask` resolves to, the value a channel delivers) instead of
/// replaying a fixed list.
pub struct StepFn<F> {
    f: F,
}

impl<F> StepFn<F>
where
    F: FnMut(Resume) -> Step,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Coroutine for StepFn<F>
where
    F: FnMut(Resume) -> Step,
{
    fn resume(&mut self, input: Resume) -> Step {
        (self.f)(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fn_once_runs_to_completion() {
        let mut c = FnOnceCoroutine::new(|| Ok(Box::new(42i32) as Value));
        match c.resume(Resume::Start) {
            Step::Done(Ok(v)) => assert_eq!(*v.downcast::<i32>().unwrap(), 42),
            _ => panic!("expected Done(Ok(42))"),
        }
    }

    #[test]
    fn fn_once_resumed_twice_panics_gracefully() {
        let mut c = FnOnceCoroutine::new(|| Ok(Box::new(()) as Value));
        let _ = c.resume(Resume::Start);
        match c.resume(Resume::Start) {
            Step::Done(Err(WeaveError::Panic(_))) => {}
            _ => panic!("expected Panic on double resume"),
        }
    }

    #[test]
    fn relay_passes_through_value_and_throw() {
        let mut v = Relay;
        match v.resume(Resume::Value(Box::new(5i32))) {
            Step::Done(Ok(b)) => assert_eq!(*b.downcast::<i32>().unwrap(), 5),
            _ => panic!("expected Done(Ok(5))"),
        }
        let mut e = Relay;
        assert!(matches!(e.resume(Resume::Throw(WeaveError::Timeout)), Step::Done(Err(WeaveError::Timeout))));
    }

    #[test]
    fn step_fn_can_branch_on_resumed_values() {
        let mut seen_start = false;
        let mut c = StepFn::new(move |input: Resume| match input {
            Resume::Start => {
                seen_start = true;
                Step::Yield(crate::kernel::Primitive::CurrentTask)
            }
            Resume::Value(v) => Step::Done(Ok(v)),
            Resume::Throw(e) => Step::Done(Err(e)),
        });
        assert!(matches!(c.resume(Resume::Start), Step::Yield(_)));
        match c.resume(Resume::Value(Box::new(9i32))) {
            Step::Done(Ok(v)) => assert_eq!(*v.downcast::<i32>().unwrap(), 9),
            _ => panic!("expected Done(Ok(9))"),
        }
    }
}
