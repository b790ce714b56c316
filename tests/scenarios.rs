// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! End-to-end scenarios driving a real `Scheduler` through its public API,
//! one coroutine body at a time, the way an embedder would.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use weave_rt::coroutine::{Coroutine, FnOnceCoroutine, Resume, Step, StepFn, Value};
use weave_rt::error::WeaveError;
use weave_rt::gather::GatherOptions;
use weave_rt::group::WaitPolicy;
use weave_rt::kernel::Primitive;
use weave_rt::scheduler::Scheduler;
use weave_rt::task::{TaskId, TaskKind};

fn boxed_child(coroutine: impl Coroutine + 'static) -> Box<dyn Coroutine> {
    Box::new(coroutine)
}

/// A parent spawns a child, cancels it mid-sleep, then joins it and sees
/// the cancellation propagate back as the join's error.
#[test]
fn cancelling_a_sleeping_child_propagates_through_join() {
    let sched = Scheduler::new().unwrap();
    let observed: Rc<RefCell<Option<bool>>> = Rc::new(RefCell::new(None));
    let observed2 = observed.clone();

    let mut step = 0u32;
    let mut child_id: Option<TaskId> = None;
    let root = StepFn::new(move |input: Resume| {
        step += 1;
        match (step, input) {
            (1, Resume::Start) => {
                let child = boxed_child(StepFn::new(|input: Resume| match input {
                    Resume::Start => Step::Yield(Primitive::SleepFor(Duration::from_secs(3600))),
                    Resume::Throw(e) => Step::Done(Err(e)),
                    Resume::Value(_) => Step::Done(Ok(Box::new(()))),
                }));
                Step::Yield(Primitive::CreateTask {
                    coroutine: child,
                    kind: TaskKind::Awaited,
                    group: None,
                })
            }
            (2, Resume::Value(v)) => {
                let id = *v.downcast::<TaskId>().unwrap();
                child_id = Some(id);
                Step::Yield(Primitive::CancelTask(id))
            }
            (3, Resume::Value(_)) => Step::Yield(Primitive::JoinTask(child_id.unwrap())),
            (4, Resume::Throw(e)) => {
                *observed2.borrow_mut() = Some(e.is_cancelled());
                Step::Done(Ok(Box::new(())))
            }
            (n, other) => panic!("unexpected step {n} / resume {other:?}"),
        }
    });

    sched.spawn_root(boxed_child(root));
    sched.run();

    assert_eq!(*observed.borrow(), Some(true));
}

/// Three children race in a `gather_wait(race=2)`; the third is left
/// running and the gather resolves as soon as two finish.
#[test]
fn gather_race_resolves_after_n_finish() {
    let sched = Scheduler::new().unwrap();
    let outcome: Rc<RefCell<Option<usize>>> = Rc::new(RefCell::new(None));
    let outcome2 = outcome.clone();

    fn sleepy_child(millis: u64, tag: i32) -> Box<dyn Coroutine> {
        let mut slept = false;
        Box::new(StepFn::new(move |input: Resume| {
            if !slept {
                slept = true;
                return Step::Yield(Primitive::SleepFor(Duration::from_millis(millis)));
            }
            match input {
                Resume::Value(_) => Step::Done(Ok(Box::new(tag))),
                Resume::Throw(e) => Step::Done(Err(e)),
                Resume::Start => unreachable!(),
            }
        }))
    }

    let mut step = 0u32;
    let mut members: Vec<TaskId> = Vec::new();
    let root = StepFn::new(move |input: Resume| {
        step += 1;
        match (step, input) {
            (1, Resume::Start) => Step::Yield(Primitive::CreateTask {
                coroutine: sleepy_child(2, 0),
                kind: TaskKind::Awaited,
                group: None,
            }),
            (2, Resume::Value(v)) => {
                members.push(*v.downcast::<TaskId>().unwrap());
                Step::Yield(Primitive::CreateTask {
                    coroutine: sleepy_child(5, 1),
                    kind: TaskKind::Awaited,
                    group: None,
                })
            }
            (3, Resume::Value(v)) => {
                members.push(*v.downcast::<TaskId>().unwrap());
                Step::Yield(Primitive::CreateTask {
                    coroutine: sleepy_child(500, 2),
                    kind: TaskKind::Awaited,
                    group: None,
                })
            }
            (4, Resume::Value(v)) => {
                members.push(*v.downcast::<TaskId>().unwrap());
                Step::Yield(Primitive::GatherWait {
                    members: members.clone(),
                    options: GatherOptions {
                        race: Some(2),
                        ..Default::default()
                    },
                })
            }
            (5, Resume::Value(v)) => {
                let outcomes = *v
                    .downcast::<Vec<(TaskId, Result<Value, WeaveError>)>>()
                    .unwrap();
                *outcome2.borrow_mut() = Some(outcomes.len());
                Step::Done(Ok(Box::new(())))
            }
            (n, other) => panic!("unexpected step {n} / resume {other:?}"),
        }
    });

    sched.spawn_root(boxed_child(root));
    sched.run();
    assert_eq!(*outcome.borrow(), Some(2));
}

/// `wait_for` wraps a long sleep with a short deadline; the deadline wins.
#[test]
fn wait_for_times_out_before_inner_sleep_fires() {
    let sched = Scheduler::new().unwrap();
    let timed_out = Rc::new(RefCell::new(false));
    let timed_out2 = timed_out.clone();

    let mut step = 0u32;
    let root = StepFn::new(move |input: Resume| {
        step += 1;
        match (step, input) {
            (1, Resume::Start) => Step::Yield(Primitive::WaitFor {
                inner: Box::new(Primitive::SleepFor(Duration::from_secs(3600))),
                timeout: Duration::from_millis(5),
            }),
            (2, Resume::Throw(WeaveError::Timeout)) => {
                *timed_out2.borrow_mut() = true;
                Step::Done(Ok(Box::new(())))
            }
            (n, other) => panic!("unexpected step {n} / resume {other:?}"),
        }
    });

    sched.spawn_root(boxed_child(root));
    sched.run();
    assert!(*timed_out.borrow());
}

/// `gather_wait(exception=true)` short-circuits on the first failure and
/// cancels whatever was still running.
#[test]
fn gather_exception_short_circuits_and_cancels_leftovers() {
    let sched = Scheduler::new().unwrap();

    let mut step = 0u32;
    let mut members: Vec<TaskId> = Vec::new();
    let saw_error = Rc::new(RefCell::new(false));
    let saw_error2 = saw_error.clone();

    let root = StepFn::new(move |input: Resume| {
        step += 1;
        match (step, input) {
            (1, Resume::Start) => {
                let failing = boxed_child(FnOnceCoroutine::new(|| {
                    Err(WeaveError::Application("boom".into()))
                }));
                Step::Yield(Primitive::CreateTask {
                    coroutine: failing,
                    kind: TaskKind::Awaited,
                    group: None,
                })
            }
            (2, Resume::Value(v)) => {
                members.push(*v.downcast::<TaskId>().unwrap());
                let forever = boxed_child(StepFn::new(|input: Resume| match input {
                    Resume::Start => Step::Yield(Primitive::SleepFor(Duration::from_secs(3600))),
                    Resume::Throw(e) => Step::Done(Err(e)),
                    Resume::Value(_) => Step::Done(Ok(Box::new(()))),
                }));
                Step::Yield(Primitive::CreateTask {
                    coroutine: forever,
                    kind: TaskKind::Awaited,
                    group: None,
                })
            }
            (3, Resume::Value(v)) => {
                members.push(*v.downcast::<TaskId>().unwrap());
                let forever = boxed_child(StepFn::new(|input: Resume| match input {
                    Resume::Start => Step::Yield(Primitive::SleepFor(Duration::from_secs(3600))),
                    Resume::Throw(e) => Step::Done(Err(e)),
                    Resume::Value(_) => Step::Done(Ok(Box::new(()))),
                }));
                Step::Yield(Primitive::CreateTask {
                    coroutine: forever,
                    kind: TaskKind::Awaited,
                    group: None,
                })
            }
            (4, Resume::Value(v)) => {
                members.push(*v.downcast::<TaskId>().unwrap());
                Step::Yield(Primitive::GatherWait {
                    members: members.clone(),
                    options: GatherOptions {
                        exception: true,
                        ..Default::default()
                    },
                })
            }
            (5, Resume::Value(v)) => {
                let outcomes = *v
                    .downcast::<Vec<(TaskId, Result<Value, WeaveError>)>>()
                    .unwrap();
                *saw_error2.borrow_mut() = outcomes.iter().any(|(_, r)| r.is_err());
                Step::Done(Ok(Box::new(())))
            }
            (n, other) => panic!("unexpected step {n} / resume {other:?}"),
        }
    });

    sched.spawn_root(boxed_child(root));
    sched.run();
    assert!(*saw_error.borrow());
}

/// A sender and a receiver rendezvous over a freshly made channel; the
/// value travels from one task to the other.
#[test]
fn channel_rendezvous_delivers_the_sent_value() {
    let sched = Scheduler::new().unwrap();
    let delivered = Rc::new(RefCell::new(None));
    let delivered2 = delivered.clone();

    let mut step = 0u32;
    let mut receiver_id: Option<TaskId> = None;
    let mut pending_receiver: Option<Box<dyn Coroutine>> = None;
    let root = StepFn::new(move |input: Resume| {
        step += 1;
        match (step, input) {
            (1, Resume::Start) => Step::Yield(Primitive::ChannelMake),
            (2, Resume::Value(v)) => {
                let cid = *v.downcast::<weave_rt::channel::ChannelId>().unwrap();
                let sender = boxed_child(StepFn::new(move |input: Resume| match input {
                    Resume::Start => Step::Yield(Primitive::ChannelSend(cid, Box::new(99i32))),
                    Resume::Value(_) => Step::Done(Ok(Box::new(()))),
                    Resume::Throw(e) => Step::Done(Err(e)),
                }));
                pending_receiver = Some(boxed_child(StepFn::new(move |input: Resume| match input {
                    Resume::Start => Step::Yield(Primitive::ChannelReceive(cid)),
                    Resume::Value(v) => Step::Done(Ok(v)),
                    Resume::Throw(e) => Step::Done(Err(e)),
                })));
                Step::Yield(Primitive::CreateTask {
                    coroutine: sender,
                    kind: TaskKind::Awaited,
                    group: None,
                })
            }
            (3, Resume::Value(_sender_id)) => {
                let receiver = pending_receiver.take().unwrap();
                Step::Yield(Primitive::CreateTask {
                    coroutine: receiver,
                    kind: TaskKind::Awaited,
                    group: None,
                })
            }
            (4, Resume::Value(v)) => {
                receiver_id = Some(*v.downcast::<TaskId>().unwrap());
                Step::Yield(Primitive::JoinTask(receiver_id.unwrap()))
            }
            (5, Resume::Value(v)) => {
                let n = *v.downcast::<i32>().unwrap();
                *delivered2.borrow_mut() = Some(n);
                Step::Done(Ok(Box::new(())))
            }
            (n, other) => panic!("unexpected step {n} / resume {other:?}"),
        }
    });

    sched.spawn_root(boxed_child(root));
    sched.run();
    assert_eq!(*delivered.borrow(), Some(99));
}

/// A future-backed task is killed via `spawn_kill`; the scheduler signals
/// the worker and terminates the task immediately (it doesn't wait on the
/// worker's own cooperative stop), so the join observes it as signaled.
#[test]
fn spawn_kill_stops_a_future_backed_task() {
    let sched = Scheduler::new().unwrap();
    let signaled = Rc::new(RefCell::new(false));
    let signaled2 = signaled.clone();

    let mut step = 0u32;
    let mut target: Option<TaskId> = None;
    let root = StepFn::new(move |input: Resume| {
        step += 1;
        match (step, input) {
            (1, Resume::Start) => Step::Yield(Primitive::SpawnTask {
                work: Box::new(|ctx| {
                    while !ctx.should_stop() {
                        std::thread::sleep(Duration::from_millis(2));
                    }
                    Ok(Box::new(()))
                }),
                timeout: None,
            }),
            (2, Resume::Value(v)) => {
                target = Some(*v.downcast::<TaskId>().unwrap());
                Step::Yield(Primitive::SpawnKill {
                    target: target.unwrap(),
                    signal: libc::SIGTERM,
                })
            }
            (3, Resume::Value(_)) => Step::Yield(Primitive::JoinTask(target.unwrap())),
            (4, Resume::Throw(e)) => {
                *signaled2.borrow_mut() = e.is_signaled();
                Step::Done(Ok(Box::new(())))
            }
            (n, other) => panic!("unexpected step {n} / resume {other:?}"),
        }
    });

    sched.spawn_root(boxed_child(root));
    sched.run();
    assert!(*signaled.borrow());
}

/// Two members spawned straight into a group, a third adopted afterward via
/// `GroupAddTask`; `next_done` reports the first finisher and `join` (policy
/// `All`) only resolves once every member, including the adopted one, is done.
#[test]
fn task_group_next_done_and_join_observe_every_member() {
    let sched = Scheduler::new().unwrap();
    let gid = sched.create_group(WaitPolicy::All);
    let first_created = Rc::new(RefCell::new(None));
    let first_created2 = first_created.clone();
    let seen_first = Rc::new(RefCell::new(None));
    let seen_first2 = seen_first.clone();
    let joined = Rc::new(RefCell::new(false));
    let joined2 = joined.clone();

    fn sleepy_child(millis: u64, tag: i32) -> Box<dyn Coroutine> {
        let mut slept = false;
        Box::new(StepFn::new(move |input: Resume| {
            if !slept {
                slept = true;
                return Step::Yield(Primitive::SleepFor(Duration::from_millis(millis)));
            }
            match input {
                Resume::Value(_) => Step::Done(Ok(Box::new(tag))),
                Resume::Throw(e) => Step::Done(Err(e)),
                Resume::Start => unreachable!(),
            }
        }))
    }

    let mut step = 0u32;
    let mut outside_member: Option<TaskId> = None;
    let root = StepFn::new(move |input: Resume| {
        step += 1;
        match (step, input) {
            (1, Resume::Start) => Step::Yield(Primitive::CreateTask {
                coroutine: sleepy_child(2, 0),
                kind: TaskKind::Awaited,
                group: Some(gid),
            }),
            (2, Resume::Value(v)) => {
                *first_created2.borrow_mut() = Some(*v.downcast::<TaskId>().unwrap());
                Step::Yield(Primitive::CreateTask {
                    coroutine: sleepy_child(200, 1),
                    kind: TaskKind::Awaited,
                    group: Some(gid),
                })
            }
            (3, Resume::Value(_)) => Step::Yield(Primitive::CreateTask {
                coroutine: sleepy_child(200, 2),
                kind: TaskKind::Awaited,
                group: None,
            }),
            (4, Resume::Value(v)) => {
                outside_member = Some(*v.downcast::<TaskId>().unwrap());
                Step::Yield(Primitive::GroupAddTask {
                    group: gid,
                    task: outside_member.unwrap(),
                })
            }
            (5, Resume::Value(_)) => Step::Yield(Primitive::GroupNextDone(gid)),
            (6, Resume::Value(v)) => {
                *seen_first2.borrow_mut() = Some(*v.downcast::<TaskId>().unwrap());
                Step::Yield(Primitive::GroupJoin(gid))
            }
            (7, Resume::Value(_)) => {
                *joined2.borrow_mut() = true;
                Step::Done(Ok(Box::new(())))
            }
            (n, other) => panic!("unexpected step {n} / resume {other:?}"),
        }
    });

    sched.spawn_root(boxed_child(root));
    sched.run();
    assert_eq!(*seen_first.borrow(), *first_created.borrow());
    assert!(*joined.borrow());
}

/// `join()` under `WaitPolicy::None` doesn't wait at all: it cancels every
/// still-running member immediately and resolves right away.
#[test]
fn task_group_join_none_cancels_remaining_members() {
    let sched = Scheduler::new().unwrap();
    let gid = sched.create_group(WaitPolicy::None);
    let joined = Rc::new(RefCell::new(false));
    let joined2 = joined.clone();

    let forever = || {
        boxed_child(StepFn::new(|input: Resume| match input {
            Resume::Start => Step::Yield(Primitive::SleepFor(Duration::from_secs(3600))),
            Resume::Throw(e) => Step::Done(Err(e)),
            Resume::Value(_) => Step::Done(Ok(Box::new(()))),
        }))
    };

    let mut step = 0u32;
    let root = StepFn::new(move |input: Resume| {
        step += 1;
        match (step, input) {
            (1, Resume::Start) => Step::Yield(Primitive::CreateTask {
                coroutine: forever(),
                kind: TaskKind::Awaited,
                group: Some(gid),
            }),
            (2, Resume::Value(_)) => Step::Yield(Primitive::GroupJoin(gid)),
            (3, Resume::Value(_)) => {
                *joined2.borrow_mut() = true;
                Step::Done(Ok(Box::new(())))
            }
            (n, other) => panic!("unexpected step {n} / resume {other:?}"),
        }
    });

    sched.spawn_root(boxed_child(root));
    sched.run();
    assert!(*joined.borrow());
}
