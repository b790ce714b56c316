// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Gather: wait for a subset of tasks with optional early exit (§4.9, C6).
//!
//! `GatherWait` bookkeeping mirrors `TaskGroup`: it only ever holds
//! `TaskId`s and a count of how many outcomes are still wanted, and it
//! leaves resuming anything to the scheduler. What's particular to gather
//! is the `race`/`exception`/`clear` triad (§4.9): `race` stops after N
//! results instead of all of them, `exception` short-circuits the whole
//! wait the moment any member fails, and `clear` decides whether the
//! tasks gather didn't pick are left running or cancelled.

use std::any::Any;
use std::collections::HashMap;

use crate::error::WeaveError;
use crate::task::TaskId;

pub type Outcome = Result<Box<dyn Any + Send>, WeaveError>;

/// Parameters of a single `gather_wait` call, mirroring §4.9.
#[derive(Debug, Clone, Copy)]
pub struct GatherOptions {
    /// Stop once this many tasks have finished. `None` means "all of them".
    pub race: Option<usize>,
    /// Stop (and fail the whole gather) on the first exception observed.
    pub exception: bool,
    /// Cancel tasks left running once the wait target is met.
    pub clear: bool,
}

impl Default for GatherOptions {
    fn default() -> Self {
        Self {
            race: None,
            exception: false,
            clear: false,
        }
    }
}

/// What the scheduler should do after a member reports in.
pub enum GatherProgress {
    /// Still waiting on more members.
    Pending,
    /// The wait target was met (or an exception short-circuited it); here
    /// are the outcomes in completion order and the ids of members that
    /// were still running and should be cancelled if `clear` was set.
    Done {
        outcomes: Vec<(TaskId, Outcome)>,
        leftover_running: Vec<TaskId>,
    },
}

pub struct GatherWait {
    members: Vec<TaskId>,
    options: GatherOptions,
    finished_order: Vec<TaskId>,
    outcomes: HashMap<TaskId, Outcome>,
    done: bool,
}

impl GatherWait {
    /// `members` may include already-terminal ids (e.g. a stateless task
    /// reported as an immediate null per §4.9); seed those via
    /// `record_immediate` right after construction.
    pub fn new(members: Vec<TaskId>, options: GatherOptions) -> Self {
        Self {
            members,
            options,
            finished_order: Vec::new(),
            outcomes: HashMap::new(),
            done: false,
        }
    }

    pub fn members(&self) -> &[TaskId] {
        &self.members
    }

    /// Whether members left running when the wait target is met should be
    /// cancelled (§4.9: `clear`). When `false`, those tasks keep running.
    pub fn clear(&self) -> bool {
        self.options.clear
    }

    fn target(&self) -> usize {
        self.options.race.unwrap_or(self.members.len()).min(self.members.len())
    }

    /// Record that `task` finished with `outcome`. Returns the scheduler's
    /// next move: keep waiting, or finish the gather with the accumulated
    /// outcomes and whichever members are still running.
    pub fn record(&mut self, task: TaskId, outcome: Outcome) -> GatherProgress {
        if self.done || !self.members.contains(&task) || self.outcomes.contains_key(&task) {
            return GatherProgress::Pending;
        }

        let is_err = outcome.is_err();
        self.finished_order.push(task);
        self.outcomes.insert(task, outcome);

        let short_circuit = self.options.exception && is_err;
        let target_met = self.finished_order.len() >= self.target();

        if short_circuit || target_met {
            self.done = true;
            let outcomes = self
                .finished_order
                .iter()
                .map(|id| (*id, self.outcomes.remove(id).unwrap()))
                .collect();
            let leftover_running = self
                .members
                .iter()
                .copied()
                .filter(|id| !self.finished_order.contains(id))
                .collect();
            GatherProgress::Done {
                outcomes,
                leftover_running,
            }
        } else {
            GatherProgress::Pending
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}
