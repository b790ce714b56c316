// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Scheduler tunables (conc.runtime config), mirroring the small
//! `serde::Deserialize` config structs `rask-lsp` and `rask-describe` use
//! for their own entry points. Loading one from a file or environment is an
//! adapter's job, not the runtime core's — this type only describes the
//! shape and supplies defaults via `#[serde(default)]`.

use serde::Deserialize;

/// Initial `TimerHeap` vector capacity: a hint, not a limit — the heap
/// still grows past it.
const DEFAULT_TIMER_CAPACITY: usize = 16;

/// Fallback `epoll_wait` timeout, in milliseconds, used when a future is
/// in flight but no timer is armed (the scheduler still needs to come back
/// and poll the future's channel periodically).
const DEFAULT_POLL_TIMEOUT_MS: u64 = 10;

/// Max events collected from a single `epoll_wait` call.
const DEFAULT_REACTOR_EVENT_BATCH: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub timer_capacity: usize,
    pub default_poll_timeout_ms: u64,
    pub reactor_event_batch: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timer_capacity: DEFAULT_TIMER_CAPACITY,
            default_poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            reactor_event_batch: DEFAULT_REACTOR_EVENT_BATCH,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_constants() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.timer_capacity, DEFAULT_TIMER_CAPACITY);
        assert_eq!(cfg.default_poll_timeout_ms, DEFAULT_POLL_TIMEOUT_MS);
        assert_eq!(cfg.reactor_event_batch, DEFAULT_REACTOR_EVENT_BATCH);
    }

    #[test]
    fn overriding_one_field_leaves_the_rest_at_default() {
        let cfg = SchedulerConfig {
            reactor_event_batch: 256,
            ..SchedulerConfig::default()
        };
        assert_eq!(cfg.reactor_event_batch, 256);
        assert_eq!(cfg.timer_capacity, DEFAULT_TIMER_CAPACITY);
    }
}
