// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Signal router (conc.runtime/signal, §4.5, C3).
//!
//! First registration for a signal installs a self-pipe: `signal-hook`'s
//! low-level pipe registration writes a byte into a `UnixStream` pair from
//! the actual (async-signal-unsafe-free) signal handler; the read half is
//! registered with the scheduler's `Reactor` like any other fd, so signal
//! delivery rides the same readiness loop as file descriptors instead of
//! needing a dedicated thread or a busy poll. Removing the last handler for
//! a signal tears the pipe down and restores the default disposition
//! (`signal_hook::low_level::unregister`).

use std::collections::HashMap;
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;

use signal_hook::low_level::{pipe, unregister};

use crate::task::TaskId;

struct Registration {
    read_end: UnixStream,
    hook_id: signal_hook::SigId,
    /// Handler task ids in registration order (first registered runs first).
    handlers: Vec<TaskId>,
}

/// Routes OS signals to registered handler tasks.
#[derive(Default)]
pub struct SignalRouter {
    by_signal: HashMap<i32, Registration>,
    by_fd: HashMap<RawFd, i32>,
}

impl SignalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `signal`. Returns the read fd to hand to the
    /// reactor the first time this signal is observed; `None` on later
    /// registrations, since the fd is already registered.
    pub fn add_handler(&mut self, signal: i32, handler: TaskId) -> io::Result<Option<RawFd>> {
        if let Some(reg) = self.by_signal.get_mut(&signal) {
            reg.handlers.push(handler);
            return Ok(None);
        }

        let (read_end, write_end) = UnixStream::pair()?;
        read_end.set_nonblocking(true)?;
        let fd = read_end.as_raw_fd();

        let hook_id = unsafe {
            pipe::register(signal, write_end).map_err(io::Error::other)?
        };

        self.by_signal.insert(
            signal,
            Registration {
                read_end,
                hook_id,
                handlers: vec![handler],
            },
        );
        self.by_fd.insert(fd, signal);
        Ok(Some(fd))
    }

    /// Remove `handler` from `signal`'s handler list. Returns the fd to
    /// deregister from the reactor if this was the last handler (restoring
    /// the default disposition).
    pub fn remove_handler(&mut self, signal: i32, handler: TaskId) -> RemoveOutcome {
        let Some(reg) = self.by_signal.get_mut(&signal) else {
            return RemoveOutcome::NotFound;
        };
        reg.handlers.retain(|h| *h != handler);
        if reg.handlers.is_empty() {
            let reg = self.by_signal.remove(&signal).unwrap();
            let fd = reg.read_end.as_raw_fd();
            self.by_fd.remove(&fd);
            unregister(reg.hook_id);
            RemoveOutcome::LastHandlerRemoved(fd)
        } else {
            RemoveOutcome::StillHandled
        }
    }

    /// Drain the self-pipe bytes for `fd` so the next readiness poll
    /// doesn't spuriously re-fire, and return the handler ids to schedule.
    pub fn drain(&mut self, fd: RawFd) -> Vec<TaskId> {
        let Some(&signal) = self.by_fd.get(&fd) else {
            return Vec::new();
        };
        let Some(reg) = self.by_signal.get_mut(&signal) else {
            return Vec::new();
        };
        let mut buf = [0u8; 64];
        while matches!(reg.read_end.read(&mut buf), Ok(n) if n > 0) {}
        reg.handlers.clone()
    }

    pub fn signal_for_fd(&self, fd: RawFd) -> Option<i32> {
        self.by_fd.get(&fd).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.by_signal.is_empty()
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RemoveOutcome {
    NotFound,
    StillHandled,
    LastHandlerRemoved(RawFd),
}

impl Drop for SignalRouter {
    fn drop(&mut self) {
        for (_, reg) in self.by_signal.drain() {
            unregister(reg.hook_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_registration_installs_hook_second_does_not() {
        let mut router = SignalRouter::new();
        let a = TaskId::from_raw(1);
        let b = TaskId::from_raw(2);
        let fd = router.add_handler(libc::SIGUSR1, a).unwrap();
        assert!(fd.is_some());
        let fd2 = router.add_handler(libc::SIGUSR1, b).unwrap();
        assert!(fd2.is_none());
    }

    #[test]
    fn removing_last_handler_restores_default() {
        let mut router = SignalRouter::new();
        let a = TaskId::from_raw(1);
        router.add_handler(libc::SIGUSR2, a).unwrap();
        assert!(!router.is_empty());
        match router.remove_handler(libc::SIGUSR2, a) {
            RemoveOutcome::LastHandlerRemoved(_) => {}
            other => panic!("expected LastHandlerRemoved, got {other:?}"),
        }
        assert!(router.is_empty());
    }

    #[test]
    fn removing_one_of_several_keeps_router_active() {
        let mut router = SignalRouter::new();
        let a = TaskId::from_raw(1);
        let b = TaskId::from_raw(2);
        router.add_handler(libc::SIGUSR1, a).unwrap();
        router.add_handler(libc::SIGUSR1, b).unwrap();
        assert_eq!(router.remove_handler(libc::SIGUSR1, a), RemoveOutcome::StillHandled);
        assert!(!router.is_empty());
    }
}
