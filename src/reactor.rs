// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Readiness multiplexer (conc.runtime/reactor, §4.4, C2).
//!
//! Epoll-backed, grounded on the teacher's `green::reactor::Reactor`, but
//! reshaped for a single-threaded cooperative loop: there is no dedicated
//! reactor thread and no per-registration `Waker` — the scheduler calls
//! `Reactor::poll` synchronously from its own tick and gets back a plain
//! list of `(fd, Interest)` pairs to re-enqueue. The scheduler (not the
//! reactor) owns the waiting-task lists per §3's readiness registry, so the
//! reactor here is purely the OS-facing polling primitive.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;

/// Which direction(s) a registration or readiness event covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn bit(self) -> u32 {
        match self {
            Interest::Readable => libc::EPOLLIN as u32,
            Interest::Writable => libc::EPOLLOUT as u32,
        }
    }
}

const DEFAULT_MAX_EVENTS: usize = 128;

/// Epoll-backed synchronous readiness multiplexer.
pub struct Reactor {
    epoll_fd: RawFd,
    /// Combined interest mask currently registered per fd (read | write bits).
    registered: HashMap<RawFd, u32>,
    /// Largest number of events `poll` collects from a single `epoll_wait`.
    max_events: usize,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Self::with_capacity(DEFAULT_MAX_EVENTS)
    }

    /// Like `new`, but with a caller-chosen `epoll_wait` batch size
    /// (`SchedulerConfig::reactor_event_batch`).
    pub fn with_capacity(max_events: usize) -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll_fd,
            registered: HashMap::new(),
            max_events: max_events.max(1),
        })
    }

    /// Register interest in `fd` becoming ready for `interest`. Combines
    /// with any existing interest already registered for that fd (a single
    /// fd may have both a reader and a writer waiting, per §8's boundary on
    /// dual-direction waits).
    pub fn add_interest(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let existing = self.registered.get(&fd).copied();
        let mask = existing.unwrap_or(0) | interest.bit();

        let mut ev = libc::epoll_event { events: mask, u64: fd as u64 };
        let op = if existing.is_some() {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        self.registered.insert(fd, mask);
        Ok(())
    }

    /// Remove interest in `fd` for `interest` only; if the other direction
    /// is still registered the fd stays in epoll with the reduced mask.
    /// Round-trips to the prior membership when the fd had no other
    /// interest (§8 round-trip property).
    pub fn remove_interest(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let Some(mask) = self.registered.get(&fd).copied() else {
            return Ok(());
        };
        let new_mask = mask & !interest.bit();

        if new_mask == 0 {
            self.registered.remove(&fd);
            let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF) {
                    return Err(err);
                }
            }
        } else {
            let mut ev = libc::epoll_event { events: new_mask, u64: fd as u64 };
            let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev) };
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            self.registered.insert(fd, new_mask);
        }
        Ok(())
    }

    /// Remove every registration for `fd`, regardless of direction.
    pub fn remove_fd(&mut self, fd: RawFd) -> io::Result<()> {
        if self.registered.remove(&fd).is_some() {
            let ret = unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) && err.raw_os_error() != Some(libc::EBADF) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Block up to `timeout_ms` (negative = forever) waiting for readiness.
    /// Returns `(fd, Interest)` pairs — one per direction that became ready,
    /// in fd-enumeration order (§4.1: "applications must not rely on this
    /// order").
    pub fn poll(&self, timeout_ms: i32) -> io::Result<Vec<(RawFd, Interest)>> {
        let mut events: Vec<libc::epoll_event> = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events];

        let n = unsafe { libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), self.max_events as i32, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut ready = Vec::new();
        for ev in &events[..n as usize] {
            let fd = ev.u64 as RawFd;
            if ev.events & libc::EPOLLIN as u32 != 0 {
                ready.push((fd, Interest::Readable));
            }
            if ev.events & libc::EPOLLOUT as u32 != 0 {
                ready.push((fd, Interest::Writable));
            }
            // Hang-up/error bits wake both directions so a waiting task
            // observes the condition instead of blocking forever.
            if ev.events & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0 {
                if ev.events & libc::EPOLLIN as u32 == 0 {
                    ready.push((fd, Interest::Readable));
                }
                if ev.events & libc::EPOLLOUT as u32 == 0 {
                    ready.push((fd, Interest::Writable));
                }
            }
        }
        Ok(ready)
    }

    pub fn is_idle(&self) -> bool {
        self.registered.is_empty()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        (fds[0], fds[1])
    }

    #[test]
    fn readiness_on_write() {
        let mut reactor = Reactor::new().unwrap();
        let (read_fd, write_fd) = pipe();
        reactor.add_interest(read_fd, Interest::Readable).unwrap();

        unsafe { libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1) };

        let ready = reactor.poll(100).unwrap();
        assert!(ready.contains(&(read_fd, Interest::Readable)));

        reactor.remove_fd(read_fd).unwrap();
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn register_remove_round_trips() {
        let mut reactor = Reactor::new().unwrap();
        let (read_fd, write_fd) = pipe();
        assert!(reactor.is_idle());
        reactor.add_interest(read_fd, Interest::Readable).unwrap();
        assert!(!reactor.is_idle());
        reactor.remove_interest(read_fd, Interest::Readable).unwrap();
        assert!(reactor.is_idle());
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn dual_direction_same_fd_independent() {
        let mut reactor = Reactor::new().unwrap();
        let (read_fd, write_fd) = pipe();
        reactor.add_interest(write_fd, Interest::Readable).unwrap();
        reactor.add_interest(write_fd, Interest::Writable).unwrap();
        reactor.remove_interest(write_fd, Interest::Readable).unwrap();
        assert!(!reactor.is_idle());
        reactor.remove_interest(write_fd, Interest::Writable).unwrap();
        assert!(reactor.is_idle());
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn timeout_with_no_events() {
        let reactor = Reactor::new().unwrap();
        let ready = reactor.poll(1).unwrap();
        assert!(ready.is_empty());
    }
}
