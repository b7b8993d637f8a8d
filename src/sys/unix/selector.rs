//! Thin `epoll(7)` wrapper. The engine registers exactly one interest set
//! per file descriptor and re-derives it from queue occupancy on every
//! change, so unlike a general-purpose poller there is no separate
//! registration token: events carry the raw descriptor back directly.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP};

use crate::macros::syscall;

/// Which directions the engine currently wants notified for a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub fn is_empty(self) -> bool {
        !self.readable && !self.writable
    }

    fn to_epoll_bits(self) -> u32 {
        let mut bits = 0u32;
        if self.readable {
            bits |= (EPOLLIN | EPOLLRDHUP) as u32;
        }
        if self.writable {
            bits |= EPOLLOUT as u32;
        }
        bits
    }
}

pub(crate) struct Selector {
    ep: OwnedFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let ep = unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(Selector { ep })
    }

    pub fn add(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event { events: interest.to_epoll_bits(), u64: fd as u64 };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event { events: interest.to_epoll_bits(), u64: fd as u64 };
        syscall!(epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut event)).map(|_| ())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        syscall!(epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()))
            .map(|_| ())
    }

    /// Wait for readiness, unblocking `signum` for the duration of the wait
    /// so the control signal can interrupt it (see [`crate::sys::signal`]).
    pub fn wait(
        &self,
        events: &mut Events,
        timeout: Option<Duration>,
        sigmask: Option<&libc::sigset_t>,
    ) -> io::Result<()> {
        let timeout_ms = timeout
            .map(|t| t.checked_add(Duration::from_nanos(999_999)).unwrap_or(t).as_millis() as i32)
            .unwrap_or(-1);

        events.inner.clear();
        let n = syscall!(epoll_pwait(
            self.ep.as_raw_fd(),
            events.inner.as_mut_ptr(),
            events.inner.capacity() as i32,
            timeout_ms,
            sigmask.map(|m| m as *const _).unwrap_or(std::ptr::null()),
        ))
        .or_else(|err| {
            if err.kind() == io::ErrorKind::Interrupted {
                Ok(0)
            } else {
                Err(err)
            }
        })?;
        unsafe { events.inner.set_len(n as usize) };
        Ok(())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep.as_raw_fd()
    }
}

pub(crate) struct Events {
    inner: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events { inner: Vec::with_capacity(capacity) }
    }

    pub fn iter(&self) -> impl Iterator<Item = ReadyEvent> + '_ {
        self.inner.iter().map(ReadyEvent::from)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ReadyEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hup: bool,
}

impl From<&libc::epoll_event> for ReadyEvent {
    fn from(event: &libc::epoll_event) -> Self {
        let bits = event.events as i32;
        ReadyEvent {
            fd: event.u64 as RawFd,
            readable: bits & (EPOLLIN | libc::EPOLLPRI) != 0,
            writable: bits & EPOLLOUT != 0,
            error: bits & EPOLLERR != 0,
            hup: bits & (EPOLLHUP | EPOLLRDHUP) != 0,
        }
    }
}
