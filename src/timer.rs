//! C6: a `timerfd`-backed endpoint. Expiration is delivered the same way
//! any other readable descriptor is — reading an 8-byte overrun counter —
//! so a timer is an ordinary [`crate::endpoint::EndpointOps`] plus a
//! convenience `set`/`set_abs` pair that (re)arms the kernel timer and
//! queues the read that will fire the caller's callback.

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::endpoint::EndpointOps;
use crate::engine::Engine;
use crate::error;
use crate::macros::syscall;

pub struct TimerEndpoint {
    fd: RawFd,
}

impl TimerEndpoint {
    pub fn new(clock: libc::clockid_t) -> io::Result<Self> {
        let fd = syscall!(timerfd_create(clock, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC))?;
        Ok(TimerEndpoint { fd })
    }

    pub fn monotonic() -> io::Result<Self> {
        Self::new(libc::CLOCK_MONOTONIC)
    }

    fn arm(&self, value: libc::itimerspec) -> io::Result<()> {
        syscall!(timerfd_settime(self.fd, 0, &value, std::ptr::null_mut())).map(|_| ())
    }

    fn disarm(&self) -> io::Result<()> {
        let zero: libc::itimerspec = unsafe { std::mem::zeroed() };
        self.arm(zero)
    }
}

impl EndpointOps for TimerEndpoint {
    fn do_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.len() < 8 {
            return Err(error::not_supported());
        }
        syscall!(read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, 8)).map(|n| n as usize)
    }

    fn do_write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(error::not_supported())
    }

    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn close(&mut self) -> io::Result<()> {
        if self.fd >= 0 {
            syscall!(close(self.fd))?;
            self.fd = -1;
        }
        Ok(())
    }
}

impl Drop for TimerEndpoint {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn duration_to_timespec(d: Duration) -> libc::timespec {
    libc::timespec { tv_sec: d.as_secs() as libc::time_t, tv_nsec: d.subsec_nanos() as libc::c_long }
}

impl Endpoint<TimerEndpoint> {
    pub fn new_on(engine: Engine) -> io::Result<Self> {
        Ok(Endpoint::new(engine, TimerEndpoint::monotonic()?))
    }

    /// Arms the timer to first fire after `delay`, then every `interval`
    /// after that (`interval` of zero means fire once), invoking `callback`
    /// on every expiration until the endpoint is dropped or re-armed.
    pub fn set(
        &self,
        delay: Duration,
        interval: Duration,
        mut callback: impl FnMut() + Send + 'static,
    ) -> io::Result<()> {
        let spec = libc::itimerspec {
            it_value: duration_to_timespec(if delay.is_zero() { Duration::from_nanos(1) } else { delay }),
            it_interval: duration_to_timespec(interval),
        };
        self.with_inner(|t| t.arm(spec))?;
        self.queue_next_expiration(interval, move || callback())
    }

    fn queue_next_expiration(
        &self,
        interval: Duration,
        mut callback: impl FnMut() + Send + 'static,
    ) -> io::Result<()> {
        let this = self.clone();
        self.read(8, None, move |result| {
            if result.is_err() {
                return;
            }
            callback();
            if !interval.is_zero() {
                let _ = this.queue_next_expiration(interval, callback);
            }
        })
    }

    pub fn cancel_timer(&self) {
        self.cancel(true, false, true);
        let _ = self.with_inner(|t| t.disarm());
    }
}
