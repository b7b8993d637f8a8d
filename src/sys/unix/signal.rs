//! Engine-scoped, reference-counted real-time-signal interrupt mechanism.
//!
//! `epoll_pwait` is woken by delivering `signum` to the engine's worker
//! thread while that signal is unblocked only for the duration of the wait.
//! Several engines may share the same signal number (the original keeps a
//! `sigaction_map` keyed by signal number with a use count); installing a
//! no-op handler is only needed while at least one engine is using that
//! number, and the previous handler is restored once the last one is gone.

use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, OnceLock};

extern "C" fn noop_handler(_signum: libc::c_int) {}

struct Registration {
    refs: usize,
    previous: libc::sigaction,
}

fn registry() -> &'static Mutex<HashMap<libc::c_int, Registration>> {
    static REGISTRY: OnceLock<Mutex<HashMap<libc::c_int, Registration>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Installs (or references) a handler for `signum`. Dropping the returned
/// guard releases the reference and restores the previous handler once no
/// engine shares the signal number anymore.
pub(crate) struct SignalGuard {
    signum: libc::c_int,
}

impl SignalGuard {
    pub fn install(signum: libc::c_int) -> io::Result<SignalGuard> {
        let mut reg = registry().lock().unwrap();
        if let Some(entry) = reg.get_mut(&signum) {
            entry.refs += 1;
            return Ok(SignalGuard { signum });
        }

        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = noop_handler as usize;
        unsafe { libc::sigemptyset(&mut action.sa_mask) };
        action.sa_flags = 0;

        let mut previous: libc::sigaction = unsafe { std::mem::zeroed() };
        if unsafe { libc::sigaction(signum, &action, &mut previous) } != 0 {
            return Err(io::Error::last_os_error());
        }

        reg.insert(signum, Registration { refs: 1, previous });
        Ok(SignalGuard { signum })
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        let mut reg = registry().lock().unwrap();
        if let Some(entry) = reg.get_mut(&self.signum) {
            entry.refs -= 1;
            if entry.refs == 0 {
                let previous = entry.previous;
                reg.remove(&self.signum);
                unsafe {
                    libc::sigaction(self.signum, &previous, std::ptr::null_mut());
                }
            }
        }
    }
}

/// Blocks `signum` process-wide except during `epoll_pwait`, which instead
/// takes an explicit unblocked mask. Returns the mask to pass to
/// `epoll_pwait` (the current mask with `signum` removed).
pub(crate) fn block_and_make_wait_mask(signum: libc::c_int) -> io::Result<libc::sigset_t> {
    let mut block_set: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut block_set);
        libc::sigaddset(&mut block_set, signum);
        if libc::pthread_sigmask(libc::SIG_BLOCK, &block_set, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    let mut current: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, std::ptr::null(), &mut current);
        libc::sigdelset(&mut current, signum);
    }
    Ok(current)
}

/// Send `signum` to `tid` (as obtained from [`gettid`]) to interrupt a
/// blocked `epoll_pwait`.
pub(crate) fn interrupt(tid: libc::pid_t, signum: libc::c_int) -> io::Result<()> {
    let ret = unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, signum) };
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub(crate) fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}
