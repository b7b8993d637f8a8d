//! Small helpers for putting a raw descriptor into the state the engine
//! requires: non-blocking and close-on-exec.

use std::io;
use std::os::fd::RawFd;

use crate::macros::syscall;

pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    let new_flags = if nonblocking { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
    if new_flags != flags {
        syscall!(fcntl(fd, libc::F_SETFL, new_flags))?;
    }
    Ok(())
}

pub(crate) fn set_cloexec(fd: RawFd, cloexec: bool) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFD))?;
    let new_flags = if cloexec { flags | libc::FD_CLOEXEC } else { flags & !libc::FD_CLOEXEC };
    if new_flags != flags {
        syscall!(fcntl(fd, libc::F_SETFD, new_flags))?;
    }
    Ok(())
}

/// True if `fd` refers to a regular file. `epoll` never reports readiness
/// for regular files, so the engine rejects operations queued on one.
pub(crate) fn is_regular_file(fd: RawFd) -> bool {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return false;
    }
    (st.st_mode & libc::S_IFMT) == libc::S_IFREG
}
