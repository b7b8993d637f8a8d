//! C4: the plain file-descriptor endpoint. Wraps an already-open,
//! already-non-blocking descriptor (a pipe, a serial line, an inherited
//! fd) and reads/writes it directly with no transformation — the baseline
//! [`crate::endpoint::EndpointOps`] implementation everything else either
//! uses directly or wraps with an [`crate::adapter::Adapter`].

use std::io;
use std::os::fd::RawFd;

use crate::endpoint::{Endpoint, EndpointOps};
use crate::engine::Engine;
use crate::error;
use crate::macros::syscall;
use crate::sys::fd as fdutil;

pub struct FdEndpoint {
    fd: RawFd,
    close_on_drop: bool,
}

impl FdEndpoint {
    /// Takes ownership of `fd`, putting it in non-blocking, close-on-exec
    /// mode. `fd` is closed when the returned endpoint (or its wrapping
    /// [`Endpoint`]) is dropped.
    pub fn open(fd: RawFd) -> io::Result<FdEndpoint> {
        fdutil::set_nonblocking(fd, true)?;
        fdutil::set_cloexec(fd, true)?;
        Ok(FdEndpoint { fd, close_on_drop: true })
    }

    /// Wraps `fd` without taking ownership of it; the caller remains
    /// responsible for closing it.
    pub fn borrowed(fd: RawFd) -> io::Result<FdEndpoint> {
        fdutil::set_nonblocking(fd, true)?;
        Ok(FdEndpoint { fd, close_on_drop: false })
    }

    pub fn into_endpoint(self, engine: Engine) -> Endpoint<FdEndpoint> {
        Endpoint::new(engine, self)
    }
}

impl EndpointOps for FdEndpoint {
    fn do_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.fd < 0 {
            return Err(error::bad_descriptor());
        }
        match syscall!(read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())) {
            Ok(n) => Ok(n as usize),
            Err(e) if e.raw_os_error() == error::connection_reset().raw_os_error() => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn do_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fd < 0 {
            return Err(error::bad_descriptor());
        }
        syscall!(write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len())).map(|n| n as usize)
    }

    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn close(&mut self) -> io::Result<()> {
        if self.fd >= 0 {
            if self.close_on_drop {
                syscall!(close(self.fd))?;
            }
            self.fd = -1;
        }
        Ok(())
    }
}

impl Drop for FdEndpoint {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_roundtrip_do_read_do_write() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let mut reader = FdEndpoint::open(fds[0]).unwrap();
        let mut writer = FdEndpoint::open(fds[1]).unwrap();

        assert_eq!(writer.do_write(b"hello").unwrap(), 5);
        let mut buf = [0u8; 16];
        // A non-blocking pipe read may race the write landing in the
        // kernel buffer; give it one retry budget as the real engine would
        // via EAGAIN-then-readiness.
        let n = loop {
            match reader.do_read(&mut buf) {
                Ok(n) => break n,
                Err(e) if error::is_would_block(&e) => continue,
                Err(e) => panic!("unexpected error: {e}"),
            }
        };
        assert_eq!(&buf[..n], b"hello");
    }
}
