//! C7: the adapter base. An adapter *is* an endpoint that wraps another
//! endpoint (the "slave") and, by default, simply forwards `do_read`/
//! `do_write` to it — transparent to the engine, which only ever sees
//! [`crate::endpoint::EndpointOps`]. Subclasses such as [`crate::tls`]
//! override both to transform bytes in transit.

use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};

use crate::endpoint::EndpointOps;
use crate::error;

/// How an adapter holds on to its slave: a plain mutable borrow for the
/// common case of wrapping an endpoint that outlives the adapter, or a
/// shared, reference-counted handle when the slave's lifetime needs to be
/// independent of the adapter's (mirrors the source's
/// `Connection&` vs. `shared_ptr<Connection>` constructor pair).
pub enum Slave<E: EndpointOps> {
    Owned(E),
    Shared(Arc<Mutex<E>>),
}

impl<E: EndpointOps> Slave<E> {
    fn with<R>(&mut self, f: impl FnOnce(&mut E) -> R) -> R {
        match self {
            Slave::Owned(e) => f(e),
            Slave::Shared(shared) => f(&mut shared.lock().unwrap()),
        }
    }
}

/// Base adapter: forwards everything to the slave unchanged. Exists mostly
/// to anchor the [`Slave`] ownership pattern that transforming adapters
/// (TLS) build on; most applications will reach for a transforming adapter
/// directly rather than this one.
pub struct Adapter<E: EndpointOps> {
    slave: Slave<E>,
}

impl<E: EndpointOps> Adapter<E> {
    pub fn wrapping(slave: E) -> Self {
        Adapter { slave: Slave::Owned(slave) }
    }

    pub fn wrapping_shared(slave: Arc<Mutex<E>>) -> Self {
        Adapter { slave: Slave::Shared(slave) }
    }

    pub(crate) fn slave_mut(&mut self) -> &mut Slave<E> {
        &mut self.slave
    }
}

impl<E: EndpointOps> EndpointOps for Adapter<E> {
    fn do_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.slave.with(|s| s.do_read(buf))
    }

    fn do_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.slave.with(|s| s.do_write(buf))
    }

    fn raw_fd(&self) -> RawFd {
        match &self.slave {
            Slave::Owned(e) => e.raw_fd(),
            Slave::Shared(shared) => shared.lock().map(|e| e.raw_fd()).unwrap_or(-1),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match &mut self.slave {
            Slave::Owned(e) => e.close(),
            Slave::Shared(shared) => shared.lock().map_err(|_| error::bad_descriptor())?.close(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd_endpoint::FdEndpoint;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn owned_slave_forwards_unchanged() {
        let (r, w) = pipe();
        let mut adapter = Adapter::wrapping(FdEndpoint::open(r).unwrap());
        let mut writer = FdEndpoint::open(w).unwrap();
        assert_eq!(writer.do_write(b"hi").unwrap(), 2);
        let mut buf = [0u8; 8];
        let n = loop {
            match adapter.do_read(&mut buf) {
                Ok(n) => break n,
                Err(e) if error::is_would_block(&e) => continue,
                Err(e) => panic!("unexpected error: {e}"),
            }
        };
        assert_eq!(&buf[..n], b"hi");
    }

    #[test]
    fn shared_slave_is_reachable_through_both_handles() {
        let (r, w) = pipe();
        let shared = Arc::new(Mutex::new(FdEndpoint::open(r).unwrap()));
        let mut adapter = Adapter::wrapping_shared(shared.clone());
        let mut writer = FdEndpoint::open(w).unwrap();

        assert_eq!(adapter.raw_fd(), shared.lock().unwrap().raw_fd());
        assert_eq!(writer.do_write(b"ok").unwrap(), 2);

        let mut buf = [0u8; 8];
        let n = loop {
            match adapter.slave_mut().with(|s| s.do_read(&mut buf)) {
                Ok(n) => break n,
                Err(e) if error::is_would_block(&e) => continue,
                Err(e) => panic!("unexpected error: {e}"),
            }
        };
        assert_eq!(&buf[..n], b"ok");

        adapter.close().unwrap();
        assert_eq!(shared.lock().unwrap().raw_fd(), -1);
    }
}
