//! C5: TCP, UDP, and Unix-domain socket endpoints. One type parameterized
//! by the domain passed to `socket(2)`, matching `socket_connection`'s
//! single class covering `AF_INET`/`AF_INET6`/`AF_UNIX` alike.

use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::endpoint::{Endpoint, EndpointOps};
use crate::error;
use crate::macros::syscall;
use crate::net::addr::SockAddr;
use crate::sys::fd as fdutil;

pub struct SocketEndpoint {
    fd: RawFd,
    /// Cached local address, filled in by [`SocketEndpoint::bind`] or by a
    /// successful [`SocketEndpoint::do_sendto`] on a socket that was never
    /// explicitly bound (the kernel picks an ephemeral address on first
    /// send). `None` until one of those happens.
    local: Option<SockAddr>,
    /// Cached peer address, filled in by [`SocketEndpoint::begin_connect`].
    peer: Option<SockAddr>,
    bound: bool,
    connected: bool,
}

impl SocketEndpoint {
    pub fn open(domain: libc::c_int, sock_type: libc::c_int, protocol: libc::c_int) -> io::Result<Self> {
        let fd = syscall!(socket(domain, sock_type, protocol))?;
        fdutil::set_nonblocking(fd, true)?;
        fdutil::set_cloexec(fd, true)?;
        Ok(SocketEndpoint { fd, local: None, peer: None, bound: false, connected: false })
    }

    pub fn tcp(family: libc::c_int) -> io::Result<Self> {
        Self::open(family, libc::SOCK_STREAM, 0)
    }

    pub fn udp(family: libc::c_int) -> io::Result<Self> {
        Self::open(family, libc::SOCK_DGRAM, 0)
    }

    pub fn unix_stream() -> io::Result<Self> {
        Self::open(libc::AF_UNIX, libc::SOCK_STREAM, 0)
    }

    pub fn unix_datagram() -> io::Result<Self> {
        Self::open(libc::AF_UNIX, libc::SOCK_DGRAM, 0)
    }

    pub fn bind(&mut self, addr: &SockAddr) -> io::Result<()> {
        let raw = addr.to_raw()?;
        syscall!(bind(self.fd, &raw.storage as *const _ as *const libc::sockaddr, raw.len))?;
        self.local = Some(addr.clone());
        self.bound = true;
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        syscall!(listen(self.fd, backlog)).map(|_| ())
    }

    /// Returns the cached local address if one was latched by [`bind`] or a
    /// prior [`do_sendto`], otherwise asks the kernel directly.
    ///
    /// [`bind`]: SocketEndpoint::bind
    /// [`do_sendto`]: SocketEndpoint::do_sendto
    pub fn local_addr(&self) -> io::Result<SockAddr> {
        if let Some(addr) = &self.local {
            return Ok(addr.clone());
        }
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len))?;
        unsafe { SockAddr::from_raw(&storage, len) }
    }

    /// Returns the cached peer address latched by a successful
    /// [`begin_connect`], otherwise asks the kernel directly.
    ///
    /// [`begin_connect`]: SocketEndpoint::begin_connect
    pub fn peer_addr(&self) -> io::Result<SockAddr> {
        if let Some(addr) = &self.peer {
            return Ok(addr.clone());
        }
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getpeername(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len))?;
        unsafe { SockAddr::from_raw(&storage, len) }
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn set_reuseaddr(&self, value: bool) -> io::Result<()> {
        let v: libc::c_int = value as libc::c_int;
        syscall!(setsockopt(
            self.fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &v as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))
        .map(|_| ())
    }

    /// Returns `Ok(true)` if the connection completed synchronously,
    /// `Ok(false)` if it is in progress (caller should wait for
    /// writability and then call [`SocketEndpoint::take_connect_error`]).
    pub(crate) fn begin_connect(&mut self, addr: &SockAddr) -> io::Result<bool> {
        let raw = addr.to_raw()?;
        match syscall!(connect(self.fd, &raw.storage as *const _ as *const libc::sockaddr, raw.len)) {
            Ok(_) => {
                self.peer = Some(addr.clone());
                self.connected = true;
                Ok(true)
            }
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                self.peer = Some(addr.clone());
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    pub(crate) fn take_connect_error(&mut self) -> io::Result<()> {
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            self.fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        ))?;
        if err == 0 {
            self.connected = true;
            Ok(())
        } else {
            self.peer = None;
            Err(io::Error::from_raw_os_error(err))
        }
    }

    pub(crate) fn do_accept(&self) -> io::Result<SocketEndpoint> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = syscall!(accept4(
            self.fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;
        let peer = unsafe { SockAddr::from_raw(&storage, len) }.ok();
        Ok(SocketEndpoint { fd, local: None, peer, bound: false, connected: true })
    }

    pub(crate) fn do_recvfrom(&self, len: usize) -> io::Result<(Vec<u8>, SockAddr)> {
        let mut buf = vec![0u8; len];
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut addr_len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = syscall!(recvfrom(
            self.fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut addr_len,
        ))?;
        buf.truncate(n as usize);
        let peer = unsafe { SockAddr::from_raw(&storage, addr_len)? };
        Ok((buf, peer))
    }

    pub(crate) fn do_sendto(&mut self, buf: &[u8], peer: &SockAddr) -> io::Result<usize> {
        let raw = peer.to_raw()?;
        let n = syscall!(sendto(
            self.fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            0,
            &raw.storage as *const _ as *const libc::sockaddr,
            raw.len,
        ))? as usize;
        if self.local.is_none() {
            // Unbound datagram socket: the kernel picked an ephemeral local
            // address on this first send. Latch it so `local_addr` doesn't
            // need a syscall on every subsequent call.
            if let Ok(addr) = self.local_addr_uncached() {
                self.local = Some(addr);
            }
        }
        Ok(n)
    }

    fn local_addr_uncached(&self) -> io::Result<SockAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        syscall!(getsockname(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len))?;
        unsafe { SockAddr::from_raw(&storage, len) }
    }
}

impl EndpointOps for SocketEndpoint {
    fn do_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match syscall!(recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)) {
            Ok(n) => Ok(n as usize),
            Err(e) if e.raw_os_error() == error::connection_reset().raw_os_error() => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn do_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        syscall!(send(self.fd, buf.as_ptr() as *const libc::c_void, buf.len(), libc::MSG_NOSIGNAL))
            .map(|n| n as usize)
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

impl Drop for SocketEndpoint {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl Endpoint<SocketEndpoint> {
    pub fn connect(
        &self,
        addr: SockAddr,
        timeout: Option<Duration>,
        callback: impl FnOnce(io::Result<()>) + Send + 'static,
    ) -> io::Result<()> {
        let immediate = self.with_inner(|sock| sock.begin_connect(&addr))?;
        if immediate {
            callback(Ok(()));
            return Ok(());
        }
        let this = self.clone();
        self.wait_for_tx(timeout, move |ready| {
            let result = ready.and_then(|_| this.with_inner(|sock| sock.take_connect_error()));
            callback(result);
        })
    }

    pub fn connect_sync(&self, addr: SockAddr, timeout: Option<Duration>) -> io::Result<()> {
        if self.engine().same_context() {
            return Err(error::deadlock_avoided());
        }
        let (tx, rx) = std::sync::mpsc::channel();
        self.connect(addr, timeout, move |result| {
            let _ = tx.send(result);
        })?;
        rx.recv().unwrap_or_else(|_| Err(error::cancelled()))
    }

    pub fn accept(
        &self,
        timeout: Option<Duration>,
        callback: impl FnOnce(io::Result<Endpoint<SocketEndpoint>>) + Send + 'static,
    ) -> io::Result<()> {
        let this = self.clone();
        self.wait_for_rx(timeout, move |ready| {
            let result = ready.and_then(|_| this.with_inner(|sock| sock.do_accept()));
            callback(result.map(|client| Endpoint::new(this.engine().clone(), client)));
        })
    }

    pub fn accept_sync(&self, timeout: Option<Duration>) -> io::Result<Endpoint<SocketEndpoint>> {
        if self.engine().same_context() {
            return Err(error::deadlock_avoided());
        }
        let (tx, rx) = std::sync::mpsc::channel();
        self.accept(timeout, move |result| {
            let _ = tx.send(result);
        })?;
        rx.recv().unwrap_or_else(|_| Err(error::cancelled()))
    }

    pub fn recvfrom(
        &self,
        len: usize,
        timeout: Option<Duration>,
        callback: impl FnOnce(io::Result<(Vec<u8>, SockAddr)>) + Send + 'static,
    ) -> io::Result<()> {
        let this = self.clone();
        self.wait_for_rx(timeout, move |ready| {
            callback(ready.and_then(|_| this.with_inner(|sock| sock.do_recvfrom(len))));
        })
    }

    pub fn sendto(
        &self,
        buf: Vec<u8>,
        peer: SockAddr,
        timeout: Option<Duration>,
        callback: impl FnOnce(io::Result<usize>) + Send + 'static,
    ) -> io::Result<()> {
        let this = self.clone();
        self.wait_for_tx(timeout, move |ready| {
            callback(ready.and_then(|_| this.with_inner(|sock| sock.do_sendto(&buf, &peer))));
        })
    }
}
