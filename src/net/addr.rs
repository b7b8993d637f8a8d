//! C1 (the part that isn't external): a thin address newtype wide enough to
//! cover the socket families [`crate::net::socket::SocketEndpoint`]
//! supports, with the raw `sockaddr` conversions the `libc` socket calls
//! need. Name resolution stays out of scope — callers hand in addresses
//! already resolved via `std::net`/`std::os::unix::net`.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use crate::error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SockAddr {
    Inet(SocketAddr),
    /// A path-bound Unix-domain address. Abstract (`\0`-prefixed) addresses
    /// are out of scope.
    Unix(PathBuf),
    /// A Unix-domain socket with no bound path (the usual state of the
    /// client end of a `socketpair`, or an unbound local address).
    UnixUnnamed,
}

impl From<SocketAddr> for SockAddr {
    fn from(addr: SocketAddr) -> Self {
        SockAddr::Inet(addr)
    }
}

impl<'a> From<&'a Path> for SockAddr {
    fn from(path: &'a Path) -> Self {
        SockAddr::Unix(path.to_path_buf())
    }
}

pub(crate) struct RawAddr {
    pub storage: libc::sockaddr_storage,
    pub len: libc::socklen_t,
}

impl SockAddr {
    pub(crate) fn to_raw(&self) -> io::Result<RawAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = match self {
            SockAddr::Inet(SocketAddr::V4(addr)) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: addr.port().to_be(),
                    sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(addr.ip().octets()) },
                    sin_zero: [0; 8],
                };
                unsafe {
                    std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
                }
                mem::size_of::<libc::sockaddr_in>()
            }
            SockAddr::Inet(SocketAddr::V6(addr)) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: addr.port().to_be(),
                    sin6_flowinfo: addr.flowinfo(),
                    sin6_addr: libc::in6_addr { s6_addr: addr.ip().octets() },
                    sin6_scope_id: addr.scope_id(),
                };
                unsafe {
                    std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
                }
                mem::size_of::<libc::sockaddr_in6>()
            }
            SockAddr::Unix(path) => {
                let mut sun = libc::sockaddr_un {
                    sun_family: libc::AF_UNIX as libc::sa_family_t,
                    sun_path: [0; 108],
                };
                let bytes = path.as_os_str().as_bytes();
                if bytes.len() >= sun.sun_path.len() {
                    return Err(error::not_supported());
                }
                for (dst, src) in sun.sun_path.iter_mut().zip(bytes.iter()) {
                    *dst = *src as libc::c_char;
                }
                let path_len = mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
                unsafe {
                    std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_un, sun);
                }
                path_len
            }
            SockAddr::UnixUnnamed => {
                let sun = libc::sockaddr_un {
                    sun_family: libc::AF_UNIX as libc::sa_family_t,
                    sun_path: [0; 108],
                };
                unsafe {
                    std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_un, sun);
                }
                mem::size_of::<libc::sa_family_t>()
            }
        };
        Ok(RawAddr { storage, len: len as libc::socklen_t })
    }

    pub(crate) unsafe fn from_raw(storage: &libc::sockaddr_storage, len: libc::socklen_t) -> io::Result<SockAddr> {
        match storage.ss_family as libc::c_int {
            libc::AF_INET if len as usize >= mem::size_of::<libc::sockaddr_in>() => {
                let sin = &*(storage as *const _ as *const libc::sockaddr_in);
                let ip = Ipv4Addr::from(u32::from_ne_bytes(sin.sin_addr.s_addr.to_ne_bytes()));
                Ok(SockAddr::Inet(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port))))
            }
            libc::AF_INET6 if len as usize >= mem::size_of::<libc::sockaddr_in6>() => {
                let sin6 = &*(storage as *const _ as *const libc::sockaddr_in6);
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Ok(SockAddr::Inet(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port))))
            }
            libc::AF_UNIX => {
                if len as usize <= mem::size_of::<libc::sa_family_t>() {
                    return Ok(SockAddr::UnixUnnamed);
                }
                let sun = &*(storage as *const _ as *const libc::sockaddr_un);
                let path_len = len as usize - mem::size_of::<libc::sa_family_t>();
                let bytes: Vec<u8> =
                    sun.sun_path[..path_len].iter().take_while(|b| **b != 0).map(|b| *b as u8).collect();
                if bytes.is_empty() {
                    Ok(SockAddr::UnixUnnamed)
                } else {
                    Ok(SockAddr::Unix(PathBuf::from(std::ffi::OsStr::from_bytes(&bytes))))
                }
            }
            _ => Err(error::address_family_mismatch()),
        }
    }
}
