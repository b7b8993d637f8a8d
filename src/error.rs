//! Helpers that build the `io::Error` values the engine and endpoints hand
//! back to callers. There is no crate-local error enum: every POSIX errno
//! the original C implementation sets is surfaced as-is through
//! `io::Error::from_raw_os_error`, matching the errno each operation already
//! carries.

use std::io;

pub fn bad_descriptor() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADF)
}

pub fn already_in_progress() -> io::Error {
    io::Error::from_raw_os_error(libc::EINPROGRESS)
}

pub fn cancelled() -> io::Error {
    io::Error::from_raw_os_error(libc::ECANCELED)
}

pub fn timed_out() -> io::Error {
    io::Error::from_raw_os_error(libc::ETIMEDOUT)
}

pub fn would_block() -> io::Error {
    io::Error::from_raw_os_error(libc::EAGAIN)
}

pub fn deadlock_avoided() -> io::Error {
    io::Error::from_raw_os_error(libc::EDEADLK)
}

pub fn connection_reset() -> io::Error {
    io::Error::from_raw_os_error(libc::ECONNRESET)
}

pub fn connection_refused() -> io::Error {
    io::Error::from_raw_os_error(libc::ECONNREFUSED)
}

pub fn address_family_mismatch() -> io::Error {
    io::Error::from_raw_os_error(libc::EAFNOSUPPORT)
}

pub fn not_supported() -> io::Error {
    io::Error::from_raw_os_error(libc::EOPNOTSUPP)
}

/// A protocol-level failure from the TLS library, not tied to a single
/// errno. Carries the OpenSSL error-stack message as context.
#[cfg(feature = "tls")]
pub fn tls_protocol_error(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::Other, msg.into())
}

/// True if `err` is the "no data/space right now, try later" condition the
/// engine treats as "leave the operation queued".
pub fn is_would_block(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK))
}
