//! C8: the TLS/DTLS adapter. Wraps a plain endpoint (almost always a
//! [`crate::net::SocketEndpoint`]) and, once a handshake completes, makes
//! `do_read`/`do_write` transparently encrypt/decrypt application data.
//!
//! The handshake has its own state machine distinct from ordinary queued
//! I/O — `start_client`/`start_server` drive it to completion across
//! however many `WANT_READ`/`WANT_WRITE` round trips OpenSSL asks for,
//! resuming a parked [`openssl::ssl::MidHandshakeSslStream`] each time the
//! descriptor becomes ready. A seeded server handshake (bytes already
//! peeked off the wire by a protocol sniffer before TLS took over) is
//! supported by draining a small in-memory buffer ahead of the slave's
//! `do_read`.

pub mod config;
pub use config::TlsConfig;

use std::io::{self, Read, Write};
use std::os::fd::RawFd;
use std::time::Duration;

use openssl::ssl::{
    Error as SslError, ErrorCode, HandshakeError, MidHandshakeSslStream, ShutdownResult, Ssl,
    SslStream,
};

use crate::endpoint::{Endpoint, EndpointOps};
use crate::error;

/// Bridges a slave [`EndpointOps`] to `Read`/`Write` so it can back an
/// `openssl` `SslStream`. A non-blocking slave's `EAGAIN` already carries
/// `io::ErrorKind::WouldBlock`, which is exactly what `openssl` needs to
/// recognize `SSL_ERROR_WANT_READ`/`WANT_WRITE` and hand back a resumable
/// `HandshakeError::WouldBlock` (or, post-handshake, a `WouldBlock` read/
/// write error the engine leaves queued).
struct SlaveStream<E: EndpointOps> {
    slave: E,
    seed: Vec<u8>,
    seed_pos: usize,
}

impl<E: EndpointOps> Read for SlaveStream<E> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.seed_pos < self.seed.len() {
            let n = buf.len().min(self.seed.len() - self.seed_pos);
            buf[..n].copy_from_slice(&self.seed[self.seed_pos..self.seed_pos + n]);
            self.seed_pos += n;
            return Ok(n);
        }
        self.slave.do_read(buf)
    }
}

impl<E: EndpointOps> Write for SlaveStream<E> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.slave.do_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

enum State<E: EndpointOps> {
    /// Transient value only ever observed between a `mem::replace` and the
    /// assignment that follows it within the same call.
    Empty,
    Inactive(E),
    Handshaking(MidHandshakeSslStream<SlaveStream<E>>),
    Active(SslStream<SlaveStream<E>>),
    ShuttingDown(SslStream<SlaveStream<E>>),
    Closed,
}

enum HandshakeStep {
    Done,
    WantRead,
    WantWrite,
    Failed(io::Error),
}

enum ShutdownStep {
    Done,
    WantRead,
    WantWrite,
    Failed(io::Error),
}

pub struct TlsAdapter<E: EndpointOps> {
    fd: RawFd,
    state: State<E>,
}

impl<E: EndpointOps> TlsAdapter<E> {
    pub fn wrapping(slave: E) -> Self {
        TlsAdapter { fd: slave.raw_fd(), state: State::Inactive(slave) }
    }

    fn begin(&mut self, ssl: Ssl, seed: Vec<u8>, server: bool) -> HandshakeStep {
        let slave = match std::mem::replace(&mut self.state, State::Empty) {
            State::Inactive(e) => e,
            other => {
                self.state = other;
                return HandshakeStep::Failed(error::already_in_progress());
            }
        };
        let stream = SlaveStream { slave, seed, seed_pos: 0 };
        let result = if server { ssl.accept(stream) } else { ssl.connect(stream) };
        self.apply_handshake(result)
    }

    fn resume(&mut self) -> HandshakeStep {
        match std::mem::replace(&mut self.state, State::Empty) {
            State::Handshaking(mid) => self.apply_handshake(mid.handshake()),
            other => {
                self.state = other;
                HandshakeStep::Failed(error::bad_descriptor())
            }
        }
    }

    fn apply_handshake(
        &mut self,
        result: Result<SslStream<SlaveStream<E>>, HandshakeError<SlaveStream<E>>>,
    ) -> HandshakeStep {
        match result {
            Ok(stream) => {
                self.state = State::Active(stream);
                HandshakeStep::Done
            }
            Err(HandshakeError::WouldBlock(mid)) => {
                let step = match mid.error().code() {
                    ErrorCode::WANT_WRITE => HandshakeStep::WantWrite,
                    _ => HandshakeStep::WantRead,
                };
                self.state = State::Handshaking(mid);
                step
            }
            Err(HandshakeError::Failure(mid)) => {
                let msg = mid.error().to_string();
                self.state = State::Closed;
                HandshakeStep::Failed(error::tls_protocol_error(msg))
            }
            Err(HandshakeError::SetupFailure(e)) => {
                self.state = State::Closed;
                HandshakeStep::Failed(error::tls_protocol_error(e.to_string()))
            }
        }
    }

    fn begin_shutdown(&mut self) -> ShutdownStep {
        match std::mem::replace(&mut self.state, State::Empty) {
            State::Active(s) | State::ShuttingDown(s) => self.drive_shutdown(s),
            other => {
                self.state = other;
                ShutdownStep::Done
            }
        }
    }

    fn resume_shutdown(&mut self) -> ShutdownStep {
        self.begin_shutdown()
    }

    fn drive_shutdown(&mut self, mut stream: SslStream<SlaveStream<E>>) -> ShutdownStep {
        match stream.shutdown() {
            Ok(ShutdownResult::Sent) => {
                self.state = State::ShuttingDown(stream);
                ShutdownStep::WantRead
            }
            Ok(ShutdownResult::Received) => {
                self.state = State::Closed;
                ShutdownStep::Done
            }
            Err(e) => match e.code() {
                ErrorCode::WANT_READ => {
                    self.state = State::ShuttingDown(stream);
                    ShutdownStep::WantRead
                }
                ErrorCode::WANT_WRITE => {
                    self.state = State::ShuttingDown(stream);
                    ShutdownStep::WantWrite
                }
                _ => {
                    self.state = State::Closed;
                    ShutdownStep::Failed(error::tls_protocol_error(e.to_string()))
                }
            },
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state, State::Active(_))
    }

    pub fn peer_certificate(&self) -> Option<openssl::x509::X509> {
        match &self.state {
            State::Active(s) | State::ShuttingDown(s) => s.ssl().peer_certificate(),
            _ => None,
        }
    }

    pub fn cipher_name(&self) -> Option<String> {
        match &self.state {
            State::Active(s) | State::ShuttingDown(s) => s.ssl().current_cipher().map(|c| c.name().to_string()),
            _ => None,
        }
    }

    pub fn protocol_version(&self) -> Option<String> {
        match &self.state {
            State::Active(s) | State::ShuttingDown(s) => Some(s.ssl().version_str().to_string()),
            _ => None,
        }
    }

    pub fn peer_verified(&self) -> bool {
        match &self.state {
            State::Active(s) | State::ShuttingDown(s) => {
                s.ssl().verify_result() == openssl::x509::X509VerifyResult::OK
            }
            _ => false,
        }
    }
}

/// Translates a post-handshake `ssl_read`/`ssl_write` error into the
/// `io::Result` the engine expects. `SSL_ERROR_SYSCALL` with no underlying
/// errno (peer went away without a TLS-level or TCP-level signal) or with
/// `ECONNRESET` both collapse to `Ok(0)`, the same "peer closed" convention
/// a plain socket's `do_read` uses; a clean `close_notify` (`ZERO_RETURN`)
/// does too. `WANT_READ`/`WANT_WRITE` become the engine's would-block.
fn map_ssl_io_error(e: SslError) -> io::Result<usize> {
    match e.code() {
        ErrorCode::ZERO_RETURN => Ok(0),
        ErrorCode::WANT_READ | ErrorCode::WANT_WRITE => Err(error::would_block()),
        ErrorCode::SYSCALL => match e.io_error().and_then(|io_err| io_err.raw_os_error()) {
            None => Ok(0),
            Some(errno) if errno == libc::ECONNRESET => Ok(0),
            Some(errno) => Err(io::Error::from_raw_os_error(errno)),
        },
        _ => Err(error::tls_protocol_error(e.to_string())),
    }
}

impl<E: EndpointOps> EndpointOps for TlsAdapter<E> {
    fn do_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.state {
            State::Active(stream) | State::ShuttingDown(stream) => match stream.ssl_read(buf) {
                Ok(n) => Ok(n),
                Err(e) => map_ssl_io_error(e),
            },
            State::Handshaking(_) => Err(error::would_block()),
            State::Inactive(_) | State::Closed | State::Empty => Err(error::not_supported()),
        }
    }

    fn do_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.state {
            State::Active(stream) => match stream.ssl_write(buf) {
                Ok(n) => Ok(n),
                Err(e) => map_ssl_io_error(e),
            },
            State::Handshaking(_) | State::ShuttingDown(_) => Err(error::would_block()),
            State::Inactive(_) | State::Closed | State::Empty => Err(error::not_supported()),
        }
    }

    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn close(&mut self) -> io::Result<()> {
        self.fd = -1;
        let result = match std::mem::replace(&mut self.state, State::Closed) {
            State::Inactive(mut e) => e.close(),
            State::Handshaking(mut mid) => mid.get_mut().slave.close(),
            State::Active(mut s) | State::ShuttingDown(mut s) => {
                let _ = s.shutdown();
                s.get_mut().slave.close()
            }
            State::Closed | State::Empty => Ok(()),
        };
        result
    }
}

impl<E: EndpointOps> Endpoint<TlsAdapter<E>> {
    pub fn new_tls(engine: crate::engine::Engine, slave: E) -> Self {
        Endpoint::new(engine, TlsAdapter::wrapping(slave))
    }

    pub fn start_client(
        &self,
        ssl: Ssl,
        timeout: Option<Duration>,
        callback: impl FnOnce(io::Result<()>) + Send + 'static,
    ) -> io::Result<()> {
        let step = self.with_inner(|a| a.begin(ssl, Vec::new(), false));
        self.continue_handshake(step, timeout, callback)
    }

    pub fn start_client_sync(&self, ssl: Ssl, timeout: Option<Duration>) -> io::Result<()> {
        if self.engine().same_context() {
            return Err(error::deadlock_avoided());
        }
        let (tx, rx) = std::sync::mpsc::channel();
        self.start_client(ssl, timeout, move |r| {
            let _ = tx.send(r);
        })?;
        rx.recv().unwrap_or_else(|_| Err(error::cancelled()))
    }

    pub fn start_server(
        &self,
        ssl: Ssl,
        timeout: Option<Duration>,
        callback: impl FnOnce(io::Result<()>) + Send + 'static,
    ) -> io::Result<()> {
        self.start_server_seeded(ssl, Vec::new(), timeout, callback)
    }

    /// Begins a server-side handshake treating `seed` as bytes already
    /// consumed from the wire before the caller handed the connection to
    /// TLS (e.g. a protocol multiplexer that peeked the `ClientHello`).
    pub fn start_server_seeded(
        &self,
        ssl: Ssl,
        seed: Vec<u8>,
        timeout: Option<Duration>,
        callback: impl FnOnce(io::Result<()>) + Send + 'static,
    ) -> io::Result<()> {
        let step = self.with_inner(|a| a.begin(ssl, seed, true));
        self.continue_handshake(step, timeout, callback)
    }

    pub fn start_server_sync(&self, ssl: Ssl, timeout: Option<Duration>) -> io::Result<()> {
        if self.engine().same_context() {
            return Err(error::deadlock_avoided());
        }
        let (tx, rx) = std::sync::mpsc::channel();
        self.start_server(ssl, timeout, move |r| {
            let _ = tx.send(r);
        })?;
        rx.recv().unwrap_or_else(|_| Err(error::cancelled()))
    }

    fn continue_handshake(
        &self,
        step: HandshakeStep,
        timeout: Option<Duration>,
        callback: impl FnOnce(io::Result<()>) + Send + 'static,
    ) -> io::Result<()> {
        match step {
            HandshakeStep::Done => {
                callback(Ok(()));
                Ok(())
            }
            HandshakeStep::Failed(e) => {
                callback(Err(e));
                Ok(())
            }
            HandshakeStep::WantRead => {
                let this = self.clone();
                self.wait_for_rx(timeout, move |ready| match ready {
                    Ok(()) => {
                        let step = this.with_inner(|a| a.resume());
                        let _ = this.continue_handshake(step, timeout, callback);
                    }
                    Err(e) => callback(Err(e)),
                })
            }
            HandshakeStep::WantWrite => {
                let this = self.clone();
                self.wait_for_tx(timeout, move |ready| match ready {
                    Ok(()) => {
                        let step = this.with_inner(|a| a.resume());
                        let _ = this.continue_handshake(step, timeout, callback);
                    }
                    Err(e) => callback(Err(e)),
                })
            }
        }
    }

    /// Begins the close_notify exchange. Unlike a plain `close`, this lets
    /// the peer see a clean shutdown rather than an abrupt reset.
    pub fn shutdown_tls(
        &self,
        timeout: Option<Duration>,
        callback: impl FnOnce(io::Result<()>) + Send + 'static,
    ) -> io::Result<()> {
        let step = self.with_inner(|a| a.begin_shutdown());
        self.continue_shutdown(step, timeout, callback)
    }

    fn continue_shutdown(
        &self,
        step: ShutdownStep,
        timeout: Option<Duration>,
        callback: impl FnOnce(io::Result<()>) + Send + 'static,
    ) -> io::Result<()> {
        match step {
            ShutdownStep::Done => {
                callback(Ok(()));
                Ok(())
            }
            ShutdownStep::Failed(e) => {
                callback(Err(e));
                Ok(())
            }
            ShutdownStep::WantRead => {
                let this = self.clone();
                self.wait_for_rx(timeout, move |ready| match ready {
                    Ok(()) => {
                        let step = this.with_inner(|a| a.resume_shutdown());
                        let _ = this.continue_shutdown(step, timeout, callback);
                    }
                    Err(e) => callback(Err(e)),
                })
            }
            ShutdownStep::WantWrite => {
                let this = self.clone();
                self.wait_for_tx(timeout, move |ready| match ready {
                    Ok(()) => {
                        let step = this.with_inner(|a| a.resume_shutdown());
                        let _ = this.continue_shutdown(step, timeout, callback);
                    }
                    Err(e) => callback(Err(e)),
                })
            }
        }
    }

    pub fn peer_certificate(&self) -> Option<openssl::x509::X509> {
        self.with_inner(|a| a.peer_certificate())
    }

    pub fn cipher_name(&self) -> Option<String> {
        self.with_inner(|a| a.cipher_name())
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.with_inner(|a| a.protocol_version())
    }

    pub fn peer_verified(&self) -> bool {
        self.with_inner(|a| a.peer_verified())
    }
}
