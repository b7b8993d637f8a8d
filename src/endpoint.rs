//! The endpoint abstraction (C2): anything the engine can read from or
//! write to. [`EndpointOps`] is the single primitive the engine invokes —
//! `do_read`/`do_write` — everything else (queued read/write, synchronous
//! wrappers, readiness-only waits) is built once, generically, atop it in
//! [`Endpoint`].

use std::io;
use std::os::fd::RawFd;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::engine::op::{Direction, IoOutcome, Payload};
use crate::engine::Engine;
use crate::error;

/// The only two operations the engine ever calls on an endpoint. A
/// concrete endpoint performs the real syscall; an [`crate::adapter::Adapter`]
/// overrides both to transform bytes in transit (e.g. TLS).
pub trait EndpointOps: Send + 'static {
    fn do_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn do_write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn raw_fd(&self) -> RawFd;
    /// Release the underlying resource. Idempotent.
    fn close(&mut self) -> io::Result<()>;
}

/// A handle to an [`EndpointOps`] implementor registered with an [`Engine`],
/// providing the full C2 surface: fire-and-forget queued I/O, synchronous
/// wrappers built on top of it, cancellation, and readiness-only waits.
pub struct Endpoint<E: EndpointOps> {
    engine: Engine,
    inner: Arc<Mutex<E>>,
    /// Counts outstanding `Endpoint<E>` handles, independent of `inner`'s
    /// own strong count (which also gets a clone per queued operation the
    /// engine is servicing). `Drop` watches this one so a handle dropped
    /// while operations are still in flight still cancels them, instead of
    /// waiting for the engine to finish draining the queue on its own.
    handles: Arc<()>,
}

impl<E: EndpointOps> Clone for Endpoint<E> {
    fn clone(&self) -> Self {
        Endpoint {
            engine: self.engine.clone(),
            inner: Arc::clone(&self.inner),
            handles: Arc::clone(&self.handles),
        }
    }
}

/// Dropping the last handle to an endpoint cancels whatever it still has
/// queued and closes it, the same as an explicit [`Endpoint::close`] call.
/// Handles created by [`Endpoint::clone`] share one underlying endpoint, so
/// this only fires once the last of them goes out of scope.
impl<E: EndpointOps> Drop for Endpoint<E> {
    fn drop(&mut self) {
        if Arc::strong_count(&self.handles) == 1 {
            let _ = self.close();
        }
    }
}

impl<E: EndpointOps> Endpoint<E> {
    pub fn new(engine: Engine, inner: E) -> Self {
        Endpoint { engine, inner: Arc::new(Mutex::new(inner)), handles: Arc::new(()) }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn fd(&self) -> RawFd {
        self.inner.lock().unwrap().raw_fd()
    }

    pub fn is_open(&self) -> bool {
        self.fd() >= 0
    }

    /// Run `f` with exclusive access to the wrapped endpoint. Concrete
    /// endpoint types use this to expose their own extra operations
    /// (`SocketEndpoint::connect`, `TimerEndpoint::set`, ...).
    pub(crate) fn with_inner<R>(&self, f: impl FnOnce(&mut E) -> R) -> R {
        f(&mut self.inner.lock().unwrap())
    }

    pub fn cancel(&self, cancel_rx: bool, cancel_tx: bool, fast: bool) {
        self.engine.cancel(self.fd(), cancel_rx, cancel_tx, fast);
    }

    pub fn close(&self) -> io::Result<()> {
        self.cancel(true, true, true);
        self.inner.lock().unwrap().close()
    }

    /// Reclaims the wrapped endpoint, provided this is the only remaining
    /// handle to it. Used to hand a plain endpoint off to an
    /// [`crate::adapter::Adapter`] (e.g. upgrading a freshly-accepted
    /// socket to TLS): the caller drops its `Endpoint<E>` handle, takes
    /// the bare `E` back out, and wraps it in the adapter instead.
    pub fn into_inner(self) -> io::Result<E> {
        // Hold a second `handles` reference across the drop of `self` so
        // `Endpoint`'s `Drop` impl sees more than one outstanding handle and
        // leaves the endpoint alone instead of cancelling and closing it out
        // from under us.
        let inner = Arc::clone(&self.inner);
        let keep_alive = Arc::clone(&self.handles);
        drop(self);
        drop(keep_alive);
        match Arc::try_unwrap(inner) {
            Ok(mutex) => Ok(mutex.into_inner().unwrap_or_else(|e| e.into_inner())),
            Err(_) => Err(error::already_in_progress()),
        }
    }

    /// Queue an asynchronous read of up to `len` bytes.
    pub fn read(
        &self,
        len: usize,
        timeout: Option<Duration>,
        callback: impl FnOnce(io::Result<Vec<u8>>) + Send + 'static,
    ) -> io::Result<()> {
        let endpoint: Arc<Mutex<dyn EndpointOps>> = self.inner.clone();
        self.engine.queue_op(
            self.fd(),
            Direction::Rx,
            endpoint,
            Payload::Read { buf: vec![0u8; len] },
            timeout,
            Some(Box::new(move |outcome: IoOutcome| match outcome.result {
                Ok(_) => callback(Ok(outcome.data)),
                Err(e) => callback(Err(e)),
            })),
        )
    }

    /// Blocking read built on [`Endpoint::read`]. Fails with `EDEADLK` if
    /// called from the engine's own worker thread (it would never wake up
    /// to service the queued operation).
    pub fn read_sync(&self, len: usize, timeout: Option<Duration>) -> io::Result<Vec<u8>> {
        if self.engine.same_context() {
            return Err(error::deadlock_avoided());
        }
        let (tx, rx) = mpsc::channel();
        self.read(len, timeout, move |result| {
            let _ = tx.send(result);
        })?;
        rx.recv().unwrap_or_else(|_| Err(error::cancelled()))
    }

    /// Queue an asynchronous write of `data`.
    pub fn write(
        &self,
        data: Vec<u8>,
        timeout: Option<Duration>,
        callback: impl FnOnce(io::Result<usize>) + Send + 'static,
    ) -> io::Result<()> {
        let endpoint: Arc<Mutex<dyn EndpointOps>> = self.inner.clone();
        self.engine.queue_op(
            self.fd(),
            Direction::Tx,
            endpoint,
            Payload::Write { buf: data },
            timeout,
            Some(Box::new(move |outcome: IoOutcome| callback(outcome.result))),
        )
    }

    pub fn write_sync(&self, data: Vec<u8>, timeout: Option<Duration>) -> io::Result<usize> {
        if self.engine.same_context() {
            return Err(error::deadlock_avoided());
        }
        let (tx, rx) = mpsc::channel();
        self.write(data, timeout, move |result| {
            let _ = tx.send(result);
        })?;
        rx.recv().unwrap_or_else(|_| Err(error::cancelled()))
    }

    /// Queue a dummy operation: no bytes are transferred, the callback
    /// fires as soon as the descriptor is readable (or times out, or is
    /// cancelled).
    pub fn wait_for_rx(
        &self,
        timeout: Option<Duration>,
        callback: impl FnOnce(io::Result<()>) + Send + 'static,
    ) -> io::Result<()> {
        self.wait_for(Direction::Rx, timeout, callback)
    }

    pub fn wait_for_tx(
        &self,
        timeout: Option<Duration>,
        callback: impl FnOnce(io::Result<()>) + Send + 'static,
    ) -> io::Result<()> {
        self.wait_for(Direction::Tx, timeout, callback)
    }

    fn wait_for(
        &self,
        direction: Direction,
        timeout: Option<Duration>,
        callback: impl FnOnce(io::Result<()>) + Send + 'static,
    ) -> io::Result<()> {
        let endpoint: Arc<Mutex<dyn EndpointOps>> = self.inner.clone();
        self.engine.queue_op(
            self.fd(),
            direction,
            endpoint,
            Payload::Dummy,
            timeout,
            Some(Box::new(move |outcome: IoOutcome| callback(outcome.result.map(|_| ())))),
        )
    }

    pub fn wait_for_rx_sync(&self, timeout: Option<Duration>) -> io::Result<()> {
        if self.engine.same_context() {
            return Err(error::deadlock_avoided());
        }
        let (tx, rx) = mpsc::channel();
        self.wait_for_rx(timeout, move |result| {
            let _ = tx.send(result);
        })?;
        rx.recv().unwrap_or_else(|_| Err(error::cancelled()))
    }

    pub fn wait_for_tx_sync(&self, timeout: Option<Duration>) -> io::Result<()> {
        if self.engine.same_context() {
            return Err(error::deadlock_avoided());
        }
        let (tx, rx) = mpsc::channel();
        self.wait_for_tx(timeout, move |result| {
            let _ = tx.send(result);
        })?;
        rx.recv().unwrap_or_else(|_| Err(error::cancelled()))
    }
}
