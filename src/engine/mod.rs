//! The reactor (C3) — the center of the design. A single event loop waits
//! on `epoll` readiness, drains cancellations, dispatches ready descriptors
//! against their per-direction FIFO queues, and fires expired timeouts, in
//! that fixed order every iteration.

pub(crate) mod op;
mod timeout;

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error;
use crate::sys::selector::{Events, Interest, Selector};
use crate::util::{Handle, Slab};

use op::{Callback, Direction, IoOutcome, Payload, PendingOp};
use timeout::TimeoutQueue;

/// Tunables for an [`Engine`]. The control signal defaults to a real-time
/// signal not otherwise claimed by the process; override it if the
/// embedding application already uses `SIGRTMIN+4` for something else.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub control_signal: libc::c_int,
    pub events_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig { control_signal: unsafe { libc::SIGRTMIN() } + 4, events_capacity: 128 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct State {
    ops: Slab<PendingOp>,
    rx_queues: HashMap<RawFd, VecDeque<Handle>>,
    tx_queues: HashMap<RawFd, VecDeque<Handle>>,
    rx_cancelling: HashSet<RawFd>,
    tx_cancelling: HashSet<RawFd>,
    registered_interest: HashMap<RawFd, Interest>,
    timeouts: TimeoutQueue,
    lifecycle: Lifecycle,
}

impl State {
    fn new() -> Self {
        State {
            ops: Slab::new(),
            rx_queues: HashMap::new(),
            tx_queues: HashMap::new(),
            rx_cancelling: HashSet::new(),
            tx_cancelling: HashSet::new(),
            registered_interest: HashMap::new(),
            timeouts: TimeoutQueue::new(),
            lifecycle: Lifecycle::Stopped,
        }
    }
}

struct Shared {
    selector: Selector,
    signal_guard: crate::sys::signal::SignalGuard,
    state: Mutex<State>,
    quit: AtomicBool,
    worker_tid: AtomicI32,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
    config: EngineConfig,
}

/// A single-threaded reactor shared by clone: every `Endpoint` created
/// against it holds its own `Engine` handle, and all of them drive the same
/// underlying loop.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> io::Result<Engine> {
        let selector = Selector::new()?;
        let signal_guard = crate::sys::signal::SignalGuard::install(config.control_signal)?;
        Ok(Engine {
            shared: Arc::new(Shared {
                selector,
                signal_guard,
                state: Mutex::new(State::new()),
                quit: AtomicBool::new(false),
                worker_tid: AtomicI32::new(0),
                worker_handle: Mutex::new(None),
                config,
            }),
        })
    }

    pub fn with_default_config() -> io::Result<Engine> {
        Self::new(EngineConfig::default())
    }

    /// Start the loop. If `spawn_worker` is true, it runs on a new thread
    /// and this call returns once that thread is alive; otherwise it runs
    /// on the calling thread and this call blocks until [`Engine::stop`].
    pub fn run(&self, spawn_worker: bool) -> io::Result<()> {
        {
            let mut st = self.shared.state.lock().unwrap();
            if st.lifecycle != Lifecycle::Stopped {
                return Err(error::already_in_progress());
            }
            st.lifecycle = Lifecycle::Starting;
        }
        self.shared.quit.store(false, Ordering::SeqCst);

        if spawn_worker {
            let engine = self.clone();
            let (ready_tx, ready_rx) = std::sync::mpsc::channel();
            let handle = std::thread::Builder::new().name("ioreactor".to_string()).spawn(
                move || {
                    engine.shared.worker_tid.store(crate::sys::signal::gettid(), Ordering::SeqCst);
                    let _ = ready_tx.send(());
                    engine.run_loop();
                },
            )?;
            ready_rx.recv().ok();
            *self.shared.worker_handle.lock().unwrap() = Some(handle);
            Ok(())
        } else {
            self.shared.worker_tid.store(crate::sys::signal::gettid(), Ordering::SeqCst);
            self.run_loop();
            Ok(())
        }
    }

    /// Request a shutdown. Idempotent; all pending operations are cancelled
    /// with `ECANCELED` before the loop exits.
    pub fn stop(&self) {
        self.shared.quit.store(true, Ordering::SeqCst);
        if !self.same_context() {
            let tid = self.shared.worker_tid.load(Ordering::SeqCst);
            if tid != 0 {
                let _ = crate::sys::signal::interrupt(tid, self.shared.config.control_signal);
            }
        }
    }

    /// Block until a worker thread started by `run(true)` has exited.
    /// Calling this from within the worker thread itself would deadlock;
    /// callers are expected not to do that, matching the source's own
    /// documented caveat.
    pub fn join(&self) {
        let handle = self.shared.worker_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// True if called from the thread currently running this engine's loop.
    pub fn same_context(&self) -> bool {
        let tid = self.shared.worker_tid.load(Ordering::SeqCst);
        tid != 0 && tid == crate::sys::signal::gettid()
    }

    pub fn cancel(&self, fd: RawFd, cancel_rx: bool, cancel_tx: bool, fast: bool) {
        let mut st = self.shared.state.lock().unwrap();
        if fast {
            if cancel_rx {
                if let Some(q) = st.rx_queues.remove(&fd) {
                    Self::purge(&mut st, q);
                }
            }
            if cancel_tx {
                if let Some(q) = st.tx_queues.remove(&fd) {
                    Self::purge(&mut st, q);
                }
            }
            let _ = self.apply_interest(&mut st, fd);
            return;
        }

        if cancel_rx {
            st.rx_cancelling.insert(fd);
        }
        if cancel_tx {
            st.tx_cancelling.insert(fd);
        }
        let stopped = st.lifecycle == Lifecycle::Stopped;
        drop(st);
        if stopped {
            self.drain_cancelled();
        } else {
            self.wake();
        }
    }

    fn purge(st: &mut State, queue: VecDeque<Handle>) {
        for h in queue {
            if let Some(op) = st.ops.remove(h) {
                if let Some((d, s)) = op.timeout_key() {
                    st.timeouts.remove(d, s);
                }
            }
        }
    }

    pub(crate) fn queue_op(
        &self,
        fd: RawFd,
        direction: Direction,
        endpoint: Arc<Mutex<dyn crate::endpoint::EndpointOps>>,
        payload: Payload,
        timeout: Option<Duration>,
        callback: Option<Callback>,
    ) -> io::Result<()> {
        if fd < 0 {
            return Err(error::bad_descriptor());
        }
        if crate::sys::fd::is_regular_file(fd) {
            return Err(error::not_supported());
        }

        let mut st = self.shared.state.lock().unwrap();
        let cancelling = match direction {
            Direction::Rx => st.rx_cancelling.contains(&fd),
            Direction::Tx => st.tx_cancelling.contains(&fd),
        };
        if cancelling {
            return Err(error::cancelled());
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let was_earliest = st.timeouts.earliest_deadline();
        let seq = st.timeouts.next_seq();

        let handle = st.ops.insert(PendingOp {
            fd,
            direction,
            endpoint,
            payload,
            callback,
            deadline,
            timeout_seq: seq,
            cancelling: false,
        });

        match direction {
            Direction::Rx => st.rx_queues.entry(fd).or_default().push_back(handle),
            Direction::Tx => st.tx_queues.entry(fd).or_default().push_back(handle),
        }
        if let Some(d) = deadline {
            st.timeouts.insert(d, seq, handle);
        }

        self.apply_interest(&mut st, fd)?;

        let became_earliest =
            deadline.is_some_and(|d| match was_earliest { Some(w) => d < w, None => true });
        drop(st);
        if became_earliest {
            self.wake();
        }
        Ok(())
    }

    fn wake(&self) {
        if !self.same_context() {
            let tid = self.shared.worker_tid.load(Ordering::SeqCst);
            if tid != 0 {
                let _ = crate::sys::signal::interrupt(tid, self.shared.config.control_signal);
            }
        }
    }

    fn apply_interest(&self, st: &mut State, fd: RawFd) -> io::Result<()> {
        let readable = st.rx_queues.get(&fd).is_some_and(|q| !q.is_empty());
        let writable = st.tx_queues.get(&fd).is_some_and(|q| !q.is_empty());
        let desired = Interest { readable, writable };
        let previous = st.registered_interest.get(&fd).copied();

        match (previous, desired.is_empty()) {
            (None, true) => Ok(()),
            (None, false) => {
                self.shared.selector.add(fd, desired)?;
                st.registered_interest.insert(fd, desired);
                Ok(())
            }
            (Some(_), true) => {
                self.shared.selector.delete(fd)?;
                st.registered_interest.remove(&fd);
                st.rx_queues.remove(&fd);
                st.tx_queues.remove(&fd);
                Ok(())
            }
            (Some(prev), false) if prev != desired => {
                self.shared.selector.modify(fd, desired)?;
                st.registered_interest.insert(fd, desired);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn drain_cancelled(&self) {
        loop {
            let (rx_fds, tx_fds): (Vec<RawFd>, Vec<RawFd>) = {
                let st = self.shared.state.lock().unwrap();
                if st.rx_cancelling.is_empty() && st.tx_cancelling.is_empty() {
                    return;
                }
                (st.rx_cancelling.iter().copied().collect(), st.tx_cancelling.iter().copied().collect())
            };
            for fd in rx_fds {
                self.drain_direction(fd, Direction::Rx);
            }
            for fd in tx_fds {
                self.drain_direction(fd, Direction::Tx);
            }
        }
    }

    /// The cancelling marker for `(fd, direction)` stays set until *after*
    /// the drained callbacks have run, so that an operation re-queued on
    /// the same descriptor/direction from inside one of those callbacks is
    /// itself rejected with `cancelled()` rather than silently accepted
    /// mid-drain.
    fn drain_direction(&self, fd: RawFd, direction: Direction) {
        let fired: Vec<Callback> = {
            let mut st = self.shared.state.lock().unwrap();
            let queue = match direction {
                Direction::Rx => st.rx_queues.remove(&fd),
                Direction::Tx => st.tx_queues.remove(&fd),
            };
            let mut out = Vec::new();
            if let Some(q) = queue {
                for h in q {
                    if let Some(mut op) = st.ops.remove(h) {
                        if let Some((d, s)) = op.timeout_key() {
                            st.timeouts.remove(d, s);
                        }
                        if let Some(cb) = op.callback.take() {
                            out.push(cb);
                        }
                    }
                }
            }
            let _ = self.apply_interest(&mut st, fd);
            out
        };
        for cb in fired {
            cb(IoOutcome { result: Err(error::cancelled()), data: Vec::new() });
        }
        let mut st = self.shared.state.lock().unwrap();
        match direction {
            Direction::Rx => {
                st.rx_cancelling.remove(&fd);
            }
            Direction::Tx => {
                st.tx_cancelling.remove(&fd);
            }
        }
    }

    fn dispatch_events(&self, events: &Events) {
        let ready: Vec<_> = events.iter().collect();
        for ev in ready {
            if ev.error || ev.hup {
                self.handle_ready(ev.fd, Direction::Rx);
                self.handle_ready(ev.fd, Direction::Tx);
                continue;
            }
            if ev.readable {
                self.handle_ready(ev.fd, Direction::Rx);
            }
            if ev.writable {
                self.handle_ready(ev.fd, Direction::Tx);
            }
        }
    }

    /// Services queued operations on `(fd, direction)` one at a time,
    /// continuing to the next queued operation as long as the previous one
    /// completed (not `EAGAIN`) and succeeded — a single level-triggered
    /// readiness notification can satisfy several queued reads/writes in a
    /// row, the way a drained socket buffer lets several small reads
    /// succeed back to back. A real I/O error stops the drain after its own
    /// callback fires; the next readiness event (or timeout) handles what's
    /// left.
    fn handle_ready(&self, fd: RawFd, direction: Direction) {
        loop {
            let mut fired: Option<(Callback, IoOutcome)> = None;
            let mut keep_draining = false;
            {
                let mut st = self.shared.state.lock().unwrap();
                let handle = {
                    let queue = match direction {
                        Direction::Rx => st.rx_queues.get(&fd),
                        Direction::Tx => st.tx_queues.get(&fd),
                    };
                    match queue.and_then(|q| q.front().copied()) {
                        Some(h) => h,
                        None => return,
                    }
                };
                match st.ops.get(handle) {
                    Some(op) if !op.cancelling => {}
                    _ => return,
                }

                let endpoint = st.ops.get(handle).unwrap().endpoint.clone();
                let io_result: io::Result<usize> = {
                    let mut ep = endpoint.lock().unwrap();
                    let op = st.ops.get_mut(handle).unwrap();
                    match &mut op.payload {
                        Payload::Read { buf } => ep.do_read(buf),
                        Payload::Write { buf } => ep.do_write(buf),
                        Payload::Dummy => Ok(0),
                    }
                };

                if let Err(e) = &io_result {
                    if error::is_would_block(e) {
                        return;
                    }
                }

                match direction {
                    Direction::Rx => {
                        st.rx_queues.get_mut(&fd).map(|q| q.pop_front());
                    }
                    Direction::Tx => {
                        st.tx_queues.get_mut(&fd).map(|q| q.pop_front());
                    }
                }
                let mut op = st.ops.remove(handle).expect("op removed exactly once");
                if let Some((d, s)) = op.timeout_key() {
                    st.timeouts.remove(d, s);
                }

                let data = match (&io_result, &op.payload) {
                    (Ok(n), Payload::Read { buf }) => buf[..*n].to_vec(),
                    _ => Vec::new(),
                };

                let _ = self.apply_interest(&mut st, fd);

                if io_result.is_ok() {
                    keep_draining = match direction {
                        Direction::Rx => st.rx_queues.get(&fd).is_some_and(|q| !q.is_empty()),
                        Direction::Tx => st.tx_queues.get(&fd).is_some_and(|q| !q.is_empty()),
                    };
                }

                if let Some(cb) = op.callback.take() {
                    fired = Some((cb, IoOutcome { result: io_result, data }));
                }
            }
            if let Some((cb, outcome)) = fired {
                cb(outcome);
            }
            if !keep_draining {
                return;
            }
        }
    }

    fn handle_timeouts(&self) {
        let mut fired: Vec<(Callback, IoOutcome)> = Vec::new();
        {
            let mut st = self.shared.state.lock().unwrap();
            let now = Instant::now();
            let expired = st.timeouts.drain_expired(now);
            for handle in expired {
                if let Some(mut op) = st.ops.remove(handle) {
                    let fd = op.fd;
                    match op.direction {
                        Direction::Rx => {
                            if let Some(q) = st.rx_queues.get_mut(&fd) {
                                q.retain(|h| *h != handle);
                            }
                        }
                        Direction::Tx => {
                            if let Some(q) = st.tx_queues.get_mut(&fd) {
                                q.retain(|h| *h != handle);
                            }
                        }
                    }
                    let _ = self.apply_interest(&mut st, fd);
                    if let Some(cb) = op.callback.take() {
                        fired.push((cb, IoOutcome { result: Err(error::timed_out()), data: Vec::new() }));
                    }
                }
            }
        }
        for (cb, outcome) in fired {
            cb(outcome);
        }
    }

    fn run_loop(&self) {
        {
            let mut st = self.shared.state.lock().unwrap();
            st.lifecycle = Lifecycle::Running;
        }

        let wait_mask =
            match crate::sys::signal::block_and_make_wait_mask(self.shared.config.control_signal) {
                Ok(mask) => mask,
                Err(_e) => {
                    #[cfg(feature = "log")]
                    log::error!("failed to configure control signal mask: {_e}");
                    let mut st = self.shared.state.lock().unwrap();
                    st.lifecycle = Lifecycle::Stopped;
                    return;
                }
            };

        let mut events = Events::with_capacity(self.shared.config.events_capacity);
        while !self.shared.quit.load(Ordering::SeqCst) {
            let timeout = {
                let st = self.shared.state.lock().unwrap();
                st.timeouts.earliest_deadline().map(|d| d.saturating_duration_since(Instant::now()))
            };
            if let Err(_e) = self.shared.selector.wait(&mut events, timeout, Some(&wait_mask)) {
                #[cfg(feature = "log")]
                log::warn!("epoll_pwait failed: {_e}");
                continue;
            }
            self.drain_cancelled();
            self.dispatch_events(&events);
            self.handle_timeouts();
        }

        {
            let mut st = self.shared.state.lock().unwrap();
            st.lifecycle = Lifecycle::Stopping;
        }
        let fds: Vec<RawFd> = {
            let st = self.shared.state.lock().unwrap();
            let mut set: HashSet<RawFd> = st.rx_queues.keys().copied().collect();
            set.extend(st.tx_queues.keys().copied());
            set.into_iter().collect()
        };
        for fd in fds {
            self.cancel(fd, true, true, false);
        }
        self.drain_cancelled();

        let mut st = self.shared.state.lock().unwrap();
        st.lifecycle = Lifecycle::Stopped;
        drop(st);
        self.shared.worker_tid.store(0, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("control_signal", &self.shared.config.control_signal).finish()
    }
}
