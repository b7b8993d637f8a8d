//! E1: ordered cancellation drains pending reads in FIFO order, and an
//! operation re-queued from inside one of those callbacks is itself
//! rejected rather than silently accepted mid-drain.

use ioreactor::fd_endpoint::FdEndpoint;
use ioreactor::{Engine, Endpoint};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn pipe() -> (i32, i32) {
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    (fds[0], fds[1])
}

#[test]
fn ordered_cancel_drains_pending_reads_in_fifo_order() {
    let engine = Engine::with_default_config().unwrap();
    engine.run(true).unwrap();

    let (read_fd, write_fd) = pipe();
    let reader = Endpoint::new(engine.clone(), FdEndpoint::open(read_fd).unwrap());
    let _writer = FdEndpoint::open(write_fd).unwrap();

    let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    let requeued_during_drain: Arc<Mutex<Option<bool>>> = Arc::new(Mutex::new(None));

    for i in 0..3usize {
        let order = order.clone();
        let reader_clone = reader.clone();
        let requeued = requeued_during_drain.clone();
        reader
            .read(1, None, move |result| {
                order.lock().unwrap().push(i);
                assert!(result.is_err(), "cancelled reads must fail");
                if i == 0 {
                    // Queued from inside a callback fired by the very drain
                    // that is cancelling this fd — must also be rejected.
                    let outcome = reader_clone.read(1, None, |_| {});
                    *requeued.lock().unwrap() = Some(outcome.is_err());
                }
            })
            .unwrap();
    }

    reader.cancel(true, false, false);
    std::thread::sleep(Duration::from_millis(50));

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    assert_eq!(*requeued_during_drain.lock().unwrap(), Some(true));

    engine.stop();
    engine.join();
}
