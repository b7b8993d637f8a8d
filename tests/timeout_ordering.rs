//! E2: two reads on two separate pipes with different timeouts and no data
//! sent fire in deadline order.

use ioreactor::fd_endpoint::FdEndpoint;
use ioreactor::{Engine, Endpoint};
use std::os::fd::FromRawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn pipe_reader(engine: &Engine) -> (Endpoint<FdEndpoint>, i32) {
    let mut fds = [0i32; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let reader = Endpoint::new(engine.clone(), FdEndpoint::open(fds[0]).unwrap());
    (reader, fds[1])
}

#[test]
fn timeouts_fire_in_deadline_order() {
    let engine = Engine::with_default_config().unwrap();
    engine.run(true).unwrap();

    let (reader_a, write_fd_a) = pipe_reader(&engine);
    let (reader_b, write_fd_b) = pipe_reader(&engine);
    // Keep the write ends alive (and unused) so the read ends never see EOF.
    let _keep_a = unsafe { std::os::fd::OwnedFd::from_raw_fd(write_fd_a) };
    let _keep_b = unsafe { std::os::fd::OwnedFd::from_raw_fd(write_fd_b) };

    let start = Instant::now();
    let fired: Arc<Mutex<Vec<(&'static str, Duration)>>> = Arc::new(Mutex::new(Vec::new()));

    let fired_a = fired.clone();
    reader_a
        .read(1, Some(Duration::from_millis(50)), move |result| {
            assert!(result.is_err());
            fired_a.lock().unwrap().push(("a", start.elapsed()));
        })
        .unwrap();

    let fired_b = fired.clone();
    reader_b
        .read(1, Some(Duration::from_millis(100)), move |result| {
            assert!(result.is_err());
            fired_b.lock().unwrap().push(("b", start.elapsed()));
        })
        .unwrap();

    std::thread::sleep(Duration::from_millis(200));

    let fired = fired.lock().unwrap();
    assert_eq!(fired.len(), 2);
    assert_eq!(fired[0].0, "a");
    assert_eq!(fired[1].0, "b");
    assert!(fired[0].1 >= Duration::from_millis(45));
    assert!(fired[1].1 >= Duration::from_millis(95));

    engine.stop();
    engine.join();
}
