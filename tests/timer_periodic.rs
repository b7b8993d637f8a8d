//! E5: a periodic timer fires a handful of times before being cancelled,
//! and nothing fires after the cancel call returns.

use ioreactor::timer::TimerEndpoint;
use ioreactor::Engine;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn periodic_timer_cancels_cleanly() {
    let engine = Engine::with_default_config().unwrap();
    engine.run(true).unwrap();

    let timer = ioreactor::Endpoint::<TimerEndpoint>::new_on(engine.clone()).unwrap();
    let count = Arc::new(AtomicUsize::new(0));

    let count_cb = count.clone();
    timer.set(Duration::from_millis(10), Duration::from_millis(10), move || {
        count_cb.fetch_add(1, Ordering::SeqCst);
    }).unwrap();

    std::thread::sleep(Duration::from_millis(55));
    timer.cancel_timer();
    let after_cancel = count.load(Ordering::SeqCst);

    std::thread::sleep(Duration::from_millis(50));
    let settled = count.load(Ordering::SeqCst);

    assert!((4..=6).contains(&after_cancel), "expected 4-6 callbacks by cancel time, got {after_cancel}");
    assert_eq!(settled, after_cancel, "no callbacks should fire after cancel returns");

    engine.stop();
    engine.join();
}
