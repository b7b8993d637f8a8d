//! E6: connecting to a closed local port fails fast with connection-refused,
//! well inside the caller's timeout.

use ioreactor::net::{SockAddr, SocketEndpoint};
use ioreactor::Engine;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

/// Binds an ephemeral port and immediately drops the listener, leaving the
/// port in a state where the kernel answers new connections with RST.
fn closed_local_port() -> SockAddr {
    let mut probe = SocketEndpoint::tcp(libc::AF_INET).unwrap();
    let any = SockAddr::from(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)));
    probe.bind(&any).unwrap();
    probe.local_addr().unwrap()
}

#[test]
fn connect_to_closed_port_fails_within_timeout() {
    let engine = Engine::with_default_config().unwrap();
    engine.run(true).unwrap();

    let addr = closed_local_port();

    let socket = SocketEndpoint::tcp(libc::AF_INET).unwrap();
    let conn = ioreactor::Endpoint::new(engine.clone(), socket);

    let start = Instant::now();
    let result = conn.connect_sync(addr, Some(Duration::from_millis(500)));
    let elapsed = start.elapsed();

    let err = result.expect_err("connect to a closed port must fail");
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionRefused);
    assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}, should fail fast on RST");

    engine.stop();
    engine.join();
}
