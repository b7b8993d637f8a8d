//! E3: a loopback echo server/client round trip, driven entirely through
//! the synchronous wrappers since this test has no need for callback-level
//! control.

use ioreactor::net::{SockAddr, SocketEndpoint};
use ioreactor::Engine;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

#[test]
fn echo_client_server_round_trip() {
    let engine = Engine::with_default_config().unwrap();
    engine.run(true).unwrap();

    let mut listener = SocketEndpoint::tcp(libc::AF_INET).unwrap();
    let any = SockAddr::from(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)));
    listener.bind(&any).unwrap();
    listener.listen(16).unwrap();
    let listen_addr = listener.local_addr().unwrap();
    let listener = ioreactor::Endpoint::new(engine.clone(), listener);

    let server_done = {
        let listener = listener.clone();
        std::thread::spawn(move || {
            let client = listener.accept_sync(Some(Duration::from_secs(2))).unwrap();
            let got = client.read_sync(4, Some(Duration::from_secs(2))).unwrap();
            client.write_sync(got, Some(Duration::from_secs(2))).unwrap();
        })
    };

    let client_socket = SocketEndpoint::tcp(libc::AF_INET).unwrap();
    let client = ioreactor::Endpoint::new(engine.clone(), client_socket);
    client.connect_sync(listen_addr, Some(Duration::from_secs(2))).unwrap();
    client.write_sync(b"ping".to_vec(), Some(Duration::from_secs(2))).unwrap();
    let echoed = client.read_sync(4, Some(Duration::from_secs(2))).unwrap();
    assert_eq!(&echoed, b"ping");

    server_done.join().unwrap();
    client.close().unwrap();
    listener.close().unwrap();

    engine.stop();
    engine.join();
}
