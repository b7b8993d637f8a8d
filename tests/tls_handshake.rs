//! E4: a TLS handshake seeded with bytes already read off the wire by a
//! (simulated) protocol sniffer. Peer A writes a 64-byte non-TLS prefix
//! directly on the raw socket, then upgrades the same connection to TLS;
//! peer B reads 80 bytes in one syscall, treats the last 16 as the start
//! of the real handshake, and starts a seeded server handshake from there.

#![cfg(feature = "tls")]

use ioreactor::net::SocketEndpoint;
use ioreactor::tls::TlsAdapter;
use ioreactor::{Endpoint, Engine};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::rsa::Rsa;
use openssl::ssl::{Ssl, SslContextBuilder, SslMethod, SslVerifyMode};
use openssl::x509::{X509NameBuilder, X509};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

fn self_signed() -> (PKey<openssl::pkey::Private>, X509) {
    let rsa = Rsa::generate(2048).unwrap();
    let pkey = PKey::from_rsa(rsa).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", "localhost").unwrap();
    let name = name.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&pkey).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
    builder.sign(&pkey, MessageDigest::sha256()).unwrap();
    (pkey, builder.build())
}

fn server_ssl(pkey: &PKey<openssl::pkey::Private>, cert: &X509) -> Ssl {
    let mut ctx = SslContextBuilder::new(SslMethod::tls_server()).unwrap();
    ctx.set_private_key(pkey).unwrap();
    ctx.set_certificate(cert).unwrap();
    Ssl::new(&ctx.build()).unwrap()
}

fn client_ssl() -> Ssl {
    let mut ctx = SslContextBuilder::new(SslMethod::tls_client()).unwrap();
    ctx.set_verify(SslVerifyMode::NONE);
    Ssl::new(&ctx.build()).unwrap()
}

#[test]
fn seeded_server_handshake_then_application_data() {
    let engine = Engine::with_default_config().unwrap();
    engine.run(true).unwrap();

    let mut listener_socket = SocketEndpoint::tcp(libc::AF_INET).unwrap();
    let any = ioreactor::net::SockAddr::from(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)));
    listener_socket.bind(&any).unwrap();
    listener_socket.listen(1).unwrap();
    let server_addr = listener_socket.local_addr().unwrap();
    let listener = Endpoint::new(engine.clone(), listener_socket);

    let (pkey, cert) = self_signed();
    let timeout = Some(Duration::from_secs(5));

    let server = {
        let engine = engine.clone();
        let listener = listener.clone();
        std::thread::spawn(move || {
            let conn = listener.accept_sync(timeout).unwrap();
            // A single `read` is not guaranteed to return all 80 bytes in
            // one syscall even though the peer wrote them together; loop
            // until the full prefix-plus-seed has arrived.
            let mut prefix_and_seed = Vec::new();
            while prefix_and_seed.len() < 80 {
                let chunk = conn.read_sync(80 - prefix_and_seed.len(), timeout).unwrap();
                assert!(!chunk.is_empty(), "peer closed before sending the full prefix");
                prefix_and_seed.extend(chunk);
            }
            let seed = prefix_and_seed[64..].to_vec();

            let socket = conn.into_inner().unwrap();
            let tls: Endpoint<TlsAdapter<SocketEndpoint>> = Endpoint::new_tls(engine, socket);

            let (tx, rx) = std::sync::mpsc::channel();
            tls.start_server_seeded(server_ssl(&pkey, &cert), seed, timeout, move |r| {
                let _ = tx.send(r);
            })
            .unwrap();
            rx.recv().unwrap().unwrap();

            let got = tls.read_sync(5, timeout).unwrap();
            tls.write_sync(got, timeout).unwrap();
        })
    };

    let client_socket = SocketEndpoint::tcp(libc::AF_INET).unwrap();
    let client = Endpoint::new(engine.clone(), client_socket);
    client.connect_sync(server_addr, timeout).unwrap();
    client.write_sync(vec![0u8; 64], timeout).unwrap();
    let socket = client.into_inner().unwrap();
    let tls: Endpoint<TlsAdapter<SocketEndpoint>> = Endpoint::new_tls(engine.clone(), socket);
    tls.start_client_sync(client_ssl(), timeout).unwrap();

    // The client never installed the self-signed cert in a trust store, so
    // the chain is reachable but not verified.
    assert!(!tls.peer_verified());
    assert!(tls.cipher_name().is_some());
    assert!(tls.protocol_version().unwrap().starts_with("TLS"));
    assert!(tls.peer_certificate().is_some());

    tls.write_sync(b"hello".to_vec(), timeout).unwrap();
    let reply = tls.read_sync(5, timeout).unwrap();
    assert_eq!(&reply, b"hello");

    server.join().unwrap();
    engine.stop();
    engine.join();
}
