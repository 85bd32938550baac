#![cfg(unix)]

use std::sync::mpsc;

use evio::net::{UnixListener, UnixServerParam, UnixStream};
use evio::{AsyncStream, StreamResultCode};

mod util;
use util::{new_loop, recv, temp_path};

#[test]
fn domain_socket_echo() {
    let io_loop = new_loop();
    let path = temp_path("uds-echo.sock");

    let (accept_tx, accept_rx) = mpsc::channel();
    let mut param = UnixServerParam::new(&path);
    param.on_accept = Some(Box::new(move |stream, peer| {
        let _ = accept_tx.send((stream, peer));
    }));
    let _listener = UnixListener::create(param, Some(&io_loop)).expect("unable to listen");

    let (connect_tx, connect_rx) = mpsc::channel();
    let client = UnixStream::open(Some(&io_loop)).expect("unable to open client");
    client.connect(
        &path,
        Box::new(move |error| {
            let _ = connect_tx.send(error);
        }),
        Some(util::WAIT),
    );
    assert!(!recv(&connect_rx, "connect"), "connect failed");

    let (accepted, peer) = recv(&accept_rx, "accept");
    // The client did not bind a path.
    assert!(peer.is_none());
    let server = UnixStream::from_std(accepted, Some(&io_loop)).expect("unable to adopt socket");

    let (read_tx, read_rx) = mpsc::channel();
    server.read_fully(
        vec![0; 5],
        Box::new(move |result| {
            let _ = read_tx.send((result.data().to_vec(), result.code));
        }),
        None,
    );
    client.write(b"local".to_vec(), Box::new(|_| {}), None);

    let (data, code) = recv(&read_rx, "server read");
    assert_eq!(code, StreamResultCode::Success);
    assert_eq!(data, b"local");

    io_loop.release();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn connect_to_missing_path_fails() {
    let io_loop = new_loop();
    let path = temp_path("uds-missing.sock");

    let (connect_tx, connect_rx) = mpsc::channel();
    let client = UnixStream::open(Some(&io_loop)).expect("unable to open client");
    client.connect(
        &path,
        Box::new(move |error| {
            let _ = connect_tx.send(error);
        }),
        None,
    );
    assert!(recv(&connect_rx, "connect failure"));

    io_loop.release();
}
