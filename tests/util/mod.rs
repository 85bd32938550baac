// Not all helpers are used by every test file.
#![allow(dead_code)]

use std::sync::mpsc;
use std::sync::{Arc, Once};
use std::time::Duration;

use evio::net::{TcpListener, TcpServerParam, TcpStream};
use evio::IoLoop;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

pub fn new_loop() -> Arc<IoLoop> {
    init();
    IoLoop::create(true).expect("unable to create IoLoop")
}

pub const WAIT: Duration = Duration::from_secs(5);

pub fn recv<T>(rx: &mpsc::Receiver<T>, what: &str) -> T {
    rx.recv_timeout(WAIT)
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what))
}

/// Connected loopback pair: `(client, server_side, listener)`.
///
/// The listener is returned so it stays alive for the test's duration.
pub fn tcp_pair(
    io_loop: &Arc<IoLoop>,
) -> (Arc<TcpStream>, Arc<TcpStream>, Arc<TcpListener>) {
    let (accept_tx, accept_rx) = mpsc::channel();
    let mut param = TcpServerParam::new("127.0.0.1:0".parse().unwrap());
    param.on_accept = Some(Box::new(move |stream, _addr| {
        let _ = accept_tx.send(stream);
    }));
    let listener = TcpListener::create(param, Some(io_loop)).expect("unable to listen");
    let addr = listener.local_addr().expect("no listener address");

    let (connect_tx, connect_rx) = mpsc::channel();
    let client = TcpStream::connect_to(
        addr,
        Some(io_loop),
        Box::new(move |error| {
            let _ = connect_tx.send(error);
        }),
        Some(WAIT),
    )
    .expect("unable to open client socket");

    assert!(!recv(&connect_rx, "connect"), "connect failed");
    let accepted = recv(&accept_rx, "accept");
    let server = TcpStream::from_std(accepted, Some(io_loop)).expect("unable to adopt socket");

    (client, server, listener)
}

/// Unique path in the system temp directory.
pub fn temp_path(name: &str) -> std::path::PathBuf {
    use std::sync::atomic::{AtomicUsize, Ordering};

    static SEQ: AtomicUsize = AtomicUsize::new(0);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "evio-test-{}-{}-{}",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed),
        name,
    ));
    path
}
