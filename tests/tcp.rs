use std::sync::mpsc;
use std::time::{Duration, Instant};

use evio::{AsyncStream, StreamResultCode};

mod util;
use util::{new_loop, recv, tcp_pair};

#[test]
fn echo_round_trip() {
    let io_loop = new_loop();
    let (client, server, _listener) = tcp_pair(&io_loop);

    let (read_tx, read_rx) = mpsc::channel();
    server.read_fully(
        vec![0; 4],
        Box::new(move |result| {
            let _ = read_tx.send((result.data().to_vec(), result.code));
        }),
        None,
    );

    let (write_tx, write_rx) = mpsc::channel();
    client.write(
        b"ping".to_vec(),
        Box::new(move |result| {
            let _ = write_tx.send(result.code);
        }),
        None,
    );
    assert_eq!(recv(&write_rx, "client write"), StreamResultCode::Success);

    let (data, code) = recv(&read_rx, "server read");
    assert_eq!(code, StreamResultCode::Success);
    assert_eq!(data, b"ping");

    let (pong_tx, pong_rx) = mpsc::channel();
    client.read_fully(
        vec![0; 4],
        Box::new(move |result| {
            let _ = pong_tx.send((result.data().to_vec(), result.code));
        }),
        None,
    );
    server.write(b"pong".to_vec(), Box::new(|_| {}), None);

    let (data, code) = recv(&pong_rx, "client read");
    assert_eq!(code, StreamResultCode::Success);
    assert_eq!(data, b"pong");

    io_loop.release();
}

#[test]
fn graceful_eof_delivers_partial_bytes() {
    let io_loop = new_loop();
    let (client, server, _listener) = tcp_pair(&io_loop);

    let (write_tx, write_rx) = mpsc::channel();
    server.write(
        b"abc".to_vec(),
        Box::new(move |result| {
            let _ = write_tx.send(result.code);
        }),
        None,
    );
    assert_eq!(recv(&write_rx, "server write"), StreamResultCode::Success);
    server.close();

    let (read_tx, read_rx) = mpsc::channel();
    client.read_fully(
        vec![0; 10],
        Box::new(move |result| {
            let _ = read_tx.send((result.data().to_vec(), result.size, result.code));
        }),
        None,
    );

    let (data, size, code) = recv(&read_rx, "client read");
    assert_eq!(code, StreamResultCode::Ended);
    assert_eq!(size, 3);
    assert_eq!(data, b"abc");

    io_loop.release();
}

#[test]
fn read_timeout_fires_on_idle_connection() {
    let io_loop = new_loop();
    let (client, _server, _listener) = tcp_pair(&io_loop);

    let (read_tx, read_rx) = mpsc::channel();
    let started = Instant::now();
    client.read_fully(
        vec![0; 1],
        Box::new(move |result| {
            let _ = read_tx.send((result.size, result.code));
        }),
        Some(Duration::from_millis(20)),
    );

    let (size, code) = recv(&read_rx, "timeout");
    let elapsed = started.elapsed();
    assert_eq!(code, StreamResultCode::Timeout);
    assert_eq!(size, 0);
    assert!(elapsed >= Duration::from_millis(15), "fired after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(500), "fired after {:?}", elapsed);

    io_loop.release();
}

#[test]
fn completion_beats_generous_timeout() {
    let io_loop = new_loop();
    let (client, server, _listener) = tcp_pair(&io_loop);

    let (read_tx, read_rx) = mpsc::channel();
    client.read_fully(
        vec![0; 5],
        Box::new(move |result| {
            let _ = read_tx.send((result.data().to_vec(), result.code));
        }),
        Some(Duration::from_secs(30)),
    );
    server.write(b"hello".to_vec(), Box::new(|_| {}), None);

    let (data, code) = recv(&read_rx, "read");
    assert_eq!(code, StreamResultCode::Success);
    assert_eq!(data, b"hello");

    io_loop.release();
}

#[test]
fn close_resolves_pending_request_exactly_once() {
    let io_loop = new_loop();
    let (client, _server, _listener) = tcp_pair(&io_loop);

    let (read_tx, read_rx) = mpsc::channel();
    client.read(
        vec![0; 16],
        Box::new(move |result| {
            let _ = read_tx.send(result.code);
        }),
        None,
    );

    client.close();
    assert_eq!(recv(&read_rx, "close delivery"), StreamResultCode::Closed);

    // No second callback may arrive.
    assert!(read_rx
        .recv_timeout(Duration::from_millis(200))
        .is_err());

    io_loop.release();
}

#[test]
fn sequential_reads_preserve_byte_order() {
    let io_loop = new_loop();
    let (client, server, _listener) = tcp_pair(&io_loop);

    for chunk in [&b"first-"[..], &b"second-"[..], &b"third"[..]] {
        server.write_from_slice(chunk, Box::new(|_| {}), None);
    }

    let total = b"first-second-third".len();
    let (read_tx, read_rx) = mpsc::channel();
    client.read_fully(
        vec![0; total],
        Box::new(move |result| {
            let _ = read_tx.send((result.data().to_vec(), result.code));
        }),
        None,
    );

    let (data, code) = recv(&read_rx, "ordered read");
    assert_eq!(code, StreamResultCode::Success);
    assert_eq!(data, b"first-second-third");

    io_loop.release();
}

#[test]
fn second_read_on_occupied_slot_is_refused() {
    let io_loop = new_loop();
    let (client, _server, _listener) = tcp_pair(&io_loop);

    // Park the loop in a long task so the first request stays in its slot.
    let (hold_tx, hold_rx) = mpsc::channel::<()>();
    io_loop.add_task(Box::new(move || {
        let _ = hold_rx.recv_timeout(Duration::from_secs(2));
    }));

    let (first_tx, _first_rx) = mpsc::channel();
    client.read(
        vec![0; 4],
        Box::new(move |result| {
            let _ = first_tx.send(result.code);
        }),
        None,
    );

    let (second_tx, second_rx) = mpsc::channel();
    client.read(
        vec![0; 4],
        Box::new(move |result| {
            let _ = second_tx.send(result.code);
        }),
        None,
    );
    assert_eq!(recv(&second_rx, "refusal"), StreamResultCode::Unknown);

    let _ = hold_tx.send(());
    io_loop.release();
}

#[test]
fn write_from_slice_copies_caller_data() {
    let io_loop = new_loop();
    let (client, server, _listener) = tcp_pair(&io_loop);

    let mut scratch = b"mutable".to_vec();
    let (write_tx, write_rx) = mpsc::channel();
    client.write_from_slice(
        &scratch,
        Box::new(move |result| {
            let _ = write_tx.send(result.code);
        }),
        None,
    );
    // The source buffer may be reused immediately.
    scratch.fill(b'!');
    assert_eq!(recv(&write_rx, "write"), StreamResultCode::Success);

    let (read_tx, read_rx) = mpsc::channel();
    server.read_fully(
        vec![0; 7],
        Box::new(move |result| {
            let _ = read_tx.send(result.data().to_vec());
        }),
        None,
    );
    assert_eq!(recv(&read_rx, "read"), b"mutable");

    io_loop.release();
}
