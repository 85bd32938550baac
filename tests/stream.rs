use std::sync::mpsc;

use evio::{AsyncStream, StreamResultCode};

mod util;
use util::{new_loop, recv, tcp_pair};

#[test]
fn empty_read_fails_synchronously() {
    let io_loop = new_loop();
    let (client, _server, _listener) = tcp_pair(&io_loop);

    let (tx, rx) = mpsc::channel();
    client.read(
        Vec::new(),
        Box::new(move |result| {
            let _ = tx.send((result.code, result.request_size));
        }),
        None,
    );
    let (code, request_size) = recv(&rx, "sync failure");
    assert_eq!(code, StreamResultCode::Unknown);
    assert_eq!(request_size, 0);

    io_loop.release();
}

#[test]
fn read_new_allocates_and_truncates() {
    let io_loop = new_loop();
    let (client, server, _listener) = tcp_pair(&io_loop);

    let (tx, rx) = mpsc::channel();
    client.read_new(
        32,
        Box::new(move |buf| {
            let _ = tx.send(buf);
        }),
        None,
    );
    server.write(b"short".to_vec(), Box::new(|_| {}), None);
    server.close();

    let buf = recv(&rx, "read_new").expect("read_new failed");
    assert_eq!(buf, b"short");

    io_loop.release();
}

#[test]
fn read_new_segmented_chains_chunks() {
    let io_loop = new_loop();
    let (client, server, _listener) = tcp_pair(&io_loop);

    server.write(b"abcdefghij".to_vec(), Box::new(|_| {}), None);

    let (tx, rx) = mpsc::channel();
    client.read_new_segmented(
        10,
        4,
        Box::new(move |chunks| {
            let _ = tx.send(chunks);
        }),
        None,
    );

    let chunks = recv(&rx, "segmented read").expect("segmented read failed");
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].len(), 4);
    let joined: Vec<u8> = chunks.concat();
    assert_eq!(joined, b"abcdefghij");

    io_loop.release();
}

#[test]
fn last_result_code_tracks_terminal_codes() {
    let io_loop = new_loop();
    let (client, server, _listener) = tcp_pair(&io_loop);

    let (tx, rx) = mpsc::channel();
    client.read_fully(
        vec![0; 3],
        Box::new(move |result| {
            let _ = tx.send(result.code);
        }),
        None,
    );
    server.write(b"abc".to_vec(), Box::new(|_| {}), None);
    assert_eq!(recv(&rx, "read"), StreamResultCode::Success);
    assert_eq!(client.last_result_code(), StreamResultCode::Success);

    io_loop.release();
}
