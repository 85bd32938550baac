use std::sync::mpsc;
use std::sync::Arc;

use evio::http::{ContentReader, HeaderReader};
use evio::{AsyncStream, StreamResultCode};

mod util;
use util::{new_loop, recv, tcp_pair};

#[test]
fn header_reader_reports_first_boundary() {
    let mut reader = HeaderReader::new();
    let input = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
    let pos = reader.add(input).expect("boundary not found");
    assert_eq!(&input[pos..], b"hello");
    assert_eq!(reader.merge_header().len(), pos);
}

#[test]
fn header_reader_survives_any_split() {
    let input = b"A: 1\r\nB: 2\r\n\r\nbody".to_vec();
    let boundary = 14;
    for split in 1..input.len() - 1 {
        let mut reader = HeaderReader::new();
        let mut found = None;
        if let Some(pos) = reader.add(&input[..split]) {
            found = Some(pos);
        } else if let Some(pos) = reader.add(&input[split..]) {
            found = Some(split + pos);
        }
        assert_eq!(found, Some(boundary), "split at {}", split);
    }
}

#[test]
fn chunked_body_decodes_over_tcp() {
    let io_loop = new_loop();
    let (client, server, _listener) = tcp_pair(&io_loop);

    let (complete_tx, complete_rx) = mpsc::channel();
    let source: Arc<dyn AsyncStream> = client;
    let reader = ContentReader::chunked(
        Some(source),
        Box::new(move |remainder, error| {
            let _ = complete_tx.send((remainder.to_vec(), error));
        }),
        1024,
        false,
    );

    let (body_tx, body_rx) = mpsc::channel();
    reader.read_fully(
        vec![0; 9],
        Box::new(move |result| {
            let _ = body_tx.send((result.data().to_vec(), result.code));
        }),
        None,
    );

    server.write_from_slice(b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n", Box::new(|_| {}), None);

    let (body, code) = recv(&body_rx, "decoded body");
    assert_eq!(body, b"Wikipedia");
    assert_eq!(code, StreamResultCode::Ended);

    let (remainder, error) = recv(&complete_rx, "completion");
    assert!(!error);
    assert!(remainder.is_empty());

    io_loop.release();
}

#[test]
fn chunked_remainder_belongs_to_next_message() {
    let io_loop = new_loop();
    let (client, server, _listener) = tcp_pair(&io_loop);

    let (complete_tx, complete_rx) = mpsc::channel();
    let source: Arc<dyn AsyncStream> = client;
    let reader = ContentReader::chunked(
        Some(source),
        Box::new(move |remainder, error| {
            let _ = complete_tx.send((remainder.to_vec(), error));
        }),
        1024,
        false,
    );

    let (body_tx, body_rx) = mpsc::channel();
    reader.read_fully(
        vec![0; 10],
        Box::new(move |result| {
            let _ = body_tx.send(result.data().to_vec());
        }),
        None,
    );

    server.write_from_slice(b"a\r\n0123456789\r\n0\r\n\r\nEXTRA", Box::new(|_| {}), None);

    assert_eq!(recv(&body_rx, "decoded body"), b"0123456789");
    let (remainder, error) = recv(&complete_rx, "completion");
    assert!(!error);
    assert_eq!(remainder, b"EXTRA");

    io_loop.release();
}

#[test]
fn persistent_body_counts_to_content_length() {
    let io_loop = new_loop();
    let (client, server, _listener) = tcp_pair(&io_loop);

    let (complete_tx, complete_rx) = mpsc::channel();
    let source: Arc<dyn AsyncStream> = client;
    let reader = ContentReader::persistent(
        Some(source),
        Box::new(move |remainder, error| {
            let _ = complete_tx.send((remainder.to_vec(), error));
        }),
        5,
        1024,
        false,
    );

    let (body_tx, body_rx) = mpsc::channel();
    reader.read_fully(
        vec![0; 5],
        Box::new(move |result| {
            let _ = body_tx.send((result.data().to_vec(), result.code));
        }),
        None,
    );

    // Body plus the first bytes of a pipelined follow-up message.
    server.write_from_slice(b"helloNEXT", Box::new(|_| {}), None);

    let (body, code) = recv(&body_rx, "body");
    assert_eq!(body, b"hello");
    assert_eq!(code, StreamResultCode::Ended);

    let (remainder, error) = recv(&complete_rx, "completion");
    assert!(!error);
    assert_eq!(remainder, b"NEXT");

    io_loop.release();
}

#[test]
fn malformed_chunk_reports_error() {
    let io_loop = new_loop();
    let (client, server, _listener) = tcp_pair(&io_loop);

    let (complete_tx, complete_rx) = mpsc::channel();
    let source: Arc<dyn AsyncStream> = client;
    let reader = ContentReader::chunked(
        Some(source),
        Box::new(move |_, error| {
            let _ = complete_tx.send(error);
        }),
        1024,
        false,
    );

    let (body_tx, _body_rx) = mpsc::channel();
    reader.read(
        vec![0; 16],
        Box::new(move |result| {
            let _ = body_tx.send(result.code);
        }),
        None,
    );

    // The chunk-size line must end in CRLF.
    server.write_from_slice(b"4\rXWiki\r\n", Box::new(|_| {}), None);

    assert!(recv(&complete_rx, "error completion"));

    io_loop.release();
}

#[test]
fn closed_filter_still_buffers_added_data() {
    let source: Option<Arc<dyn AsyncStream>> = None;
    let filter = evio::filter::StreamFilter::new(source, Box::new(evio::filter::IdentityFilter));
    filter.close();
    assert!(filter.add_read_data(b"late"));
    assert!(filter.add_read_data(b""));
}
