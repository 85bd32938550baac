use std::sync::mpsc;
use std::sync::Arc;

use rand::RngCore;

use evio::output::{Output, OutputOptions};
use evio::AsyncStream;

mod util;
use util::{new_loop, recv, temp_path};

#[test]
fn headers_and_file_body_arrive_in_order() {
    let io_loop = new_loop();

    let path = temp_path("output-img.bin");
    let mut body = vec![0; 123_456];
    rand::rng().fill_bytes(&mut body);
    std::fs::write(&path, &body).expect("unable to seed file");

    let (reader, writer) = evio::pipe::new(Some(&io_loop)).expect("unable to create pipe");
    let header = b"HTTP/1.1 200 OK\r\n\r\n";
    let total = header.len() + body.len();

    let (read_tx, read_rx) = mpsc::channel();
    reader.read_fully(
        vec![0; total],
        Box::new(move |result| {
            let _ = read_tx.send(result.data().to_vec());
        }),
        None,
    );

    let (end_tx, end_rx) = mpsc::channel();
    let target: Arc<dyn AsyncStream> = writer;
    let output = Output::create(
        target,
        OutputOptions {
            buffer_size: 4096,
            buffer_count: 3,
            on_end: Some(Box::new(move |error| {
                let _ = end_tx.send(error);
            })),
        },
    )
    .expect("unable to create output");

    assert!(output.write(header));
    assert!(output.copy_from_file(&path, Some(&io_loop)));
    assert_eq!(output.output_length(), total as u64);
    output.start_writing();

    assert!(!recv(&end_rx, "output end"), "output reported an error");

    let received = recv(&read_rx, "pipe drain");
    assert_eq!(received.len(), total);
    assert_eq!(&received[..header.len()], header);
    assert_eq!(&received[header.len()..], &body[..]);

    let _ = std::fs::remove_file(&path);
    io_loop.release();
}

#[test]
fn bytes_stream_bytes_compose_in_order() {
    let io_loop = new_loop();

    let path = temp_path("output-middle.bin");
    std::fs::write(&path, b"MIDDLE").expect("unable to seed file");

    let (reader, writer) = evio::pipe::new(Some(&io_loop)).expect("unable to create pipe");

    let (read_tx, read_rx) = mpsc::channel();
    reader.read_fully(
        vec![0; 14],
        Box::new(move |result| {
            let _ = read_tx.send(result.data().to_vec());
        }),
        None,
    );

    let (end_tx, end_rx) = mpsc::channel();
    let target: Arc<dyn AsyncStream> = writer;
    let output = Output::create(
        target,
        OutputOptions {
            on_end: Some(Box::new(move |error| {
                let _ = end_tx.send(error);
            })),
            ..OutputOptions::default()
        },
    )
    .expect("unable to create output");

    assert!(output.write(b"AAAA"));
    assert!(output.copy_from_file(&path, Some(&io_loop)));
    assert!(output.write(b"BBBB"));
    output.start_writing();

    assert!(!recv(&end_rx, "output end"));
    assert_eq!(recv(&read_rx, "pipe drain"), b"AAAAMIDDLEBBBB");

    io_loop.release();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn consecutive_writes_merge_while_body_splits() {
    let io_loop = new_loop();

    let buffer = evio::output::OutputBuffer::new();
    assert!(buffer.write(b"one"));
    assert!(buffer.write(b"two"));
    assert_eq!(buffer.output_length(), 6);

    let (reader, _writer) = evio::pipe::new(Some(&io_loop)).expect("unable to create pipe");
    let body: Arc<dyn AsyncStream> = reader;
    assert!(buffer.copy_from(&body, 10));
    // Bytes appended after a body start a fresh element.
    assert!(buffer.write(b"three"));
    assert_eq!(buffer.output_length(), 21);

    io_loop.release();
}
