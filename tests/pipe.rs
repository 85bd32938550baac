use std::sync::mpsc;
use std::time::Duration;

use evio::{AsyncStream, StreamResultCode};

mod util;
use util::{new_loop, recv};

#[test]
fn bytes_flow_reader_to_writer() {
    let io_loop = new_loop();
    let (reader, writer) = evio::pipe::new(Some(&io_loop)).expect("unable to create pipe");

    let (read_tx, read_rx) = mpsc::channel();
    reader.read_fully(
        vec![0; 11],
        Box::new(move |result| {
            let _ = read_tx.send((result.data().to_vec(), result.code));
        }),
        None,
    );

    writer.write(b"across pipe".to_vec(), Box::new(|_| {}), None);

    let (data, code) = recv(&read_rx, "pipe read");
    assert_eq!(code, StreamResultCode::Success);
    assert_eq!(data, b"across pipe");

    io_loop.release();
}

#[test]
fn closing_writer_ends_reader() {
    let io_loop = new_loop();
    let (reader, writer) = evio::pipe::new(Some(&io_loop)).expect("unable to create pipe");

    writer.write(b"bye".to_vec(), Box::new(|_| {}), None);
    // Let the write land before the peer closes.
    std::thread::sleep(Duration::from_millis(50));
    writer.close();

    let (read_tx, read_rx) = mpsc::channel();
    reader.read_fully(
        vec![0; 16],
        Box::new(move |result| {
            let _ = read_tx.send((result.size, result.code));
        }),
        None,
    );

    let (size, code) = recv(&read_rx, "pipe eof");
    assert_eq!(code, StreamResultCode::Ended);
    assert_eq!(size, 3);

    io_loop.release();
}

#[test]
fn pipe_is_one_way() {
    let io_loop = new_loop();
    let (reader, _writer) = evio::pipe::new(Some(&io_loop)).expect("unable to create pipe");

    let (write_tx, write_rx) = mpsc::channel();
    reader.write(
        b"wrong way".to_vec(),
        Box::new(move |result| {
            let _ = write_tx.send(result.code);
        }),
        None,
    );
    assert_eq!(recv(&write_rx, "rejected write"), StreamResultCode::Unknown);

    io_loop.release();
}
