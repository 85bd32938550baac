use std::sync::mpsc;

use evio::fs::{File, OpenMode};
use evio::{AsyncStream, StreamResultCode};

mod util;
use util::{init, recv, temp_path};

#[test]
fn file_round_trip_through_simulator() {
    init();

    let path = temp_path("fs-roundtrip.txt");
    let file = File::open(&path, OpenMode::WRITE | OpenMode::READ).expect("unable to create file");

    let (write_tx, write_rx) = mpsc::channel();
    file.write(
        b"simulated".to_vec(),
        Box::new(move |result| {
            let _ = write_tx.send(result.code);
        }),
        None,
    );
    assert_eq!(recv(&write_rx, "write"), StreamResultCode::Success);

    assert!(file.is_seekable());
    assert!(file.seek(0));

    let (read_tx, read_rx) = mpsc::channel();
    file.read_fully(
        vec![0; 9],
        Box::new(move |result| {
            let _ = read_tx.send((result.data().to_vec(), result.code));
        }),
        None,
    );
    let (data, code) = recv(&read_rx, "read");
    assert_eq!(code, StreamResultCode::Success);
    assert_eq!(data, b"simulated");
    assert_eq!(file.size(), 9);

    file.close();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn reading_past_the_end_reports_ended() {
    init();

    let path = temp_path("fs-ended.txt");
    std::fs::write(&path, b"xy").expect("unable to seed file");

    let file = File::open(&path, OpenMode::READ).expect("unable to open file");
    let (read_tx, read_rx) = mpsc::channel();
    file.read_fully(
        vec![0; 16],
        Box::new(move |result| {
            let _ = read_tx.send((result.size, result.code));
        }),
        None,
    );
    let (size, code) = recv(&read_rx, "read");
    assert_eq!(code, StreamResultCode::Ended);
    assert_eq!(size, 2);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn close_fails_queued_requests() {
    init();

    let path = temp_path("fs-close.txt");
    std::fs::write(&path, b"data").expect("unable to seed file");
    let file = File::open(&path, OpenMode::READ).expect("unable to open file");

    file.close();
    assert!(!file.is_open());

    let (read_tx, read_rx) = mpsc::channel();
    file.read(
        vec![0; 4],
        Box::new(move |result| {
            let _ = read_tx.send(result.code);
        }),
        None,
    );
    assert_eq!(recv(&read_rx, "refused read"), StreamResultCode::Unknown);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn open_stream_reads_files_generically() {
    init();

    let path = temp_path("fs-generic.bin");
    std::fs::write(&path, b"generic-bytes").expect("unable to seed file");

    let stream = evio::fs::open_stream(&path, OpenMode::READ, None).expect("unable to open");
    let (read_tx, read_rx) = mpsc::channel();
    stream.read_fully(
        vec![0; 13],
        Box::new(move |result| {
            let _ = read_tx.send(result.data().to_vec());
        }),
        None,
    );
    assert_eq!(recv(&read_rx, "read"), b"generic-bytes");

    evio::IoLoop::release_default();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn append_mode_preserves_existing_content() {
    init();

    let path = temp_path("fs-append.txt");
    std::fs::write(&path, b"head-").expect("unable to seed file");

    let file = File::open_for_append(&path).expect("unable to open for append");
    let (write_tx, write_rx) = mpsc::channel();
    file.write(
        b"tail".to_vec(),
        Box::new(move |result| {
            let _ = write_tx.send(result.code);
        }),
        None,
    );
    assert_eq!(recv(&write_rx, "append"), StreamResultCode::Success);
    file.close();

    assert_eq!(std::fs::read(&path).unwrap(), b"head-tail");
    let _ = std::fs::remove_file(&path);
}
