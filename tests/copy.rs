use std::sync::mpsc;
use std::sync::Arc;

use rand::RngCore;

use evio::copy::{Copier, CopyOptions};
use evio::fs::{File, OpenMode};
use evio::{AsyncStream, IoLoop};

mod util;
use util::{new_loop, recv, temp_path};

fn write_random_file(path: &std::path::Path, size: usize) -> Vec<u8> {
    let mut data = vec![0; size];
    rand::rng().fill_bytes(&mut data);
    std::fs::write(path, &data).expect("unable to seed file");
    data
}

fn collect_pipe(
    io_loop: &Arc<IoLoop>,
    reader: Arc<evio::fs::FileStream>,
    total: usize,
) -> mpsc::Receiver<Vec<u8>> {
    let _ = io_loop;
    let (tx, rx) = mpsc::channel();
    reader.read_fully(
        vec![0; total],
        Box::new(move |result| {
            let _ = tx.send(result.data().to_vec());
        }),
        None,
    );
    rx
}

#[test]
fn copies_a_file_through_a_pipe_bit_exact() {
    let io_loop = new_loop();

    let path = temp_path("copy-src.bin");
    let expected = write_random_file(&path, 1024 * 1024);

    let source = File::open(&path, OpenMode::READ).expect("unable to open source");
    let (reader, writer) = evio::pipe::new(Some(&io_loop)).expect("unable to create pipe");
    let collected = collect_pipe(&io_loop, reader, expected.len());

    let (end_tx, end_rx) = mpsc::channel();
    let options = CopyOptions {
        size: expected.len() as u64,
        buffer_size: 4096,
        buffer_count: 4,
        on_end: Some(Box::new(move |copier, error| {
            let _ = end_tx.send((error, copier.read_size(), copier.written_size(), copier.is_completed()));
        })),
        ..CopyOptions::default()
    };
    let copier = Copier::create(source, writer, options).expect("unable to create copier");

    let (error, read, written, completed) = recv(&end_rx, "copy end");
    assert!(!error);
    assert!(completed);
    assert_eq!(read, expected.len() as u64);
    assert_eq!(written, expected.len() as u64);
    assert!(copier.is_completed());

    let data = recv(&collected, "pipe drain");
    assert_eq!(data.len(), expected.len());
    assert_eq!(data, expected);

    let _ = std::fs::remove_file(&path);
    io_loop.release();
}

#[test]
fn unbounded_copy_latches_total_at_source_end() {
    let io_loop = new_loop();

    let path = temp_path("copy-unbounded.bin");
    let expected = write_random_file(&path, 48 * 1024);

    let source = File::open(&path, OpenMode::READ).expect("unable to open source");
    let (reader, writer) = evio::pipe::new(Some(&io_loop)).expect("unable to create pipe");
    let collected = collect_pipe(&io_loop, reader, expected.len());

    let (end_tx, end_rx) = mpsc::channel();
    let options = CopyOptions {
        // Size unknown up front: run until the source ends.
        size: u64::MAX,
        buffer_size: 4096,
        buffer_count: 2,
        on_end: Some(Box::new(move |copier, error| {
            let _ = end_tx.send((error, copier.total_size(), copier.is_completed()));
        })),
        ..CopyOptions::default()
    };
    let _copier = Copier::create(source, writer, options).expect("unable to create copier");

    let (error, total, completed) = recv(&end_rx, "copy end");
    assert!(!error);
    assert_eq!(total, expected.len() as u64);
    assert!(completed);

    assert_eq!(recv(&collected, "pipe drain"), expected);

    let _ = std::fs::remove_file(&path);
    io_loop.release();
}

#[test]
fn read_hook_may_transform_the_stream() {
    let io_loop = new_loop();

    let path = temp_path("copy-hook.bin");
    std::fs::write(&path, b"abcdefgh").expect("unable to seed file");

    let source = File::open(&path, OpenMode::READ).expect("unable to open source");
    let (reader, writer) = evio::pipe::new(Some(&io_loop)).expect("unable to create pipe");
    let collected = collect_pipe(&io_loop, reader, 8);

    let (end_tx, end_rx) = mpsc::channel();
    let options = CopyOptions {
        size: 8,
        buffer_size: 8,
        buffer_count: 2,
        on_read: Some(Box::new(|_, mut data| {
            data.make_ascii_uppercase();
            Some(data)
        })),
        on_end: Some(Box::new(move |_, error| {
            let _ = end_tx.send(error);
        })),
        ..CopyOptions::default()
    };
    let _copier = Copier::create(source, writer, options).expect("unable to create copier");

    assert!(!recv(&end_rx, "copy end"));
    assert_eq!(recv(&collected, "pipe drain"), b"ABCDEFGH");

    let _ = std::fs::remove_file(&path);
    io_loop.release();
}

#[test]
fn rejects_empty_configuration() {
    let io_loop = new_loop();
    let (reader, writer) = evio::pipe::new(Some(&io_loop)).expect("unable to create pipe");

    let options = CopyOptions {
        size: 0,
        ..CopyOptions::default()
    };
    let source: Arc<dyn AsyncStream> = reader;
    let target: Arc<dyn AsyncStream> = writer;
    assert!(Copier::create(source, target, options).is_err());

    io_loop.release();
}
