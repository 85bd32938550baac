use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use evio::IoLoop;

mod util;
use util::{init, recv};

#[test]
fn tasks_run_in_fifo_order() {
    init();
    let io_loop = IoLoop::create(true).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = mpsc::channel();
    for index in 0..32 {
        let order = Arc::clone(&order);
        let done_tx = done_tx.clone();
        io_loop.add_task(Box::new(move || {
            order.lock().unwrap().push(index);
            if index == 31 {
                let _ = done_tx.send(());
            }
        }));
    }

    recv(&done_rx, "last task");
    let observed = order.lock().unwrap().clone();
    assert_eq!(observed, (0..32).collect::<Vec<_>>());

    io_loop.release();
}

#[test]
fn dispatch_delays_execution() {
    init();
    let io_loop = IoLoop::create(true).unwrap();

    let (tx, rx) = mpsc::channel();
    let started = Instant::now();
    assert!(io_loop.dispatch(
        Box::new(move || {
            let _ = tx.send(Instant::now());
        }),
        Duration::from_millis(50),
    ));

    let fired = recv(&rx, "timer");
    let elapsed = fired - started;
    assert!(elapsed >= Duration::from_millis(45), "fired after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "fired after {:?}", elapsed);

    io_loop.release();
}

#[test]
fn dispatch_zero_delay_is_a_task() {
    init();
    let io_loop = IoLoop::create(true).unwrap();

    let (tx, rx) = mpsc::channel();
    assert!(io_loop.dispatch(
        Box::new(move || {
            let _ = tx.send(());
        }),
        Duration::ZERO,
    ));
    recv(&rx, "task");

    io_loop.release();
}

#[test]
fn timers_fire_in_deadline_order() {
    init();
    let io_loop = IoLoop::create(true).unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = mpsc::channel();
    for (label, delay) in [("slow", 80u64), ("fast", 20), ("mid", 50)] {
        let order = Arc::clone(&order);
        let done_tx = done_tx.clone();
        io_loop.dispatch(
            Box::new(move || {
                order.lock().unwrap().push(label);
                if label == "slow" {
                    let _ = done_tx.send(());
                }
            }),
            Duration::from_millis(delay),
        );
    }

    recv(&done_rx, "slowest timer");
    assert_eq!(*order.lock().unwrap(), vec!["fast", "mid", "slow"]);

    io_loop.release();
}

#[test]
fn release_is_idempotent_and_stops_tasks() {
    init();
    let io_loop = IoLoop::create(true).unwrap();
    assert!(io_loop.is_running());

    io_loop.release();
    io_loop.release();
    assert!(!io_loop.add_task(Box::new(|| {})));
}

#[test]
fn default_loop_is_shared_and_releasable() {
    init();
    let first = IoLoop::default_loop().expect("no default loop");
    let second = IoLoop::default_loop().expect("no default loop");
    assert!(Arc::ptr_eq(&first, &second));
    IoLoop::release_default();
    assert!(!first.is_running());
}

#[test]
fn manual_start_runs_queued_tasks() {
    init();
    let io_loop = IoLoop::create(false).unwrap();
    assert!(!io_loop.is_running());

    let (tx, rx) = mpsc::channel();
    io_loop.add_task(Box::new(move || {
        let _ = tx.send(());
    }));
    io_loop.start().unwrap();
    recv(&rx, "queued task");

    io_loop.release();
}
