//! Blocking-handle simulation.
//!
//! Handles without native readiness (regular files on POSIX) are driven by a
//! [`Dispatcher`]: a worker thread executing queued closures, with delayed
//! execution for request timeouts. A stream built on it queues its requests
//! and schedules one processor closure at a time, which pops requests and
//! performs plain blocking I/O, so per-direction FIFO order holds and two
//! requests never overlap on the same handle.

use std::collections::{BinaryHeap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::io_loop::{Task, TimerEntry};
use crate::stream::StreamRequest;

/// Worker thread executing closures in FIFO order, with optional delays.
pub struct Dispatcher {
    shared: Arc<DispatcherShared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

struct DispatcherShared {
    queue: Mutex<DispatcherQueue>,
    condvar: Condvar,
    running: AtomicBool,
    timer_seq: AtomicU64,
}

struct DispatcherQueue {
    tasks: VecDeque<Task>,
    timers: BinaryHeap<TimerEntry>,
}

impl Dispatcher {
    pub fn new() -> io::Result<Arc<Dispatcher>> {
        let shared = Arc::new(DispatcherShared {
            queue: Mutex::new(DispatcherQueue {
                tasks: VecDeque::new(),
                timers: BinaryHeap::new(),
            }),
            condvar: Condvar::new(),
            running: AtomicBool::new(true),
            timer_seq: AtomicU64::new(0),
        });
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("evio-dispatch".to_owned())
            .spawn(move || worker.run())?;
        Ok(Arc::new(Dispatcher {
            shared,
            thread: Mutex::new(Some(thread)),
        }))
    }

    pub fn dispatch(&self, task: Task) -> bool {
        self.dispatch_delayed(task, Duration::ZERO)
    }

    pub fn dispatch_delayed(&self, task: Task, delay: Duration) -> bool {
        if !self.shared.running.load(Ordering::Acquire) {
            return false;
        }
        let mut queue = self.shared.queue.lock().unwrap();
        if delay.is_zero() {
            queue.tasks.push_back(task);
        } else {
            queue.timers.push(TimerEntry {
                deadline: Instant::now() + delay,
                seq: self.shared.timer_seq.fetch_add(1, Ordering::Relaxed),
                task,
            });
        }
        drop(queue);
        self.shared.condvar.notify_one();
        true
    }

    /// Stops the worker; queued tasks that have not started are dropped.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.condvar.notify_one();
        let handle = self.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl DispatcherShared {
    fn run(&self) {
        loop {
            let task = {
                let mut queue = self.queue.lock().unwrap();
                loop {
                    if !self.running.load(Ordering::Acquire) {
                        return;
                    }
                    let now = Instant::now();
                    while queue
                        .timers
                        .peek()
                        .map_or(false, |entry| entry.deadline <= now)
                    {
                        let entry = queue.timers.pop().unwrap();
                        queue.tasks.push_back(entry.task);
                    }
                    if let Some(task) = queue.tasks.pop_front() {
                        break task;
                    }
                    let wait = queue
                        .timers
                        .peek()
                        .map(|entry| entry.deadline.saturating_duration_since(Instant::now()));
                    match wait {
                        Some(wait) => {
                            let (guard, _) = self.condvar.wait_timeout(queue, wait).unwrap();
                            queue = guard;
                        }
                        None => {
                            queue = self.condvar.wait(queue).unwrap();
                        }
                    }
                }
            };
            task();
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Dispatcher").finish()
    }
}

/// Request queue of a simulated stream.
///
/// `push` reports whether the caller must schedule the processor; `pop`
/// clears the processing flag when it runs dry so the next push reschedules.
pub(crate) struct SimulatorQueue {
    inner: Mutex<SimulatorState>,
}

struct SimulatorState {
    requests: VecDeque<Arc<StreamRequest>>,
    processing: bool,
}

impl SimulatorQueue {
    pub fn new() -> SimulatorQueue {
        SimulatorQueue {
            inner: Mutex::new(SimulatorState {
                requests: VecDeque::new(),
                processing: false,
            }),
        }
    }

    pub fn push(&self, request: &Arc<StreamRequest>) -> bool {
        let mut state = self.inner.lock().unwrap();
        state.requests.push_back(request.clone());
        if state.processing {
            false
        } else {
            state.processing = true;
            true
        }
    }

    pub fn pop(&self) -> Option<Arc<StreamRequest>> {
        let mut state = self.inner.lock().unwrap();
        match state.requests.pop_front() {
            Some(request) => Some(request),
            None => {
                state.processing = false;
                None
            }
        }
    }

    pub fn drain(&self) -> Vec<Arc<StreamRequest>> {
        let mut state = self.inner.lock().unwrap();
        state.requests.drain(..).collect()
    }
}
