use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use log::{error, trace};

use crate::instance::IoInstance;
use crate::sys;
use crate::token::{Token, WAKE_TOKEN};

/// A closure executed on the loop thread.
pub type Task = Box<dyn FnOnce() + Send>;

/// Single-threaded I/O event loop.
///
/// One worker thread multiplexes readiness/completion events for every
/// instance attached to the loop, runs queued task closures and fires the
/// loop's timers. Each iteration has four phases:
///
/// 1. *Task phase*: drain the task queue (including expired timers) in FIFO
///    order.
/// 2. *Order phase*: visit every instance that requested an order since the
///    last iteration; this is where pending requests first hit the OS.
/// 3. *Wait phase*: block in the OS multiplexor, bounded by the next timer
///    deadline.
/// 4. *Close phase*: detach closing instances and run their close handlers.
///
/// All instance callbacks and all request callbacks run on the loop thread;
/// blocking anywhere but the wait phase stalls every stream on the loop.
pub struct IoLoop {
    selector: sys::Selector,
    waker: sys::Waker,
    initialized: AtomicBool,
    running: AtomicBool,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
    tasks: Mutex<VecDeque<Task>>,
    orders: Mutex<VecDeque<Arc<dyn IoInstance>>>,
    closings: Mutex<VecDeque<Arc<dyn IoInstance>>>,
    timers: Mutex<BinaryHeap<TimerEntry>>,
    timer_seq: AtomicU64,
    registry: Mutex<HashMap<usize, Arc<dyn IoInstance>>>,
    next_token: AtomicUsize,
}

pub(crate) struct TimerEntry {
    pub deadline: Instant,
    pub seq: u64,
    pub task: Task,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Reversed so the binary heap pops the earliest deadline first.
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl IoLoop {
    /// Creates a loop together with its OS multiplexor.
    ///
    /// With `auto_start` the worker thread is spawned before returning;
    /// otherwise [`start`] has to be called explicitly.
    ///
    /// [`start`]: IoLoop::start
    pub fn create(auto_start: bool) -> io::Result<Arc<IoLoop>> {
        let selector = sys::Selector::new()?;
        let waker = sys::Waker::new(&selector)?;
        let io_loop = Arc::new(IoLoop {
            selector,
            waker,
            initialized: AtomicBool::new(true),
            running: AtomicBool::new(false),
            thread: Mutex::new(None),
            tasks: Mutex::new(VecDeque::new()),
            orders: Mutex::new(VecDeque::new()),
            closings: Mutex::new(VecDeque::new()),
            timers: Mutex::new(BinaryHeap::new()),
            timer_seq: AtomicU64::new(0),
            registry: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(0),
        });
        if auto_start {
            io_loop.start()?;
        }
        Ok(io_loop)
    }

    /// Returns the process-wide default loop, creating it on first use.
    pub fn default_loop() -> Option<Arc<IoLoop>> {
        let slot = default_slot();
        let mut guard = slot.lock().unwrap();
        if guard.is_none() {
            *guard = IoLoop::create(true).ok();
        }
        guard.clone()
    }

    /// Releases the default loop if one was created.
    pub fn release_default() {
        let taken = default_slot().lock().unwrap().take();
        if let Some(io_loop) = taken {
            io_loop.release();
        }
    }

    /// Spawns the worker thread. Idempotent.
    pub fn start(self: &Arc<Self>) -> io::Result<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(io::ErrorKind::NotConnected.into());
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let this = Arc::clone(self);
        match thread::Builder::new()
            .name("evio-loop".to_owned())
            .spawn(move || this.run())
        {
            Ok(handle) => {
                *self.thread.lock().unwrap() = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.running.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops the worker thread, closes the multiplexor state and drains every
    /// queue. Idempotent; outstanding requests resolve `Closed`.
    pub fn release(&self) {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return;
        }
        if self.running.swap(false, Ordering::AcqRel) {
            let _ = self.waker.wake();
            let handle = self.thread.lock().unwrap().take();
            if let Some(handle) = handle {
                if handle.thread().id() != thread::current().id() {
                    let _ = handle.join();
                }
            }
        }

        let instances: Vec<_> = self
            .registry
            .lock()
            .unwrap()
            .drain()
            .map(|(_, instance)| instance)
            .collect();
        for instance in instances {
            let state = instance.state();
            if state.is_open() {
                let _ = self.selector.deregister(state.handle());
                instance.on_close();
            }
        }

        self.tasks.lock().unwrap().clear();
        self.orders.lock().unwrap().clear();
        self.closings.lock().unwrap().clear();
        self.timers.lock().unwrap().clear();
    }

    /// Queues a closure for the next task phase and wakes the loop.
    pub fn add_task(&self, task: Task) -> bool {
        if !self.initialized.load(Ordering::Acquire) {
            return false;
        }
        self.tasks.lock().unwrap().push_back(task);
        self.wake();
        true
    }

    /// Runs `task` on the loop thread after `delay`; a zero delay is a plain
    /// [`add_task`].
    ///
    /// [`add_task`]: IoLoop::add_task
    pub fn dispatch(&self, task: Task, delay: Duration) -> bool {
        if delay.is_zero() {
            return self.add_task(task);
        }
        if !self.initialized.load(Ordering::Acquire) {
            return false;
        }
        let entry = TimerEntry {
            deadline: Instant::now() + delay,
            seq: self.timer_seq.fetch_add(1, Ordering::Relaxed),
            task,
        };
        self.timers.lock().unwrap().push(entry);
        // Wake so the wait phase recomputes its deadline.
        self.wake();
        true
    }

    /// Interrupts the wait phase. Idempotent and cheap.
    pub fn wake(&self) {
        if self.running.load(Ordering::Acquire) {
            let _ = self.waker.wake();
        }
    }

    pub(crate) fn attach_instance(self: &Arc<Self>, instance: Arc<dyn IoInstance>) -> io::Result<()> {
        if !self.initialized.load(Ordering::Acquire) {
            return Err(io::ErrorKind::NotConnected.into());
        }
        let state = instance.state();
        if !state.is_open() {
            return Err(io::ErrorKind::InvalidInput.into());
        }

        let token = Token(self.next_token.fetch_add(1, Ordering::Relaxed));
        state.set_token(token);
        state.bind(self, Arc::downgrade(&instance));

        // The registry entry must exist before the selector can deliver the
        // first (possibly immediate) event for the handle.
        self.registry.lock().unwrap().insert(token.0, instance.clone());
        if let Err(err) = self.selector.register(state.handle(), token, state.mode()) {
            self.registry.lock().unwrap().remove(&token.0);
            return Err(err);
        }
        trace!("attached instance; token={}", token.0);
        Ok(())
    }

    /// Marks the instance closing and hands it to the close sweep. After this
    /// call no further callbacks fire for the instance other than the close
    /// delivery itself.
    pub(crate) fn close_instance(&self, instance: &Arc<dyn IoInstance>) {
        let state = instance.state();
        if !state.is_open() || state.set_closing() {
            return;
        }
        if self.running.load(Ordering::Acquire) {
            self.closings.lock().unwrap().push_back(instance.clone());
            self.wake();
        } else {
            // No loop thread to race with; close inline.
            let _ = self.selector.deregister(state.handle());
            instance.on_close();
            self.registry.lock().unwrap().remove(&state.token().0);
        }
    }

    pub(crate) fn request_order(&self, instance: &Arc<dyn IoInstance>) {
        if !self.initialized.load(Ordering::Acquire) || !instance.state().is_open() {
            return;
        }
        if instance.state().begin_ordering() {
            self.orders.lock().unwrap().push_back(instance.clone());
        }
        self.wake();
    }

    fn run(self: Arc<Self>) {
        let mut events = sys::Events::with_capacity(1024);
        while self.running.load(Ordering::Acquire) {
            self.step_begin();
            if !self.running.load(Ordering::Acquire) {
                break;
            }

            let timeout = self.next_timeout();
            match self.selector.wait(&mut events, timeout) {
                Ok(()) => {}
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("selector wait failed: {}", err);
                    self.fail_all_instances();
                    self.step_end();
                    break;
                }
            }

            for (token, desc) in events.iter() {
                if token == WAKE_TOKEN {
                    self.waker.ack();
                    continue;
                }
                let instance = self.registry.lock().unwrap().get(&token.0).cloned();
                if let Some(instance) = instance {
                    let state = instance.state();
                    if state.is_open() && !state.is_closing() {
                        instance.on_event(&desc);
                    }
                }
            }

            self.step_end();
        }
    }

    fn step_begin(&self) {
        let mut tasks = mem::take(&mut *self.tasks.lock().unwrap());
        {
            let now = Instant::now();
            let mut timers = self.timers.lock().unwrap();
            while timers.peek().map_or(false, |entry| entry.deadline <= now) {
                tasks.push_back(timers.pop().unwrap().task);
            }
        }
        for task in tasks {
            task();
        }

        let orders = mem::take(&mut *self.orders.lock().unwrap());
        for instance in orders {
            let state = instance.state();
            state.clear_ordering();
            if state.is_open() && !state.is_closing() {
                instance.on_order();
            }
        }
    }

    fn step_end(&self) {
        loop {
            let instance = self.closings.lock().unwrap().pop_front();
            let Some(instance) = instance else { break };
            let state = instance.state();
            if state.is_open() {
                let _ = self.selector.deregister(state.handle());
                instance.on_close();
            }
            self.registry.lock().unwrap().remove(&state.token().0);
        }
    }

    fn next_timeout(&self) -> Option<Duration> {
        let timers = self.timers.lock().unwrap();
        timers.peek().map(|entry| {
            entry
                .deadline
                .saturating_duration_since(Instant::now())
        })
    }

    /// Selector failure: every instance goes through the regular close path
    /// so pending requests still resolve exactly once.
    fn fail_all_instances(&self) {
        let instances: Vec<_> = self.registry.lock().unwrap().values().cloned().collect();
        let mut closings = self.closings.lock().unwrap();
        for instance in instances {
            if !instance.state().set_closing() {
                closings.push_back(instance);
            }
        }
    }
}

impl Drop for IoLoop {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for IoLoop {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("IoLoop")
            .field("running", &self.is_running())
            .finish()
    }
}

fn default_slot() -> &'static Mutex<Option<Arc<IoLoop>>> {
    static DEFAULT: OnceLock<Mutex<Option<Arc<IoLoop>>>> = OnceLock::new();
    DEFAULT.get_or_init(|| Mutex::new(None))
}

/// Resolves an optional user-supplied loop to a concrete one, falling back to
/// the process default.
pub(crate) fn resolve_loop(io_loop: Option<&Arc<IoLoop>>) -> io::Result<Arc<IoLoop>> {
    match io_loop {
        Some(io_loop) => Ok(io_loop.clone()),
        None => IoLoop::default_loop().ok_or_else(|| io::ErrorKind::NotConnected.into()),
    }
}
