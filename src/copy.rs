//! Double-buffered stream-to-stream copying.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::stream::{AsyncStream, StreamResult};

/// Transforms each filled buffer before it is written; returning `None`
/// drops the data and recycles the buffer.
pub type CopyReadHook = Box<dyn FnMut(&Copier, Vec<u8>) -> Option<Vec<u8>> + Send>;

/// Observes every completed target write.
pub type CopyWriteHook = Box<dyn FnMut(&Copier) + Send>;

/// Invoked exactly once when the copy finishes or fails.
pub type CopyEndHook = Box<dyn FnMut(&Copier, bool) + Send>;

/// Copy configuration.
pub struct CopyOptions {
    /// Total bytes to move; `u64::MAX` copies until the source ends.
    pub size: u64,
    pub buffer_size: usize,
    pub buffer_count: u32,
    pub auto_start: bool,
    pub on_read: Option<CopyReadHook>,
    pub on_write: Option<CopyWriteHook>,
    pub on_end: Option<CopyEndHook>,
}

impl Default for CopyOptions {
    fn default() -> CopyOptions {
        CopyOptions {
            size: u64::MAX,
            buffer_size: 0x10000,
            buffer_count: 8,
            auto_start: true,
            on_read: None,
            on_write: None,
            on_end: None,
        }
    }
}

struct CopyHooks {
    on_read: Option<CopyReadHook>,
    on_write: Option<CopyWriteHook>,
    on_end: Option<CopyEndHook>,
}

struct CopyQueues {
    /// Empty buffers available for reading into.
    read: VecDeque<Vec<u8>>,
    /// Filled buffers awaiting their write.
    write: VecDeque<Vec<u8>>,
}

/// Pumps bytes from a source stream to a target stream through a fixed pool
/// of buffers.
///
/// At most one read and one write are in flight at any moment; buffers cycle
/// `read-ready → writing → read-ready`. The task closes itself once neither
/// direction can make progress, delivering the end hook exactly once.
pub struct Copier {
    source: Mutex<Option<Arc<dyn AsyncStream>>>,
    target: Mutex<Option<Arc<dyn AsyncStream>>>,
    hooks: Mutex<CopyHooks>,
    queues: Mutex<CopyQueues>,
    buffer_size: usize,
    total: AtomicU64,
    size_read: AtomicU64,
    size_written: AtomicU64,
    reading: AtomicBool,
    writing: AtomicBool,
    read_error: AtomicBool,
    read_ended: AtomicBool,
    write_error: AtomicBool,
    running: AtomicBool,
    started: AtomicBool,
    enqueuing: AtomicBool,
    this: Weak<Copier>,
}

impl Copier {
    pub fn create(
        source: Arc<dyn AsyncStream>,
        target: Arc<dyn AsyncStream>,
        options: CopyOptions,
    ) -> io::Result<Arc<Copier>> {
        if options.size == 0 || options.buffer_size == 0 || options.buffer_count == 0 {
            return Err(io::ErrorKind::InvalidInput.into());
        }
        let mut read = VecDeque::with_capacity(options.buffer_count as usize);
        for _ in 0..options.buffer_count {
            read.push_back(vec![0; options.buffer_size]);
        }
        let copier = Arc::new_cyclic(|this| Copier {
            source: Mutex::new(Some(source)),
            target: Mutex::new(Some(target)),
            hooks: Mutex::new(CopyHooks {
                on_read: options.on_read,
                on_write: options.on_write,
                on_end: options.on_end,
            }),
            queues: Mutex::new(CopyQueues {
                read,
                write: VecDeque::new(),
            }),
            buffer_size: options.buffer_size,
            total: AtomicU64::new(options.size),
            size_read: AtomicU64::new(0),
            size_written: AtomicU64::new(0),
            reading: AtomicBool::new(false),
            writing: AtomicBool::new(false),
            read_error: AtomicBool::new(false),
            read_ended: AtomicBool::new(false),
            write_error: AtomicBool::new(false),
            running: AtomicBool::new(true),
            started: AtomicBool::new(false),
            enqueuing: AtomicBool::new(false),
            this: this.clone(),
        });
        if options.auto_start {
            copier.start();
        }
        Ok(copier)
    }

    /// Begins pumping; idempotent.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.started.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.enqueue();
        true
    }

    /// Stops the copy and delivers the end hook (once).
    pub fn close(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let error = self.has_error();
        // The hook runs with the hook slot taken so it may call back into
        // the copier without deadlocking.
        let on_end = self.hooks.lock().unwrap().on_end.take();
        if let Some(mut on_end) = on_end {
            on_end(self, error);
            self.hooks.lock().unwrap().on_end = Some(on_end);
        }
        *self.source.lock().unwrap() = None;
        *self.target.lock().unwrap() = None;
        let mut queues = self.queues.lock().unwrap();
        queues.read.clear();
        queues.write.clear();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn total_size(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    pub fn read_size(&self) -> u64 {
        self.size_read.load(Ordering::Acquire)
    }

    pub fn written_size(&self) -> u64 {
        self.size_written.load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.written_size() == self.total_size()
    }

    pub fn has_error(&self) -> bool {
        self.read_error.load(Ordering::Acquire) || self.write_error.load(Ordering::Acquire)
    }

    pub fn is_read_error(&self) -> bool {
        self.read_error.load(Ordering::Acquire)
    }

    pub fn is_write_error(&self) -> bool {
        self.write_error.load(Ordering::Acquire)
    }

    pub fn is_read_ended(&self) -> bool {
        self.read_ended.load(Ordering::Acquire)
    }

    /// Issues whatever reads and writes the current state admits. Guarded so
    /// a synchronous callback re-entering does not recurse; the loop
    /// re-checks state every pass so suppressed transitions are picked up.
    fn enqueue(self: &Arc<Self>) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        if self.enqueuing.swap(true, Ordering::AcqRel) {
            return;
        }

        loop {
            let mut acted = false;
            if let Some(buffer) = self.try_begin_read() {
                self.issue_read(buffer);
                acted = true;
            }
            if let Some(buffer) = self.try_begin_write() {
                self.issue_write(buffer);
                acted = true;
            }
            if !acted {
                break;
            }
        }

        self.enqueuing.store(false, Ordering::Release);

        if self.running.load(Ordering::Acquire)
            && !self.reading.load(Ordering::Acquire)
            && !self.writing.load(Ordering::Acquire)
        {
            if self.can_read() || self.can_write() {
                // State changed while the guard was held.
                self.enqueue();
            } else {
                self.close();
            }
        }
    }

    fn can_read(&self) -> bool {
        !self.read_error.load(Ordering::Acquire)
            && !self.read_ended.load(Ordering::Acquire)
            && self.read_size() < self.total_size()
            && !self.queues.lock().unwrap().read.is_empty()
    }

    fn can_write(&self) -> bool {
        !self.write_error.load(Ordering::Acquire)
            && !self.queues.lock().unwrap().write.is_empty()
    }

    fn try_begin_read(&self) -> Option<Vec<u8>> {
        if self.read_error.load(Ordering::Acquire)
            || self.read_ended.load(Ordering::Acquire)
            || self.reading.load(Ordering::Acquire)
        {
            return None;
        }
        if self.read_size() >= self.total_size() {
            return None;
        }
        let buffer = self.queues.lock().unwrap().read.pop_front()?;
        self.reading.store(true, Ordering::Release);
        Some(buffer)
    }

    fn try_begin_write(&self) -> Option<Vec<u8>> {
        if self.write_error.load(Ordering::Acquire) || self.writing.load(Ordering::Acquire) {
            return None;
        }
        let buffer = self.queues.lock().unwrap().write.pop_front()?;
        self.writing.store(true, Ordering::Release);
        Some(buffer)
    }

    fn issue_read(self: &Arc<Self>, mut buffer: Vec<u8>) {
        let remain = self.total_size() - self.read_size();
        let want = (self.buffer_size as u64).min(remain) as usize;
        buffer.resize(want, 0);

        let source = self.source.lock().unwrap().clone();
        let Some(source) = source else {
            self.reading.store(false, Ordering::Release);
            return;
        };
        let weak = self.this.clone();
        source.read(
            buffer,
            Box::new(move |result| {
                if let Some(copier) = weak.upgrade() {
                    copier.on_read_stream(result);
                }
            }),
            None,
        );
    }

    fn issue_write(self: &Arc<Self>, buffer: Vec<u8>) {
        let target = self.target.lock().unwrap().clone();
        let Some(target) = target else {
            self.writing.store(false, Ordering::Release);
            return;
        };
        let weak = self.this.clone();
        target.write(
            buffer,
            Box::new(move |result| {
                if let Some(copier) = weak.upgrade() {
                    copier.on_write_stream(result);
                }
            }),
            None,
        );
    }

    fn on_read_stream(self: &Arc<Self>, result: StreamResult) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        self.reading.store(false, Ordering::Release);

        let is_error = result.is_error();
        let is_ended = result.is_ended();
        if result.size > 0 {
            self.size_read.fetch_add(result.size as u64, Ordering::AcqRel);
            let size = result.size;
            let mut data = result.buffer;
            data.truncate(size);
            let on_read = self.hooks.lock().unwrap().on_read.take();
            let output = match on_read {
                Some(mut on_read) => {
                    let output = on_read(self, data);
                    self.hooks.lock().unwrap().on_read = Some(on_read);
                    output
                }
                None => Some(data),
            };
            let mut queues = self.queues.lock().unwrap();
            match output {
                Some(output) if !output.is_empty() => queues.write.push_back(output),
                _ => queues.read.push_back(Vec::with_capacity(self.buffer_size)),
            }
        } else {
            self.queues.lock().unwrap().read.push_back(result.buffer);
        }

        if is_error {
            self.read_error.store(true, Ordering::Release);
        } else if is_ended {
            self.read_ended.store(true, Ordering::Release);
            if self.total_size() == u64::MAX {
                self.total.store(self.read_size(), Ordering::Release);
            }
        }

        self.enqueue();
    }

    fn on_write_stream(self: &Arc<Self>, result: StreamResult) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        if result.is_error() {
            self.write_error.store(true, Ordering::Release);
        }
        self.writing.store(false, Ordering::Release);
        self.size_written
            .fetch_add(result.size as u64, Ordering::AcqRel);
        self.queues.lock().unwrap().read.push_back(result.buffer);

        let on_write = self.hooks.lock().unwrap().on_write.take();
        if let Some(mut on_write) = on_write {
            on_write(self);
            self.hooks.lock().unwrap().on_write = Some(on_write);
        }

        self.enqueue();
    }
}

impl std::fmt::Debug for Copier {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Copier")
            .field("total", &self.total_size())
            .field("read", &self.read_size())
            .field("written", &self.written_size())
            .finish()
    }
}
