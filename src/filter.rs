//! Push-through transform stream.
//!
//! A [`StreamFilter`] looks like any other stream but converts bytes on both
//! paths: reads pull from an underlying source through a `filter_read` hook
//! into a converted-bytes buffer that read requests drain in order, writes
//! run through `filter_write` before delegating to the source. Terminal codes
//! from the source propagate once the converted buffer runs dry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::buffer::MemoryQueue;
use crate::io_loop::Task;
use crate::stream::{AsyncStream, ResultCodeCell, StreamRequest, StreamResult, StreamResultCode};

const DEFAULT_READ_BUFFER: usize = 16 * 1024;

/// Write-path conversion outcome.
pub enum FilterWrite {
    /// Pass the caller's bytes through untouched (zero copy).
    Unchanged,
    /// Write this converted region instead; the caller still observes its
    /// original buffer in the result.
    Converted(Vec<u8>),
    /// Refuse the write.
    Error,
}

/// Conversion hooks of a filter. The default implementation is the identity
/// filter.
pub trait FilterHooks: Send + 'static {
    /// Converts source bytes; append output to `out`. Returning `false`
    /// latches a fatal read error.
    fn filter_read(&mut self, input: &[u8], out: &mut Vec<u8>) -> bool {
        out.extend_from_slice(input);
        true
    }

    fn filter_write(&mut self, _input: &[u8]) -> FilterWrite {
        FilterWrite::Unchanged
    }

    /// Observes every source completion before the filter applies it.
    fn on_source_result(&mut self, _code: StreamResultCode) {}

    /// Called after a source error has been applied and pending requests
    /// were failed.
    fn on_source_error(&mut self) {}
}

/// Identity hooks, useful for tests and for plain pass-through filtering.
pub struct IdentityFilter;

impl FilterHooks for IdentityFilter {}

/// Terminal latches shared between a filter and its hooks.
pub(crate) struct FilterFlags {
    open: AtomicBool,
    reading_error: AtomicBool,
    reading_ended: AtomicBool,
    writing_error: AtomicBool,
    writing_ended: AtomicBool,
}

impl FilterFlags {
    pub fn new() -> FilterFlags {
        FilterFlags {
            open: AtomicBool::new(true),
            reading_error: AtomicBool::new(false),
            reading_ended: AtomicBool::new(false),
            writing_error: AtomicBool::new(false),
            writing_ended: AtomicBool::new(false),
        }
    }

    pub fn set_reading_ended(&self) {
        self.reading_ended.store(true, Ordering::Release);
    }

    pub fn set_reading_error(&self) {
        self.reading_error.store(true, Ordering::Release);
    }

    pub fn set_writing_error(&self) {
        self.writing_error.store(true, Ordering::Release);
    }

    fn reading_ended(&self) -> bool {
        self.reading_ended.load(Ordering::Acquire)
    }

    fn reading_error(&self) -> bool {
        self.reading_error.load(Ordering::Acquire)
    }

    fn writing_error(&self) -> bool {
        self.writing_error.load(Ordering::Acquire)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

struct ReadState {
    requests: std::collections::VecDeque<Arc<StreamRequest>>,
    converted: MemoryQueue,
    buffer: Option<Vec<u8>>,
    buffer_size: usize,
    reading: bool,
}

/// Stream-shaped adapter converting bytes between its caller and a source
/// stream.
pub struct StreamFilter {
    source: Mutex<Option<Arc<dyn AsyncStream>>>,
    hooks: Mutex<Box<dyn FilterHooks>>,
    flags: Arc<FilterFlags>,
    read_state: Mutex<ReadState>,
    last_code: ResultCodeCell,
    this: Weak<StreamFilter>,
}

impl StreamFilter {
    pub fn new(
        source: Option<Arc<dyn AsyncStream>>,
        hooks: Box<dyn FilterHooks>,
    ) -> Arc<StreamFilter> {
        StreamFilter::with_flags(source, hooks, Arc::new(FilterFlags::new()), DEFAULT_READ_BUFFER)
    }

    pub(crate) fn with_flags(
        source: Option<Arc<dyn AsyncStream>>,
        hooks: Box<dyn FilterHooks>,
        flags: Arc<FilterFlags>,
        buffer_size: usize,
    ) -> Arc<StreamFilter> {
        Arc::new_cyclic(|this| StreamFilter {
            source: Mutex::new(source),
            hooks: Mutex::new(hooks),
            flags,
            read_state: Mutex::new(ReadState {
                requests: std::collections::VecDeque::new(),
                converted: MemoryQueue::new(),
                buffer: None,
                buffer_size: buffer_size.max(1),
                reading: false,
            }),
            last_code: ResultCodeCell::new(),
            this: this.clone(),
        })
    }

    pub fn is_reading_error(&self) -> bool {
        self.flags.reading_error()
    }

    pub fn is_reading_ended(&self) -> bool {
        self.flags.reading_ended()
    }

    pub fn is_writing_error(&self) -> bool {
        self.flags.writing_error()
    }

    pub fn is_writing_ended(&self) -> bool {
        self.flags.writing_ended.load(Ordering::Acquire)
    }

    /// Feeds bytes through the read conversion into the converted buffer.
    ///
    /// This works on a closed filter too: the bytes are still buffered and
    /// the call still succeeds, it simply will not be served to anyone.
    pub fn add_read_data(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }
        let mut out = Vec::new();
        let ok = self.hooks.lock().unwrap().filter_read(data, &mut out);
        if !ok {
            return false;
        }
        if !out.is_empty() {
            self.read_state.lock().unwrap().converted.push(out);
        }
        true
    }

    /// Serves queued read requests from the converted buffer. Must be called
    /// without the read-state lock held; callbacks may re-enter the filter.
    fn process_read_requests(self: &Arc<Self>) {
        loop {
            let (request, size, code) = {
                let mut state = self.read_state.lock().unwrap();
                if state.converted.is_empty() {
                    return;
                }
                let Some(request) = state.requests.pop_front() else {
                    return;
                };
                if request.is_finished() {
                    continue;
                }
                let popped = request.with_buf(|buf| state.converted.pop(buf));
                let Some(size) = popped else { continue };
                let code = if state.converted.is_empty() {
                    if self.flags.reading_ended() {
                        StreamResultCode::Ended
                    } else if self.flags.reading_error() {
                        StreamResultCode::Unknown
                    } else {
                        StreamResultCode::Success
                    }
                } else {
                    StreamResultCode::Success
                };
                (request, size, code)
            };
            request.run_callback(Some(&**self), size, code);
        }
    }

    /// Issues one background source read when requests are waiting and no
    /// read is in flight.
    fn read_from_source(self: &Arc<Self>) -> bool {
        let source = self.source.lock().unwrap().clone();
        let Some(source) = source else { return false };
        if self.flags.reading_ended() || self.flags.reading_error() {
            return false;
        }

        self.process_read_requests();

        let buffer = {
            let mut state = self.read_state.lock().unwrap();
            if state.requests.is_empty() {
                return true;
            }
            if state.reading {
                return true;
            }
            state.reading = true;
            let size = state.buffer_size;
            let mut buffer = state.buffer.take().unwrap_or_default();
            buffer.resize(size, 0);
            buffer
        };

        let weak = self.this.clone();
        source.read(
            buffer,
            Box::new(move |result| {
                if let Some(filter) = weak.upgrade() {
                    filter.on_source_read(result);
                }
            }),
            None,
        );
        true
    }

    fn on_source_read(self: &Arc<Self>, result: StreamResult) {
        self.read_state.lock().unwrap().reading = false;
        self.hooks.lock().unwrap().on_source_result(result.code);
        if !self.flags.is_open() {
            return;
        }

        if result.size > 0 {
            self.add_read_data(result.data());
        }
        let source_error = result.is_error();
        if source_error {
            self.flags.set_reading_error();
        } else if result.is_ended() {
            self.flags.set_reading_ended();
        }
        {
            let mut state = self.read_state.lock().unwrap();
            let mut buffer = result.into_buffer();
            buffer.clear();
            state.buffer = Some(buffer);
        }

        self.process_read_requests();

        if self.flags.reading_error() {
            self.fail_read_requests();
        } else {
            let pending = !self.read_state.lock().unwrap().requests.is_empty();
            if pending {
                self.read_from_source();
            }
        }

        if source_error {
            self.hooks.lock().unwrap().on_source_error();
        }
    }

    fn fail_read_requests(self: &Arc<Self>) {
        loop {
            let request = self.read_state.lock().unwrap().requests.pop_front();
            let Some(request) = request else { break };
            request.run_callback(Some(&**self), 0, StreamResultCode::Closed);
        }
    }

    fn request_read(self: &Arc<Self>, request: &Arc<StreamRequest>) -> bool {
        if !self.flags.is_open() {
            return false;
        }
        self.read_state.lock().unwrap().requests.push_back(request.clone());
        if self.flags.reading_ended() {
            return false;
        }
        self.read_from_source()
    }

    fn request_write(self: &Arc<Self>, request: &Arc<StreamRequest>) -> bool {
        let source = self.source.lock().unwrap().clone();
        let Some(source) = source else { return false };
        if !self.flags.is_open() || self.flags.writing_error() {
            return false;
        }

        let conversion = request.with_buf(|buf| {
            if buf.is_empty() {
                None
            } else {
                Some((self.hooks.lock().unwrap().filter_write(buf), buf.len()))
            }
        });
        match conversion {
            // Finished request; nothing to deliver.
            None => true,
            Some(None) => source.request_io(request),
            Some(Some((FilterWrite::Unchanged, _))) => source.request_io(request),
            Some(Some((FilterWrite::Error, _))) => false,
            Some(Some((FilterWrite::Converted(converted), original_len))) => {
                let user_request = request.clone();
                let weak = self.this.clone();
                source.write(
                    converted,
                    Box::new(move |result| {
                        let Some(filter) = weak.upgrade() else { return };
                        if !result.is_success() {
                            filter.flags.set_writing_error();
                        }
                        let code = if filter.flags.writing_error() {
                            StreamResultCode::Unknown
                        } else {
                            StreamResultCode::Success
                        };
                        user_request.run_callback(Some(&*filter), original_len, code);
                    }),
                    None,
                );
                true
            }
        }
    }
}

impl AsyncStream for StreamFilter {
    fn request_io(&self, request: &Arc<StreamRequest>) -> bool {
        let Some(this) = self.this.upgrade() else { return false };
        if request.is_read() {
            this.request_read(request)
        } else {
            this.request_write(request)
        }
    }

    fn close(&self) {
        if !self.flags.open.swap(false, Ordering::AcqRel) {
            return;
        }
        self.flags.set_reading_ended();
        self.flags.writing_ended.store(true, Ordering::Release);
        *self.source.lock().unwrap() = None;
        if let Some(this) = self.this.upgrade() {
            this.fail_read_requests();
        }
    }

    fn is_open(&self) -> bool {
        self.flags.is_open()
    }

    fn add_task(&self, task: Task) -> bool {
        match self.source.lock().unwrap().clone() {
            Some(source) => source.add_task(task),
            None => false,
        }
    }

    fn dispatch(&self, task: Task, delay: Duration) -> bool {
        match self.source.lock().unwrap().clone() {
            Some(source) => source.dispatch(task, delay),
            None => false,
        }
    }

    fn stream_ref(&self) -> Weak<dyn AsyncStream> {
        self.this.clone()
    }

    fn last_result_code(&self) -> StreamResultCode {
        self.last_code.get()
    }

    fn set_last_result_code(&self, code: StreamResultCode) {
        self.last_code.set(code);
    }
}
