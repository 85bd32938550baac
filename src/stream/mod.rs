//! The asynchronous byte-stream contract.
//!
//! A stream accepts at most one in-flight read and one in-flight write
//! request at a time; issuing a second one in either direction while the
//! first is alive fails synchronously. Results are delivered through the
//! request's callback exactly once, on the thread that drives the stream
//! (the loop thread, or the dispatcher thread for simulated streams).

mod instance;
mod request;

pub(crate) use self::instance::StreamSlots;
pub use self::request::{Direction, StreamCallback, StreamRequest};

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::io_loop::Task;

/// Terminal code delivered with every request result.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum StreamResultCode {
    /// A non-zero transfer occurred, or a zero-byte request completed.
    Success = 0,
    /// Peer-initiated EOF on the read side.
    Ended = 1,
    /// The stream was closed locally while the request was outstanding.
    Closed = 2,
    /// The per-request deadline fired before completion.
    Timeout = 3,
    /// Any other OS error.
    Unknown = 100,
}

impl StreamResultCode {
    fn from_u8(value: u8) -> StreamResultCode {
        match value {
            0 => StreamResultCode::Success,
            1 => StreamResultCode::Ended,
            2 => StreamResultCode::Closed,
            3 => StreamResultCode::Timeout,
            _ => StreamResultCode::Unknown,
        }
    }
}

/// Outcome of one request, handed to its callback.
///
/// Ownership of the request buffer travels with the result; `data()` is the
/// transferred prefix.
#[derive(Debug)]
pub struct StreamResult {
    /// The request's buffer, handed back to the caller.
    pub buffer: Vec<u8>,
    /// Bytes transferred (accumulated for fully requests).
    pub size: usize,
    /// Bytes originally requested.
    pub request_size: usize,
    /// Terminal code.
    pub code: StreamResultCode,
}

impl StreamResult {
    pub fn is_success(&self) -> bool {
        self.code == StreamResultCode::Success
    }

    pub fn is_ended(&self) -> bool {
        self.code == StreamResultCode::Ended
    }

    pub fn is_error(&self) -> bool {
        (self.code as u8) > (StreamResultCode::Ended as u8)
    }

    /// The transferred bytes.
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.size.min(self.buffer.len())]
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }

    pub(crate) fn error(buffer: Vec<u8>, code: StreamResultCode) -> StreamResult {
        let request_size = buffer.len();
        StreamResult {
            buffer,
            size: 0,
            request_size,
            code,
        }
    }
}

/// Last terminal code a stream delivered; embedded by every implementation.
#[derive(Debug)]
pub struct ResultCodeCell(AtomicU8);

impl ResultCodeCell {
    pub fn new() -> ResultCodeCell {
        ResultCodeCell(AtomicU8::new(StreamResultCode::Success as u8))
    }

    pub fn get(&self) -> StreamResultCode {
        StreamResultCode::from_u8(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, code: StreamResultCode) {
        self.0.store(code as u8, Ordering::Relaxed);
    }
}

impl Default for ResultCodeCell {
    fn default() -> ResultCodeCell {
        ResultCodeCell::new()
    }
}

/// Callback receiving an allocated buffer, or `None` on error.
pub type ReadNewCallback = Box<dyn FnOnce(Option<Vec<u8>>) + Send>;

/// Callback receiving the chunk list of a segmented read.
pub type ReadSegmentedCallback = Box<dyn FnOnce(Option<Vec<Vec<u8>>>) + Send>;

/// Polymorphic asynchronous byte stream.
///
/// The required surface is small: enqueue a request, close, and forward
/// closures to whatever thread drives the stream. Everything the callers use
/// day to day (`read`, `read_fully`, `write`, ...) is provided on top.
pub trait AsyncStream: Send + Sync + 'static {
    /// Enqueues the request on the stream's instance. Returns `false` when
    /// the stream is closed or the direction's slot is already occupied.
    fn request_io(&self, request: &Arc<StreamRequest>) -> bool;

    /// Closes the stream. Every outstanding request resolves `Closed`; no
    /// callbacks fire afterwards.
    fn close(&self);

    fn is_open(&self) -> bool;

    /// Runs `task` on the thread that delivers this stream's callbacks.
    fn add_task(&self, task: Task) -> bool;

    /// Runs `task` after `delay` on the delivering thread; used for request
    /// timeouts.
    fn dispatch(&self, task: Task, delay: Duration) -> bool;

    /// Weak self-reference for callbacks that must not keep the stream alive.
    fn stream_ref(&self) -> Weak<dyn AsyncStream>;

    fn last_result_code(&self) -> StreamResultCode;

    fn set_last_result_code(&self, code: StreamResultCode);

    fn is_seekable(&self) -> bool {
        false
    }

    fn seek(&self, _pos: u64) -> bool {
        false
    }

    fn position(&self) -> u64 {
        0
    }

    fn size(&self) -> u64 {
        0
    }

    /// Non-cumulative read: the callback may observe any transfer up to
    /// `buf.len()` bytes. An empty buffer fails synchronously.
    fn read(&self, buf: Vec<u8>, callback: StreamCallback, timeout: Option<Duration>) {
        if buf.is_empty() {
            callback(StreamResult::error(buf, StreamResultCode::Unknown));
            return;
        }
        let request = StreamRequest::new_read(buf, false, callback);
        self.start_request(request, timeout);
    }

    /// Cumulative read: the runtime re-issues against the buffer tail until
    /// the buffer is full or a terminal code occurs, which then delivers the
    /// accumulated prefix.
    fn read_fully(&self, buf: Vec<u8>, callback: StreamCallback, timeout: Option<Duration>) {
        if buf.is_empty() {
            callback(StreamResult::error(buf, StreamResultCode::Unknown));
            return;
        }
        let request = StreamRequest::new_read(buf, true, callback);
        self.start_request(request, timeout);
    }

    /// Allocates `size` bytes and reads fully into them. The callback gets
    /// the buffer truncated to the transferred size, or `None` on error.
    fn read_new(&self, size: usize, callback: ReadNewCallback, timeout: Option<Duration>) {
        if size == 0 {
            callback(None);
            return;
        }
        let buf = vec![0; size];
        self.read_fully(
            buf,
            Box::new(move |result| {
                if result.is_error() {
                    callback(None);
                } else {
                    let size = result.size;
                    let mut buf = result.into_buffer();
                    buf.truncate(size);
                    callback(Some(buf));
                }
            }),
            timeout,
        );
    }

    /// Reads `size` bytes as a chain of `segment`-sized allocations.
    fn read_new_segmented(
        &self,
        size: usize,
        segment: usize,
        callback: ReadSegmentedCallback,
        timeout: Option<Duration>,
    ) {
        if size == 0 || segment == 0 {
            callback(None);
            return;
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        read_segment(self.stream_ref(), size, segment, Vec::new(), deadline, callback);
    }

    /// Writes the whole buffer; partial progress is re-issued internally so
    /// the callback observes either the full size or a terminal code.
    fn write(&self, buf: Vec<u8>, callback: StreamCallback, timeout: Option<Duration>) {
        if buf.is_empty() {
            callback(StreamResult::error(buf, StreamResultCode::Unknown));
            return;
        }
        let request = StreamRequest::new_write(buf, callback);
        self.start_request(request, timeout);
    }

    /// Copies `data` into a private allocation and writes it, so the caller
    /// may reuse its slice immediately.
    fn write_from_slice(&self, data: &[u8], callback: StreamCallback, timeout: Option<Duration>) {
        self.write(data.to_vec(), callback, timeout);
    }

    /// Arms the optional timeout and enqueues the request, delivering a
    /// synchronous error result if either step is refused.
    fn start_request(&self, request: Arc<StreamRequest>, timeout: Option<Duration>) {
        if let Some(delay) = timeout {
            let weak_request = Arc::downgrade(&request);
            let weak_stream = self.stream_ref();
            let armed = self.dispatch(
                Box::new(move || {
                    if let Some(request) = weak_request.upgrade() {
                        let stream = weak_stream.upgrade();
                        request.run_callback(stream.as_deref(), 0, StreamResultCode::Timeout);
                    }
                }),
                delay,
            );
            if !armed {
                request.run_callback(None, 0, StreamResultCode::Unknown);
                return;
            }
        }
        if !self.request_io(&request) {
            request.run_callback(None, 0, StreamResultCode::Unknown);
        }
    }
}

fn read_segment(
    stream: Weak<dyn AsyncStream>,
    remaining: usize,
    segment: usize,
    mut chunks: Vec<Vec<u8>>,
    deadline: Option<Instant>,
    callback: ReadSegmentedCallback,
) {
    let Some(strong) = stream.upgrade() else {
        callback(None);
        return;
    };
    let timeout = match deadline {
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                callback(None);
                return;
            }
            Some(deadline - now)
        }
        None => None,
    };
    let want = remaining.min(segment);
    let next_stream = stream.clone();
    strong.read_new(
        want,
        Box::new(move |chunk| match chunk {
            Some(chunk) if !chunk.is_empty() => {
                let got = chunk.len();
                chunks.push(chunk);
                if got >= remaining {
                    callback(Some(chunks));
                } else {
                    read_segment(
                        next_stream,
                        remaining - got,
                        segment,
                        chunks,
                        deadline,
                        callback,
                    );
                }
            }
            _ => callback(None),
        }),
        timeout,
    );
}
