use std::mem;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use super::{AsyncStream, StreamResult, StreamResultCode};

/// Callback invoked exactly once with the request's result.
pub type StreamCallback = Box<dyn FnOnce(StreamResult) + Send>;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Read,
    Write,
}

/// One queued I/O operation.
///
/// The request owns its buffer for its whole lifetime; instances borrow the
/// unfilled tail through [`with_buf`] and the result callback receives the
/// buffer back by value. The callback slot doubles as the single-shot guard:
/// whichever of completion, timeout or close takes it first wins, the others
/// become no-ops.
///
/// [`with_buf`]: StreamRequest::with_buf
pub struct StreamRequest {
    direction: Direction,
    state: Mutex<RequestState>,
}

struct RequestState {
    buf: Vec<u8>,
    /// Bytes already transferred across re-issues of a fully request.
    passed: usize,
    fully: bool,
    callback: Option<StreamCallback>,
}

impl StreamRequest {
    pub(crate) fn new_read(buf: Vec<u8>, fully: bool, callback: StreamCallback) -> Arc<StreamRequest> {
        Arc::new(StreamRequest {
            direction: Direction::Read,
            state: Mutex::new(RequestState {
                buf,
                passed: 0,
                fully,
                callback: Some(callback),
            }),
        })
    }

    pub(crate) fn new_write(buf: Vec<u8>, callback: StreamCallback) -> Arc<StreamRequest> {
        Arc::new(StreamRequest {
            direction: Direction::Write,
            state: Mutex::new(RequestState {
                buf,
                passed: 0,
                // Writers expect all-or-error.
                fully: true,
                callback: Some(callback),
            }),
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_read(&self) -> bool {
        self.direction == Direction::Read
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.lock().unwrap().callback.is_none()
    }

    /// Runs `f` over the untransferred tail of the buffer, or returns `None`
    /// when the request already finished (timeout or close won the race).
    pub(crate) fn with_buf<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let mut state = self.state.lock().unwrap();
        if state.callback.is_none() {
            return None;
        }
        let offset = state.passed.min(state.buf.len());
        let buf = &mut state.buf[offset..];
        Some(f(buf))
    }

    /// Delivers a result, honouring fully semantics.
    ///
    /// A non-terminal short transfer on a fully request advances the
    /// accumulator and re-enqueues the request instead of surfacing the
    /// partial result; everything else takes the callback and invokes it with
    /// the accumulated transfer.
    pub(crate) fn run_callback(
        self: &Arc<Self>,
        stream: Option<&dyn AsyncStream>,
        size: usize,
        code: StreamResultCode,
    ) {
        let reissue = {
            let mut state = self.state.lock().unwrap();
            if state.callback.is_none() {
                return;
            }
            if state.fully
                && code == StreamResultCode::Success
                && size > 0
                && stream.is_some()
                && state.passed + size < state.buf.len()
            {
                state.passed += size;
                true
            } else {
                false
            }
        };

        if reissue {
            if let Some(stream) = stream {
                if stream.request_io(self) {
                    return;
                }
                // The slot was taken by a competing request between the
                // take-out and the re-issue. The request stays pending and
                // retries from the stream's thread once the occupant is
                // done; a short transfer must never surface as Success.
                if schedule_reissue(self, stream) {
                    return;
                }
            }
        }

        // A re-issue that could not even be scheduled means the stream is
        // tearing down: the accumulated prefix resolves as a close.
        let deliver_code = if reissue { StreamResultCode::Closed } else { code };

        let (callback, result) = {
            let mut state = self.state.lock().unwrap();
            let Some(callback) = state.callback.take() else {
                return;
            };
            let total = if reissue { state.passed } else { state.passed + size };
            state.passed = 0;
            let buffer = mem::take(&mut state.buf);
            let request_size = buffer.len();
            (
                callback,
                StreamResult {
                    buffer,
                    size: total,
                    request_size,
                    code: deliver_code,
                },
            )
        };

        if let Some(stream) = stream {
            stream.set_last_result_code(deliver_code);
        }
        callback(result);
    }
}

/// Hands a displaced fully re-issue to the stream's thread. Returns `false`
/// when the stream cannot run tasks any more.
fn schedule_reissue(request: &Arc<StreamRequest>, stream: &dyn AsyncStream) -> bool {
    let weak_stream = stream.stream_ref();
    let request = request.clone();
    stream.add_task(Box::new(move || reissue_pending(request, weak_stream)))
}

fn reissue_pending(request: Arc<StreamRequest>, weak_stream: Weak<dyn AsyncStream>) {
    if request.is_finished() {
        return;
    }
    let Some(stream) = weak_stream.upgrade() else {
        request.run_callback(None, 0, StreamResultCode::Closed);
        return;
    };
    if !stream.is_open() {
        request.run_callback(Some(&*stream), 0, StreamResultCode::Closed);
        return;
    }
    if stream.request_io(&request) {
        return;
    }
    // Still occupied; back off a tick so the loop can drive the occupant.
    let retry_request = request.clone();
    let retry_stream = weak_stream.clone();
    let scheduled = stream.dispatch(
        Box::new(move || reissue_pending(retry_request, retry_stream)),
        Duration::from_millis(1),
    );
    if !scheduled {
        request.run_callback(Some(&*stream), 0, StreamResultCode::Closed);
    }
}

impl std::fmt::Debug for StreamRequest {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("StreamRequest")
            .field("direction", &self.direction)
            .finish()
    }
}
