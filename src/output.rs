//! Composed response emission: in-memory chunks interleaved with zero-copy
//! stream bodies.

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::buffer::MemoryQueue;
use crate::copy::{Copier, CopyOptions};
use crate::fs::{open_stream, OpenMode};
use crate::io_loop::IoLoop;
use crate::stream::{AsyncStream, StreamResult};

/// One unit of queued output: an optional header (byte chunks) followed by
/// an optional body (a stream of declared length).
pub(crate) struct OutputElement {
    header: MemoryQueue,
    body: Option<(Arc<dyn AsyncStream>, u64)>,
}

impl OutputElement {
    fn new() -> OutputElement {
        OutputElement {
            header: MemoryQueue::new(),
            body: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.header.is_empty() && self.body.is_none()
    }

    fn has_body(&self) -> bool {
        self.body.is_some()
    }
}

struct OutputState {
    queue: VecDeque<OutputElement>,
    length: u64,
}

/// Queue of output elements with the header/body merge rule: appended bytes
/// join the tail element's header as long as that element has no body yet.
pub struct OutputBuffer {
    state: Mutex<OutputState>,
}

impl OutputBuffer {
    pub fn new() -> OutputBuffer {
        OutputBuffer {
            state: Mutex::new(OutputState {
                queue: VecDeque::new(),
                length: 0,
            }),
        }
    }

    /// Copies `data` into the queue.
    pub fn write(&self, data: &[u8]) -> bool {
        self.write_vec(data.to_vec())
    }

    /// Appends an owned chunk without copying.
    pub fn write_vec(&self, data: Vec<u8>) -> bool {
        if data.is_empty() {
            return false;
        }
        let mut state = self.state.lock().unwrap();
        state.length += data.len() as u64;
        match state.queue.back_mut() {
            Some(element) if !element.has_body() => {
                element.header.push(data);
            }
            _ => {
                let mut element = OutputElement::new();
                element.header.push(data);
                state.queue.push_back(element);
            }
        }
        true
    }

    /// Queues `size` bytes to be pulled from `stream` when writing reaches
    /// this point of the queue.
    pub fn copy_from(&self, stream: &Arc<dyn AsyncStream>, size: u64) -> bool {
        if size == 0 {
            return true;
        }
        let mut state = self.state.lock().unwrap();
        state.length += size;
        match state.queue.back_mut() {
            Some(element) if !element.has_body() => {
                element.body = Some((stream.clone(), size));
            }
            _ => {
                let mut element = OutputElement::new();
                element.body = Some((stream.clone(), size));
                state.queue.push_back(element);
            }
        }
        true
    }

    /// Measures the file and queues its whole content as a body.
    pub fn copy_from_file<P: AsRef<Path>>(&self, path: P, io_loop: Option<&Arc<IoLoop>>) -> bool {
        let Ok(metadata) = std::fs::metadata(path.as_ref()) else {
            return false;
        };
        let size = metadata.len();
        if size == 0 {
            return true;
        }
        match open_stream(path, OpenMode::READ, io_loop) {
            Ok(stream) => self.copy_from(&stream, size),
            Err(_) => false,
        }
    }

    pub fn output_length(&self) -> u64 {
        self.state.lock().unwrap().length
    }

    pub fn clear_output(&self) {
        let mut state = self.state.lock().unwrap();
        state.queue.clear();
        state.length = 0;
    }

    fn pop_element(&self) -> Option<OutputElement> {
        self.state.lock().unwrap().queue.pop_front()
    }

    fn merge_from(&self, other: &OutputBuffer) {
        let mut source = other.state.lock().unwrap();
        let mut state = self.state.lock().unwrap();
        state.length += source.length;
        source.length = 0;
        let drained: Vec<_> = source.queue.drain(..).collect();
        state.queue.extend(drained);
    }
}

impl Default for OutputBuffer {
    fn default() -> OutputBuffer {
        OutputBuffer::new()
    }
}

/// End callback; `true` reports an error.
pub type OutputEndCallback = Box<dyn FnMut(bool) + Send>;

/// Output writer configuration. The buffer settings govern the copy tasks
/// spawned for body elements.
pub struct OutputOptions {
    pub buffer_size: usize,
    pub buffer_count: u32,
    pub on_end: Option<OutputEndCallback>,
}

impl Default for OutputOptions {
    fn default() -> OutputOptions {
        OutputOptions {
            buffer_size: 0x10000,
            buffer_count: 3,
            on_end: None,
        }
    }
}

/// Drains an [`OutputBuffer`] into a target stream.
///
/// Headers funnel through one scratch buffer; body elements each spawn a
/// [`Copier`] straight from their stream to the target, so body bytes are
/// never staged in memory beyond the copy pool.
pub struct Output {
    buffer: OutputBuffer,
    target: Mutex<Option<Arc<dyn AsyncStream>>>,
    element: Mutex<Option<OutputElement>>,
    scratch: Mutex<Option<Vec<u8>>>,
    buffer_size: usize,
    buffer_count: u32,
    writing: AtomicBool,
    step: Mutex<()>,
    closed: AtomicBool,
    copier: Mutex<Option<Arc<Copier>>>,
    on_end: Mutex<Option<OutputEndCallback>>,
    this: Weak<Output>,
}

impl Output {
    pub fn create(target: Arc<dyn AsyncStream>, options: OutputOptions) -> io::Result<Arc<Output>> {
        if options.buffer_size == 0 || options.buffer_count == 0 {
            return Err(io::ErrorKind::InvalidInput.into());
        }
        Ok(Arc::new_cyclic(|this| Output {
            buffer: OutputBuffer::new(),
            target: Mutex::new(Some(target)),
            element: Mutex::new(None),
            scratch: Mutex::new(Some(vec![0; options.buffer_size])),
            buffer_size: options.buffer_size,
            buffer_count: options.buffer_count,
            writing: AtomicBool::new(false),
            step: Mutex::new(()),
            closed: AtomicBool::new(false),
            copier: Mutex::new(None),
            on_end: Mutex::new(options.on_end),
            this: this.clone(),
        }))
    }

    pub fn write(&self, data: &[u8]) -> bool {
        self.buffer.write(data)
    }

    pub fn write_vec(&self, data: Vec<u8>) -> bool {
        self.buffer.write_vec(data)
    }

    pub fn copy_from(&self, stream: &Arc<dyn AsyncStream>, size: u64) -> bool {
        self.buffer.copy_from(stream, size)
    }

    pub fn copy_from_file<P: AsRef<Path>>(&self, path: P, io_loop: Option<&Arc<IoLoop>>) -> bool {
        self.buffer.copy_from_file(path, io_loop)
    }

    /// Folds another buffer's queued elements onto the end of this output.
    pub fn merge_buffer(&self, other: &OutputBuffer) {
        self.buffer.merge_from(other);
    }

    pub fn output_length(&self) -> u64 {
        self.buffer.output_length()
    }

    pub fn is_writing(&self) -> bool {
        self.writing.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let copier = self.copier.lock().unwrap().take();
        if let Some(copier) = copier {
            copier.close();
        }
        *self.target.lock().unwrap() = None;
    }

    /// Starts (or resumes) draining the queue.
    pub fn start_writing(self: &Arc<Self>) {
        self.write_step(false);
    }

    fn write_step(self: &Arc<Self>, from_completion: bool) {
        // One stepper at a time. Synchronous failure callbacks never re-enter
        // this path, so holding the guard across the issue is safe.
        let _step = self.step.lock().unwrap();
        if self.closed.load(Ordering::Acquire) || self.writing.load(Ordering::Acquire) {
            return;
        }

        // Advance to the next non-empty element.
        loop {
            let mut element = self.element.lock().unwrap();
            if let Some(current) = element.as_ref() {
                if current.is_empty() {
                    *element = None;
                } else {
                    break;
                }
            }
            if element.is_none() {
                match self.buffer.pop_element() {
                    Some(next) => *element = Some(next),
                    None => {
                        drop(element);
                        drop(_step);
                        if from_completion {
                            self.deliver_end(false);
                        }
                        return;
                    }
                }
            }
        }

        enum Step {
            WriteHeader(Vec<u8>),
            CopyBody(Arc<dyn AsyncStream>, u64),
            Nothing,
        }

        let step = {
            let mut element = self.element.lock().unwrap();
            let Some(current) = element.as_mut() else {
                return;
            };
            if !current.header.is_empty() {
                let mut scratch = self.scratch.lock().unwrap().take().unwrap_or_default();
                scratch.resize(self.buffer_size, 0);
                let size = current.header.pop(&mut scratch);
                scratch.truncate(size);
                if size > 0 {
                    Step::WriteHeader(scratch)
                } else {
                    Step::Nothing
                }
            } else if let Some((stream, size)) = current.body.take() {
                *element = None;
                Step::CopyBody(stream, size)
            } else {
                Step::Nothing
            }
        };

        // Claim the writing slot under the step guard, then release the
        // guard: the issue below may fail synchronously and re-enter through
        // the end callback.
        if !matches!(step, Step::Nothing) {
            self.writing.store(true, Ordering::Release);
        }
        drop(_step);

        match step {
            Step::Nothing => {}
            Step::WriteHeader(chunk) => {
                let target = self.target.lock().unwrap().clone();
                let Some(target) = target else {
                    self.writing.store(false, Ordering::Release);
                    self.deliver_end(true);
                    return;
                };
                let weak = self.this.clone();
                target.write(
                    chunk,
                    Box::new(move |result| {
                        if let Some(output) = weak.upgrade() {
                            output.on_write_stream(result);
                        }
                    }),
                    None,
                );
            }
            Step::CopyBody(stream, size) => {
                let target = self.target.lock().unwrap().clone();
                let Some(target) = target else {
                    self.writing.store(false, Ordering::Release);
                    self.deliver_end(true);
                    return;
                };
                let weak = self.this.clone();
                let options = CopyOptions {
                    size,
                    buffer_size: self.buffer_size,
                    buffer_count: self.buffer_count,
                    auto_start: true,
                    on_read: None,
                    on_write: None,
                    on_end: Some(Box::new(move |copier, error| {
                        if let Some(output) = weak.upgrade() {
                            output.on_copy_end(copier, error);
                        }
                    })),
                };
                match Copier::create(stream, target, options) {
                    Ok(copier) => {
                        *self.copier.lock().unwrap() = Some(copier);
                    }
                    Err(_) => {
                        self.writing.store(false, Ordering::Release);
                        self.deliver_end(true);
                    }
                }
            }
        }
    }

    fn on_write_stream(self: &Arc<Self>, result: StreamResult) {
        self.writing.store(false, Ordering::Release);
        if !result.is_success() {
            self.deliver_end(true);
            return;
        }
        *self.scratch.lock().unwrap() = Some(result.into_buffer());
        self.write_step(true);
    }

    fn on_copy_end(self: &Arc<Self>, copier: &Copier, error: bool) {
        self.writing.store(false, Ordering::Release);
        if error || !copier.is_completed() {
            self.deliver_end(true);
        } else {
            self.write_step(true);
        }
    }

    fn deliver_end(&self, error: bool) {
        let on_end = self.on_end.lock().unwrap().take();
        if let Some(mut on_end) = on_end {
            on_end(error);
            *self.on_end.lock().unwrap() = Some(on_end);
        }
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::OutputBuffer;

    #[test]
    fn writes_merge_into_tail_header() {
        let buffer = OutputBuffer::new();
        assert!(buffer.write(b"abc"));
        assert!(buffer.write(b"def"));
        assert_eq!(buffer.output_length(), 6);
        let element = buffer.pop_element().unwrap();
        assert_eq!(element.header.merge(), b"abcdef");
        assert!(buffer.pop_element().is_none());
    }

    #[test]
    fn empty_write_is_rejected() {
        let buffer = OutputBuffer::new();
        assert!(!buffer.write(b""));
        assert_eq!(buffer.output_length(), 0);
    }

    #[test]
    fn clear_resets_length() {
        let buffer = OutputBuffer::new();
        buffer.write(b"abc");
        buffer.clear_output();
        assert_eq!(buffer.output_length(), 0);
        assert!(buffer.pop_element().is_none());
    }
}
