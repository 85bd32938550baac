//! HTTP-oriented readers built on the stream filter.
//!
//! [`HeaderReader`] absorbs bytes until the `\r\n\r\n` boundary, tolerant of
//! the marker being split across arbitrary packet sizes. [`ContentReader`]
//! produces filters that deliver exactly one message body (counted,
//! chunk-decoded or read-to-EOF) and report where the next message begins.

use std::sync::Arc;

use flate2::{Decompress, FlushDecompress, Status};

use crate::buffer::MemoryQueue;
use crate::filter::{FilterFlags, FilterHooks, StreamFilter};
use crate::stream::{AsyncStream, StreamResultCode};

/// Finds the end of an HTTP header block across split reads.
///
/// The last three bytes of every absorbed call are carried so a marker
/// spanning two calls is still detected; the earliest boundary wins.
pub struct HeaderReader {
    last: [u8; 3],
    buffer: MemoryQueue,
}

impl HeaderReader {
    pub fn new() -> HeaderReader {
        HeaderReader {
            last: [0; 3],
            buffer: MemoryQueue::new(),
        }
    }

    /// Absorbs `buf`. On boundary detection returns the position of the first
    /// body byte within `buf`; only the header part is absorbed.
    pub fn add(&mut self, buf: &[u8]) -> Option<usize> {
        if buf.is_empty() {
            return None;
        }

        let mut pos_body = None;
        if self.last == *b"\r\n\r" && buf[0] == b'\n' {
            pos_body = Some(1);
        } else if buf.len() > 1
            && self.last[1] == b'\r'
            && self.last[2] == b'\n'
            && buf[0] == b'\r'
            && buf[1] == b'\n'
        {
            pos_body = Some(2);
        } else if buf.len() > 2
            && self.last[2] == b'\r'
            && buf[0] == b'\n'
            && buf[1] == b'\r'
            && buf[2] == b'\n'
        {
            pos_body = Some(3);
        } else if buf.len() > 3 {
            for (index, window) in buf.windows(4).enumerate() {
                if window == b"\r\n\r\n" {
                    pos_body = Some(index + 4);
                    break;
                }
            }
        }

        match pos_body {
            Some(pos) => {
                self.buffer.push(buf[..pos].to_vec());
                self.last = [0; 3];
                Some(pos)
            }
            None => {
                self.buffer.push(buf.to_vec());
                match buf.len() {
                    1 => {
                        self.last = [self.last[1], self.last[2], buf[0]];
                    }
                    2 => {
                        self.last = [self.last[2], buf[0], buf[1]];
                    }
                    _ => {
                        self.last.copy_from_slice(&buf[buf.len() - 3..]);
                    }
                }
                None
            }
        }
    }

    pub fn header_size(&self) -> usize {
        self.buffer.len()
    }

    /// The absorbed header bytes, terminator included.
    pub fn merge_header(&self) -> Vec<u8> {
        self.buffer.merge()
    }

    pub fn clear(&mut self) {
        self.last = [0; 3];
        self.buffer.clear();
    }
}

impl Default for HeaderReader {
    fn default() -> HeaderReader {
        HeaderReader::new()
    }
}

/// Completion callback of a content reader: the bytes past the message
/// boundary (they belong to the next message) and an error flag.
pub type OnContentComplete = Box<dyn FnOnce(&[u8], bool) + Send>;

/// Streaming zlib inflater applied to reader output when decompression is
/// enabled.
struct Inflater {
    inner: Decompress,
}

impl Inflater {
    fn new() -> Inflater {
        Inflater {
            inner: Decompress::new(true),
        }
    }

    fn pass(&mut self, mut input: &[u8], out: &mut Vec<u8>) -> bool {
        while !input.is_empty() {
            if out.capacity() == out.len() {
                out.reserve(4096);
            }
            let before = self.inner.total_in();
            match self.inner.decompress_vec(input, out, FlushDecompress::None) {
                Ok(Status::StreamEnd) => return true,
                Ok(_) => {
                    let consumed = (self.inner.total_in() - before) as usize;
                    if consumed == 0 && out.capacity() > out.len() {
                        // No progress with room to spare: corrupt input.
                        return false;
                    }
                    input = &input[consumed..];
                }
                Err(_) => return false,
            }
        }
        true
    }
}

/// Shared plumbing of the three reader variants.
struct ReaderCore {
    flags: Arc<FilterFlags>,
    on_complete: Option<OnContentComplete>,
    inflater: Option<Inflater>,
}

impl ReaderCore {
    fn new(flags: Arc<FilterFlags>, on_complete: OnContentComplete, decompress: bool) -> ReaderCore {
        ReaderCore {
            flags,
            on_complete: Some(on_complete),
            inflater: if decompress { Some(Inflater::new()) } else { None },
        }
    }

    fn emit(&mut self, bytes: &[u8], out: &mut Vec<u8>) -> bool {
        match &mut self.inflater {
            Some(inflater) => inflater.pass(bytes, out),
            None => {
                out.extend_from_slice(bytes);
                true
            }
        }
    }

    /// Marks the body complete: later reads drain the converted buffer and
    /// then fail, and the consumer learns where the next message starts.
    fn complete(&mut self, remainder: &[u8], error: bool) {
        self.flags.set_reading_ended();
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(remainder, error);
        }
        self.flags.set_reading_error();
    }

    fn fail(&mut self) {
        self.complete(&[], true);
    }
}

/// Factories for the three content-reader variants. Each returns a
/// [`StreamFilter`] whose reads deliver the decoded body.
pub struct ContentReader;

impl ContentReader {
    /// Body of known length; completes when the count is reached.
    pub fn persistent(
        source: Option<Arc<dyn AsyncStream>>,
        on_complete: OnContentComplete,
        content_length: u64,
        buffer_size: usize,
        decompress: bool,
    ) -> Arc<StreamFilter> {
        let flags = Arc::new(FilterFlags::new());
        let hooks = PersistentReader {
            core: ReaderCore::new(flags.clone(), on_complete, decompress),
            total: content_length,
            read: 0,
        };
        StreamFilter::with_flags(source, Box::new(hooks), flags, buffer_size.max(1))
    }

    /// Chunked-transfer body; completes on the zero-size chunk after the
    /// trailer.
    pub fn chunked(
        source: Option<Arc<dyn AsyncStream>>,
        on_complete: OnContentComplete,
        buffer_size: usize,
        decompress: bool,
    ) -> Arc<StreamFilter> {
        let flags = Arc::new(FilterFlags::new());
        let hooks = ChunkedReader {
            core: ReaderCore::new(flags.clone(), on_complete, decompress),
            state: ChunkState::Size,
            chunk_size: 0,
            chunk_read: 0,
            trailer_len: 0,
        };
        StreamFilter::with_flags(source, Box::new(hooks), flags, buffer_size.max(1))
    }

    /// Pass-through until the source ends.
    pub fn tear_down(
        source: Option<Arc<dyn AsyncStream>>,
        on_complete: OnContentComplete,
        buffer_size: usize,
        decompress: bool,
    ) -> Arc<StreamFilter> {
        let flags = Arc::new(FilterFlags::new());
        let hooks = TearDownReader {
            core: ReaderCore::new(flags.clone(), on_complete, decompress),
        };
        StreamFilter::with_flags(source, Box::new(hooks), flags, buffer_size.max(1))
    }
}

struct PersistentReader {
    core: ReaderCore,
    total: u64,
    read: u64,
}

impl FilterHooks for PersistentReader {
    fn filter_read(&mut self, input: &[u8], out: &mut Vec<u8>) -> bool {
        let remain = self.total - self.read;
        if (input.len() as u64) < remain {
            self.read += input.len() as u64;
            self.core.emit(input, out)
        } else {
            let cut = remain as usize;
            self.read = self.total;
            let ok = self.core.emit(&input[..cut], out);
            self.core.complete(&input[cut..], false);
            ok
        }
    }

    fn on_source_result(&mut self, code: StreamResultCode) {
        if code != StreamResultCode::Success {
            self.core.flags.set_reading_ended();
        }
    }

    fn on_source_error(&mut self) {
        self.core.fail();
    }
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum ChunkState {
    Size,
    Extension,
    SizeLf,
    Data,
    DataLf,
    Trailer,
    TrailerLf,
    Done,
}

struct ChunkedReader {
    core: ReaderCore,
    state: ChunkState,
    chunk_size: u64,
    chunk_read: u64,
    trailer_len: u32,
}

impl FilterHooks for ChunkedReader {
    fn filter_read(&mut self, input: &[u8], out: &mut Vec<u8>) -> bool {
        let mut decoded: Vec<u8> = Vec::new();
        let mut pos = 0;

        while pos < input.len() {
            let byte = input[pos];
            match self.state {
                ChunkState::Size => match hex_value(byte) {
                    Some(value) => {
                        self.chunk_size = (self.chunk_size << 4) | u64::from(value);
                        pos += 1;
                    }
                    None => {
                        self.state = ChunkState::Extension;
                    }
                },
                ChunkState::Extension => {
                    if byte == b'\r' {
                        self.state = ChunkState::SizeLf;
                    }
                    pos += 1;
                }
                ChunkState::SizeLf => {
                    if byte != b'\n' {
                        self.core.fail();
                        return false;
                    }
                    self.state = if self.chunk_size > 0 {
                        ChunkState::Data
                    } else {
                        self.trailer_len = 0;
                        ChunkState::Trailer
                    };
                    pos += 1;
                }
                ChunkState::Data => {
                    if self.chunk_read < self.chunk_size {
                        let run = ((self.chunk_size - self.chunk_read) as usize)
                            .min(input.len() - pos);
                        decoded.extend_from_slice(&input[pos..pos + run]);
                        self.chunk_read += run as u64;
                        pos += run;
                    } else {
                        if byte != b'\r' {
                            self.core.fail();
                            return false;
                        }
                        self.state = ChunkState::DataLf;
                        pos += 1;
                    }
                }
                ChunkState::DataLf => {
                    if byte != b'\n' {
                        self.core.fail();
                        return false;
                    }
                    self.chunk_size = 0;
                    self.chunk_read = 0;
                    self.state = ChunkState::Size;
                    pos += 1;
                }
                ChunkState::Trailer => {
                    if byte == b'\r' {
                        self.state = ChunkState::TrailerLf;
                    } else {
                        self.trailer_len += 1;
                    }
                    pos += 1;
                }
                ChunkState::TrailerLf => {
                    if byte != b'\n' {
                        self.core.fail();
                        return false;
                    }
                    if self.trailer_len > 0 {
                        self.trailer_len = 0;
                        self.state = ChunkState::Trailer;
                        pos += 1;
                    } else {
                        pos += 1;
                        self.state = ChunkState::Done;
                        let ok = self.core.emit(&decoded, out);
                        self.core.complete(&input[pos..], false);
                        return ok;
                    }
                }
                ChunkState::Done => {
                    // Everything past the terminator was already reported.
                    return true;
                }
            }
        }

        self.core.emit(&decoded, out)
    }

    fn on_source_result(&mut self, code: StreamResultCode) {
        if code != StreamResultCode::Success {
            self.core.flags.set_reading_ended();
        }
    }

    fn on_source_error(&mut self) {
        self.core.fail();
    }
}

struct TearDownReader {
    core: ReaderCore,
}

impl FilterHooks for TearDownReader {
    fn filter_read(&mut self, input: &[u8], out: &mut Vec<u8>) -> bool {
        self.core.emit(input, out)
    }

    fn on_source_result(&mut self, code: StreamResultCode) {
        if code != StreamResultCode::Success {
            self.core.flags.set_reading_ended();
        }
    }

    fn on_source_error(&mut self) {
        self.core.fail();
    }
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::HeaderReader;

    #[test]
    fn finds_boundary_in_one_call() {
        let mut reader = HeaderReader::new();
        let pos = reader.add(b"GET / HTTP/1.1\r\nHost: x\r\n\r\nBODY");
        assert_eq!(pos, Some(27));
        assert_eq!(reader.header_size(), 27);
        assert!(reader.merge_header().ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn finds_boundary_split_across_calls() {
        for split in 1..7 {
            let full = b"A: b\r\n\r\nrest".to_vec();
            let mut reader = HeaderReader::new();
            let first = reader.add(&full[..split]);
            if let Some(pos) = first {
                assert_eq!(pos, 8);
                continue;
            }
            let second = reader.add(&full[split..]);
            let pos = second.expect("boundary must be found in the second call");
            assert_eq!(split + pos, 8, "split at {}", split);
        }
    }

    #[test]
    fn no_false_positive_on_bare_crlf() {
        let mut reader = HeaderReader::new();
        assert_eq!(reader.add(b"a\r\nb\r\nc"), None);
        assert_eq!(reader.header_size(), 7);
    }

    #[test]
    fn clear_resets_carry() {
        let mut reader = HeaderReader::new();
        assert_eq!(reader.add(b"x\r\n\r"), None);
        reader.clear();
        assert_eq!(reader.add(b"\ny"), None);
    }
}
