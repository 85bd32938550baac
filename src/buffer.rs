/// Chunked byte queue with partial pops.
///
/// Used wherever converted or staged bytes wait for a consumer: the filter's
/// converted-read buffer, output-element headers, the header reader. Chunks
/// are kept as pushed; `pop` crosses chunk boundaries and remembers the
/// offset into a partially consumed head chunk.
#[derive(Default)]
pub struct MemoryQueue {
    chunks: std::collections::VecDeque<(Vec<u8>, usize)>,
    size: usize,
}

impl MemoryQueue {
    pub fn new() -> MemoryQueue {
        MemoryQueue::default()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn push(&mut self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        self.size += chunk.len();
        self.chunks.push_back((chunk, 0));
    }

    /// Copies up to `dst.len()` bytes out of the queue, returning the count.
    pub fn pop(&mut self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        while copied < dst.len() {
            let Some((chunk, offset)) = self.chunks.front_mut() else { break };
            let available = chunk.len() - *offset;
            let take = available.min(dst.len() - copied);
            dst[copied..copied + take].copy_from_slice(&chunk[*offset..*offset + take]);
            copied += take;
            *offset += take;
            if *offset == chunk.len() {
                self.chunks.pop_front();
            }
        }
        self.size -= copied;
        copied
    }

    /// Concatenates the remaining content without consuming it.
    pub fn merge(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size);
        for (chunk, offset) in &self.chunks {
            out.extend_from_slice(&chunk[*offset..]);
        }
        out
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.size = 0;
    }
}

impl std::fmt::Debug for MemoryQueue {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("MemoryQueue").field("size", &self.size).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryQueue;

    #[test]
    fn pop_crosses_chunks() {
        let mut queue = MemoryQueue::new();
        queue.push(b"hello ".to_vec());
        queue.push(b"world".to_vec());
        assert_eq!(queue.len(), 11);

        let mut buf = [0; 8];
        assert_eq!(queue.pop(&mut buf), 8);
        assert_eq!(&buf, b"hello wo");
        assert_eq!(queue.len(), 3);

        let mut rest = [0; 8];
        assert_eq!(queue.pop(&mut rest), 3);
        assert_eq!(&rest[..3], b"rld");
        assert!(queue.is_empty());
    }

    #[test]
    fn merge_respects_partial_consumption() {
        let mut queue = MemoryQueue::new();
        queue.push(b"abcdef".to_vec());
        let mut buf = [0; 2];
        queue.pop(&mut buf);
        assert_eq!(queue.merge(), b"cdef");
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn empty_chunks_are_dropped() {
        let mut queue = MemoryQueue::new();
        queue.push(Vec::new());
        assert!(queue.is_empty());
        let mut buf = [0; 4];
        assert_eq!(queue.pop(&mut buf), 0);
    }
}
