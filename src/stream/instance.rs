use std::sync::{Arc, Mutex, Weak};

use super::{AsyncStream, StreamRequest, StreamResultCode};

/// The two per-instance request holders plus the parked in-flight requests.
///
/// `install` admits at most one live request per direction; the driver moves
/// a request out with `next_read`/`next_write` when it attempts the syscall
/// and parks it back if the OS reports would-block (POSIX) or pending
/// (Windows). Parked requests are resumed before freshly installed ones.
pub(crate) struct StreamSlots {
    read: Mutex<Option<Arc<StreamRequest>>>,
    write: Mutex<Option<Arc<StreamRequest>>>,
    parked_read: Mutex<Option<Arc<StreamRequest>>>,
    parked_write: Mutex<Option<Arc<StreamRequest>>>,
    object: Mutex<Option<Weak<dyn AsyncStream>>>,
}

impl StreamSlots {
    pub fn new() -> StreamSlots {
        StreamSlots {
            read: Mutex::new(None),
            write: Mutex::new(None),
            parked_read: Mutex::new(None),
            parked_write: Mutex::new(None),
            object: Mutex::new(None),
        }
    }

    /// Stores the request in its direction's slot if the slot is empty.
    pub fn install(&self, request: &Arc<StreamRequest>) -> bool {
        let slot = if request.is_read() { &self.read } else { &self.write };
        let mut guard = slot.lock().unwrap();
        if guard.is_some() {
            false
        } else {
            *guard = Some(request.clone());
            true
        }
    }

    /// Next read request to drive: the parked one first, then the slot.
    pub fn next_read(&self) -> Option<Arc<StreamRequest>> {
        let parked = self.parked_read.lock().unwrap().take();
        parked.or_else(|| self.read.lock().unwrap().take())
    }

    pub fn next_write(&self) -> Option<Arc<StreamRequest>> {
        let parked = self.parked_write.lock().unwrap().take();
        parked.or_else(|| self.write.lock().unwrap().take())
    }

    /// Windows: resume the in-flight (parked) request a completion packet
    /// belongs to, leaving freshly installed requests for the order phase.
    #[cfg(windows)]
    pub fn next_read_parked_only(&self) -> Option<Arc<StreamRequest>> {
        self.parked_read.lock().unwrap().take()
    }

    #[cfg(windows)]
    pub fn next_write_parked_only(&self) -> Option<Arc<StreamRequest>> {
        self.parked_write.lock().unwrap().take()
    }

    /// Windows: take the installed request only when no operation is pending
    /// on the direction's embedded `OVERLAPPED`.
    #[cfg(windows)]
    pub fn take_read_if_unparked(&self) -> Option<Arc<StreamRequest>> {
        if self.parked_read.lock().unwrap().is_some() {
            return None;
        }
        self.read.lock().unwrap().take()
    }

    #[cfg(windows)]
    pub fn take_write_if_unparked(&self) -> Option<Arc<StreamRequest>> {
        if self.parked_write.lock().unwrap().is_some() {
            return None;
        }
        self.write.lock().unwrap().take()
    }

    pub fn park(&self, request: Arc<StreamRequest>) {
        let slot = if request.is_read() {
            &self.parked_read
        } else {
            &self.parked_write
        };
        *slot.lock().unwrap() = Some(request);
    }

    /// Links the slots back to the user-facing stream so results can carry
    /// it and fully requests can re-issue.
    pub fn set_object(&self, object: Weak<dyn AsyncStream>) {
        *self.object.lock().unwrap() = Some(object);
    }

    pub fn object(&self) -> Option<Arc<dyn AsyncStream>> {
        self.object.lock().unwrap().as_ref()?.upgrade()
    }

    /// Delivers one result through the owning stream; if the stream is
    /// already gone the request resolves `Closed`.
    pub fn process_result(&self, request: &Arc<StreamRequest>, size: usize, code: StreamResultCode) {
        match self.object() {
            Some(object) => request.run_callback(Some(&*object), size, code),
            None => request.run_callback(None, 0, StreamResultCode::Closed),
        }
    }

    /// Close sweep: every held request resolves `Closed` exactly once.
    pub fn close_all(&self) {
        let object = self.object();
        let stream = object.as_deref();
        for slot in [&self.parked_read, &self.read, &self.parked_write, &self.write] {
            let request = slot.lock().unwrap().take();
            if let Some(request) = request {
                request.run_callback(stream, 0, StreamResultCode::Closed);
            }
        }
    }
}
