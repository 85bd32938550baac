use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::event::EventDesc;
use crate::io_loop::IoLoop;
use crate::io_mode::IoMode;
use crate::sys;
use crate::token::Token;

/// Driver-side state of one OS handle registered with a loop.
///
/// Implementations receive `on_order` when the loop visits them from the
/// order queue, `on_event` for every readiness/completion event and
/// `on_close` exactly once from the close sweep. All three run on the loop
/// thread.
pub(crate) trait IoInstance: Send + Sync + 'static {
    fn state(&self) -> &InstanceState;

    fn on_order(&self);

    fn on_event(&self, event: &EventDesc);

    fn on_close(&self);
}

/// Fields shared by every instance: the native handle, the registration
/// mode, the closing/ordering flags and the binding to the owning loop.
pub(crate) struct InstanceState {
    raw: AtomicI64,
    mode: IoMode,
    token: AtomicUsize,
    closing: AtomicBool,
    ordering: Mutex<bool>,
    binding: Mutex<Binding>,
}

struct Binding {
    io_loop: Weak<IoLoop>,
    this: Option<Weak<dyn IoInstance>>,
}

impl InstanceState {
    pub fn new(handle: sys::Handle, mode: IoMode) -> InstanceState {
        InstanceState {
            raw: AtomicI64::new(handle as i64),
            mode,
            token: AtomicUsize::new(usize::MAX),
            closing: AtomicBool::new(false),
            ordering: Mutex::new(false),
            binding: Mutex::new(Binding {
                io_loop: Weak::new(),
                this: None,
            }),
        }
    }

    pub fn handle(&self) -> sys::Handle {
        self.raw.load(Ordering::Acquire) as sys::Handle
    }

    pub fn is_open(&self) -> bool {
        self.raw.load(Ordering::Acquire) as sys::Handle != sys::INVALID_HANDLE
    }

    /// Invalidates the handle and returns the previous value; the caller is
    /// responsible for actually closing it.
    pub fn take_handle(&self) -> sys::Handle {
        self.raw.swap(sys::INVALID_HANDLE as i64, Ordering::AcqRel) as sys::Handle
    }

    pub fn mode(&self) -> IoMode {
        self.mode
    }

    pub fn token(&self) -> Token {
        Token(self.token.load(Ordering::Acquire))
    }

    pub fn set_token(&self, token: Token) {
        self.token.store(token.0, Ordering::Release);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Marks the instance closing; returns `true` if it already was.
    pub fn set_closing(&self) -> bool {
        self.closing.swap(true, Ordering::AcqRel)
    }

    pub fn bind(&self, io_loop: &Arc<IoLoop>, this: Weak<dyn IoInstance>) {
        let mut binding = self.binding.lock().unwrap();
        binding.io_loop = Arc::downgrade(io_loop);
        binding.this = Some(this);
    }

    pub fn io_loop(&self) -> Option<Arc<IoLoop>> {
        self.binding.lock().unwrap().io_loop.upgrade()
    }

    fn this(&self) -> Option<Arc<dyn IoInstance>> {
        self.binding.lock().unwrap().this.as_ref()?.upgrade()
    }

    /// Asks the owning loop to visit this instance before its next wait.
    pub fn request_order(&self) {
        if let (Some(io_loop), Some(this)) = (self.io_loop(), self.this()) {
            io_loop.request_order(&this);
        }
    }

    /// Sets the ordering flag; returns `true` when the caller must enqueue
    /// the instance (it was not queued yet).
    pub(crate) fn begin_ordering(&self) -> bool {
        let mut ordering = self.ordering.lock().unwrap();
        if *ordering {
            false
        } else {
            *ordering = true;
            true
        }
    }

    /// Cleared before `on_order` runs so a fresh order request from inside
    /// the callback re-enqueues the instance.
    pub(crate) fn clear_ordering(&self) {
        *self.ordering.lock().unwrap() = false;
    }
}
