use std::io;
use std::ptr;

use windows_sys::Win32::Foundation::HANDLE;
use windows_sys::Win32::System::IO::PostQueuedCompletionStatus;

use crate::token::WAKE_TOKEN;

use super::Selector;

/// Wake primitive for the completion driver: posts a zero-byte packet keyed
/// with [`WAKE_TOKEN`] and a null `OVERLAPPED`.
#[derive(Debug)]
pub(crate) struct Waker {
    port: HANDLE,
}

unsafe impl Send for Waker {}
unsafe impl Sync for Waker {}

impl Waker {
    pub fn new(selector: &Selector) -> io::Result<Waker> {
        Ok(Waker {
            port: selector.port(),
        })
    }

    pub fn wake(&self) -> io::Result<()> {
        win_call!(PostQueuedCompletionStatus(
            self.port,
            0,
            WAKE_TOKEN.0,
            ptr::null_mut(),
        ))
        .map(|_| ())
    }

    pub fn ack(&self) {
        // Dequeuing the packet is the acknowledgement.
    }
}
