use std::io;
use std::mem::MaybeUninit;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle, RawHandle};
use std::time::Duration;

use windows_sys::Win32::Foundation::{
    HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT,
};
use windows_sys::Win32::System::Threading::INFINITE;
use windows_sys::Win32::System::IO::{
    CreateIoCompletionPort, GetQueuedCompletionStatusEx, OVERLAPPED_ENTRY,
};

use crate::event::EventDesc;
use crate::io_mode::IoMode;
use crate::token::Token;

use super::Handle;

/// Completion driver backed by an I/O completion port.
///
/// Instances associate their handle with the port using their token as the
/// completion key; every dequeued packet carries that key plus the
/// `OVERLAPPED` pointer of the operation it completes.
#[derive(Debug)]
pub(crate) struct Selector {
    port: OwnedHandle,
}

unsafe impl Send for Selector {}
unsafe impl Sync for Selector {}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, 0 as HANDLE, 0, 1) };
        if port.is_null() {
            return Err(io::Error::last_os_error());
        }
        let port = unsafe { OwnedHandle::from_raw_handle(port as RawHandle) };
        Ok(Selector { port })
    }

    pub(crate) fn port(&self) -> HANDLE {
        self.port.as_raw_handle() as HANDLE
    }

    pub fn register(&self, handle: Handle, token: Token, _mode: IoMode) -> io::Result<()> {
        let res = unsafe {
            CreateIoCompletionPort(handle as HANDLE, self.port(), token.0, 0)
        };
        if res.is_null() {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn deregister(&self, _handle: Handle) -> io::Result<()> {
        // A handle cannot be detached from a completion port; closing it is
        // what stops further packets.
        Ok(())
    }

    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout
            .map(|to| {
                // Round up so a short timeout never becomes a busy spin.
                let ms = to.as_millis() + u128::from(to.subsec_nanos() % 1_000_000 != 0);
                ms.min(u128::from(INFINITE - 1)) as u32
            })
            .unwrap_or(INFINITE);

        events.len = 0;
        let mut removed: u32 = 0;
        let ok = unsafe {
            GetQueuedCompletionStatusEx(
                self.port(),
                events.entries.as_mut_ptr() as *mut OVERLAPPED_ENTRY,
                events.entries.len() as u32,
                &mut removed,
                timeout_ms,
                0,
            )
        };
        if ok == 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(WAIT_TIMEOUT as i32) {
                return Ok(());
            }
            return Err(err);
        }
        events.len = removed as usize;
        Ok(())
    }
}

pub(crate) struct Events {
    entries: Box<[MaybeUninit<OVERLAPPED_ENTRY>]>,
    len: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            entries: vec![MaybeUninit::uninit(); capacity].into_boxed_slice(),
            len: 0,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Token, EventDesc)> + '_ {
        self.entries[..self.len].iter().map(|entry| {
            let entry = unsafe { entry.assume_init_ref() };
            let desc = EventDesc {
                readable: false,
                writable: false,
                error: false,
                overlapped: entry.lpOverlapped as *mut core::ffi::c_void,
                bytes: entry.dwNumberOfBytesTransferred,
            };
            (Token(entry.lpCompletionKey), desc)
        })
    }
}
