mod selector;
pub(crate) use self::selector::{Events, Selector};

mod waker;
pub(crate) use self::waker::Waker;

pub(crate) mod net;

/// Native handle an instance is registered under. Both `HANDLE` and `SOCKET`
/// fit; the sign matches `INVALID_HANDLE_VALUE` / `INVALID_SOCKET`.
pub(crate) type Handle = isize;

pub(crate) const INVALID_HANDLE: Handle = -1;

pub(crate) fn close_handle(handle: Handle) {
    use windows_sys::Win32::Foundation::CloseHandle;
    unsafe {
        CloseHandle(handle as _);
    }
}
