//! OS-specific driver code.
//!
//! Each platform provides the same surface: a `Selector` owning the OS
//! multiplexor handle, an `Events` buffer for one wait round, and a `Waker`
//! able to interrupt a wait from any thread. The loop never touches platform
//! APIs directly.

#[cfg(unix)]
pub(crate) mod unix;
#[cfg(unix)]
pub(crate) use self::unix::{Events, Handle, Selector, Waker, INVALID_HANDLE};

#[cfg(windows)]
pub(crate) mod windows;
#[cfg(windows)]
pub(crate) use self::windows::{Events, Handle, Selector, Waker, INVALID_HANDLE};
