#[cfg(any(target_os = "linux", target_os = "android", target_os = "illumos"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android", target_os = "illumos"))]
pub(crate) use self::epoll::{Events, Selector};

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub(crate) use self::kqueue::{Events, Selector};

mod waker;
pub(crate) use self::waker::Waker;

pub(crate) mod net;
pub(crate) mod pktinfo;

/// Native handle an instance is registered under: a plain file descriptor.
pub(crate) type Handle = std::os::unix::io::RawFd;

pub(crate) const INVALID_HANDLE: Handle = -1;

pub(crate) fn close_handle(handle: Handle) {
    let _ = syscall!(close(handle));
}
