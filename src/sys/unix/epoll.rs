use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{cmp, io};

use crate::event::EventDesc;
use crate::io_mode::IoMode;
use crate::token::Token;

/// Readiness driver backed by `epoll`.
///
/// Instances are registered edge-triggered; a would-block result parks the
/// pending request and the next edge resumes it.
#[derive(Debug)]
pub(crate) struct Selector {
    ep: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let ep = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Selector { ep })
    }

    pub fn register(&self, fd: RawFd, token: Token, mode: IoMode) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: mode_to_epoll(mode),
            u64: token.0 as u64,
        };
        syscall!(epoll_ctl(self.ep, libc::EPOLL_CTL_ADD, fd, &mut event)).map(|_| ())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        // Linux < 2.6.9 required a non-null event argument for EPOLL_CTL_DEL.
        let mut event = libc::epoll_event { events: 0, u64: 0 };
        syscall!(epoll_ctl(self.ep, libc::EPOLL_CTL_DEL, fd, &mut event)).map(|_| ())
    }

    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timeout_ms = timeout
            .map(|to| cmp::min(millis(to), i32::MAX as u64) as i32)
            .unwrap_or(-1);

        events.inner.clear();
        let n = syscall!(epoll_wait(
            self.ep,
            events.inner.as_mut_ptr(),
            events.inner.capacity() as i32,
            timeout_ms,
        ))?;
        unsafe { events.inner.set_len(n as usize) };
        Ok(())
    }
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.ep
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        let _ = syscall!(close(self.ep));
    }
}

fn mode_to_epoll(mode: IoMode) -> u32 {
    let mut kind = libc::EPOLLET | libc::EPOLLRDHUP;
    if mode.is_input() {
        kind |= libc::EPOLLIN | libc::EPOLLPRI;
    }
    if mode.is_output() {
        kind |= libc::EPOLLOUT;
    }
    kind as u32
}

pub(crate) struct Events {
    inner: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Token, EventDesc)> + '_ {
        self.inner.iter().map(|event| {
            let flags = event.events as libc::c_int;
            let desc = EventDesc {
                // A hang-up still needs a read attempt so the instance can
                // observe EOF or the pending socket error.
                readable: flags & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP | libc::EPOLLHUP)
                    != 0,
                writable: flags & libc::EPOLLOUT != 0,
                error: flags & libc::EPOLLERR != 0,
            };
            (Token(event.u64 as usize), desc)
        })
    }
}

const NANOS_PER_MILLI: u64 = 1_000_000;
const MILLIS_PER_SEC: u64 = 1_000;

/// Convert a `Duration` to milliseconds, rounding up and saturating at
/// `u64::MAX`.
fn millis(duration: Duration) -> u64 {
    let millis = (u64::from(duration.subsec_nanos()) + NANOS_PER_MILLI - 1) / NANOS_PER_MILLI;
    duration
        .as_secs()
        .saturating_mul(MILLIS_PER_SEC)
        .saturating_add(millis)
}
