use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;
use std::{io, mem, ptr};

use crate::event::EventDesc;
use crate::io_mode::IoMode;
use crate::token::Token;

/// Readiness driver backed by `kqueue`.
#[derive(Debug)]
pub(crate) struct Selector {
    kq: RawFd,
}

impl Selector {
    pub fn new() -> io::Result<Selector> {
        let kq = syscall!(kqueue())?;
        syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC))?;
        Ok(Selector { kq })
    }

    pub fn register(&self, fd: RawFd, token: Token, mode: IoMode) -> io::Result<()> {
        let mut changes: Vec<libc::kevent> = Vec::with_capacity(2);
        if mode.is_input() {
            changes.push(kevent(fd, libc::EVFILT_READ, libc::EV_ADD | libc::EV_CLEAR, token));
        }
        if mode.is_output() {
            changes.push(kevent(fd, libc::EVFILT_WRITE, libc::EV_ADD | libc::EV_CLEAR, token));
        }
        if changes.is_empty() {
            return Ok(());
        }
        syscall!(kevent(
            self.kq,
            changes.as_ptr(),
            changes.len() as _,
            ptr::null_mut(),
            0,
            ptr::null(),
        ))
        .map(|_| ())
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        // Remove both filters; a missing one reports ENOENT which is fine.
        let changes = [
            kevent(fd, libc::EVFILT_READ, libc::EV_DELETE, Token(0)),
            kevent(fd, libc::EVFILT_WRITE, libc::EV_DELETE, Token(0)),
        ];
        let _ = syscall!(kevent(
            self.kq,
            changes.as_ptr(),
            changes.len() as _,
            ptr::null_mut(),
            0,
            ptr::null(),
        ));
        Ok(())
    }

    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        let timespec = timeout.map(|to| libc::timespec {
            tv_sec: cmp_min_secs(to),
            tv_nsec: libc::c_long::from(to.subsec_nanos() as i32),
        });
        let timespec_ptr = timespec
            .as_ref()
            .map(|ts| ts as *const libc::timespec)
            .unwrap_or(ptr::null());

        events.inner.clear();
        let n = syscall!(kevent(
            self.kq,
            ptr::null(),
            0,
            events.inner.as_mut_ptr(),
            events.inner.capacity() as _,
            timespec_ptr,
        ))?;
        unsafe { events.inner.set_len(n as usize) };
        Ok(())
    }
}

fn cmp_min_secs(to: Duration) -> libc::time_t {
    if to.as_secs() > libc::time_t::MAX as u64 {
        libc::time_t::MAX
    } else {
        to.as_secs() as libc::time_t
    }
}

fn kevent(fd: RawFd, filter: i16, flags: u16, token: Token) -> libc::kevent {
    let mut ev: libc::kevent = unsafe { mem::zeroed() };
    ev.ident = fd as libc::uintptr_t;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev.udata = token.0 as _;
    ev
}

impl AsRawFd for Selector {
    fn as_raw_fd(&self) -> RawFd {
        self.kq
    }
}

impl Drop for Selector {
    fn drop(&mut self) {
        let _ = syscall!(close(self.kq));
    }
}

pub(crate) struct Events {
    inner: Vec<libc::kevent>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Token, EventDesc)> + '_ {
        self.inner.iter().map(|event| {
            let filter = event.filter as i16;
            let desc = EventDesc {
                readable: filter == libc::EVFILT_READ as i16
                    || event.flags as u16 & libc::EV_EOF as u16 != 0,
                writable: filter == libc::EVFILT_WRITE as i16,
                error: event.flags as u16 & libc::EV_ERROR as u16 != 0,
            };
            (Token(event.udata as usize), desc)
        })
    }
}
