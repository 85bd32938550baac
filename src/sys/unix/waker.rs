use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd};

use crate::io_mode::IoMode;
use crate::token::WAKE_TOKEN;

use super::Selector;

/// Out-of-band wake primitive, registered with the selector under
/// [`WAKE_TOKEN`].
///
/// On Linux this is an `eventfd`: an 64 bit counter where every 8-byte write
/// adds to the count and a read resets it. Elsewhere a non-blocking pipe is
/// used; `wake` writes one byte and `ack` drains whatever accumulated.
#[derive(Debug)]
pub(crate) struct Waker {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fd: File,
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    sender: File,
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    receiver: File,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Waker {
    pub fn new(selector: &Selector) -> io::Result<Waker> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;
        let file = unsafe { File::from_raw_fd(fd) };
        selector.register(fd, WAKE_TOKEN, IoMode::In)?;
        Ok(Waker { fd: file })
    }

    #[allow(clippy::unused_io_amount)] // Writes of 8 bytes never split.
    pub fn wake(&self) -> io::Result<()> {
        let buf: [u8; 8] = 1u64.to_ne_bytes();
        match (&self.fd).write(&buf) {
            Ok(_) => Ok(()),
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                // Writing only blocks if the counter is about to overflow.
                self.ack();
                self.wake()
            }
            Err(err) => Err(err),
        }
    }

    pub fn ack(&self) {
        let mut buf: [u8; 8] = [0; 8];
        let _ = (&self.fd).read(&mut buf);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
impl Waker {
    pub fn new(selector: &Selector) -> io::Result<Waker> {
        let mut fds: [libc::c_int; 2] = [-1, -1];
        syscall!(pipe(fds.as_mut_ptr()))?;
        for fd in &fds {
            syscall!(fcntl(*fd, libc::F_SETFD, libc::FD_CLOEXEC))?;
            syscall!(fcntl(*fd, libc::F_SETFL, libc::O_NONBLOCK))?;
        }
        let receiver = unsafe { File::from_raw_fd(fds[0]) };
        let sender = unsafe { File::from_raw_fd(fds[1]) };
        selector.register(fds[0], WAKE_TOKEN, IoMode::In)?;
        Ok(Waker { sender, receiver })
    }

    pub fn wake(&self) -> io::Result<()> {
        match (&self.sender).write(&[1]) {
            Ok(_) => Ok(()),
            // A full pipe means a wake is already pending.
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn ack(&self) {
        let mut buf = [0; 64];
        while let Ok(n) = (&self.receiver).read(&mut buf) {
            if n < buf.len() {
                break;
            }
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl AsRawFd for Waker {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.fd.as_raw_fd()
    }
}
