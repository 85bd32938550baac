//! Anonymous pipe pair exposed as a pair of one-way async streams.
//!
//! POSIX uses `pipe(2)` with both ends non-blocking. Windows emulates an
//! anonymous pipe with a uniquely named pipe opened overlapped on both ends,
//! since true anonymous pipes cannot complete through a port.

use std::io;
use std::sync::Arc;

use crate::fs::FileStream;
use crate::io_loop::{resolve_loop, IoLoop};

/// Creates a pipe; returns `(reader, writer)` attached to the loop.
#[cfg(unix)]
pub fn new(io_loop: Option<&Arc<IoLoop>>) -> io::Result<(Arc<FileStream>, Arc<FileStream>)> {
    use crate::fs::fd::FdStreamInstance;
    use crate::io_mode::IoMode;

    let io_loop = resolve_loop(io_loop)?;

    let mut fds: [libc::c_int; 2] = [-1, -1];
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let res = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if res == -1 {
            return Err(io::Error::last_os_error());
        }
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let res = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if res == -1 {
            return Err(io::Error::last_os_error());
        }
        for fd in &fds {
            unsafe {
                libc::fcntl(*fd, libc::F_SETFD, libc::FD_CLOEXEC);
                libc::fcntl(*fd, libc::F_SETFL, libc::O_NONBLOCK);
            }
        }
    }

    let reader = FdStreamInstance::new(fds[0], IoMode::In);
    let writer = FdStreamInstance::new(fds[1], IoMode::Out);
    let reader = FileStream::attach(io_loop.clone(), reader)?;
    let writer = FileStream::attach(io_loop, writer)?;
    Ok((reader, writer))
}

/// Creates a pipe; returns `(reader, writer)` attached to the loop.
#[cfg(windows)]
pub fn new(io_loop: Option<&Arc<IoLoop>>) -> io::Result<(Arc<FileStream>, Arc<FileStream>)> {
    use std::os::windows::ffi::OsStrExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use windows_sys::Win32::Foundation::{GENERIC_WRITE, INVALID_HANDLE_VALUE};
    use windows_sys::Win32::Storage::FileSystem::{
        CreateFileW, FILE_ATTRIBUTE_NORMAL, FILE_FLAG_FIRST_PIPE_INSTANCE, FILE_FLAG_OVERLAPPED,
        OPEN_EXISTING, PIPE_ACCESS_INBOUND,
    };
    use windows_sys::Win32::System::Pipes::{
        CreateNamedPipeW, PIPE_READMODE_BYTE, PIPE_TYPE_BYTE, PIPE_WAIT,
    };

    use crate::fs::overlapped::OverlappedFileInstance;

    let io_loop = resolve_loop(io_loop)?;

    static PIPE_SEQ: AtomicUsize = AtomicUsize::new(0);
    let name = format!(
        r"\\.\pipe\evio-{}-{}",
        std::process::id(),
        PIPE_SEQ.fetch_add(1, Ordering::Relaxed),
    );
    let mut wide: Vec<u16> = std::ffi::OsStr::new(&name).encode_wide().collect();
    wide.push(0);

    let read_handle = unsafe {
        CreateNamedPipeW(
            wide.as_ptr(),
            PIPE_ACCESS_INBOUND | FILE_FLAG_OVERLAPPED | FILE_FLAG_FIRST_PIPE_INSTANCE,
            PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
            1,
            65536,
            65536,
            0,
            std::ptr::null(),
        )
    };
    if read_handle == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }

    let write_handle = unsafe {
        CreateFileW(
            wide.as_ptr(),
            GENERIC_WRITE,
            0,
            std::ptr::null(),
            OPEN_EXISTING,
            FILE_ATTRIBUTE_NORMAL | FILE_FLAG_OVERLAPPED,
            std::ptr::null_mut(),
        )
    };
    if write_handle == INVALID_HANDLE_VALUE {
        let err = io::Error::last_os_error();
        crate::sys::windows::close_handle(read_handle as _);
        return Err(err);
    }

    let reader = OverlappedFileInstance::from_handle(read_handle as _);
    let writer = OverlappedFileInstance::from_handle(write_handle as _);
    let reader = FileStream::attach(io_loop.clone(), reader)?;
    let writer = FileStream::attach(io_loop, writer)?;
    Ok((reader, writer))
}
