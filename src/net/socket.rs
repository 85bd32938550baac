//! Driver-side state shared by the stream-socket types.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::event::EventDesc;
use crate::instance::{InstanceState, IoInstance};
use crate::io_mode::IoMode;
use crate::stream::{StreamResultCode, StreamSlots};
use crate::sys;

use super::ConnectCallback;

/// Where a queued connect is headed.
pub(crate) enum ConnectTarget {
    Inet(SocketAddr),
    #[cfg(unix)]
    Path(std::path::PathBuf),
}

/// Single-shot connect outcome holder; completion and timeout race for the
/// callback.
pub(crate) struct ConnectRequest {
    callback: Mutex<Option<ConnectCallback>>,
}

impl ConnectRequest {
    pub fn new(callback: ConnectCallback) -> Arc<ConnectRequest> {
        Arc::new(ConnectRequest {
            callback: Mutex::new(Some(callback)),
        })
    }

    pub fn complete(&self, error: bool) {
        let callback = self.callback.lock().unwrap().take();
        if let Some(callback) = callback {
            callback(error);
        }
    }
}

#[cfg(unix)]
pub(crate) use self::posix::SocketStreamInstance;

#[cfg(unix)]
mod posix {
    use super::*;
    use crate::fs::fd::IoStep;
    use crate::sys::unix::net::{socket_addr, take_socket_error};

    /// Stream-socket instance: non-blocking recv/send loops over the two
    /// request slots, plus connect handled as an order-time flag. Connect
    /// completion is decided by `SO_ERROR` once the socket reports writable.
    pub(crate) struct SocketStreamInstance {
        state: InstanceState,
        pub(crate) slots: StreamSlots,
        connect: Mutex<ConnectState>,
    }

    struct ConnectState {
        request: Option<(ConnectTarget, Arc<ConnectRequest>)>,
        connecting: Option<Arc<ConnectRequest>>,
    }

    impl SocketStreamInstance {
        pub fn new(fd: sys::Handle) -> Arc<SocketStreamInstance> {
            Arc::new(SocketStreamInstance {
                state: InstanceState::new(fd, IoMode::InOut),
                slots: StreamSlots::new(),
                connect: Mutex::new(ConnectState {
                    request: None,
                    connecting: None,
                }),
            })
        }

        pub fn queue_connect(&self, target: ConnectTarget, request: Arc<ConnectRequest>) {
            let mut connect = self.connect.lock().unwrap();
            connect.request = Some((target, request));
        }

        /// Fills the request buffer with as much as the socket will give
        /// before reporting; a partial transfer interrupted by would-block is
        /// a success, the remainder is the fully-logic's business.
        fn recv_fill(fd: sys::Handle, buf: &mut [u8]) -> IoStep {
            if buf.is_empty() {
                return IoStep::Empty;
            }
            let mut filled = 0;
            loop {
                let n = unsafe {
                    libc::recv(
                        fd,
                        buf[filled..].as_mut_ptr() as *mut libc::c_void,
                        buf.len() - filled,
                        0,
                    )
                };
                if n > 0 {
                    filled += n as usize;
                    if filled >= buf.len() {
                        return IoStep::Done(filled);
                    }
                    continue;
                }
                if n == 0 {
                    return if filled > 0 { IoStep::Done(filled) } else { IoStep::Ended };
                }
                match io::Error::last_os_error().kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => {
                        return if filled > 0 { IoStep::Done(filled) } else { IoStep::WouldBlock }
                    }
                    _ => return if filled > 0 { IoStep::Done(filled) } else { IoStep::Failed },
                }
            }
        }

        fn send_fill(fd: sys::Handle, buf: &mut [u8]) -> IoStep {
            // A dying peer must surface as an error result, not a signal.
            #[cfg(any(target_os = "linux", target_os = "android"))]
            const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            const SEND_FLAGS: libc::c_int = 0;

            if buf.is_empty() {
                return IoStep::Empty;
            }
            let mut sent = 0;
            loop {
                let n = unsafe {
                    libc::send(
                        fd,
                        buf[sent..].as_ptr() as *const libc::c_void,
                        buf.len() - sent,
                        SEND_FLAGS,
                    )
                };
                if n > 0 {
                    sent += n as usize;
                    if sent >= buf.len() {
                        return IoStep::Done(sent);
                    }
                    continue;
                }
                if n == 0 {
                    return if sent > 0 { IoStep::Done(sent) } else { IoStep::Failed };
                }
                match io::Error::last_os_error().kind() {
                    io::ErrorKind::Interrupted => continue,
                    io::ErrorKind::WouldBlock => {
                        return if sent > 0 { IoStep::Done(sent) } else { IoStep::WouldBlock }
                    }
                    _ => return if sent > 0 { IoStep::Done(sent) } else { IoStep::Failed },
                }
            }
        }

        fn process_read(&self, flag_error: bool) {
            let fd = self.state.handle();
            if fd == sys::INVALID_HANDLE {
                return;
            }
            while let Some(request) = self.slots.next_read() {
                let step = request.with_buf(|buf| Self::recv_fill(fd, buf));
                match step {
                    None => continue,
                    Some(IoStep::Empty) => {
                        self.slots.process_result(&request, 0, StreamResultCode::Success)
                    }
                    Some(IoStep::Done(n)) => {
                        let code = if flag_error {
                            StreamResultCode::Unknown
                        } else {
                            StreamResultCode::Success
                        };
                        self.slots.process_result(&request, n, code);
                    }
                    Some(IoStep::WouldBlock) => {
                        if flag_error {
                            self.slots.process_result(&request, 0, StreamResultCode::Unknown);
                        } else {
                            self.slots.park(request);
                        }
                        return;
                    }
                    Some(IoStep::Ended) => {
                        self.slots.process_result(&request, 0, StreamResultCode::Ended)
                    }
                    Some(IoStep::Failed) => {
                        self.slots.process_result(&request, 0, StreamResultCode::Unknown)
                    }
                }
            }
        }

        fn process_write(&self, flag_error: bool) {
            let fd = self.state.handle();
            if fd == sys::INVALID_HANDLE {
                return;
            }
            while let Some(request) = self.slots.next_write() {
                let step = request.with_buf(|buf| Self::send_fill(fd, buf));
                match step {
                    None => continue,
                    Some(IoStep::Empty) => {
                        self.slots.process_result(&request, 0, StreamResultCode::Success)
                    }
                    Some(IoStep::Done(n)) => {
                        let code = if flag_error {
                            StreamResultCode::Unknown
                        } else {
                            StreamResultCode::Success
                        };
                        self.slots.process_result(&request, n, code);
                    }
                    Some(IoStep::WouldBlock) => {
                        if flag_error {
                            self.slots.process_result(&request, 0, StreamResultCode::Unknown);
                        } else {
                            self.slots.park(request);
                        }
                        return;
                    }
                    Some(IoStep::Ended) | Some(IoStep::Failed) => {
                        self.slots.process_result(&request, 0, StreamResultCode::Unknown)
                    }
                }
            }
        }

        fn start_connect(fd: sys::Handle, target: &ConnectTarget) -> io::Result<bool> {
            let res = match target {
                ConnectTarget::Inet(addr) => {
                    let (raw, len) = socket_addr(addr);
                    unsafe { libc::connect(fd, raw.as_ptr(), len) }
                }
                ConnectTarget::Path(path) => {
                    use std::os::unix::ffi::OsStrExt;

                    let bytes = path.as_os_str().as_bytes();
                    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
                    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
                    if bytes.len() >= addr.sun_path.len() {
                        return Err(io::ErrorKind::InvalidInput.into());
                    }
                    for (dst, src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
                        *dst = *src as libc::c_char;
                    }
                    let len = std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
                    unsafe {
                        libc::connect(
                            fd,
                            &addr as *const _ as *const libc::sockaddr,
                            len as libc::socklen_t,
                        )
                    }
                }
            };
            if res == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINPROGRESS) | Some(libc::EINTR) => Ok(false),
                _ => Err(err),
            }
        }
    }

    impl IoInstance for SocketStreamInstance {
        fn state(&self) -> &InstanceState {
            &self.state
        }

        fn on_order(&self) {
            let fd = self.state.handle();
            if fd == sys::INVALID_HANDLE {
                return;
            }

            {
                let mut connect = self.connect.lock().unwrap();
                if connect.connecting.is_some() {
                    return;
                }
                if let Some((target, request)) = connect.request.take() {
                    drop(connect);
                    match Self::start_connect(fd, &target) {
                        Ok(true) => request.complete(false),
                        Ok(false) => {
                            self.connect.lock().unwrap().connecting = Some(request);
                        }
                        Err(_) => request.complete(true),
                    }
                    return;
                }
            }

            self.process_read(false);
            self.process_write(false);
        }

        fn on_event(&self, event: &EventDesc) {
            // A finished connect may surface as any mix of writable, error
            // and hang-up; resolve it before the I/O paths run.
            if event.writable || event.error || event.readable {
                let connecting = self.connect.lock().unwrap().connecting.take();
                if let Some(request) = connecting {
                    let failed = event.error
                        || !matches!(take_socket_error(self.state.handle()), Ok(None));
                    request.complete(failed);
                    self.state.request_order();
                    return;
                }
            }

            let mut processed = false;
            if event.readable {
                self.process_read(event.error);
                processed = true;
            }
            if event.writable {
                self.process_write(event.error);
                processed = true;
            }
            if !processed && event.error {
                self.process_read(true);
                self.process_write(true);
            }
            self.state.request_order();
        }

        fn on_close(&self) {
            {
                let mut connect = self.connect.lock().unwrap();
                if let Some((_, request)) = connect.request.take() {
                    request.complete(true);
                }
                if let Some(request) = connect.connecting.take() {
                    request.complete(true);
                }
            }
            self.slots.close_all();
            let handle = self.state.take_handle();
            if handle != sys::INVALID_HANDLE {
                sys::unix::close_handle(handle);
            }
        }
    }
}

#[cfg(windows)]
pub(crate) use self::win::SocketStreamInstance;

#[cfg(windows)]
mod win {
    use std::cell::UnsafeCell;
    use std::mem;

    use windows_sys::Win32::Networking::WinSock::{
        WSAGetLastError, WSAGetOverlappedResult, WSARecv, WSASend, SOCKET, SOCKET_ERROR, WSABUF,
        WSA_IO_PENDING,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    use super::*;
    use crate::sys::windows::net as winnet;

    /// Overlapped stream-socket instance. `ConnectEx` is looked up at
    /// construction; a socket whose provider lacks it cannot connect
    /// asynchronously and reports so through `supports_connect`.
    pub(crate) struct SocketStreamInstance {
        state: InstanceState,
        pub(crate) slots: StreamSlots,
        connect_ex: Option<winnet::ConnectExFn>,
        connect: Mutex<ConnectState>,
        overlapped_read: UnsafeCell<OVERLAPPED>,
        overlapped_write: UnsafeCell<OVERLAPPED>,
        overlapped_connect: UnsafeCell<OVERLAPPED>,
    }

    unsafe impl Send for SocketStreamInstance {}
    unsafe impl Sync for SocketStreamInstance {}

    struct ConnectState {
        request: Option<(ConnectTarget, Arc<ConnectRequest>)>,
        connecting: Option<Arc<ConnectRequest>>,
    }

    impl SocketStreamInstance {
        pub fn new(socket: sys::Handle) -> Arc<SocketStreamInstance> {
            Arc::new(SocketStreamInstance {
                connect_ex: winnet::connect_ex(socket),
                state: InstanceState::new(socket, IoMode::InOut),
                slots: StreamSlots::new(),
                connect: Mutex::new(ConnectState {
                    request: None,
                    connecting: None,
                }),
                overlapped_read: UnsafeCell::new(unsafe { mem::zeroed() }),
                overlapped_write: UnsafeCell::new(unsafe { mem::zeroed() }),
                overlapped_connect: UnsafeCell::new(unsafe { mem::zeroed() }),
            })
        }

        pub fn supports_connect(&self) -> bool {
            self.connect_ex.is_some()
        }

        pub fn queue_connect(&self, target: ConnectTarget, request: Arc<ConnectRequest>) {
            let mut connect = self.connect.lock().unwrap();
            connect.request = Some((target, request));
        }

        fn issue(&self, request: Arc<crate::stream::StreamRequest>, read: bool) {
            let socket = self.state.handle();
            let overlapped = if read {
                self.overlapped_read.get()
            } else {
                self.overlapped_write.get()
            };

            let issued = request.with_buf(|buf| {
                if buf.is_empty() {
                    return Some(true);
                }
                unsafe {
                    *overlapped = mem::zeroed();
                }
                let wsabuf = WSABUF {
                    len: buf.len().min(u32::MAX as usize) as u32,
                    buf: buf.as_mut_ptr(),
                };
                let mut flags: u32 = 0;
                let res = unsafe {
                    if read {
                        WSARecv(
                            socket as SOCKET,
                            &wsabuf,
                            1,
                            std::ptr::null_mut(),
                            &mut flags,
                            overlapped,
                            None,
                        )
                    } else {
                        WSASend(
                            socket as SOCKET,
                            &wsabuf,
                            1,
                            std::ptr::null_mut(),
                            0,
                            overlapped,
                            None,
                        )
                    }
                };
                if res == 0 {
                    // Completed synchronously; the packet still arrives.
                    None
                } else if unsafe { WSAGetLastError() } == WSA_IO_PENDING {
                    None
                } else {
                    Some(false)
                }
            });

            match issued {
                None => {}
                Some(None) => self.slots.park(request),
                Some(Some(true)) => {
                    self.slots.process_result(&request, 0, StreamResultCode::Success)
                }
                Some(Some(false)) => {
                    self.slots.process_result(&request, 0, StreamResultCode::Unknown)
                }
            }
        }

        fn complete_io(&self, read: bool) {
            let socket = self.state.handle();
            let overlapped = if read {
                self.overlapped_read.get()
            } else {
                self.overlapped_write.get()
            };
            let slot = if read {
                self.slots.next_read_parked_only()
            } else {
                self.slots.next_write_parked_only()
            };
            let Some(request) = slot else { return };

            let mut transferred: u32 = 0;
            let mut flags: u32 = 0;
            let ok = unsafe {
                WSAGetOverlappedResult(socket as SOCKET, overlapped, &mut transferred, 0, &mut flags)
            };
            if ok != 0 {
                if read && transferred == 0 {
                    self.slots.process_result(&request, 0, StreamResultCode::Ended);
                } else {
                    self.slots
                        .process_result(&request, transferred as usize, StreamResultCode::Success);
                }
            } else {
                self.slots.process_result(&request, 0, StreamResultCode::Unknown);
            }
        }

        fn complete_connect(&self) {
            let connecting = self.connect.lock().unwrap().connecting.take();
            let Some(request) = connecting else { return };
            let socket = self.state.handle();

            let mut transferred: u32 = 0;
            let mut flags: u32 = 0;
            let ok = unsafe {
                WSAGetOverlappedResult(
                    socket as SOCKET,
                    self.overlapped_connect.get(),
                    &mut transferred,
                    0,
                    &mut flags,
                )
            };
            if ok != 0 {
                let _ = winnet::update_connect_context(socket);
                request.complete(false);
            } else {
                request.complete(true);
            }
        }

        fn start_connect(&self) {
            let socket = self.state.handle();
            let queued = self.connect.lock().unwrap().request.take();
            let Some((target, request)) = queued else { return };
            let ConnectTarget::Inet(addr) = target;
            let Some(connect_ex) = self.connect_ex else {
                request.complete(true);
                return;
            };

            let (raw, len) = winnet::socket_addr(&addr);
            let overlapped = self.overlapped_connect.get();
            unsafe {
                *overlapped = mem::zeroed();
            }
            let mut sent: u32 = 0;
            let ok = unsafe {
                connect_ex(
                    socket as SOCKET,
                    raw.as_ptr(),
                    len,
                    std::ptr::null(),
                    0,
                    &mut sent,
                    overlapped,
                )
            };
            if ok != 0 {
                let _ = winnet::update_connect_context(socket);
                request.complete(false);
            } else if unsafe { WSAGetLastError() } == WSA_IO_PENDING {
                self.connect.lock().unwrap().connecting = Some(request);
            } else {
                request.complete(true);
            }
        }
    }

    impl IoInstance for SocketStreamInstance {
        fn state(&self) -> &InstanceState {
            &self.state
        }

        fn on_order(&self) {
            if self.state.handle() == sys::INVALID_HANDLE {
                return;
            }
            {
                let connect = self.connect.lock().unwrap();
                if connect.connecting.is_some() {
                    return;
                }
                if connect.request.is_some() {
                    drop(connect);
                    self.start_connect();
                    return;
                }
            }
            if let Some(request) = self.slots.take_read_if_unparked() {
                self.issue(request, true);
            }
            if let Some(request) = self.slots.take_write_if_unparked() {
                self.issue(request, false);
            }
        }

        fn on_event(&self, event: &EventDesc) {
            if self.state.handle() == sys::INVALID_HANDLE {
                return;
            }
            if event.overlapped == self.overlapped_read.get() as *mut _ {
                self.complete_io(true);
            } else if event.overlapped == self.overlapped_write.get() as *mut _ {
                self.complete_io(false);
            } else if event.overlapped == self.overlapped_connect.get() as *mut _ {
                self.complete_connect();
            }
            self.state.request_order();
        }

        fn on_close(&self) {
            {
                let mut connect = self.connect.lock().unwrap();
                if let Some((_, request)) = connect.request.take() {
                    request.complete(true);
                }
                if let Some(request) = connect.connecting.take() {
                    request.complete(true);
                }
            }
            self.slots.close_all();
            let handle = self.state.take_handle();
            if handle != sys::INVALID_HANDLE {
                winnet::close_socket(handle);
            }
        }
    }
}
