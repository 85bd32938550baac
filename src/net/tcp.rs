use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::instance::IoInstance;
use crate::io_loop::{resolve_loop, IoLoop, Task};
use crate::stream::{AsyncStream, ResultCodeCell, StreamRequest, StreamResultCode};
use crate::sys;

use super::socket::{ConnectRequest, ConnectTarget, SocketStreamInstance};
use super::ConnectCallback;

/// Asynchronous TCP byte stream.
///
/// Reads and writes follow the stream contract; [`connect`] resolves through
/// a one-shot callback and may be bounded by a timeout.
///
/// [`connect`]: TcpStream::connect
pub struct TcpStream {
    io_loop: Arc<IoLoop>,
    instance: Arc<SocketStreamInstance>,
    last_code: ResultCodeCell,
    this: Weak<TcpStream>,
}

impl TcpStream {
    /// Opens an unconnected socket, optionally bound to a local address.
    pub fn open(
        bind: Option<SocketAddr>,
        ipv6: bool,
        io_loop: Option<&Arc<IoLoop>>,
    ) -> io::Result<Arc<TcpStream>> {
        let io_loop = resolve_loop(io_loop)?;
        let handle = open_tcp_socket(ipv6)?;
        if let Some(addr) = bind {
            if let Err(err) = bind_socket(handle, &addr) {
                close_socket(handle);
                return Err(err);
            }
        }
        TcpStream::attach(io_loop, SocketStreamInstance::new(handle))
    }

    /// Adopts an already connected standard stream (e.g. an accepted one).
    pub fn from_std(
        stream: std::net::TcpStream,
        io_loop: Option<&Arc<IoLoop>>,
    ) -> io::Result<Arc<TcpStream>> {
        let io_loop = resolve_loop(io_loop)?;
        stream.set_nonblocking(true)?;
        let handle = into_handle(stream);
        TcpStream::attach(io_loop, SocketStreamInstance::new(handle))
    }

    /// Opens a socket and connects it in one step.
    pub fn connect_to(
        addr: SocketAddr,
        io_loop: Option<&Arc<IoLoop>>,
        on_connect: ConnectCallback,
        timeout: Option<Duration>,
    ) -> io::Result<Arc<TcpStream>> {
        let stream = TcpStream::open(None, addr.is_ipv6(), io_loop)?;
        stream.connect(addr, on_connect, timeout);
        Ok(stream)
    }

    fn attach(
        io_loop: Arc<IoLoop>,
        instance: Arc<SocketStreamInstance>,
    ) -> io::Result<Arc<TcpStream>> {
        let stream = Arc::new_cyclic(|this| TcpStream {
            io_loop,
            instance,
            last_code: ResultCodeCell::new(),
            this: this.clone(),
        });
        stream.instance.slots.set_object(stream.this.clone());
        stream.io_loop.attach_instance(stream.as_instance())?;
        Ok(stream)
    }

    /// Starts a non-blocking connect. The callback receives `true` on
    /// failure; with a timeout the first of {completion, deadline} wins.
    pub fn connect(&self, addr: SocketAddr, on_connect: ConnectCallback, timeout: Option<Duration>) {
        if !self.is_open() {
            on_connect(true);
            return;
        }
        let request = ConnectRequest::new(on_connect);
        if let Some(delay) = timeout {
            let weak = Arc::downgrade(&request);
            self.io_loop.dispatch(
                Box::new(move || {
                    if let Some(request) = weak.upgrade() {
                        request.complete(true);
                    }
                }),
                delay,
            );
        }
        self.instance.queue_connect(ConnectTarget::Inet(addr), request);
        self.io_loop.request_order(&self.as_instance());
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        socket_local_addr(self.instance.state().handle())
    }

    fn as_instance(&self) -> Arc<dyn IoInstance> {
        self.instance.clone()
    }
}

impl AsyncStream for TcpStream {
    fn request_io(&self, request: &Arc<StreamRequest>) -> bool {
        if !self.is_open() {
            return false;
        }
        if self.instance.slots.install(request) {
            self.io_loop.request_order(&self.as_instance());
            true
        } else {
            false
        }
    }

    fn close(&self) {
        self.io_loop.close_instance(&self.as_instance());
    }

    fn is_open(&self) -> bool {
        let state = self.instance.state();
        state.is_open() && !state.is_closing()
    }

    fn add_task(&self, task: Task) -> bool {
        self.io_loop.add_task(task)
    }

    fn dispatch(&self, task: Task, delay: Duration) -> bool {
        self.io_loop.dispatch(task, delay)
    }

    fn stream_ref(&self) -> Weak<dyn AsyncStream> {
        self.this.clone()
    }

    fn last_result_code(&self) -> StreamResultCode {
        self.last_code.get()
    }

    fn set_last_result_code(&self, code: StreamResultCode) {
        self.last_code.set(code);
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Callback receiving each accepted connection.
pub type TcpAcceptCallback = Box<dyn FnMut(std::net::TcpStream, SocketAddr) + Send>;

/// TCP accept server configuration.
pub struct TcpServerParam {
    pub bind_address: SocketAddr,
    pub reuse_address: bool,
    /// `SO_REUSEPORT` where the platform has it.
    pub reuse_port: bool,
    pub backlog: u32,
    pub auto_start: bool,
    pub on_accept: Option<TcpAcceptCallback>,
    pub on_error: Option<Box<dyn FnMut() + Send>>,
}

impl TcpServerParam {
    pub fn new(bind_address: SocketAddr) -> TcpServerParam {
        TcpServerParam {
            bind_address,
            reuse_address: true,
            reuse_port: false,
            backlog: 128,
            auto_start: true,
            on_accept: None,
            on_error: None,
        }
    }
}

/// Listening TCP socket delivering accepted connections to a callback.
pub struct TcpListener {
    io_loop: Arc<IoLoop>,
    instance: Arc<accept::TcpAcceptInstance>,
}

impl TcpListener {
    pub fn create(param: TcpServerParam, io_loop: Option<&Arc<IoLoop>>) -> io::Result<Arc<TcpListener>> {
        let io_loop = resolve_loop(io_loop)?;
        let auto_start = param.auto_start;
        let instance = accept::TcpAcceptInstance::create(param)?;
        let listener = Arc::new(TcpListener { io_loop, instance });
        listener.io_loop.attach_instance(listener.as_instance())?;
        if auto_start {
            listener.start();
        }
        Ok(listener)
    }

    /// Begins accepting; also drains connections that raced the attach.
    pub fn start(&self) {
        self.instance.set_running(true);
        self.io_loop.request_order(&self.as_instance());
    }

    pub fn is_running(&self) -> bool {
        self.instance.is_running()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        socket_local_addr(self.instance.state().handle())
    }

    pub fn close(&self) {
        self.io_loop.close_instance(&self.as_instance());
    }

    fn as_instance(&self) -> Arc<dyn IoInstance> {
        self.instance.clone()
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(unix)]
fn open_tcp_socket(ipv6: bool) -> io::Result<sys::Handle> {
    let domain = if ipv6 { libc::AF_INET6 } else { libc::AF_INET };
    sys::unix::net::new_socket(domain, libc::SOCK_STREAM)
}

#[cfg(windows)]
fn open_tcp_socket(ipv6: bool) -> io::Result<sys::Handle> {
    sys::windows::net::new_socket(ipv6, false)
}

#[cfg(unix)]
fn bind_socket(handle: sys::Handle, addr: &SocketAddr) -> io::Result<()> {
    sys::unix::net::set_reuseaddr(handle, true)?;
    sys::unix::net::bind(handle, addr)
}

#[cfg(windows)]
fn bind_socket(handle: sys::Handle, addr: &SocketAddr) -> io::Result<()> {
    sys::windows::net::set_reuseaddr(handle, true)?;
    let (raw, len) = sys::windows::net::socket_addr(addr);
    let res = unsafe {
        windows_sys::Win32::Networking::WinSock::bind(
            handle as windows_sys::Win32::Networking::WinSock::SOCKET,
            raw.as_ptr(),
            len,
        )
    };
    if res != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(unix)]
fn close_socket(handle: sys::Handle) {
    sys::unix::close_handle(handle);
}

#[cfg(windows)]
fn close_socket(handle: sys::Handle) {
    sys::windows::net::close_socket(handle);
}

#[cfg(unix)]
fn socket_local_addr(handle: sys::Handle) -> io::Result<SocketAddr> {
    sys::unix::net::local_addr(handle)
}

#[cfg(windows)]
fn socket_local_addr(handle: sys::Handle) -> io::Result<SocketAddr> {
    sys::windows::net::local_addr(handle)
}

#[cfg(unix)]
fn into_handle(stream: std::net::TcpStream) -> sys::Handle {
    use std::os::unix::io::IntoRawFd;
    stream.into_raw_fd()
}

#[cfg(windows)]
fn into_handle(stream: std::net::TcpStream) -> sys::Handle {
    use std::os::windows::io::IntoRawSocket;
    stream.into_raw_socket() as sys::Handle
}

#[cfg(unix)]
mod accept {
    use super::*;
    use crate::event::EventDesc;
    use crate::instance::InstanceState;
    use crate::io_mode::IoMode;
    use std::mem;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Listening-socket instance: drains `accept` on readability and hands
    /// each connection to the server callback.
    pub(crate) struct TcpAcceptInstance {
        state: InstanceState,
        running: AtomicBool,
        on_accept: Mutex<Option<TcpAcceptCallback>>,
        on_error: Mutex<Option<Box<dyn FnMut() + Send>>>,
    }

    impl TcpAcceptInstance {
        pub fn create(param: TcpServerParam) -> io::Result<Arc<TcpAcceptInstance>> {
            let handle = open_tcp_socket(param.bind_address.is_ipv6())?;
            let prepared = (|| {
                if param.reuse_address {
                    sys::unix::net::set_reuseaddr(handle, true)?;
                }
                #[cfg(not(any(target_os = "illumos", target_os = "solaris")))]
                if param.reuse_port {
                    sys::unix::net::set_reuseport(handle, true)?;
                }
                sys::unix::net::bind(handle, &param.bind_address)?;
                syscall!(listen(handle, param.backlog as libc::c_int)).map(|_| ())
            })();
            if let Err(err) = prepared {
                close_socket(handle);
                return Err(err);
            }
            Ok(Arc::new(TcpAcceptInstance {
                state: InstanceState::new(handle, IoMode::In),
                running: AtomicBool::new(false),
                on_accept: Mutex::new(param.on_accept),
                on_error: Mutex::new(param.on_error),
            }))
        }

        pub fn set_running(&self, running: bool) {
            self.running.store(running, Ordering::Release);
        }

        pub fn is_running(&self) -> bool {
            self.running.load(Ordering::Acquire)
        }

        fn process_accept(&self) {
            if !self.is_running() {
                return;
            }
            let fd = self.state.handle();
            if fd == sys::INVALID_HANDLE {
                return;
            }
            loop {
                let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
                let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
                let accepted = unsafe {
                    libc::accept(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
                };
                if accepted < 0 {
                    match io::Error::last_os_error().kind() {
                        io::ErrorKind::WouldBlock => return,
                        io::ErrorKind::Interrupted => continue,
                        _ => {
                            self.report_error();
                            return;
                        }
                    }
                }
                let stream = unsafe {
                    use std::os::unix::io::FromRawFd;
                    std::net::TcpStream::from_raw_fd(accepted)
                };
                let Ok(addr) = sys::unix::net::to_socket_addr(&storage) else {
                    continue;
                };
                if let Some(callback) = self.on_accept.lock().unwrap().as_mut() {
                    callback(stream, addr);
                }
            }
        }

        fn report_error(&self) {
            if let Some(callback) = self.on_error.lock().unwrap().as_mut() {
                callback();
            }
        }
    }

    impl IoInstance for TcpAcceptInstance {
        fn state(&self) -> &InstanceState {
            &self.state
        }

        fn on_order(&self) {
            self.process_accept();
        }

        fn on_event(&self, event: &EventDesc) {
            if event.readable {
                self.process_accept();
            }
            if event.error {
                self.report_error();
            }
        }

        fn on_close(&self) {
            let handle = self.state.take_handle();
            if handle != sys::INVALID_HANDLE {
                sys::unix::close_handle(handle);
            }
        }
    }
}

#[cfg(windows)]
mod accept {
    use std::cell::UnsafeCell;
    use std::mem;
    use std::sync::atomic::{AtomicBool, Ordering};

    use windows_sys::Win32::Networking::WinSock::{
        WSAGetLastError, SOCKADDR, SOCKADDR_STORAGE, SOCKET, WSA_IO_PENDING,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    use super::*;
    use crate::event::EventDesc;
    use crate::instance::InstanceState;
    use crate::io_mode::IoMode;
    use crate::sys::windows::net as winnet;

    const ADDR_BUF: usize = mem::size_of::<SOCKADDR_STORAGE>() + 16;

    /// Listening-socket instance driven by `AcceptEx`: one pre-created
    /// socket is in flight at a time; its completion yields the peer address
    /// via `GetAcceptExSockaddrs` and re-arms the next accept.
    pub(crate) struct TcpAcceptInstance {
        state: InstanceState,
        running: AtomicBool,
        ipv6: bool,
        accept_ex: Option<winnet::AcceptExFn>,
        sockaddrs: Option<winnet::GetAcceptExSockaddrsFn>,
        pending: Mutex<Option<sys::Handle>>,
        addr_buf: UnsafeCell<[u8; ADDR_BUF * 2]>,
        overlapped: UnsafeCell<OVERLAPPED>,
        on_accept: Mutex<Option<TcpAcceptCallback>>,
        on_error: Mutex<Option<Box<dyn FnMut() + Send>>>,
    }

    unsafe impl Send for TcpAcceptInstance {}
    unsafe impl Sync for TcpAcceptInstance {}

    impl TcpAcceptInstance {
        pub fn create(param: TcpServerParam) -> io::Result<Arc<TcpAcceptInstance>> {
            let ipv6 = param.bind_address.is_ipv6();
            let handle = open_tcp_socket(ipv6)?;
            let prepared = (|| {
                if param.reuse_address {
                    winnet::set_reuseaddr(handle, true)?;
                }
                bind_socket(handle, &param.bind_address)?;
                let res = unsafe {
                    windows_sys::Win32::Networking::WinSock::listen(
                        handle as SOCKET,
                        param.backlog as i32,
                    )
                };
                if res != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            })();
            if let Err(err) = prepared {
                close_socket(handle);
                return Err(err);
            }
            Ok(Arc::new(TcpAcceptInstance {
                accept_ex: winnet::accept_ex(handle),
                sockaddrs: winnet::get_accept_ex_sockaddrs(handle),
                state: InstanceState::new(handle, IoMode::In),
                running: AtomicBool::new(false),
                ipv6,
                pending: Mutex::new(None),
                addr_buf: UnsafeCell::new([0; ADDR_BUF * 2]),
                overlapped: UnsafeCell::new(unsafe { mem::zeroed() }),
                on_accept: Mutex::new(param.on_accept),
                on_error: Mutex::new(param.on_error),
            }))
        }

        pub fn set_running(&self, running: bool) {
            self.running.store(running, Ordering::Release);
        }

        pub fn is_running(&self) -> bool {
            self.running.load(Ordering::Acquire)
        }

        fn arm_accept(&self) {
            if !self.is_running() {
                return;
            }
            let mut pending = self.pending.lock().unwrap();
            if pending.is_some() {
                return;
            }
            let (Some(accept_ex), listener) = (self.accept_ex, self.state.handle()) else {
                self.report_error();
                return;
            };
            let accepted = match winnet::new_socket(self.ipv6, false) {
                Ok(socket) => socket,
                Err(_) => {
                    self.report_error();
                    return;
                }
            };
            let overlapped = self.overlapped.get();
            unsafe {
                *overlapped = mem::zeroed();
            }
            let mut received: u32 = 0;
            let ok = unsafe {
                accept_ex(
                    listener as SOCKET,
                    accepted as SOCKET,
                    self.addr_buf.get() as *mut _,
                    0,
                    ADDR_BUF as u32,
                    ADDR_BUF as u32,
                    &mut received,
                    overlapped,
                )
            };
            if ok != 0 || unsafe { WSAGetLastError() } == WSA_IO_PENDING {
                *pending = Some(accepted);
            } else {
                winnet::close_socket(accepted);
                self.report_error();
            }
        }

        fn complete_accept(&self) {
            let accepted = self.pending.lock().unwrap().take();
            let Some(accepted) = accepted else { return };
            let listener = self.state.handle();

            if winnet::update_accept_context(accepted, listener).is_err() {
                winnet::close_socket(accepted);
                self.arm_accept();
                return;
            }

            let mut local: *mut SOCKADDR = std::ptr::null_mut();
            let mut local_len: i32 = 0;
            let mut remote: *mut SOCKADDR = std::ptr::null_mut();
            let mut remote_len: i32 = 0;
            let addr = self.sockaddrs.and_then(|get_sockaddrs| {
                unsafe {
                    get_sockaddrs(
                        self.addr_buf.get() as *const _,
                        0,
                        ADDR_BUF as u32,
                        ADDR_BUF as u32,
                        &mut local,
                        &mut local_len,
                        &mut remote,
                        &mut remote_len,
                    );
                    if remote.is_null() {
                        None
                    } else {
                        winnet::to_socket_addr(remote as *const SOCKADDR_STORAGE).ok()
                    }
                }
            });

            if let Some(addr) = addr {
                let stream = unsafe {
                    use std::os::windows::io::FromRawSocket;
                    std::net::TcpStream::from_raw_socket(accepted as _)
                };
                if let Some(callback) = self.on_accept.lock().unwrap().as_mut() {
                    callback(stream, addr);
                }
            } else {
                winnet::close_socket(accepted);
            }
            self.arm_accept();
        }

        fn report_error(&self) {
            if let Some(callback) = self.on_error.lock().unwrap().as_mut() {
                callback();
            }
        }
    }

    impl IoInstance for TcpAcceptInstance {
        fn state(&self) -> &InstanceState {
            &self.state
        }

        fn on_order(&self) {
            self.arm_accept();
        }

        fn on_event(&self, event: &EventDesc) {
            if event.overlapped == self.overlapped.get() as *mut _ {
                self.complete_accept();
            }
        }

        fn on_close(&self) {
            let pending = self.pending.lock().unwrap().take();
            if let Some(socket) = pending {
                winnet::close_socket(socket);
            }
            let handle = self.state.take_handle();
            if handle != sys::INVALID_HANDLE {
                winnet::close_socket(handle);
            }
        }
    }
}
