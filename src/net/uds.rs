use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::event::EventDesc;
use crate::instance::{InstanceState, IoInstance};
use crate::io_loop::{resolve_loop, IoLoop, Task};
use crate::io_mode::IoMode;
use crate::stream::{AsyncStream, ResultCodeCell, StreamRequest, StreamResultCode};
use crate::sys;

use super::socket::{ConnectRequest, ConnectTarget, SocketStreamInstance};
use super::ConnectCallback;

/// Asynchronous UNIX-domain byte stream.
pub struct UnixStream {
    io_loop: Arc<IoLoop>,
    instance: Arc<SocketStreamInstance>,
    last_code: ResultCodeCell,
    this: Weak<UnixStream>,
}

impl UnixStream {
    /// Opens an unconnected domain socket.
    pub fn open(io_loop: Option<&Arc<IoLoop>>) -> io::Result<Arc<UnixStream>> {
        let io_loop = resolve_loop(io_loop)?;
        let fd = sys::unix::net::new_socket(libc::AF_UNIX, libc::SOCK_STREAM)?;
        UnixStream::attach(io_loop, SocketStreamInstance::new(fd))
    }

    /// Adopts an already connected standard stream (e.g. an accepted one).
    pub fn from_std(
        stream: std::os::unix::net::UnixStream,
        io_loop: Option<&Arc<IoLoop>>,
    ) -> io::Result<Arc<UnixStream>> {
        use std::os::unix::io::IntoRawFd;

        let io_loop = resolve_loop(io_loop)?;
        stream.set_nonblocking(true)?;
        UnixStream::attach(io_loop, SocketStreamInstance::new(stream.into_raw_fd()))
    }

    fn attach(
        io_loop: Arc<IoLoop>,
        instance: Arc<SocketStreamInstance>,
    ) -> io::Result<Arc<UnixStream>> {
        let stream = Arc::new_cyclic(|this| UnixStream {
            io_loop,
            instance,
            last_code: ResultCodeCell::new(),
            this: this.clone(),
        });
        stream.instance.slots.set_object(stream.this.clone());
        stream.io_loop.attach_instance(stream.as_instance())?;
        Ok(stream)
    }

    /// Starts a non-blocking connect to a filesystem path.
    pub fn connect<P: AsRef<Path>>(
        &self,
        path: P,
        on_connect: ConnectCallback,
        timeout: Option<Duration>,
    ) {
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
        self.instance
            .queue_connect(ConnectTarget::Path(path.as_ref().to_path_buf()), request);
        self.io_loop.request_order(&self.as_instance());
    }

    fn as_instance(&self) -> Arc<dyn IoInstance> {
        self.instance.clone()
    }
}

impl AsyncStream for UnixStream {
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

impl Drop for UnixStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Callback receiving each accepted domain connection with the peer path, if
/// the peer bound one.
pub type UnixAcceptCallback =
    Box<dyn FnMut(std::os::unix::net::UnixStream, Option<PathBuf>) + Send>;

/// Domain accept server configuration.
pub struct UnixServerParam {
    pub path: PathBuf,
    /// Unlink a stale socket file before binding.
    pub remove_existing: bool,
    pub backlog: u32,
    pub auto_start: bool,
    pub on_accept: Option<UnixAcceptCallback>,
    pub on_error: Option<Box<dyn FnMut() + Send>>,
}

impl UnixServerParam {
    pub fn new<P: AsRef<Path>>(path: P) -> UnixServerParam {
        UnixServerParam {
            path: path.as_ref().to_path_buf(),
            remove_existing: true,
            backlog: 128,
            auto_start: true,
            on_accept: None,
            on_error: None,
        }
    }
}

/// Listening domain socket delivering accepted connections to a callback.
pub struct UnixListener {
    io_loop: Arc<IoLoop>,
    instance: Arc<UnixAcceptInstance>,
}

impl UnixListener {
    pub fn create(
        param: UnixServerParam,
        io_loop: Option<&Arc<IoLoop>>,
    ) -> io::Result<Arc<UnixListener>> {
        let io_loop = resolve_loop(io_loop)?;
        let auto_start = param.auto_start;
        let instance = UnixAcceptInstance::create(param)?;
        let listener = Arc::new(UnixListener { io_loop, instance });
        listener.io_loop.attach_instance(listener.as_instance())?;
        if auto_start {
            listener.start();
        }
        Ok(listener)
    }

    pub fn start(&self) {
        self.instance.running.store(true, Ordering::Release);
        self.io_loop.request_order(&self.as_instance());
    }

    pub fn is_running(&self) -> bool {
        self.instance.running.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.io_loop.close_instance(&self.as_instance());
    }

    fn as_instance(&self) -> Arc<dyn IoInstance> {
        self.instance.clone()
    }
}

impl Drop for UnixListener {
    fn drop(&mut self) {
        self.close();
    }
}

struct UnixAcceptInstance {
    state: InstanceState,
    running: AtomicBool,
    on_accept: Mutex<Option<UnixAcceptCallback>>,
    on_error: Mutex<Option<Box<dyn FnMut() + Send>>>,
}

impl UnixAcceptInstance {
    fn create(param: UnixServerParam) -> io::Result<Arc<UnixAcceptInstance>> {
        use std::os::unix::ffi::OsStrExt;

        if param.remove_existing {
            let _ = std::fs::remove_file(&param.path);
        }
        let fd = sys::unix::net::new_socket(libc::AF_UNIX, libc::SOCK_STREAM)?;
        let prepared = (|| {
            let bytes = param.path.as_os_str().as_bytes();
            let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
            addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
            if bytes.len() >= addr.sun_path.len() {
                return Err(io::ErrorKind::InvalidInput.into());
            }
            for (dst, src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
                *dst = *src as libc::c_char;
            }
            let len = mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
            syscall!(bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                len as libc::socklen_t,
            ))?;
            syscall!(listen(fd, param.backlog as libc::c_int)).map(|_| ())
        })();
        if let Err(err) = prepared {
            sys::unix::close_handle(fd);
            return Err(err);
        }
        Ok(Arc::new(UnixAcceptInstance {
            state: InstanceState::new(fd, IoMode::In),
            running: AtomicBool::new(false),
            on_accept: Mutex::new(param.on_accept),
            on_error: Mutex::new(param.on_error),
        }))
    }

    fn process_accept(&self) {
        if !self.running.load(Ordering::Acquire) {
            return;
        }
        let fd = self.state.handle();
        if fd == sys::INVALID_HANDLE {
            return;
        }
        loop {
            let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
            let accepted = unsafe {
                libc::accept(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
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
                std::os::unix::net::UnixStream::from_raw_fd(accepted)
            };
            let peer = peer_path(&addr, len);
            if let Some(callback) = self.on_accept.lock().unwrap().as_mut() {
                callback(stream, peer);
            }
        }
    }

    fn report_error(&self) {
        if let Some(callback) = self.on_error.lock().unwrap().as_mut() {
            callback();
        }
    }
}

/// Extracts the peer's bound filesystem path; unnamed and abstract peers
/// yield `None`.
fn peer_path(addr: &libc::sockaddr_un, len: libc::socklen_t) -> Option<PathBuf> {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let header = mem::size_of::<libc::sa_family_t>();
    let len = len as usize;
    if len <= header {
        return None;
    }
    let path = &addr.sun_path[..len - header];
    if path.is_empty() || path[0] == 0 {
        return None;
    }
    let bytes: Vec<u8> = path
        .iter()
        .take_while(|byte| **byte != 0)
        .map(|byte| *byte as u8)
        .collect();
    Some(PathBuf::from(OsStr::from_bytes(&bytes)))
}

impl IoInstance for UnixAcceptInstance {
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
