//! Asynchronous file access.
//!
//! Regular files have no useful readiness model on POSIX, so [`File`] drives
//! a blocking handle from a [`Dispatcher`] worker. Windows opens files with
//! `FILE_FLAG_OVERLAPPED` instead and runs them as a completion-based
//! [`FileStream`] on the loop. [`open_stream`] picks whichever fits the
//! platform.
//!
//! [`Dispatcher`]: crate::Dispatcher

use std::io;
use std::ops::BitOr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::instance::IoInstance;
#[cfg(windows)]
use crate::io_loop::resolve_loop;
use crate::io_loop::{IoLoop, Task};
use crate::simulator::{Dispatcher, SimulatorQueue};
use crate::stream::{
    AsyncStream, ResultCodeCell, StreamRequest, StreamResultCode, StreamSlots,
};

/// File open flags.
///
/// `WRITE` creates and truncates unless `NOT_CREATE` / `NOT_TRUNCATE` are
/// added; `SEEK_TO_END` positions the cursor past the existing content.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OpenMode(u8);

impl OpenMode {
    pub const READ: OpenMode = OpenMode(0b0000_0001);
    pub const WRITE: OpenMode = OpenMode(0b0000_0010);
    pub const APPEND: OpenMode = OpenMode(0b0000_0100);
    pub const NOT_CREATE: OpenMode = OpenMode(0b0000_1000);
    pub const NOT_TRUNCATE: OpenMode = OpenMode(0b0001_0000);
    pub const SEEK_TO_END: OpenMode = OpenMode(0b0010_0000);
    pub const HINT_RANDOM_ACCESS: OpenMode = OpenMode(0b0100_0000);

    pub fn contains(self, other: OpenMode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenMode {
    type Output = OpenMode;

    fn bitor(self, other: OpenMode) -> OpenMode {
        OpenMode(self.0 | other.0)
    }
}

fn open_std(path: &Path, mode: OpenMode) -> io::Result<std::fs::File> {
    use std::io::Seek;

    let mut options = std::fs::OpenOptions::new();
    if mode.contains(OpenMode::APPEND) {
        options.append(true).create(!mode.contains(OpenMode::NOT_CREATE));
        options.read(mode.contains(OpenMode::READ));
    } else if mode.contains(OpenMode::WRITE) {
        options.write(true).read(mode.contains(OpenMode::READ));
        options.create(!mode.contains(OpenMode::NOT_CREATE));
        options.truncate(!mode.contains(OpenMode::NOT_TRUNCATE));
    } else {
        options.read(true);
    }
    let mut file = options.open(path)?;
    if mode.contains(OpenMode::SEEK_TO_END) {
        file.seek(io::SeekFrom::End(0))?;
    }
    Ok(file)
}

/// Asynchronous file over a blocking handle and a dispatcher worker.
///
/// Requests are served FIFO per stream; two requests never overlap on the
/// handle. Callbacks run on the dispatcher thread.
pub struct File {
    file: Mutex<Option<std::fs::File>>,
    dispatcher: Arc<Dispatcher>,
    queue: SimulatorQueue,
    open: AtomicBool,
    last_code: ResultCodeCell,
    this: Weak<File>,
}

impl File {
    /// Opens the file with a dedicated dispatcher thread.
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> io::Result<Arc<File>> {
        let dispatcher = Dispatcher::new()?;
        File::open_with_dispatcher(path, mode, dispatcher)
    }

    /// Opens the file on a shared dispatcher.
    pub fn open_with_dispatcher<P: AsRef<Path>>(
        path: P,
        mode: OpenMode,
        dispatcher: Arc<Dispatcher>,
    ) -> io::Result<Arc<File>> {
        let file = open_std(path.as_ref(), mode)?;
        Ok(Arc::new_cyclic(|this| File {
            file: Mutex::new(Some(file)),
            dispatcher,
            queue: SimulatorQueue::new(),
            open: AtomicBool::new(true),
            last_code: ResultCodeCell::new(),
            this: this.clone(),
        }))
    }

    pub fn open_for_read<P: AsRef<Path>>(path: P) -> io::Result<Arc<File>> {
        File::open(path, OpenMode::READ)
    }

    pub fn open_for_write<P: AsRef<Path>>(path: P) -> io::Result<Arc<File>> {
        File::open(path, OpenMode::WRITE)
    }

    pub fn open_for_append<P: AsRef<Path>>(path: P) -> io::Result<Arc<File>> {
        File::open(path, OpenMode::WRITE | OpenMode::APPEND | OpenMode::NOT_TRUNCATE)
    }

    fn run_processor(self: &Arc<Self>) {
        while let Some(request) = self.queue.pop() {
            if !self.is_open() {
                request.run_callback(Some(&**self), 0, StreamResultCode::Closed);
                continue;
            }
            self.process_request(&request);
        }
    }

    fn process_request(self: &Arc<Self>, request: &Arc<StreamRequest>) {
        use std::io::{Read, Write};

        let guard = self.file.lock().unwrap();
        let Some(file) = guard.as_ref() else {
            drop(guard);
            request.run_callback(Some(&**self), 0, StreamResultCode::Closed);
            return;
        };

        enum Outcome {
            Done(usize),
            Ended,
            Empty,
            Failed,
        }

        let outcome = request.with_buf(|buf| {
            if buf.is_empty() {
                return Outcome::Empty;
            }
            loop {
                let result = if request.is_read() {
                    (&*file).read(buf)
                } else {
                    (&*file).write(buf)
                };
                return match result {
                    Ok(0) if request.is_read() => Outcome::Ended,
                    Ok(0) => Outcome::Failed,
                    Ok(n) => Outcome::Done(n),
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => Outcome::Failed,
                };
            }
        });
        drop(guard);

        match outcome {
            None => {}
            Some(Outcome::Empty) => request.run_callback(Some(&**self), 0, StreamResultCode::Success),
            Some(Outcome::Done(n)) => request.run_callback(Some(&**self), n, StreamResultCode::Success),
            Some(Outcome::Ended) => request.run_callback(Some(&**self), 0, StreamResultCode::Ended),
            Some(Outcome::Failed) => request.run_callback(Some(&**self), 0, StreamResultCode::Unknown),
        }
    }
}

impl AsyncStream for File {
    fn request_io(&self, request: &Arc<StreamRequest>) -> bool {
        if !self.is_open() {
            return false;
        }
        if self.queue.push(request) {
            let weak = self.this.clone();
            self.dispatcher.dispatch(Box::new(move || {
                if let Some(file) = weak.upgrade() {
                    file.run_processor();
                }
            }));
        }
        true
    }

    fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        let file = self.file.lock().unwrap().take();
        drop(file);
        let object = self.this.upgrade();
        let stream = object.as_ref().map(|o| &**o as &dyn AsyncStream);
        for request in self.queue.drain() {
            request.run_callback(stream, 0, StreamResultCode::Closed);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn add_task(&self, task: Task) -> bool {
        self.dispatcher.dispatch(task)
    }

    fn dispatch(&self, task: Task, delay: Duration) -> bool {
        self.dispatcher.dispatch_delayed(task, delay)
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

    fn is_seekable(&self) -> bool {
        true
    }

    fn seek(&self, pos: u64) -> bool {
        use std::io::Seek;
        match self.file.lock().unwrap().as_ref() {
            Some(file) => (&*file).seek(io::SeekFrom::Start(pos)).is_ok(),
            None => false,
        }
    }

    fn position(&self) -> u64 {
        use std::io::Seek;
        match self.file.lock().unwrap().as_ref() {
            Some(file) => (&*file).stream_position().unwrap_or(0),
            None => 0,
        }
    }

    fn size(&self) -> u64 {
        match self.file.lock().unwrap().as_ref() {
            Some(file) => file.metadata().map(|meta| meta.len()).unwrap_or(0),
            None => 0,
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let file = self.file.lock().unwrap().take();
            drop(file);
        }
    }
}

/// Loop-attached byte stream over a native handle (pipe ends, overlapped
/// files on Windows).
pub struct FileStream {
    io_loop: Arc<IoLoop>,
    #[cfg(unix)]
    instance: Arc<fd::FdStreamInstance>,
    #[cfg(windows)]
    instance: Arc<overlapped::OverlappedFileInstance>,
    last_code: ResultCodeCell,
    this: Weak<FileStream>,
}

impl FileStream {
    #[cfg(unix)]
    pub(crate) fn attach(
        io_loop: Arc<IoLoop>,
        instance: Arc<fd::FdStreamInstance>,
    ) -> io::Result<Arc<FileStream>> {
        let stream = Arc::new_cyclic(|this| FileStream {
            io_loop,
            instance,
            last_code: ResultCodeCell::new(),
            this: this.clone(),
        });
        stream.instance.slots.set_object(stream.this.clone());
        stream.io_loop.attach_instance(stream.as_instance())?;
        Ok(stream)
    }

    #[cfg(windows)]
    pub(crate) fn attach(
        io_loop: Arc<IoLoop>,
        instance: Arc<overlapped::OverlappedFileInstance>,
    ) -> io::Result<Arc<FileStream>> {
        let stream = Arc::new_cyclic(|this| FileStream {
            io_loop,
            instance,
            last_code: ResultCodeCell::new(),
            this: this.clone(),
        });
        stream.instance.slots.set_object(stream.this.clone());
        stream.io_loop.attach_instance(stream.as_instance())?;
        Ok(stream)
    }

    /// Opens a path as an overlapped file stream. Windows only; POSIX callers
    /// go through [`open_stream`] which falls back to the simulator.
    #[cfg(windows)]
    pub fn open<P: AsRef<Path>>(
        path: P,
        mode: OpenMode,
        io_loop: Option<&Arc<IoLoop>>,
    ) -> io::Result<Arc<FileStream>> {
        let io_loop = resolve_loop(io_loop)?;
        let instance = overlapped::OverlappedFileInstance::open(path.as_ref(), mode)?;
        FileStream::attach(io_loop, instance)
    }

    fn as_instance(&self) -> Arc<dyn IoInstance> {
        self.instance.clone()
    }
}

impl AsyncStream for FileStream {
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

    #[cfg(windows)]
    fn is_seekable(&self) -> bool {
        self.instance.is_seekable()
    }

    #[cfg(windows)]
    fn seek(&self, pos: u64) -> bool {
        self.instance.seek(pos)
    }

    #[cfg(windows)]
    fn position(&self) -> u64 {
        self.instance.position()
    }

    #[cfg(windows)]
    fn size(&self) -> u64 {
        self.instance.size()
    }
}

impl Drop for FileStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens a path as an [`AsyncStream`]: an overlapped [`FileStream`] on
/// Windows, a dispatcher-backed [`File`] elsewhere.
pub fn open_stream<P: AsRef<Path>>(
    path: P,
    mode: OpenMode,
    io_loop: Option<&Arc<IoLoop>>,
) -> io::Result<Arc<dyn AsyncStream>> {
    #[cfg(windows)]
    {
        let stream = FileStream::open(path, mode, io_loop)?;
        Ok(stream)
    }
    #[cfg(unix)]
    {
        let _ = io_loop;
        let file = File::open(path, mode)?;
        Ok(file)
    }
}

#[cfg(unix)]
pub(crate) mod fd {
    use super::*;
    use crate::event::EventDesc;
    use crate::instance::InstanceState;
    use crate::io_mode::IoMode;
    use crate::sys;

    /// Outcome of one non-blocking syscall attempt.
    pub(crate) enum IoStep {
        Empty,
        Done(usize),
        WouldBlock,
        Ended,
        Failed,
    }

    pub(crate) fn fd_read(fd: sys::Handle, buf: &mut [u8]) -> IoStep {
        if buf.is_empty() {
            return IoStep::Empty;
        }
        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n > 0 {
                return IoStep::Done(n as usize);
            }
            if n == 0 {
                return IoStep::Ended;
            }
            match io::Error::last_os_error().kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return IoStep::WouldBlock,
                _ => return IoStep::Failed,
            }
        }
    }

    pub(crate) fn fd_write(fd: sys::Handle, buf: &mut [u8]) -> IoStep {
        if buf.is_empty() {
            return IoStep::Empty;
        }
        loop {
            let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
            if n > 0 {
                return IoStep::Done(n as usize);
            }
            if n == 0 {
                return IoStep::Failed;
            }
            match io::Error::last_os_error().kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return IoStep::WouldBlock,
                _ => return IoStep::Failed,
            }
        }
    }

    /// Stream instance over a non-blocking descriptor (pipe end, character
    /// device). Seek is not supported.
    pub(crate) struct FdStreamInstance {
        state: InstanceState,
        pub(crate) slots: StreamSlots,
    }

    impl FdStreamInstance {
        pub fn new(fd: sys::Handle, mode: IoMode) -> Arc<FdStreamInstance> {
            Arc::new(FdStreamInstance {
                state: InstanceState::new(fd, mode),
                slots: StreamSlots::new(),
            })
        }

        fn process_read(&self, flag_error: bool) {
            let fd = self.state.handle();
            if fd == sys::INVALID_HANDLE {
                return;
            }
            while let Some(request) = self.slots.next_read() {
                let step = request.with_buf(|buf| fd_read(fd, buf));
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
                let step = request.with_buf(|buf| fd_write(fd, buf));
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
    }

    impl IoInstance for FdStreamInstance {
        fn state(&self) -> &InstanceState {
            &self.state
        }

        fn on_order(&self) {
            self.process_read(false);
            self.process_write(false);
        }

        fn on_event(&self, event: &EventDesc) {
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
            self.slots.close_all();
            let handle = self.state.take_handle();
            if handle != sys::INVALID_HANDLE {
                sys::unix::close_handle(handle);
            }
        }
    }
}

#[cfg(windows)]
pub(crate) mod overlapped {
    use std::cell::UnsafeCell;
    use std::os::windows::ffi::OsStrExt;

    use windows_sys::Win32::Foundation::{
        GetLastError, ERROR_HANDLE_EOF, ERROR_IO_PENDING, GENERIC_READ, GENERIC_WRITE,
        INVALID_HANDLE_VALUE,
    };
    use windows_sys::Win32::Storage::FileSystem::{
        CreateFileW, GetFileSizeEx, ReadFile, WriteFile, CREATE_ALWAYS, FILE_ATTRIBUTE_NORMAL,
        FILE_FLAG_OVERLAPPED, FILE_FLAG_RANDOM_ACCESS, FILE_SHARE_READ, OPEN_ALWAYS,
        OPEN_EXISTING, TRUNCATE_EXISTING,
    };
    use windows_sys::Win32::System::IO::{GetOverlappedResult, OVERLAPPED};

    use super::*;
    use crate::event::EventDesc;
    use crate::instance::InstanceState;
    use crate::io_mode::IoMode;
    use crate::sys;

    /// Overlapped file stream instance. Each slot owns an embedded
    /// `OVERLAPPED`; order issues the syscall, the completion packet resolves
    /// it through `GetOverlappedResult`.
    pub(crate) struct OverlappedFileInstance {
        state: InstanceState,
        pub(crate) slots: StreamSlots,
        seekable: bool,
        offset: Mutex<u64>,
        overlapped_read: UnsafeCell<OVERLAPPED>,
        overlapped_write: UnsafeCell<OVERLAPPED>,
    }

    unsafe impl Send for OverlappedFileInstance {}
    unsafe impl Sync for OverlappedFileInstance {}

    // A single overlapped syscall transfers at most this much.
    const MAX_IO: usize = 0x4000_0000;

    impl OverlappedFileInstance {
        pub fn open(path: &Path, mode: OpenMode) -> io::Result<Arc<OverlappedFileInstance>> {
            let mut wide: Vec<u16> = path.as_os_str().encode_wide().collect();
            wide.push(0);

            let mut access = 0u32;
            let disposition;
            if mode.contains(OpenMode::WRITE) {
                access |= GENERIC_WRITE;
                if mode.contains(OpenMode::READ) {
                    access |= GENERIC_READ;
                }
                disposition = if mode.contains(OpenMode::NOT_CREATE) {
                    if mode.contains(OpenMode::NOT_TRUNCATE) {
                        OPEN_EXISTING
                    } else {
                        TRUNCATE_EXISTING
                    }
                } else if mode.contains(OpenMode::NOT_TRUNCATE) {
                    OPEN_ALWAYS
                } else {
                    CREATE_ALWAYS
                };
            } else {
                access = GENERIC_READ;
                disposition = OPEN_EXISTING;
            }
            let mut flags = FILE_ATTRIBUTE_NORMAL | FILE_FLAG_OVERLAPPED;
            if mode.contains(OpenMode::HINT_RANDOM_ACCESS) {
                flags |= FILE_FLAG_RANDOM_ACCESS;
            }

            let handle = unsafe {
                CreateFileW(
                    wide.as_ptr(),
                    access,
                    if mode.contains(OpenMode::READ) { FILE_SHARE_READ } else { 0 },
                    std::ptr::null(),
                    disposition,
                    flags,
                    std::ptr::null_mut(),
                )
            };
            if handle == INVALID_HANDLE_VALUE {
                return Err(io::Error::last_os_error());
            }

            let mut offset = 0u64;
            if mode.contains(OpenMode::SEEK_TO_END) || mode.contains(OpenMode::APPEND) {
                let mut size = 0i64;
                if unsafe { GetFileSizeEx(handle, &mut size) } != 0 {
                    offset = size as u64;
                }
            }

            Ok(Arc::new(OverlappedFileInstance {
                state: InstanceState::new(handle as sys::Handle, IoMode::InOut),
                slots: StreamSlots::new(),
                seekable: true,
                offset: Mutex::new(offset),
                overlapped_read: UnsafeCell::new(unsafe { std::mem::zeroed() }),
                overlapped_write: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            }))
        }

        /// Wraps an already-overlapped handle with no file position (pipe
        /// ends).
        pub fn from_handle(handle: sys::Handle) -> Arc<OverlappedFileInstance> {
            Arc::new(OverlappedFileInstance {
                state: InstanceState::new(handle, IoMode::InOut),
                slots: StreamSlots::new(),
                seekable: false,
                offset: Mutex::new(0),
                overlapped_read: UnsafeCell::new(unsafe { std::mem::zeroed() }),
                overlapped_write: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            })
        }

        pub fn is_seekable(&self) -> bool {
            self.seekable
        }

        pub fn seek(&self, pos: u64) -> bool {
            if !self.seekable {
                return false;
            }
            *self.offset.lock().unwrap() = pos;
            true
        }

        pub fn position(&self) -> u64 {
            *self.offset.lock().unwrap()
        }

        pub fn size(&self) -> u64 {
            let handle = self.state.handle();
            if handle == sys::INVALID_HANDLE {
                return 0;
            }
            let mut size = 0i64;
            if unsafe { GetFileSizeEx(handle as _, &mut size) } != 0 {
                size as u64
            } else {
                0
            }
        }

        fn issue(&self, request: Arc<StreamRequest>, read: bool) {
            let handle = self.state.handle();
            let overlapped = if read {
                self.overlapped_read.get()
            } else {
                self.overlapped_write.get()
            };
            let offset = *self.offset.lock().unwrap();

            let issued = request.with_buf(|buf| {
                if buf.is_empty() {
                    return Some(true);
                }
                unsafe {
                    *overlapped = std::mem::zeroed();
                    (*overlapped).Anonymous.Anonymous.Offset = offset as u32;
                    (*overlapped).Anonymous.Anonymous.OffsetHigh = (offset >> 32) as u32;
                }
                let len = buf.len().min(MAX_IO) as u32;
                let ok = unsafe {
                    if read {
                        ReadFile(
                            handle as _,
                            buf.as_mut_ptr(),
                            len,
                            std::ptr::null_mut(),
                            overlapped,
                        )
                    } else {
                        WriteFile(
                            handle as _,
                            buf.as_ptr(),
                            len,
                            std::ptr::null_mut(),
                            overlapped,
                        )
                    }
                };
                if ok != 0 {
                    // Synchronous success still queues a completion packet.
                    None
                } else if unsafe { GetLastError() } == ERROR_IO_PENDING {
                    None
                } else {
                    Some(false)
                }
            });

            match issued {
                // Finished request (timeout/close raced the issue).
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

        fn complete(&self, read: bool, _bytes_hint: u32) {
            let handle = self.state.handle();
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
            let ok = unsafe { GetOverlappedResult(handle as _, overlapped, &mut transferred, 0) };
            if ok != 0 {
                if self.seekable {
                    *self.offset.lock().unwrap() += u64::from(transferred);
                }
                self.slots
                    .process_result(&request, transferred as usize, StreamResultCode::Success);
            } else {
                let code = if unsafe { GetLastError() } == ERROR_HANDLE_EOF && read {
                    StreamResultCode::Ended
                } else {
                    StreamResultCode::Unknown
                };
                self.slots.process_result(&request, 0, code);
            }
        }
    }

    impl IoInstance for OverlappedFileInstance {
        fn state(&self) -> &InstanceState {
            &self.state
        }

        fn on_order(&self) {
            if self.state.handle() == sys::INVALID_HANDLE {
                return;
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
                self.complete(true, event.bytes);
            } else if event.overlapped == self.overlapped_write.get() as *mut _ {
                self.complete(false, event.bytes);
            }
            self.state.request_order();
        }

        fn on_close(&self) {
            self.slots.close_all();
            let handle = self.state.take_handle();
            if handle != sys::INVALID_HANDLE {
                sys::windows::close_handle(handle);
            }
        }
    }
}
