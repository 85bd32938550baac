use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::instance::IoInstance;
use crate::io_loop::{resolve_loop, IoLoop};

#[cfg(unix)]
pub use crate::sys::unix::pktinfo::PacketInfo;
#[cfg(windows)]
pub use self::win::PacketInfo;

/// One received datagram, borrowed for the duration of the callback.
pub struct UdpPacket<'a> {
    pub source: SocketAddr,
    pub data: &'a [u8],
    /// Present when packet information is enabled on the socket.
    pub info: Option<PacketInfo>,
}

/// Callback receiving every datagram the socket drains.
pub type UdpReceiveCallback = Box<dyn FnMut(&UdpPacket<'_>) + Send>;

/// Datagram socket configuration.
pub struct UdpSocketParam {
    pub bind_address: Option<SocketAddr>,
    pub ipv6: bool,
    pub reuse_address: bool,
    /// `SO_REUSEPORT` where the platform has it.
    pub reuse_port: bool,
    /// Enable `IP_PKTINFO`/`IPV6_PKTINFO` so receives carry the interface
    /// index and destination address.
    pub packet_info: bool,
    /// Size of the single receive buffer.
    pub packet_size: usize,
    pub auto_start: bool,
    pub on_receive: Option<UdpReceiveCallback>,
    pub on_error: Option<Box<dyn FnMut() + Send>>,
}

impl Default for UdpSocketParam {
    fn default() -> UdpSocketParam {
        UdpSocketParam {
            bind_address: None,
            ipv6: false,
            reuse_address: false,
            reuse_port: false,
            packet_info: false,
            packet_size: 65536,
            auto_start: true,
            on_receive: None,
            on_error: None,
        }
    }
}

/// Asynchronous UDP socket.
///
/// Receives are drained on the loop thread and pushed through the configured
/// callback; sends are synchronous from the caller and are never queued.
pub struct UdpSocket {
    io_loop: Arc<IoLoop>,
    instance: Arc<imp::UdpInstance>,
}

impl UdpSocket {
    pub fn create(param: UdpSocketParam, io_loop: Option<&Arc<IoLoop>>) -> io::Result<Arc<UdpSocket>> {
        let io_loop = resolve_loop(io_loop)?;
        let auto_start = param.auto_start;
        let instance = imp::UdpInstance::create(param)?;
        let socket = Arc::new(UdpSocket { io_loop, instance });
        socket.io_loop.attach_instance(socket.as_instance())?;
        if auto_start {
            socket.start();
        }
        Ok(socket)
    }

    /// Begins draining receives.
    pub fn start(&self) {
        self.instance.set_running(true);
        self.io_loop.request_order(&self.as_instance());
    }

    pub fn is_running(&self) -> bool {
        self.instance.is_running()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.instance.local_addr()
    }

    /// Synchronous send.
    pub fn send_to(&self, addr: &SocketAddr, data: &[u8]) -> io::Result<usize> {
        self.instance.send_to(addr, data)
    }

    /// Synchronous send with explicit interface and source address, encoded
    /// as packet-info ancillary data.
    pub fn send_to_with_info(
        &self,
        interface_index: u32,
        source: Option<IpAddr>,
        addr: &SocketAddr,
        data: &[u8],
    ) -> io::Result<usize> {
        self.instance.send_to_with_info(interface_index, source, addr, data)
    }

    pub fn close(&self) {
        self.io_loop.close_instance(&self.as_instance());
    }

    fn as_instance(&self) -> Arc<dyn IoInstance> {
        self.instance.clone()
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) struct UdpCallbacks {
    pub on_receive: Mutex<Option<UdpReceiveCallback>>,
    pub on_error: Mutex<Option<Box<dyn FnMut() + Send>>>,
    pub running: AtomicBool,
}

impl UdpCallbacks {
    fn new(param: &mut UdpSocketParam) -> UdpCallbacks {
        UdpCallbacks {
            on_receive: Mutex::new(param.on_receive.take()),
            on_error: Mutex::new(param.on_error.take()),
            running: AtomicBool::new(false),
        }
    }

    fn deliver(&self, packet: &UdpPacket<'_>) {
        if let Some(callback) = self.on_receive.lock().unwrap().as_mut() {
            callback(packet);
        }
    }

    fn error(&self) {
        if let Some(callback) = self.on_error.lock().unwrap().as_mut() {
            callback();
        }
    }
}

#[cfg(unix)]
mod imp {
    use super::*;
    use crate::event::EventDesc;
    use crate::instance::InstanceState;
    use crate::io_mode::IoMode;
    use crate::sys;
    use crate::sys::unix::net as unet;
    use crate::sys::unix::pktinfo;

    /// Datagram instance: a single receive buffer drained with
    /// `recvfrom`/`recvmsg` until would-block.
    pub(crate) struct UdpInstance {
        state: InstanceState,
        buffer: Mutex<Vec<u8>>,
        packet_info: bool,
        callbacks: UdpCallbacks,
    }

    impl UdpInstance {
        pub fn create(mut param: UdpSocketParam) -> io::Result<Arc<UdpInstance>> {
            let domain = if param.ipv6 { libc::AF_INET6 } else { libc::AF_INET };
            let fd = unet::new_socket(domain, libc::SOCK_DGRAM)?;
            let prepared = (|| {
                if param.reuse_address {
                    unet::set_reuseaddr(fd, true)?;
                }
                #[cfg(not(any(target_os = "illumos", target_os = "solaris")))]
                if param.reuse_port {
                    unet::set_reuseport(fd, true)?;
                }
                if let Some(addr) = param.bind_address {
                    unet::bind(fd, &addr)?;
                }
                if param.packet_info {
                    pktinfo::set_packet_info(fd, param.ipv6, true)?;
                }
                Ok(())
            })();
            if let Err(err) = prepared {
                sys::unix::close_handle(fd);
                return Err(err);
            }
            let packet_size = param.packet_size.max(1);
            Ok(Arc::new(UdpInstance {
                state: InstanceState::new(fd, IoMode::In),
                buffer: Mutex::new(vec![0; packet_size]),
                packet_info: param.packet_info,
                callbacks: UdpCallbacks::new(&mut param),
            }))
        }

        pub fn set_running(&self, running: bool) {
            self.callbacks.running.store(running, Ordering::Release);
        }

        pub fn is_running(&self) -> bool {
            self.callbacks.running.load(Ordering::Acquire)
        }

        pub fn local_addr(&self) -> io::Result<SocketAddr> {
            unet::local_addr(self.state.handle())
        }

        pub fn send_to(&self, addr: &SocketAddr, data: &[u8]) -> io::Result<usize> {
            pktinfo::send_to(self.state.handle(), data, addr)
        }

        pub fn send_to_with_info(
            &self,
            interface_index: u32,
            source: Option<IpAddr>,
            addr: &SocketAddr,
            data: &[u8],
        ) -> io::Result<usize> {
            pktinfo::send_msg(self.state.handle(), data, addr, interface_index, source)
        }

        fn process_receive(&self) {
            if !self.is_running() {
                return;
            }
            let fd = self.state.handle();
            if fd == sys::INVALID_HANDLE {
                return;
            }
            let mut buffer = self.buffer.lock().unwrap();
            loop {
                let received = if self.packet_info {
                    pktinfo::recv_msg(fd, &mut buffer)
                } else {
                    pktinfo::recv_from(fd, &mut buffer).map(|(n, addr)| (n, addr, None))
                };
                match received {
                    Ok((n, source, info)) => {
                        let packet = UdpPacket {
                            source,
                            data: &buffer[..n],
                            info,
                        };
                        self.callbacks.deliver(&packet);
                    }
                    Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return,
                    Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => {
                        self.callbacks.error();
                        return;
                    }
                }
            }
        }
    }

    impl IoInstance for UdpInstance {
        fn state(&self) -> &InstanceState {
            &self.state
        }

        fn on_order(&self) {
            self.process_receive();
        }

        fn on_event(&self, event: &EventDesc) {
            if event.readable {
                self.process_receive();
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
mod win {
    use std::net::IpAddr;

    /// Ancillary data extracted from one received datagram.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct PacketInfo {
        pub interface_index: u32,
        pub destination: IpAddr,
    }
}

#[cfg(windows)]
mod imp {
    use std::cell::UnsafeCell;
    use std::mem;

    use windows_sys::Win32::Networking::WinSock::{
        bind, sendto, WSAGetLastError, WSAGetOverlappedResult, WSARecvFrom, CMSGHDR, IN6_PKTINFO,
        IN_PKTINFO, IPPROTO_IP, IPPROTO_IPV6, IPV6_PKTINFO, IP_PKTINFO, SOCKADDR,
        SOCKADDR_STORAGE, SOCKET, SOCKET_ERROR, WSABUF, WSAMSG, WSA_IO_PENDING,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    use super::*;
    use crate::event::EventDesc;
    use crate::instance::InstanceState;
    use crate::io_mode::IoMode;
    use crate::sys;
    use crate::sys::windows::net as winnet;

    /// Datagram instance: one overlapped `WSARecvFrom` in flight; each
    /// completion delivers the packet and re-arms the receive.
    ///
    /// Packet information relies on `WSARecvMsg`, which is looked up at
    /// creation; when the provider lacks it the socket downgrades to plain
    /// receives without ancillary data.
    pub(crate) struct UdpInstance {
        state: InstanceState,
        buffer: UnsafeCell<Vec<u8>>,
        from: UnsafeCell<SOCKADDR_STORAGE>,
        from_len: UnsafeCell<i32>,
        control: UnsafeCell<[u8; 128]>,
        msg: UnsafeCell<WSAMSG>,
        wsabuf: UnsafeCell<WSABUF>,
        overlapped: UnsafeCell<OVERLAPPED>,
        receiving: AtomicBool,
        packet_info: bool,
        recv_msg: Option<winnet::WsaRecvMsgFn>,
        callbacks: UdpCallbacks,
    }

    unsafe impl Send for UdpInstance {}
    unsafe impl Sync for UdpInstance {}

    impl UdpInstance {
        pub fn create(mut param: UdpSocketParam) -> io::Result<Arc<UdpInstance>> {
            let socket = winnet::new_socket(param.ipv6, true)?;
            let prepared = (|| {
                if param.reuse_address {
                    winnet::set_reuseaddr(socket, true)?;
                }
                if let Some(addr) = param.bind_address {
                    let (raw, len) = winnet::socket_addr(&addr);
                    let res = unsafe { bind(socket as SOCKET, raw.as_ptr(), len) };
                    if res != 0 {
                        return Err(io::Error::last_os_error());
                    }
                }
                if param.packet_info {
                    winnet::set_packet_info(socket, param.ipv6, true)?;
                }
                Ok(())
            })();
            if let Err(err) = prepared {
                winnet::close_socket(socket);
                return Err(err);
            }
            let packet_size = param.packet_size.max(1);
            let recv_msg = if param.packet_info {
                winnet::wsa_recv_msg(socket)
            } else {
                None
            };
            Ok(Arc::new(UdpInstance {
                state: InstanceState::new(socket, IoMode::In),
                buffer: UnsafeCell::new(vec![0; packet_size]),
                from: UnsafeCell::new(unsafe { mem::zeroed() }),
                from_len: UnsafeCell::new(mem::size_of::<SOCKADDR_STORAGE>() as i32),
                control: UnsafeCell::new([0; 128]),
                msg: UnsafeCell::new(unsafe { mem::zeroed() }),
                wsabuf: UnsafeCell::new(unsafe { mem::zeroed() }),
                overlapped: UnsafeCell::new(unsafe { mem::zeroed() }),
                receiving: AtomicBool::new(false),
                // Downgrade when the provider lacks WSARecvMsg.
                packet_info: param.packet_info && recv_msg.is_some(),
                recv_msg,
                callbacks: UdpCallbacks::new(&mut param),
            }))
        }

        pub fn set_running(&self, running: bool) {
            self.callbacks.running.store(running, Ordering::Release);
        }

        pub fn is_running(&self) -> bool {
            self.callbacks.running.load(Ordering::Acquire)
        }

        pub fn local_addr(&self) -> io::Result<SocketAddr> {
            winnet::local_addr(self.state.handle())
        }

        pub fn send_to(&self, addr: &SocketAddr, data: &[u8]) -> io::Result<usize> {
            let (raw, len) = winnet::socket_addr(addr);
            let res = unsafe {
                sendto(
                    self.state.handle() as SOCKET,
                    data.as_ptr(),
                    data.len().min(i32::MAX as usize) as i32,
                    0,
                    raw.as_ptr(),
                    len,
                )
            };
            if res == SOCKET_ERROR {
                Err(io::Error::last_os_error())
            } else {
                Ok(res as usize)
            }
        }

        pub fn send_to_with_info(
            &self,
            _interface_index: u32,
            _source: Option<IpAddr>,
            addr: &SocketAddr,
            data: &[u8],
        ) -> io::Result<usize> {
            // WSASendMsg needs a per-provider lookup; plain sendto covers the
            // routed case and the stack picks interface and source.
            self.send_to(addr, data)
        }

        fn arm_receive(&self) {
            if !self.is_running() || self.receiving.swap(true, Ordering::AcqRel) {
                return;
            }
            let socket = self.state.handle();
            let overlapped = self.overlapped.get();
            unsafe {
                *overlapped = mem::zeroed();
                *self.from_len.get() = mem::size_of::<SOCKADDR_STORAGE>() as i32;
                let buffer = &mut *self.buffer.get();
                *self.wsabuf.get() = WSABUF {
                    len: buffer.len().min(u32::MAX as usize) as u32,
                    buf: buffer.as_mut_ptr(),
                };
                let res = if let (true, Some(recv_msg)) = (self.packet_info, self.recv_msg) {
                    let control = &mut *self.control.get();
                    *self.msg.get() = WSAMSG {
                        name: self.from.get() as *mut SOCKADDR,
                        namelen: mem::size_of::<SOCKADDR_STORAGE>() as i32,
                        lpBuffers: self.wsabuf.get(),
                        dwBufferCount: 1,
                        Control: WSABUF {
                            len: control.len() as u32,
                            buf: control.as_mut_ptr(),
                        },
                        dwFlags: 0,
                    };
                    recv_msg(
                        socket as SOCKET,
                        self.msg.get(),
                        std::ptr::null_mut(),
                        overlapped,
                        std::ptr::null(),
                    )
                } else {
                    let mut flags: u32 = 0;
                    WSARecvFrom(
                        socket as SOCKET,
                        self.wsabuf.get(),
                        1,
                        std::ptr::null_mut(),
                        &mut flags,
                        self.from.get() as *mut SOCKADDR,
                        self.from_len.get(),
                        overlapped,
                        None,
                    )
                };
                if res != 0 && WSAGetLastError() != WSA_IO_PENDING {
                    self.receiving.store(false, Ordering::Release);
                    self.callbacks.error();
                }
            }
        }

        /// Walks the control buffer of a completed `WSARecvMsg`.
        fn extract_info(&self) -> Option<PacketInfo> {
            use std::net::{Ipv4Addr, Ipv6Addr};

            let msg = unsafe { &*self.msg.get() };
            let control = msg.Control.buf as usize;
            let control_len = msg.Control.len as usize;
            let align = mem::align_of::<CMSGHDR>();
            let header_len = mem::size_of::<CMSGHDR>();
            let mut cursor = control;
            while cursor + header_len <= control + control_len {
                let header = unsafe { &*(cursor as *const CMSGHDR) };
                if header.cmsg_len < header_len {
                    break;
                }
                let data = cursor + ((header_len + align - 1) & !(align - 1));
                if header.cmsg_level == IPPROTO_IP && header.cmsg_type == IP_PKTINFO as i32 {
                    let info = unsafe { &*(data as *const IN_PKTINFO) };
                    return Some(PacketInfo {
                        interface_index: info.ipi_ifindex,
                        destination: IpAddr::V4(Ipv4Addr::from(unsafe {
                            info.ipi_addr.S_un.S_addr.to_ne_bytes()
                        })),
                    });
                }
                if header.cmsg_level == IPPROTO_IPV6 && header.cmsg_type == IPV6_PKTINFO as i32 {
                    let info = unsafe { &*(data as *const IN6_PKTINFO) };
                    return Some(PacketInfo {
                        interface_index: info.ipi6_ifindex,
                        destination: IpAddr::V6(Ipv6Addr::from(unsafe { info.ipi6_addr.u.Byte })),
                    });
                }
                let advance = (header.cmsg_len + align - 1) & !(align - 1);
                cursor += advance.max(header_len);
            }
            None
        }

        fn complete_receive(&self) {
            if !self.receiving.swap(false, Ordering::AcqRel) {
                return;
            }
            let socket = self.state.handle();
            let mut transferred: u32 = 0;
            let mut flags: u32 = 0;
            let ok = unsafe {
                WSAGetOverlappedResult(
                    socket as SOCKET,
                    self.overlapped.get(),
                    &mut transferred,
                    0,
                    &mut flags,
                )
            };
            if ok != 0 {
                let source = unsafe { winnet::to_socket_addr(self.from.get()) };
                if let Ok(source) = source {
                    let info = if self.packet_info { self.extract_info() } else { None };
                    let buffer = unsafe { &*self.buffer.get() };
                    let packet = UdpPacket {
                        source,
                        data: &buffer[..transferred as usize],
                        info,
                    };
                    self.callbacks.deliver(&packet);
                }
            } else {
                self.callbacks.error();
            }
            self.arm_receive();
        }
    }

    impl IoInstance for UdpInstance {
        fn state(&self) -> &InstanceState {
            &self.state
        }

        fn on_order(&self) {
            self.arm_receive();
        }

        fn on_event(&self, event: &EventDesc) {
            if event.overlapped == self.overlapped.get() as *mut _ {
                self.complete_receive();
            }
        }

        fn on_close(&self) {
            let handle = self.state.take_handle();
            if handle != sys::INVALID_HANDLE {
                winnet::close_socket(handle);
            }
        }
    }
}
