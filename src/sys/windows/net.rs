use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Once;

use windows_sys::Win32::Networking::WinSock::{
    closesocket, getsockname, getsockopt, setsockopt, WSAIoctl, WSASocketW, AF_INET, AF_INET6,
    FIONBIO, INVALID_SOCKET, IN6_ADDR, IN_ADDR, SIO_GET_EXTENSION_FUNCTION_POINTER, SOCKADDR,
    SOCKADDR_IN, SOCKADDR_IN6, SOCKADDR_STORAGE, SOCKET, SOCKET_ERROR, SOCK_DGRAM, SOCK_STREAM,
    SOL_SOCKET, SO_ERROR, SO_REUSEADDR, SO_UPDATE_ACCEPT_CONTEXT, SO_UPDATE_CONNECT_CONTEXT,
    WSAPROTOCOL_INFOW, WSA_FLAG_OVERLAPPED,
};
use windows_sys::core::GUID;

use super::Handle;

/// Winsock requires a one-time initialisation; the standard library performs
/// it on first use of any of its socket types.
pub(crate) fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        drop(std::net::UdpSocket::bind("127.0.0.1:0"));
    });
}

pub(crate) fn new_socket(ipv6: bool, datagram: bool) -> io::Result<Handle> {
    init();
    let family = if ipv6 { AF_INET6 } else { AF_INET };
    let ty = if datagram { SOCK_DGRAM } else { SOCK_STREAM };
    let socket = unsafe {
        WSASocketW(
            family as i32,
            ty as i32,
            0,
            std::ptr::null::<WSAPROTOCOL_INFOW>() as *const _,
            0,
            WSA_FLAG_OVERLAPPED,
        )
    };
    if socket == INVALID_SOCKET {
        return Err(io::Error::last_os_error());
    }
    Ok(socket as Handle)
}

pub(crate) fn set_nonblocking(socket: Handle) -> io::Result<()> {
    let mut nonblocking: u32 = 1;
    let res = unsafe {
        windows_sys::Win32::Networking::WinSock::ioctlsocket(
            socket as SOCKET,
            FIONBIO,
            &mut nonblocking,
        )
    };
    if res == SOCKET_ERROR {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub(crate) fn close_socket(socket: Handle) {
    unsafe {
        closesocket(socket as SOCKET);
    }
}

/// A `SOCKADDR` large enough for either address family.
pub(crate) union SocketAddrCRepr {
    v4: SOCKADDR_IN,
    v6: SOCKADDR_IN6,
}

impl SocketAddrCRepr {
    pub(crate) fn as_ptr(&self) -> *const SOCKADDR {
        self as *const _ as *const SOCKADDR
    }
}

pub(crate) fn socket_addr(addr: &SocketAddr) -> (SocketAddrCRepr, i32) {
    match addr {
        SocketAddr::V4(ref addr) => {
            let mut sockaddr: SOCKADDR_IN = unsafe { mem::zeroed() };
            sockaddr.sin_family = AF_INET;
            sockaddr.sin_port = addr.port().to_be();
            sockaddr.sin_addr = ipv4_addr(*addr.ip());
            (
                SocketAddrCRepr { v4: sockaddr },
                mem::size_of::<SOCKADDR_IN>() as i32,
            )
        }
        SocketAddr::V6(ref addr) => {
            let mut sockaddr: SOCKADDR_IN6 = unsafe { mem::zeroed() };
            sockaddr.sin6_family = AF_INET6;
            sockaddr.sin6_port = addr.port().to_be();
            unsafe {
                sockaddr.sin6_addr.u.Byte = addr.ip().octets();
            }
            (
                SocketAddrCRepr { v6: sockaddr },
                mem::size_of::<SOCKADDR_IN6>() as i32,
            )
        }
    }
}

pub(crate) fn ipv4_addr(ip: Ipv4Addr) -> IN_ADDR {
    let mut addr: IN_ADDR = unsafe { mem::zeroed() };
    addr.S_un.S_addr = u32::from_ne_bytes(ip.octets());
    addr
}

pub(crate) fn ipv6_addr(ip: Ipv6Addr) -> IN6_ADDR {
    let mut addr: IN6_ADDR = unsafe { mem::zeroed() };
    addr.u.Byte = ip.octets();
    addr
}

pub(crate) unsafe fn to_socket_addr(storage: *const SOCKADDR_STORAGE) -> io::Result<SocketAddr> {
    match (*storage).ss_family {
        AF_INET => {
            let addr = &*(storage as *const SOCKADDR_IN);
            let ip = Ipv4Addr::from(addr.sin_addr.S_un.S_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(addr.sin_port),
            )))
        }
        AF_INET6 => {
            let addr = &*(storage as *const SOCKADDR_IN6);
            let ip = Ipv6Addr::from(addr.sin6_addr.u.Byte);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(addr.sin6_port),
                addr.sin6_flowinfo,
                addr.Anonymous.sin6_scope_id,
            )))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

pub(crate) fn local_addr(socket: Handle) -> io::Result<SocketAddr> {
    let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<SOCKADDR_STORAGE>() as i32;
    let res = unsafe {
        getsockname(
            socket as SOCKET,
            &mut storage as *mut _ as *mut SOCKADDR,
            &mut len,
        )
    };
    if res == SOCKET_ERROR {
        return Err(io::Error::last_os_error());
    }
    unsafe { to_socket_addr(&storage) }
}

pub(crate) fn set_reuseaddr(socket: Handle, enable: bool) -> io::Result<()> {
    let value: i32 = i32::from(enable);
    let res = unsafe {
        setsockopt(
            socket as SOCKET,
            SOL_SOCKET as i32,
            SO_REUSEADDR as i32,
            &value as *const _ as *const u8,
            mem::size_of::<i32>() as i32,
        )
    };
    if res == SOCKET_ERROR {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub(crate) fn take_socket_error(socket: Handle) -> io::Result<Option<io::Error>> {
    let mut value: i32 = 0;
    let mut len = mem::size_of::<i32>() as i32;
    let res = unsafe {
        getsockopt(
            socket as SOCKET,
            SOL_SOCKET as i32,
            SO_ERROR as i32,
            &mut value as *mut _ as *mut u8,
            &mut len,
        )
    };
    if res == SOCKET_ERROR {
        return Err(io::Error::last_os_error());
    }
    if value == 0 {
        Ok(None)
    } else {
        Ok(Some(io::Error::from_raw_os_error(value)))
    }
}

/// Binds an accepted socket to the listening socket's context so shutdown,
/// getpeername etc. work on it.
pub(crate) fn update_accept_context(accepted: Handle, listener: Handle) -> io::Result<()> {
    let value = listener as SOCKET;
    let res = unsafe {
        setsockopt(
            accepted as SOCKET,
            SOL_SOCKET as i32,
            SO_UPDATE_ACCEPT_CONTEXT as i32,
            &value as *const _ as *const u8,
            mem::size_of::<SOCKET>() as i32,
        )
    };
    if res == SOCKET_ERROR {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub(crate) fn update_connect_context(socket: Handle) -> io::Result<()> {
    let res = unsafe {
        setsockopt(
            socket as SOCKET,
            SOL_SOCKET as i32,
            SO_UPDATE_CONNECT_CONTEXT as i32,
            std::ptr::null(),
            0,
        )
    };
    if res == SOCKET_ERROR {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

// Extension function pointers are fetched per socket at instance creation;
// their absence downgrades the corresponding capability.

pub(crate) type ConnectExFn = unsafe extern "system" fn(
    socket: SOCKET,
    name: *const SOCKADDR,
    namelen: i32,
    send_buffer: *const core::ffi::c_void,
    send_data_length: u32,
    bytes_sent: *mut u32,
    overlapped: *mut windows_sys::Win32::System::IO::OVERLAPPED,
) -> i32;

pub(crate) type AcceptExFn = unsafe extern "system" fn(
    listen_socket: SOCKET,
    accept_socket: SOCKET,
    output_buffer: *mut core::ffi::c_void,
    receive_data_length: u32,
    local_address_length: u32,
    remote_address_length: u32,
    bytes_received: *mut u32,
    overlapped: *mut windows_sys::Win32::System::IO::OVERLAPPED,
) -> i32;

pub(crate) type GetAcceptExSockaddrsFn = unsafe extern "system" fn(
    output_buffer: *const core::ffi::c_void,
    receive_data_length: u32,
    local_address_length: u32,
    remote_address_length: u32,
    local_sockaddr: *mut *mut SOCKADDR,
    local_sockaddr_length: *mut i32,
    remote_sockaddr: *mut *mut SOCKADDR,
    remote_sockaddr_length: *mut i32,
) -> ();

pub(crate) type WsaRecvMsgFn = unsafe extern "system" fn(
    socket: SOCKET,
    msg: *mut windows_sys::Win32::Networking::WinSock::WSAMSG,
    bytes_received: *mut u32,
    overlapped: *mut windows_sys::Win32::System::IO::OVERLAPPED,
    completion_routine: *const core::ffi::c_void,
) -> i32;

const WSAID_WSARECVMSG: GUID = GUID {
    data1: 0xf689d7c8,
    data2: 0x6f1f,
    data3: 0x436b,
    data4: [0x8a, 0x53, 0xe5, 0x4f, 0xe3, 0x51, 0xc3, 0x22],
};

const WSAID_CONNECTEX: GUID = GUID {
    data1: 0x25a207b9,
    data2: 0xddf3,
    data3: 0x4660,
    data4: [0x8e, 0xe9, 0x76, 0xe5, 0x8c, 0x74, 0x06, 0x3e],
};

const WSAID_ACCEPTEX: GUID = GUID {
    data1: 0xb5367df1,
    data2: 0xcbac,
    data3: 0x11cf,
    data4: [0x95, 0xca, 0x00, 0x80, 0x5f, 0x48, 0xa1, 0x92],
};

const WSAID_GETACCEPTEXSOCKADDRS: GUID = GUID {
    data1: 0xb5367df2,
    data2: 0xcbac,
    data3: 0x11cf,
    data4: [0x95, 0xca, 0x00, 0x80, 0x5f, 0x48, 0xa1, 0x92],
};

fn extension_fn(socket: Handle, guid: GUID) -> Option<*const core::ffi::c_void> {
    let mut ptr: *const core::ffi::c_void = std::ptr::null();
    let mut bytes: u32 = 0;
    let res = unsafe {
        WSAIoctl(
            socket as SOCKET,
            SIO_GET_EXTENSION_FUNCTION_POINTER,
            &guid as *const _ as *const core::ffi::c_void,
            mem::size_of::<GUID>() as u32,
            &mut ptr as *mut _ as *mut core::ffi::c_void,
            mem::size_of::<*const core::ffi::c_void>() as u32,
            &mut bytes,
            std::ptr::null_mut(),
            None,
        )
    };
    if res == SOCKET_ERROR || ptr.is_null() {
        None
    } else {
        Some(ptr)
    }
}

pub(crate) fn connect_ex(socket: Handle) -> Option<ConnectExFn> {
    extension_fn(socket, WSAID_CONNECTEX).map(|ptr| unsafe { mem::transmute(ptr) })
}

pub(crate) fn accept_ex(socket: Handle) -> Option<AcceptExFn> {
    extension_fn(socket, WSAID_ACCEPTEX).map(|ptr| unsafe { mem::transmute(ptr) })
}

pub(crate) fn get_accept_ex_sockaddrs(socket: Handle) -> Option<GetAcceptExSockaddrsFn> {
    extension_fn(socket, WSAID_GETACCEPTEXSOCKADDRS).map(|ptr| unsafe { mem::transmute(ptr) })
}

pub(crate) fn wsa_recv_msg(socket: Handle) -> Option<WsaRecvMsgFn> {
    extension_fn(socket, WSAID_WSARECVMSG).map(|ptr| unsafe { mem::transmute(ptr) })
}

pub(crate) fn set_packet_info(socket: Handle, ipv6: bool, enable: bool) -> io::Result<()> {
    use windows_sys::Win32::Networking::WinSock::{
        IPPROTO_IP, IPPROTO_IPV6, IPV6_PKTINFO, IP_PKTINFO,
    };

    let value: i32 = i32::from(enable);
    let (level, option) = if ipv6 {
        (IPPROTO_IPV6, IPV6_PKTINFO as i32)
    } else {
        (IPPROTO_IP, IP_PKTINFO as i32)
    };
    let res = unsafe {
        setsockopt(
            socket as SOCKET,
            level,
            option,
            &value as *const _ as *const u8,
            mem::size_of::<i32>() as i32,
        )
    };
    if res == SOCKET_ERROR {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
