//! Per-packet ancillary data for datagram sockets.
//!
//! With packet information enabled the receive path reports the interface a
//! datagram arrived on and the destination address it was sent to, and the
//! send path can pin the outgoing interface and source address. Both sides
//! speak `in_pktinfo` / `in6_pktinfo` control messages.

use std::io;
use std::mem;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::RawFd;

use super::net::{socket_addr, to_socket_addr};

/// Ancillary data extracted from one received datagram.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PacketInfo {
    /// Index of the interface the datagram arrived on.
    pub interface_index: u32,
    /// Address the datagram was addressed to.
    pub destination: IpAddr,
}

pub(crate) fn recv_from(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = syscall!(recvfrom(
        fd,
        buf.as_mut_ptr() as *mut libc::c_void,
        buf.len(),
        0,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
    ))?;
    Ok((n as usize, to_socket_addr(&storage)?))
}

pub(crate) fn send_to(fd: RawFd, buf: &[u8], addr: &SocketAddr) -> io::Result<usize> {
    let (raw, len) = socket_addr(addr);
    let n = syscall!(sendto(
        fd,
        buf.as_ptr() as *const libc::c_void,
        buf.len(),
        0,
        raw.as_ptr(),
        len,
    ))?;
    Ok(n as usize)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use self::cmsg::{recv_msg, send_msg, set_packet_info};

#[cfg(any(target_os = "linux", target_os = "android"))]
mod cmsg {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

    use super::super::net::{ipv4_addr, ipv6_addr, socket_addr, to_socket_addr};
    use super::*;

    pub(crate) fn set_packet_info(fd: RawFd, ipv6: bool, enable: bool) -> io::Result<()> {
        let value: libc::c_int = i32::from(enable);
        let (level, option) = if ipv6 {
            (libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO)
        } else {
            (libc::IPPROTO_IP, libc::IP_PKTINFO)
        };
        syscall!(setsockopt(
            fd,
            level,
            option,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))
        .map(|_| ())
    }

    pub(crate) fn recv_msg(
        fd: RawFd,
        buf: &mut [u8],
    ) -> io::Result<(usize, SocketAddr, Option<PacketInfo>)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut control = [0u8; 128];

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = &mut storage as *mut _ as *mut libc::c_void;
        msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len() as _;

        let n = syscall!(recvmsg(fd, &mut msg, 0))?;
        let addr = to_socket_addr(&storage)?;

        let mut info = None;
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                let hdr = &*cmsg;
                if hdr.cmsg_level == libc::IPPROTO_IP && hdr.cmsg_type == libc::IP_PKTINFO {
                    let data = &*(libc::CMSG_DATA(cmsg) as *const libc::in_pktinfo);
                    info = Some(PacketInfo {
                        interface_index: data.ipi_ifindex as u32,
                        destination: IpAddr::V4(Ipv4Addr::from(data.ipi_addr.s_addr.to_ne_bytes())),
                    });
                } else if hdr.cmsg_level == libc::IPPROTO_IPV6
                    && hdr.cmsg_type == libc::IPV6_PKTINFO
                {
                    let data = &*(libc::CMSG_DATA(cmsg) as *const libc::in6_pktinfo);
                    info = Some(PacketInfo {
                        interface_index: data.ipi6_ifindex,
                        destination: IpAddr::V6(Ipv6Addr::from(data.ipi6_addr.s6_addr)),
                    });
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }

        Ok((n as usize, addr, info))
    }

    pub(crate) fn send_msg(
        fd: RawFd,
        buf: &[u8],
        addr: &SocketAddr,
        interface_index: u32,
        source: Option<IpAddr>,
    ) -> io::Result<usize> {
        let (raw, len) = socket_addr(addr);
        let mut iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut control = [0u8; 128];

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_name = raw.as_ptr() as *mut libc::c_void;
        msg.msg_namelen = len;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;

        unsafe {
            match addr {
                SocketAddr::V4(_) => {
                    msg.msg_controllen =
                        libc::CMSG_SPACE(mem::size_of::<libc::in_pktinfo>() as u32) as _;
                    let cmsg = &mut *libc::CMSG_FIRSTHDR(&msg);
                    cmsg.cmsg_level = libc::IPPROTO_IP;
                    cmsg.cmsg_type = libc::IP_PKTINFO;
                    cmsg.cmsg_len =
                        libc::CMSG_LEN(mem::size_of::<libc::in_pktinfo>() as u32) as _;
                    let mut data: libc::in_pktinfo = mem::zeroed();
                    data.ipi_ifindex = interface_index as libc::c_int;
                    if let Some(IpAddr::V4(ip)) = source {
                        data.ipi_spec_dst = ipv4_addr(ip);
                    }
                    (libc::CMSG_DATA(cmsg) as *mut libc::in_pktinfo).write_unaligned(data);
                }
                SocketAddr::V6(_) => {
                    msg.msg_controllen =
                        libc::CMSG_SPACE(mem::size_of::<libc::in6_pktinfo>() as u32) as _;
                    let cmsg = &mut *libc::CMSG_FIRSTHDR(&msg);
                    cmsg.cmsg_level = libc::IPPROTO_IPV6;
                    cmsg.cmsg_type = libc::IPV6_PKTINFO;
                    cmsg.cmsg_len =
                        libc::CMSG_LEN(mem::size_of::<libc::in6_pktinfo>() as u32) as _;
                    let mut data: libc::in6_pktinfo = mem::zeroed();
                    data.ipi6_ifindex = interface_index;
                    if let Some(IpAddr::V6(ip)) = source {
                        data.ipi6_addr = ipv6_addr(ip);
                    }
                    (libc::CMSG_DATA(cmsg) as *mut libc::in6_pktinfo).write_unaligned(data);
                }
            }
        }

        let n = syscall!(sendmsg(fd, &msg, 0))?;
        Ok(n as usize)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn set_packet_info(_fd: RawFd, _ipv6: bool, _enable: bool) -> io::Result<()> {
    Err(io::ErrorKind::Unsupported.into())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn recv_msg(
    fd: RawFd,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr, Option<PacketInfo>)> {
    let (n, addr) = recv_from(fd, buf)?;
    Ok((n, addr, None))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn send_msg(
    fd: RawFd,
    buf: &[u8],
    addr: &SocketAddr,
    _interface_index: u32,
    _source: Option<IpAddr>,
) -> io::Result<usize> {
    send_to(fd, buf, addr)
}
