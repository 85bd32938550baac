//! Asynchronous sockets: TCP and UNIX-domain byte streams with their accept
//! servers, and UDP datagram sockets with per-packet ancillary data.

pub(crate) mod socket;

mod tcp;
pub use self::tcp::{TcpListener, TcpServerParam, TcpStream};

mod udp;
pub use self::udp::{UdpPacket, UdpSocket, UdpSocketParam};

#[cfg(unix)]
mod uds;
#[cfg(unix)]
pub use self::uds::{UnixListener, UnixServerParam, UnixStream};

/// Callback deciding the outcome of a `connect`; `true` means the connect
/// failed (or timed out).
pub type ConnectCallback = Box<dyn FnOnce(bool) + Send>;
