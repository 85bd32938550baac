//! Callback-driven asynchronous stream I/O runtime.
//!
//! The core is a single-threaded [`IoLoop`] multiplexing readiness events
//! (epoll/kqueue) or completion packets (IOCP) for every instance attached
//! to it, plus the [`AsyncStream`] contract: byte streams with one in-flight
//! read and one in-flight write, partial-completion retries, per-request
//! timeouts and cancellation by close.
//!
//! Streams exist over files ([`fs`]), anonymous pipes ([`pipe`]), TCP, UDP
//! and UNIX-domain sockets ([`net`]). On top sit the transform filter
//! ([`filter`]), HTTP header/content readers ([`http`]), the
//! double-buffered copy engine ([`copy`]) and the composed output writer
//! ([`output`]).
//!
//! # Example
//!
//! ```no_run
//! use evio::{AsyncStream, IoLoop};
//! use evio::net::TcpStream;
//!
//! let io_loop = IoLoop::create(true).unwrap();
//! let stream = TcpStream::connect_to(
//!     "127.0.0.1:8080".parse().unwrap(),
//!     Some(&io_loop),
//!     Box::new(|error| assert!(!error)),
//!     None,
//! )
//! .unwrap();
//! stream.write(
//!     b"ping".to_vec(),
//!     Box::new(|result| assert!(result.is_success())),
//!     None,
//! );
//! ```

#[macro_use]
mod macros;

mod buffer;
mod event;
mod instance;
mod io_loop;
mod io_mode;
mod simulator;
mod sys;
mod token;

pub mod copy;
pub mod filter;
pub mod fs;
pub mod http;
pub mod net;
pub mod output;
pub mod pipe;
pub mod stream;

pub use buffer::MemoryQueue;
pub use io_loop::{IoLoop, Task};
pub use io_mode::IoMode;
pub use simulator::Dispatcher;
pub use stream::{
    AsyncStream, Direction, ReadNewCallback, ReadSegmentedCallback, StreamCallback, StreamRequest,
    StreamResult, StreamResultCode,
};
pub use token::Token;
