//! # netmux - readiness-driven socket multiplexing
//!
//! A small event multiplexer for non-blocking sockets: one
//! [`SocketMultiplexer`] owns a registry of listen, stream and datagram
//! sockets and dispatches readiness callbacks from a single-threaded
//! `poll` loop, while registration and teardown stay callable from any
//! thread.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use netmux::{MuxSocket, SocketAddress, SocketMultiplexer, StreamHandler};
//!
//! struct Echo;
//!
//! impl StreamHandler for Echo {
//!     fn on_readable(&self, _mux: &Arc<SocketMultiplexer>, socket: &Arc<MuxSocket>) {
//!         let mut buf = [0u8; 4096];
//!         while let Ok(Some(n)) = socket.recv(&mut buf) {
//!             if n == 0 {
//!                 socket.close();
//!                 return;
//!             }
//!             let _ = socket.send(&buf[..n]);
//!         }
//!     }
//! }
//!
//! fn main() -> netmux::MuxResult<()> {
//!     let mux = SocketMultiplexer::new()?;
//!     let addr: SocketAddress = "127.0.0.1:7000".parse()?;
//!     let _listener = MuxSocket::listen(
//!         &mux,
//!         &addr,
//!         Box::new(|mux, fd, peer| MuxSocket::adopt_stream(mux, fd, peer, Box::new(Echo))),
//!     )?;
//!     loop {
//!         mux.poll(Some(Duration::from_secs(1)))?;
//!     }
//! }
//! ```

pub mod backend;
pub mod datagram;
pub mod listen;
pub mod multiplexer;
mod sockaddr;
pub mod socket;
pub mod stream;

pub use datagram::DatagramHandler;
pub use multiplexer::{MultiplexerConfig, PollOutcome, SocketMultiplexer};
pub use socket::MuxSocket;
pub use stream::{CreateStreamSocket, StreamHandler};

pub use netmux_core::{
    mux_debug, mux_error, mux_info, mux_log, mux_trace, mux_warn, AddressFamily, Interest, LogLevel,
    MuxError, MuxResult, SocketAddress, SocketState,
};
