//! Stream (connected TCP) sockets
//!
//! A stream socket pairs a connected descriptor with an application
//! `StreamHandler`. Handlers run on the multiplexer's dispatch thread
//! and must not block: read until would-block, queue output, get out.

use std::os::unix::io::{AsRawFd, IntoRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use netmux_core::{Interest, MuxError, MuxResult, SocketAddress};

use crate::multiplexer::SocketMultiplexer;
use crate::sockaddr::{self, errno};
use crate::socket::{MuxSocket, SocketKind};

/// Application behavior for a stream socket
///
/// `on_readable` fires when the peer sent data (or closed, or errored -
/// observed as a 0/error read). `on_writable` fires only while write
/// events are enabled via [`MuxSocket::enable_write_events`].
pub trait StreamHandler: Send + Sync {
    fn on_readable(&self, mux: &Arc<SocketMultiplexer>, socket: &Arc<MuxSocket>);

    fn on_writable(&self, _mux: &Arc<SocketMultiplexer>, _socket: &Arc<MuxSocket>) {}
}

/// Factory invoked by a listen socket for every accepted connection
///
/// Contract: on success the returned socket is already registered with
/// the same multiplexer (use [`MuxSocket::adopt_stream`]). On failure
/// the accepted descriptor is dropped (closed) and the accept loop
/// carries on; the listen socket itself is unaffected.
pub type CreateStreamSocket =
    dyn Fn(&Arc<SocketMultiplexer>, OwnedFd, SocketAddress) -> MuxResult<Arc<MuxSocket>>
        + Send
        + Sync;

pub(crate) struct StreamState {
    peer: SocketAddress,
    handler: Box<dyn StreamHandler>,
    want_write: AtomicBool,
}

impl StreamState {
    pub(crate) fn peer_address(&self) -> &SocketAddress {
        &self.peer
    }

    pub(crate) fn handler(&self) -> &dyn StreamHandler {
        self.handler.as_ref()
    }

    pub(crate) fn wants_write(&self) -> bool {
        self.want_write.load(Ordering::Acquire)
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "openbsd"))] {
        const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
    } else {
        const SEND_FLAGS: libc::c_int = 0;
    }
}

impl MuxSocket {
    /// Wrap an already-connected descriptor and register it
    ///
    /// This is the usual body of a [`CreateStreamSocket`] factory. The
    /// descriptor is made non-blocking and registered with read
    /// interest; registration failure closes it.
    pub fn adopt_stream(
        mux: &Arc<SocketMultiplexer>,
        fd: OwnedFd,
        peer: SocketAddress,
        handler: Box<dyn StreamHandler>,
    ) -> MuxResult<Arc<MuxSocket>> {
        sockaddr::set_nonblocking(fd.as_raw_fd())?;
        let raw = fd.into_raw_fd();
        let socket = Arc::new(MuxSocket::with_kind(
            raw,
            mux,
            SocketKind::Stream(StreamState {
                peer,
                handler,
                want_write: AtomicBool::new(false),
            }),
        ));
        if let Err(e) = mux.register(&socket, Interest::READ) {
            socket.close();
            return Err(e);
        }
        Ok(socket)
    }

    /// Open an outbound connection and register it
    ///
    /// The connect itself is blocking; once established the descriptor
    /// goes non-blocking and joins the multiplexer like an accepted
    /// socket.
    pub fn connect_stream(
        mux: &Arc<SocketMultiplexer>,
        peer: &SocketAddress,
        handler: Box<dyn StreamHandler>,
    ) -> MuxResult<Arc<MuxSocket>> {
        let (storage, len) = sockaddr::to_storage(peer)?;
        let domain = match peer.family() {
            netmux_core::AddressFamily::Ipv4 => libc::AF_INET,
            netmux_core::AddressFamily::Ipv6 => libc::AF_INET6,
            netmux_core::AddressFamily::Unspecified => return Err(MuxError::AddressParse),
        };

        let raw = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
        if raw < 0 {
            return Err(MuxError::Platform(errno()));
        }
        let fd = unsafe { <OwnedFd as std::os::unix::io::FromRawFd>::from_raw_fd(raw) };
        sockaddr::set_cloexec(raw)?;

        let ret = unsafe {
            libc::connect(
                raw,
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        };
        if ret != 0 {
            return Err(MuxError::Platform(errno()));
        }

        MuxSocket::adopt_stream(mux, fd, peer.clone(), handler)
    }

    /// Read bytes from a stream socket
    ///
    /// `Ok(None)` means would-block (drained for now), `Ok(Some(0))`
    /// means the peer closed, `Ok(Some(n))` is bytes read.
    pub fn recv(&self, buf: &mut [u8]) -> MuxResult<Option<usize>> {
        if !self.state().has_descriptor() {
            return Err(MuxError::NotRegistered);
        }
        loop {
            let n = unsafe {
                libc::recv(self.fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            if n >= 0 {
                return Ok(Some(n as usize));
            }
            match errno() {
                libc::EINTR => continue,
                libc::EAGAIN => return Ok(None),
                e if e == libc::EWOULDBLOCK => return Ok(None),
                e => return Err(MuxError::Platform(e)),
            }
        }
    }

    /// Write bytes to a stream socket
    ///
    /// `Ok(None)` means would-block (nothing accepted); callers should
    /// enable write events and retry from `on_writable`.
    pub fn send(&self, buf: &[u8]) -> MuxResult<Option<usize>> {
        if !self.state().has_descriptor() {
            return Err(MuxError::NotRegistered);
        }
        loop {
            let n = unsafe {
                libc::send(
                    self.fd(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    SEND_FLAGS,
                )
            };
            if n >= 0 {
                return Ok(Some(n as usize));
            }
            match errno() {
                libc::EINTR => continue,
                libc::EAGAIN => return Ok(None),
                e if e == libc::EWOULDBLOCK => return Ok(None),
                e => return Err(MuxError::Platform(e)),
            }
        }
    }

    /// Turn write-readiness callbacks on or off
    ///
    /// Stream and datagram sockets start with read interest only; a
    /// handler that could not flush its output enables write events,
    /// then disables them once drained. No-op on listen sockets.
    pub fn enable_write_events(&self, enabled: bool) -> MuxResult<()> {
        let want = match &self.kind {
            SocketKind::Stream(s) => &s.want_write,
            SocketKind::Datagram(d) => d.want_write_flag(),
            SocketKind::Listen(_) => return Ok(()),
        };
        want.store(enabled, Ordering::Release);

        if self.state() != netmux_core::SocketState::Registered {
            return Ok(());
        }
        match self.multiplexer() {
            // Not yet applied (registration deferred): the flag is
            // picked up when the pending add lands.
            Some(mux) => mux.update_interest(self, Interest::READ.with_write(enabled)),
            None => Ok(()),
        }
    }
}
