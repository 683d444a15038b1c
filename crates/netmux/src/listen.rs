//! Listening sockets and the accept loop

use std::mem;
use std::os::unix::io::{FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use netmux_core::{
    mux_debug, mux_warn, AddressFamily, Interest, MuxError, MuxResult, SocketAddress,
};

use crate::multiplexer::SocketMultiplexer;
use crate::sockaddr::{self, errno};
use crate::socket::{MuxSocket, SocketKind};
use crate::stream::CreateStreamSocket;

pub(crate) struct ListenState {
    local: SocketAddress,
    factory: Box<CreateStreamSocket>,
    /// Successful accepts over the socket's lifetime. u64: does not
    /// wrap for any realistic connection rate.
    accepted: AtomicU64,
}

impl ListenState {
    pub(crate) fn local_address(&self) -> &SocketAddress {
        &self.local
    }

    pub(crate) fn connections_accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

impl MuxSocket {
    /// Bind a listening socket and register it with read interest
    ///
    /// Binding to port 0 requests an ephemeral port; the address
    /// reported by [`MuxSocket::local_address`] is read back from the
    /// OS, so it always carries the real port.
    pub fn listen(
        mux: &Arc<SocketMultiplexer>,
        local: &SocketAddress,
        factory: Box<CreateStreamSocket>,
    ) -> MuxResult<Arc<MuxSocket>> {
        let (storage, len) = sockaddr::to_storage(local)?;
        let domain = match local.family() {
            AddressFamily::Ipv4 => libc::AF_INET,
            AddressFamily::Ipv6 => libc::AF_INET6,
            AddressFamily::Unspecified => return Err(MuxError::AddressParse),
        };

        let raw = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
        if raw < 0 {
            return Err(MuxError::Platform(errno()));
        }
        // From here the OwnedFd closes the descriptor on any early return
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        sockaddr::set_cloexec(raw)?;

        unsafe {
            let opt: libc::c_int = 1;
            libc::setsockopt(
                raw,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        let ret = unsafe {
            libc::bind(raw, &storage as *const _ as *const libc::sockaddr, len)
        };
        if ret != 0 {
            return Err(MuxError::Platform(errno()));
        }

        let ret = unsafe { libc::listen(raw, mux.config().listen_backlog) };
        if ret != 0 {
            return Err(MuxError::Platform(errno()));
        }

        sockaddr::set_nonblocking(raw)?;
        let bound = sockaddr::local_address(raw)?;

        let raw_fd: RawFd = fd.into_raw_fd();
        let socket = Arc::new(MuxSocket::with_kind(
            raw_fd,
            mux,
            SocketKind::Listen(ListenState {
                local: bound,
                factory,
                accepted: AtomicU64::new(0),
            }),
        ));
        if let Err(e) = mux.register(&socket, Interest::READ) {
            socket.close();
            return Err(e);
        }
        mux_debug!("listening on {}", socket.local_address().unwrap());
        Ok(socket)
    }
}

/// Accept one pending connection, non-blocking
///
/// `Ok(None)` means the backlog is drained (would-block).
fn accept_one(
    fd: RawFd,
) -> Result<Option<(OwnedFd, libc::sockaddr_storage, libc::socklen_t)>, i32> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))] {
            let raw = unsafe {
                libc::accept4(
                    fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
        } else {
            let raw = unsafe {
                libc::accept(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
            };
        }
    }

    if raw < 0 {
        let e = errno();
        if e == libc::EAGAIN || e == libc::EWOULDBLOCK {
            return Ok(None);
        }
        return Err(e);
    }
    let accepted = unsafe { OwnedFd::from_raw_fd(raw) };

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        use std::os::unix::io::AsRawFd;
        let _ = sockaddr::set_nonblocking(accepted.as_raw_fd());
        let _ = sockaddr::set_cloexec(accepted.as_raw_fd());
    }

    Ok(Some((accepted, storage, len)))
}

impl ListenState {
    /// The accept loop: drain the backlog, hand each connection to the
    /// factory. Runs inside a dispatch pass.
    pub(crate) fn on_read_event(&self, socket: &Arc<MuxSocket>, mux: &Arc<SocketMultiplexer>) {
        loop {
            let (accepted, storage, len) = match accept_one(socket.fd()) {
                Ok(Some(conn)) => conn,
                Ok(None) => break, // backlog drained
                Err(libc::EINTR) => continue,
                // The connection died between arrival and accept; the
                // backlog may still hold live ones
                Err(libc::ECONNABORTED) => continue,
                Err(e) => {
                    // Transient accept failure (fd limits etc). Isolated
                    // to this pass; the listen socket stays up.
                    mux_warn!("listener {}: {}", self.local, MuxError::Accept(e));
                    break;
                }
            };

            // Counts the accept, whatever the factory decides
            self.accepted.fetch_add(1, Ordering::Relaxed);

            let peer = match sockaddr::from_storage(&storage, len) {
                Ok(peer) => peer,
                Err(_) => {
                    mux_warn!("dropping connection with unparseable peer address");
                    continue; // accepted fd closed by OwnedFd drop
                }
            };

            match (self.factory)(mux, accepted, peer) {
                Ok(_stream) => {
                    mux_debug!(
                        "accepted connection on {} (total {})",
                        self.local,
                        self.accepted.load(Ordering::Relaxed)
                    );
                }
                Err(e) => {
                    // Factory consumed (and thereby closed) the fd
                    mux_warn!("stream factory rejected connection on {}: {}", self.local, e);
                }
            }

            // The factory or a handler may have closed us mid-loop
            if !socket.state().is_dispatchable() {
                break;
            }
        }
    }
}
