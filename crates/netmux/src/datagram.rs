//! Datagram (UDP) sockets

use std::mem;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use netmux_core::{AddressFamily, Interest, MuxError, MuxResult, SocketAddress};

use crate::multiplexer::SocketMultiplexer;
use crate::sockaddr::{self, errno};
use crate::socket::{MuxSocket, SocketKind};

/// Application behavior for a datagram socket
pub trait DatagramHandler: Send + Sync {
    fn on_readable(&self, mux: &Arc<SocketMultiplexer>, socket: &Arc<MuxSocket>);

    fn on_writable(&self, _mux: &Arc<SocketMultiplexer>, _socket: &Arc<MuxSocket>) {}
}

pub(crate) struct DatagramState {
    local: SocketAddress,
    handler: Box<dyn DatagramHandler>,
    want_write: AtomicBool,
}

impl DatagramState {
    pub(crate) fn local_address(&self) -> &SocketAddress {
        &self.local
    }

    pub(crate) fn handler(&self) -> &dyn DatagramHandler {
        self.handler.as_ref()
    }

    pub(crate) fn wants_write(&self) -> bool {
        self.want_write.load(Ordering::Acquire)
    }

    pub(crate) fn want_write_flag(&self) -> &AtomicBool {
        &self.want_write
    }
}

impl MuxSocket {
    /// Bind a datagram socket and register it with read interest
    pub fn bind_datagram(
        mux: &Arc<SocketMultiplexer>,
        local: &SocketAddress,
        handler: Box<dyn DatagramHandler>,
    ) -> MuxResult<Arc<MuxSocket>> {
        let (storage, len) = sockaddr::to_storage(local)?;
        let domain = match local.family() {
            AddressFamily::Ipv4 => libc::AF_INET,
            AddressFamily::Ipv6 => libc::AF_INET6,
            AddressFamily::Unspecified => return Err(MuxError::AddressParse),
        };

        let raw = unsafe { libc::socket(domain, libc::SOCK_DGRAM, 0) };
        if raw < 0 {
            return Err(MuxError::Platform(errno()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        sockaddr::set_cloexec(raw)?;
        sockaddr::set_nonblocking(raw)?;

        let ret = unsafe {
            libc::bind(raw, &storage as *const _ as *const libc::sockaddr, len)
        };
        if ret != 0 {
            return Err(MuxError::Platform(errno()));
        }

        // Report the actual bound address (port 0 requests resolve to
        // an ephemeral port here)
        let bound = sockaddr::local_address(raw)?;

        let raw_fd: RawFd = std::os::unix::io::IntoRawFd::into_raw_fd(fd);
        let socket = Arc::new(MuxSocket::with_kind(
            raw_fd,
            mux,
            SocketKind::Datagram(DatagramState {
                local: bound,
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

    /// Receive one datagram and its source address
    ///
    /// `Ok(None)` means would-block (drained for now).
    pub fn recv_from(&self, buf: &mut [u8]) -> MuxResult<Option<(usize, SocketAddress)>> {
        if !self.state().has_descriptor() {
            return Err(MuxError::NotRegistered);
        }
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        loop {
            let n = unsafe {
                libc::recvfrom(
                    self.fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };
            if n >= 0 {
                let from = sockaddr::from_storage(&storage, len)?;
                return Ok(Some((n as usize, from)));
            }
            match errno() {
                libc::EINTR => continue,
                libc::EAGAIN => return Ok(None),
                e if e == libc::EWOULDBLOCK => return Ok(None),
                e => return Err(MuxError::Platform(e)),
            }
        }
    }

    /// Send one datagram to the given destination
    pub fn send_to(&self, buf: &[u8], dest: &SocketAddress) -> MuxResult<Option<usize>> {
        if !self.state().has_descriptor() {
            return Err(MuxError::NotRegistered);
        }
        let (storage, len) = sockaddr::to_storage(dest)?;
        loop {
            let n = unsafe {
                libc::sendto(
                    self.fd(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    0,
                    &storage as *const _ as *const libc::sockaddr,
                    len,
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiplexer::SocketMultiplexer;
    use std::net::UdpSocket;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    struct Collector {
        got: Arc<Mutex<Vec<(Vec<u8>, SocketAddress)>>>,
    }

    impl DatagramHandler for Collector {
        fn on_readable(&self, _mux: &Arc<SocketMultiplexer>, socket: &Arc<MuxSocket>) {
            let mut buf = [0u8; 512];
            while let Ok(Some((n, from))) = socket.recv_from(&mut buf) {
                self.got.lock().unwrap().push((buf[..n].to_vec(), from));
            }
        }
    }

    #[test]
    fn test_datagram_roundtrip() {
        let mux = SocketMultiplexer::new().unwrap();
        let got = Arc::new(Mutex::new(Vec::new()));

        let local: SocketAddress = "127.0.0.1:0".parse().unwrap();
        let socket = mux
            .create_datagram_socket(&local, Box::new(Collector { got: got.clone() }))
            .unwrap();
        let port = socket.local_address().unwrap().port();
        assert_ne!(port, 0);

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.send_to(b"ping", ("127.0.0.1", port)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while got.lock().unwrap().is_empty() && Instant::now() < deadline {
            mux.poll(Some(Duration::from_millis(100))).unwrap();
        }

        let (payload, from) = {
            let got = got.lock().unwrap();
            got.first().cloned().expect("no datagram received")
        };
        assert_eq!(payload, b"ping");

        // Reply to the recorded source and verify it arrives
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let sent = socket.send_to(b"pong", &from).unwrap();
        assert_eq!(sent, Some(4));
        let mut buf = [0u8; 16];
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"pong");

        socket.close();
        assert_eq!(mux.socket_count(), 0);
    }
}
