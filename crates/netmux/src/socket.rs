//! The socket object shared between the application and a multiplexer
//!
//! One concrete type covers the whole capability set: a `MuxSocket` is a
//! descriptor plus lifecycle state plus one of a closed set of kinds
//! (listen, stream, datagram). The kind decides what the read/write
//! event callbacks do; there is no open-ended subclassing.
//!
//! Ownership: the application holds an `Arc<MuxSocket>`; the registry of
//! the owning multiplexer holds a second `Arc` from registration until
//! removal is finalized. The object is freed only once both are gone.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use netmux_core::{mux_warn, SocketAddress, SocketKey, SocketState};

use crate::datagram::DatagramState;
use crate::listen::ListenState;
use crate::multiplexer::SocketMultiplexer;
use crate::sockaddr::errno;
use crate::stream::StreamState;

/// The closed set of socket kinds a multiplexer can dispatch to
pub(crate) enum SocketKind {
    Listen(ListenState),
    Stream(StreamState),
    Datagram(DatagramState),
}

/// A socket registered (or registerable) with exactly one multiplexer
pub struct MuxSocket {
    pub(crate) fd: RawFd,
    state: AtomicU8,
    /// Packed `SocketKey`, or `SocketKey::NONE_TOKEN` while unregistered
    token: AtomicU64,
    fd_released: AtomicBool,
    pub(crate) mux: Weak<SocketMultiplexer>,
    pub(crate) kind: SocketKind,
}

impl MuxSocket {
    pub(crate) fn with_kind(
        fd: RawFd,
        mux: &Arc<SocketMultiplexer>,
        kind: SocketKind,
    ) -> MuxSocket {
        MuxSocket {
            fd,
            state: AtomicU8::new(SocketState::Unregistered as u8),
            token: AtomicU64::new(SocketKey::NONE_TOKEN),
            fd_released: AtomicBool::new(false),
            mux: Arc::downgrade(mux),
            kind,
        }
    }

    /// Raw descriptor. Valid only while `state().has_descriptor()`.
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Current lifecycle state
    #[inline]
    pub fn state(&self) -> SocketState {
        SocketState::from(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: SocketState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Try to move between two states. Returns whether the transition
    /// was won (only one caller ever wins a given edge).
    pub(crate) fn transition(&self, from: SocketState, to: SocketState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn token(&self) -> u64 {
        self.token.load(Ordering::Acquire)
    }

    pub(crate) fn set_token(&self, token: u64) {
        self.token.store(token, Ordering::Release);
    }

    /// Clear the registry key, returning the previous token
    pub(crate) fn take_token(&self) -> u64 {
        self.token.swap(SocketKey::NONE_TOKEN, Ordering::AcqRel)
    }

    /// The owning multiplexer, while it is still alive
    pub fn multiplexer(&self) -> Option<Arc<SocketMultiplexer>> {
        self.mux.upgrade()
    }

    pub fn is_listen(&self) -> bool {
        matches!(self.kind, SocketKind::Listen(_))
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.kind, SocketKind::Stream(_))
    }

    pub fn is_datagram(&self) -> bool {
        matches!(self.kind, SocketKind::Datagram(_))
    }

    /// Bound local address, for kinds that have one
    pub fn local_address(&self) -> Option<&SocketAddress> {
        match &self.kind {
            SocketKind::Listen(l) => Some(l.local_address()),
            SocketKind::Datagram(d) => Some(d.local_address()),
            SocketKind::Stream(_) => None,
        }
    }

    /// Remote peer address, for stream sockets
    pub fn peer_address(&self) -> Option<&SocketAddress> {
        match &self.kind {
            SocketKind::Stream(s) => Some(s.peer_address()),
            _ => None,
        }
    }

    /// Total successful accepts, for listen sockets
    pub fn connections_accepted(&self) -> Option<u64> {
        match &self.kind {
            SocketKind::Listen(l) => Some(l.connections_accepted()),
            _ => None,
        }
    }

    /// Close the socket
    ///
    /// The one irreversible transition. Deregisters from the owning
    /// multiplexer (deferred to the pass boundary when called from
    /// inside a dispatch callback) and releases the OS handle. Safe to
    /// call any number of times; calls after the first are no-ops.
    /// Never fails: a failed handle release is logged and swallowed.
    pub fn close(self: &Arc<Self>) {
        if self.state() == SocketState::Registered {
            if let Some(mux) = self.mux.upgrade() {
                // Loses the race only to a concurrent close/unregister
                let _ = mux.unregister(self);
            } else {
                // Multiplexer already torn down; registry is gone
                self.transition(SocketState::Registered, SocketState::Destroyed);
            }
            self.release_fd();
        } else if self.transition(SocketState::Unregistered, SocketState::Destroyed) {
            // Never registered; nothing to deregister
            self.release_fd();
        } else if self.state() == SocketState::Closing {
            // unregister() was called directly; finish the close half
            self.release_fd();
        }
    }

    /// Release the OS handle exactly once
    pub(crate) fn release_fd(&self) {
        if self.fd_released.swap(true, Ordering::AcqRel) {
            return;
        }
        let ret = unsafe { libc::close(self.fd) };
        if ret != 0 {
            mux_warn!("close(fd={}) failed: errno {}", self.fd, errno());
        }
    }

    // ── Dispatch entry points ─────────────────────────────────────────
    // Invoked only from the owning multiplexer's dispatch pass, on its
    // dispatch thread. Never concurrently for the same socket.

    pub(crate) fn on_read_event(self: &Arc<Self>, mux: &Arc<SocketMultiplexer>) {
        match &self.kind {
            SocketKind::Listen(l) => l.on_read_event(self, mux),
            SocketKind::Stream(s) => s.handler().on_readable(mux, self),
            SocketKind::Datagram(d) => d.handler().on_readable(mux, self),
        }
    }

    pub(crate) fn on_write_event(self: &Arc<Self>, mux: &Arc<SocketMultiplexer>) {
        match &self.kind {
            // Listening sockets never register write interest
            SocketKind::Listen(_) => {}
            SocketKind::Stream(s) => s.handler().on_writable(mux, self),
            SocketKind::Datagram(d) => d.handler().on_writable(mux, self),
        }
    }

    /// Whether the socket currently wants write readiness
    pub(crate) fn wants_write(&self) -> bool {
        match &self.kind {
            SocketKind::Listen(_) => false,
            SocketKind::Stream(s) => s.wants_write(),
            SocketKind::Datagram(d) => d.wants_write(),
        }
    }
}

impl Drop for MuxSocket {
    fn drop(&mut self) {
        // Registry entries hold an Arc, so by the time Drop runs the
        // socket is out of every registry. Releasing here only matters
        // when the application dropped its handle without close().
        if !self.fd_released.swap(true, Ordering::AcqRel) {
            unsafe { libc::close(self.fd) };
        }
    }
}

impl std::fmt::Debug for MuxSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            SocketKind::Listen(_) => "listen",
            SocketKind::Stream(_) => "stream",
            SocketKind::Datagram(_) => "datagram",
        };
        f.debug_struct("MuxSocket")
            .field("fd", &self.fd)
            .field("kind", &kind)
            .field("state", &self.state())
            .finish()
    }
}
