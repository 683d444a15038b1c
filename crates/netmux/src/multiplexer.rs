//! The socket multiplexer: registry, deferred mutation, poll/dispatch
//!
//! One multiplexer owns a slot-arena registry of live sockets and the
//! platform readiness backend mirroring it. `poll` runs the blocking
//! wait with no lock held, then dispatches callbacks in registration
//! order. Structural mutations requested from inside a callback are
//! queued and applied at the pass boundary so the in-progress readiness
//! snapshot is never invalidated; mutations from any other thread are
//! applied immediately under the registry mutex.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crossbeam_queue::SegQueue;

use netmux_core::{
    mux_debug, mux_warn, Interest, MuxError, MuxResult, SocketAddress, SocketKey, SocketState,
};

use crate::backend::{new_ready_wait, PlatformWait, ReadyEvent, ReadyWait};
use crate::datagram::DatagramHandler;
use crate::socket::MuxSocket;
use crate::stream::{CreateStreamSocket, StreamHandler};

/// Multiplexer tuning knobs
pub struct MultiplexerConfig {
    /// Readiness-wait batch size per pass
    pub max_events_per_wait: usize,
    /// Backlog handed to listen(2) by `MuxSocket::listen`
    pub listen_backlog: i32,
    /// Registry slot cap
    pub max_sockets: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            max_events_per_wait: 64,
            listen_backlog: 1024,
            max_sockets: 65536,
        }
    }
}

/// What a `poll` pass observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Number of sockets dispatched this pass (>= 1)
    Ready(usize),
    /// Nothing became ready within the timeout
    TimedOut,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

struct Entry {
    socket: Arc<MuxSocket>,
    interest: Interest,
    /// Registration order, for deterministic dispatch
    seq: u64,
}

struct Registry {
    slots: Vec<Slot>,
    /// LIFO free stack for cache-friendly slot reuse
    free: Vec<u32>,
    len: usize,
}

impl Registry {
    fn new() -> Self {
        Registry {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

enum DeferredOp {
    Add(Arc<MuxSocket>, Interest),
    Remove(Arc<MuxSocket>),
}

thread_local! {
    /// Multiplexer currently dispatching on this thread, if any.
    /// Identifies register/unregister calls made from inside callbacks.
    static ACTIVE_PASS: Cell<*const SocketMultiplexer> =
        const { Cell::new(std::ptr::null()) };
}

/// Restores the pass marker even if a callback panics
///
/// Saves the previous value rather than clearing: a callback on one
/// multiplexer may legally poll a different instance, and that inner
/// pass must not erase the outer one's deferral marker.
struct PassGuard {
    prev: *const SocketMultiplexer,
}

impl PassGuard {
    fn enter(mux: &SocketMultiplexer) -> PassGuard {
        let prev = ACTIVE_PASS.with(|cell| cell.replace(mux as *const _));
        PassGuard { prev }
    }
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        let prev = self.prev;
        ACTIVE_PASS.with(|cell| cell.set(prev));
    }
}

/// The event multiplexer
///
/// Create with [`SocketMultiplexer::new`], register sockets, then drive
/// it from one thread with repeated [`SocketMultiplexer::poll`] calls.
/// Several instances may run concurrently on separate threads, each
/// with its own disjoint socket set.
pub struct SocketMultiplexer {
    registry: Mutex<Registry>,
    deferred: SegQueue<DeferredOp>,
    backend: PlatformWait,
    poll_busy: AtomicBool,
    next_seq: AtomicU64,
    config: MultiplexerConfig,
}

impl SocketMultiplexer {
    pub fn new() -> MuxResult<Arc<SocketMultiplexer>> {
        Self::with_config(MultiplexerConfig::default())
    }

    pub fn with_config(config: MultiplexerConfig) -> MuxResult<Arc<SocketMultiplexer>> {
        Ok(Arc::new(SocketMultiplexer {
            registry: Mutex::new(Registry::new()),
            deferred: SegQueue::new(),
            backend: new_ready_wait()?,
            poll_busy: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            config,
        }))
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    /// Number of sockets currently in the registry
    pub fn socket_count(&self) -> usize {
        self.registry.lock().unwrap().len
    }

    // ── Convenience constructors ──────────────────────────────────────

    /// Bind a listening socket on this multiplexer
    pub fn create_listen_socket(
        self: &Arc<Self>,
        local: &SocketAddress,
        factory: Box<CreateStreamSocket>,
    ) -> MuxResult<Arc<MuxSocket>> {
        MuxSocket::listen(self, local, factory)
    }

    /// Open an outbound stream connection on this multiplexer
    pub fn connect_stream_socket(
        self: &Arc<Self>,
        peer: &SocketAddress,
        handler: Box<dyn StreamHandler>,
    ) -> MuxResult<Arc<MuxSocket>> {
        MuxSocket::connect_stream(self, peer, handler)
    }

    /// Bind a datagram socket on this multiplexer
    pub fn create_datagram_socket(
        self: &Arc<Self>,
        local: &SocketAddress,
        handler: Box<dyn DatagramHandler>,
    ) -> MuxResult<Arc<MuxSocket>> {
        MuxSocket::bind_datagram(self, local, handler)
    }

    fn in_pass_on_current_thread(&self) -> bool {
        ACTIVE_PASS.with(|cell| std::ptr::eq(cell.get(), self))
    }

    fn owns(&self, socket: &MuxSocket) -> bool {
        std::ptr::eq(Weak::as_ptr(&socket.mux), self)
    }

    /// Add a socket to the registry
    ///
    /// Thread-safe. From inside a dispatch callback the mutation is
    /// queued and applied after the current pass; from anywhere else it
    /// is applied immediately under the registry mutex and is visible
    /// to the very next pass.
    pub fn register(&self, socket: &Arc<MuxSocket>, interest: Interest) -> MuxResult<()> {
        if !self.owns(socket) {
            debug_assert!(false, "socket registered with a foreign multiplexer");
            return Err(MuxError::ForeignSocket);
        }
        if !socket.transition(SocketState::Unregistered, SocketState::Registered) {
            debug_assert!(
                socket.state() != SocketState::Registered,
                "duplicate socket registration"
            );
            return Err(MuxError::AlreadyRegistered);
        }

        if self.in_pass_on_current_thread() {
            self.deferred.push(DeferredOp::Add(socket.clone(), interest));
            Ok(())
        } else {
            let mut reg = self.registry.lock().unwrap();
            self.apply_add(&mut reg, socket, interest)
        }
    }

    /// Remove a socket from the registry
    ///
    /// Same deferred/immediate split as `register`. Does not release
    /// the descriptor; that is `close()`'s half.
    pub fn unregister(&self, socket: &Arc<MuxSocket>) -> MuxResult<()> {
        if !self.owns(socket) {
            debug_assert!(false, "socket unregistered from a foreign multiplexer");
            return Err(MuxError::ForeignSocket);
        }
        if !socket.transition(SocketState::Registered, SocketState::Closing) {
            return Err(MuxError::NotRegistered);
        }

        if self.in_pass_on_current_thread() {
            self.deferred.push(DeferredOp::Remove(socket.clone()));
        } else {
            let mut reg = self.registry.lock().unwrap();
            self.finalize_remove(&mut reg, socket);
        }
        Ok(())
    }

    /// Re-arm the backend interest for an already-registered socket
    pub(crate) fn update_interest(&self, socket: &MuxSocket, interest: Interest) -> MuxResult<()> {
        let token = socket.token();
        let key = match SocketKey::from_token(token) {
            Some(key) => key,
            // Registration still pending; the add picks up the flags
            None => return Ok(()),
        };
        let mut reg = self.registry.lock().unwrap();
        let slot = match reg.slots.get_mut(key.index_usize()) {
            Some(slot) if slot.generation == key.generation() => slot,
            _ => return Err(MuxError::NotRegistered),
        };
        match &mut slot.entry {
            Some(entry) => {
                entry.interest = interest;
                self.backend.modify(socket.fd(), token, interest)
            }
            None => Err(MuxError::NotRegistered),
        }
    }

    /// One dispatch pass: blocking readiness wait, then callbacks
    ///
    /// At most one `poll` may be in flight per instance; a second
    /// concurrent call (including one from inside a callback) fails
    /// with `PollBusy`. Returns how many sockets were dispatched, or
    /// `TimedOut` when nothing became ready. `Err(Poll(errno))` means
    /// the readiness-wait primitive itself failed and this instance
    /// should be recreated.
    pub fn poll(self: &Arc<Self>, timeout: Option<Duration>) -> MuxResult<PollOutcome> {
        if self.poll_busy.swap(true, Ordering::Acquire) {
            return Err(MuxError::PollBusy);
        }
        let outcome = self.poll_pass(timeout);
        self.poll_busy.store(false, Ordering::Release);
        outcome
    }

    fn poll_pass(self: &Arc<Self>, timeout: Option<Duration>) -> MuxResult<PollOutcome> {
        // Blocking wait, no lock held: register/unregister from other
        // threads must stay callable while we sleep
        let mut ready: Vec<ReadyEvent> = Vec::new();
        self.backend
            .wait(&mut ready, self.config.max_events_per_wait, timeout)?;

        if ready.is_empty() {
            return Ok(PollOutcome::TimedOut);
        }

        // Resolve tokens against the registry under the mutex. A stale
        // token (slot freed and reissued since the event was queued)
        // fails the generation check and is dropped here.
        let mut batch: Vec<(u64, Arc<MuxSocket>, bool, bool)> = Vec::with_capacity(ready.len());
        {
            let reg = self.registry.lock().unwrap();
            for ev in &ready {
                let key = match SocketKey::from_token(ev.token) {
                    Some(key) => key,
                    None => continue,
                };
                let slot = match reg.slots.get(key.index_usize()) {
                    Some(slot) if slot.generation == key.generation() => slot,
                    _ => {
                        mux_debug!("dropping stale readiness for {}", key);
                        continue;
                    }
                };
                if let Some(entry) = &slot.entry {
                    batch.push((entry.seq, entry.socket.clone(), ev.readable, ev.writable));
                }
            }
        }

        // Registration order keeps dispatch deterministic
        batch.sort_by_key(|(seq, ..)| *seq);

        let mut dispatched = 0usize;
        {
            let _pass = PassGuard::enter(self);
            for (_, socket, readable, writable) in &batch {
                // A callback earlier in this pass may have closed it
                if !socket.state().is_dispatchable() {
                    continue;
                }
                if *readable {
                    socket.on_read_event(self);
                }
                if *writable && socket.state().is_dispatchable() {
                    socket.on_write_event(self);
                }
                dispatched += 1;
            }
        }

        // Pass boundary: land everything the callbacks requested
        self.apply_deferred();

        if dispatched == 0 {
            Ok(PollOutcome::TimedOut)
        } else {
            Ok(PollOutcome::Ready(dispatched))
        }
    }

    fn apply_deferred(&self) {
        let mut reg = self.registry.lock().unwrap();
        while let Some(op) = self.deferred.pop() {
            match op {
                DeferredOp::Add(socket, interest) => {
                    // Closed between the register call and now: the
                    // matching Remove op is behind us in the queue
                    if socket.state() != SocketState::Registered {
                        continue;
                    }
                    if let Err(e) = self.apply_add(&mut reg, &socket, interest) {
                        mux_warn!("deferred registration of fd {} failed: {}", socket.fd(), e);
                    }
                }
                DeferredOp::Remove(socket) => self.finalize_remove(&mut reg, &socket),
            }
        }
    }

    /// Insert into the arena and mirror into the backend. Caller holds
    /// the registry mutex and has already won the state transition.
    fn apply_add(
        &self,
        reg: &mut Registry,
        socket: &Arc<MuxSocket>,
        interest: Interest,
    ) -> MuxResult<()> {
        if reg.len >= self.config.max_sockets {
            socket.set_state(SocketState::Unregistered);
            return Err(MuxError::RegistryFull);
        }

        let index = match reg.free.pop() {
            Some(index) => index,
            None => {
                reg.slots.push(Slot {
                    generation: 0,
                    entry: None,
                });
                (reg.slots.len() - 1) as u32
            }
        };
        let key = SocketKey::new(index, reg.slots[index as usize].generation);

        // A handler may have asked for write events before the
        // registration landed
        let effective = interest.with_write(interest.writable() || socket.wants_write());

        if let Err(e) = self.backend.add(socket.fd(), key.to_token(), effective) {
            reg.free.push(index);
            socket.set_state(SocketState::Unregistered);
            return Err(e);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        reg.slots[index as usize].entry = Some(Entry {
            socket: socket.clone(),
            interest: effective,
            seq,
        });
        reg.len += 1;
        socket.set_token(key.to_token());
        mux_debug!("registered fd {} as {}", socket.fd(), key);
        Ok(())
    }

    /// Drop the registry entry, retire the slot, and complete the
    /// socket's transition to Destroyed. Caller holds the mutex.
    fn finalize_remove(&self, reg: &mut Registry, socket: &Arc<MuxSocket>) {
        let token = socket.take_token();
        if let Some(key) = SocketKey::from_token(token) {
            if let Some(slot) = reg.slots.get_mut(key.index_usize()) {
                if slot.generation == key.generation() {
                    if let Some(entry) = slot.entry.take() {
                        // Best-effort: the descriptor may already be
                        // closed, which evicted it from the interest
                        // set anyway
                        if let Err(e) = self.backend.remove(entry.socket.fd()) {
                            mux_debug!(
                                "interest-set removal for fd {}: {}",
                                entry.socket.fd(),
                                e
                            );
                        }
                        reg.len -= 1;
                    }
                    // Retire the key: stale tokens now fail the
                    // generation check forever
                    slot.generation = slot.generation.wrapping_add(1);
                    reg.free.push(key.index());
                }
            }
        }
        socket.set_state(SocketState::Destroyed);
        mux_debug!("removal finalized for fd {}", socket.fd());
    }
}

impl std::fmt::Debug for SocketMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketMultiplexer")
            .field("sockets", &self.socket_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::StreamHandler;
    use netmux_core::SocketAddress;
    use std::os::unix::io::OwnedFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;

    /// Counts bytes read; drains the socket on every readable event
    struct Recorder {
        bytes: Arc<AtomicUsize>,
    }

    impl StreamHandler for Recorder {
        fn on_readable(&self, _mux: &Arc<SocketMultiplexer>, socket: &Arc<MuxSocket>) {
            let mut buf = [0u8; 256];
            while let Ok(Some(n)) = socket.recv(&mut buf) {
                if n == 0 {
                    break;
                }
                self.bytes.fetch_add(n, Ordering::SeqCst);
            }
        }
    }

    fn adopt(
        mux: &Arc<SocketMultiplexer>,
        sock: UnixStream,
        bytes: Arc<AtomicUsize>,
    ) -> Arc<MuxSocket> {
        let fd: OwnedFd = sock.into();
        MuxSocket::adopt_stream(
            mux,
            fd,
            SocketAddress::UNSPECIFIED,
            Box::new(Recorder { bytes }),
        )
        .unwrap()
    }

    #[test]
    fn test_poll_empty_times_out() {
        let mux = SocketMultiplexer::new().unwrap();
        let outcome = mux.poll(Some(Duration::from_millis(50))).unwrap();
        assert_eq!(outcome, PollOutcome::TimedOut);
    }

    #[test]
    fn test_register_dispatch_unregister() {
        let mux = SocketMultiplexer::new().unwrap();
        let (ours, theirs) = UnixStream::pair().unwrap();
        let bytes = Arc::new(AtomicUsize::new(0));
        let socket = adopt(&mux, ours, bytes.clone());
        assert_eq!(mux.socket_count(), 1);

        use std::io::Write;
        (&theirs).write_all(b"hello").unwrap();

        let outcome = mux.poll(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(outcome, PollOutcome::Ready(1));
        assert_eq!(bytes.load(Ordering::SeqCst), 5);

        socket.close();
        assert_eq!(mux.socket_count(), 0);
        assert_eq!(socket.state(), SocketState::Destroyed);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mux = SocketMultiplexer::new().unwrap();
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let socket = adopt(&mux, ours, Arc::new(AtomicUsize::new(0)));

        socket.close();
        socket.close();
        socket.close();
        assert_eq!(socket.state(), SocketState::Destroyed);
        assert_eq!(mux.socket_count(), 0);

        // The registry is coherent afterwards: a fresh socket still works
        let (ours2, theirs2) = UnixStream::pair().unwrap();
        let bytes = Arc::new(AtomicUsize::new(0));
        let _socket2 = adopt(&mux, ours2, bytes.clone());
        use std::io::Write;
        (&theirs2).write_all(b"ok").unwrap();
        assert_eq!(
            mux.poll(Some(Duration::from_secs(2))).unwrap(),
            PollOutcome::Ready(1)
        );
        assert_eq!(bytes.load(Ordering::SeqCst), 2);
    }

    /// Closes another socket from inside its own readable callback
    struct Closer {
        victim: Arc<Mutex<Option<Arc<MuxSocket>>>>,
    }

    impl StreamHandler for Closer {
        fn on_readable(&self, _mux: &Arc<SocketMultiplexer>, socket: &Arc<MuxSocket>) {
            let mut buf = [0u8; 64];
            let _ = socket.recv(&mut buf);
            if let Some(victim) = self.victim.lock().unwrap().take() {
                victim.close();
            }
        }
    }

    #[test]
    fn test_close_from_callback_skips_victim_in_same_pass() {
        let mux = SocketMultiplexer::new().unwrap();

        let victim_slot = Arc::new(Mutex::new(None));
        let (a_ours, a_theirs) = UnixStream::pair().unwrap();
        let fd_a: OwnedFd = a_ours.into();
        let closer = MuxSocket::adopt_stream(
            &mux,
            fd_a,
            SocketAddress::UNSPECIFIED,
            Box::new(Closer {
                victim: victim_slot.clone(),
            }),
        )
        .unwrap();

        let victim_bytes = Arc::new(AtomicUsize::new(0));
        let (b_ours, b_theirs) = UnixStream::pair().unwrap();
        let victim = adopt(&mux, b_ours, victim_bytes.clone());
        *victim_slot.lock().unwrap() = Some(victim.clone());

        // Make both readable before the pass starts
        use std::io::Write;
        (&a_theirs).write_all(b"x").unwrap();
        (&b_theirs).write_all(b"y").unwrap();

        // The closer registered first, so it dispatches first and the
        // victim is skipped within the same pass
        let outcome = mux.poll(Some(Duration::from_secs(2))).unwrap();
        assert_eq!(outcome, PollOutcome::Ready(1));
        assert_eq!(victim_bytes.load(Ordering::SeqCst), 0);

        // Deferred removal landed at the pass boundary
        assert_eq!(victim.state(), SocketState::Destroyed);
        assert_eq!(mux.socket_count(), 1);
        closer.close();
    }

    /// Adopts a pre-staged connection from inside a readable callback
    struct Spawner {
        staged: Arc<Mutex<Option<(UnixStream, Arc<AtomicUsize>)>>>,
    }

    impl StreamHandler for Spawner {
        fn on_readable(&self, mux: &Arc<SocketMultiplexer>, socket: &Arc<MuxSocket>) {
            let mut buf = [0u8; 64];
            let _ = socket.recv(&mut buf);
            if let Some((sock, bytes)) = self.staged.lock().unwrap().take() {
                let fd: OwnedFd = sock.into();
                MuxSocket::adopt_stream(
                    mux,
                    fd,
                    SocketAddress::UNSPECIFIED,
                    Box::new(Recorder { bytes }),
                )
                .unwrap();
            }
        }
    }

    #[test]
    fn test_registration_from_callback_lands_after_pass() {
        let mux = SocketMultiplexer::new().unwrap();

        let (new_ours, new_theirs) = UnixStream::pair().unwrap();
        let new_bytes = Arc::new(AtomicUsize::new(0));
        let staged = Arc::new(Mutex::new(Some((new_ours, new_bytes.clone()))));

        let (ours, theirs) = UnixStream::pair().unwrap();
        let fd: OwnedFd = ours.into();
        let _spawner = MuxSocket::adopt_stream(
            &mux,
            fd,
            SocketAddress::UNSPECIFIED,
            Box::new(Spawner { staged }),
        )
        .unwrap();

        use std::io::Write;
        (&theirs).write_all(b"go").unwrap();
        assert_eq!(
            mux.poll(Some(Duration::from_secs(2))).unwrap(),
            PollOutcome::Ready(1)
        );

        // The mid-pass registration is in the registry now
        assert_eq!(mux.socket_count(), 2);

        // ... and dispatches on the next pass
        (&new_theirs).write_all(b"abc").unwrap();
        assert_eq!(
            mux.poll(Some(Duration::from_secs(2))).unwrap(),
            PollOutcome::Ready(1)
        );
        assert_eq!(new_bytes.load(Ordering::SeqCst), 3);
    }

    /// Calls poll again from inside a callback
    struct Reentrant {
        observed: Arc<Mutex<Option<MuxError>>>,
    }

    impl StreamHandler for Reentrant {
        fn on_readable(&self, mux: &Arc<SocketMultiplexer>, socket: &Arc<MuxSocket>) {
            let mut buf = [0u8; 64];
            let _ = socket.recv(&mut buf);
            if let Err(e) = mux.poll(Some(Duration::from_millis(1))) {
                *self.observed.lock().unwrap() = Some(e);
            }
        }
    }

    #[test]
    fn test_poll_reentry_from_callback_fails() {
        let mux = SocketMultiplexer::new().unwrap();
        let observed = Arc::new(Mutex::new(None));

        let (ours, theirs) = UnixStream::pair().unwrap();
        let fd: OwnedFd = ours.into();
        let _socket = MuxSocket::adopt_stream(
            &mux,
            fd,
            SocketAddress::UNSPECIFIED,
            Box::new(Reentrant {
                observed: observed.clone(),
            }),
        )
        .unwrap();

        use std::io::Write;
        (&theirs).write_all(b"x").unwrap();
        mux.poll(Some(Duration::from_secs(2))).unwrap();

        assert!(matches!(
            *observed.lock().unwrap(),
            Some(MuxError::PollBusy)
        ));
    }

    #[test]
    fn test_concurrent_registration() {
        let mux = SocketMultiplexer::new().unwrap();
        let sockets: Arc<Mutex<Vec<Arc<MuxSocket>>>> = Arc::new(Mutex::new(Vec::new()));

        let mut threads = Vec::new();
        for _ in 0..8 {
            let mux = mux.clone();
            let sockets = sockets.clone();
            threads.push(std::thread::spawn(move || {
                // 8 x 60 keeps the live descriptor count below the
                // common 1024 soft limit
                for _ in 0..60 {
                    let (ours, theirs) = UnixStream::pair().unwrap();
                    let socket = adopt(&mux, ours, Arc::new(AtomicUsize::new(0)));
                    drop(theirs);
                    sockets.lock().unwrap().push(socket);
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }

        // No lost or duplicate entries across the racing registrations
        assert_eq!(mux.socket_count(), 480);

        let all = std::mem::take(&mut *sockets.lock().unwrap());
        for socket in &all {
            socket.close();
        }
        assert_eq!(mux.socket_count(), 0);
    }

    /// Polls a second multiplexer mid-callback, then registers with the
    /// first; the registration must still defer to the pass boundary
    struct NestedPoller {
        other: Arc<SocketMultiplexer>,
        staged: Arc<Mutex<Option<UnixStream>>>,
        mid_pass_count: Arc<AtomicUsize>,
    }

    impl StreamHandler for NestedPoller {
        fn on_readable(&self, mux: &Arc<SocketMultiplexer>, socket: &Arc<MuxSocket>) {
            let mut buf = [0u8; 64];
            let _ = socket.recv(&mut buf);

            // Another instance is fair game while this pass runs
            let inner = self.other.poll(Some(Duration::from_millis(10)));
            assert!(matches!(inner, Ok(PollOutcome::TimedOut)));

            if let Some(sock) = self.staged.lock().unwrap().take() {
                let fd: OwnedFd = sock.into();
                MuxSocket::adopt_stream(
                    mux,
                    fd,
                    SocketAddress::UNSPECIFIED,
                    Box::new(Recorder {
                        bytes: Arc::new(AtomicUsize::new(0)),
                    }),
                )
                .unwrap();
            }
            self.mid_pass_count.store(mux.socket_count(), Ordering::SeqCst);
        }
    }

    #[test]
    fn test_nested_poll_on_other_instance_keeps_deferral() {
        let mux = SocketMultiplexer::new().unwrap();
        let other = SocketMultiplexer::new().unwrap();

        let (new_ours, _new_theirs) = UnixStream::pair().unwrap();
        let staged = Arc::new(Mutex::new(Some(new_ours)));
        let mid_pass_count = Arc::new(AtomicUsize::new(usize::MAX));

        let (ours, theirs) = UnixStream::pair().unwrap();
        let fd: OwnedFd = ours.into();
        let _socket = MuxSocket::adopt_stream(
            &mux,
            fd,
            SocketAddress::UNSPECIFIED,
            Box::new(NestedPoller {
                other,
                staged,
                mid_pass_count: mid_pass_count.clone(),
            }),
        )
        .unwrap();

        use std::io::Write;
        (&theirs).write_all(b"x").unwrap();
        mux.poll(Some(Duration::from_secs(2))).unwrap();

        // The inner poll must not have flushed the outer pass marker:
        // the adoption stayed queued during the callback and landed at
        // the pass boundary
        assert_eq!(mid_pass_count.load(Ordering::SeqCst), 1);
        assert_eq!(mux.socket_count(), 2);
    }

    #[test]
    fn test_slot_reuse_bumps_generation() {
        let mux = SocketMultiplexer::new().unwrap();

        let (a, _a2) = UnixStream::pair().unwrap();
        let first = adopt(&mux, a, Arc::new(AtomicUsize::new(0)));
        let first_token = first.token();
        first.close();

        let (b, _b2) = UnixStream::pair().unwrap();
        let second = adopt(&mux, b, Arc::new(AtomicUsize::new(0)));
        let second_token = second.token();

        // Same slot index, different generation
        let first_key = SocketKey::from_token(first_token).unwrap();
        let second_key = SocketKey::from_token(second_token).unwrap();
        assert_eq!(first_key.index(), second_key.index());
        assert_ne!(first_key.generation(), second_key.generation());

        second.close();
    }

    #[test]
    fn test_registry_full() {
        let mux = SocketMultiplexer::with_config(MultiplexerConfig {
            max_sockets: 1,
            ..MultiplexerConfig::default()
        })
        .unwrap();

        let (a, _a2) = UnixStream::pair().unwrap();
        let first = adopt(&mux, a, Arc::new(AtomicUsize::new(0)));

        let (b, _b2) = UnixStream::pair().unwrap();
        let fd: OwnedFd = b.into();
        let err = MuxSocket::adopt_stream(
            &mux,
            fd,
            SocketAddress::UNSPECIFIED,
            Box::new(Recorder {
                bytes: Arc::new(AtomicUsize::new(0)),
            }),
        )
        .unwrap_err();
        assert!(matches!(err, MuxError::RegistryFull));
        assert_eq!(mux.socket_count(), 1);

        first.close();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "duplicate socket registration")]
    fn test_duplicate_registration_asserts() {
        let mux = SocketMultiplexer::new().unwrap();
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let socket = adopt(&mux, ours, Arc::new(AtomicUsize::new(0)));
        let _ = mux.register(&socket, Interest::READ);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "foreign multiplexer")]
    fn test_foreign_socket_asserts() {
        let mux_a = SocketMultiplexer::new().unwrap();
        let mux_b = SocketMultiplexer::new().unwrap();
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let socket = adopt(&mux_a, ours, Arc::new(AtomicUsize::new(0)));
        let _ = mux_b.register(&socket, Interest::READ);
    }

    #[test]
    fn test_unregister_not_registered() {
        let mux = SocketMultiplexer::new().unwrap();
        let (ours, _theirs) = UnixStream::pair().unwrap();
        let socket = adopt(&mux, ours, Arc::new(AtomicUsize::new(0)));
        socket.close();

        let err = mux.unregister(&socket).unwrap_err();
        assert!(matches!(err, MuxError::NotRegistered));
    }
}
