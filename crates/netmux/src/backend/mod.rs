//! Platform readiness-wait backends
//!
//! One `ReadyWait` implementation is compiled per target platform,
//! selected at build configuration time. The multiplexer never chooses a
//! backend at runtime.

use std::os::unix::io::RawFd;
use std::time::Duration;

use netmux_core::{Interest, MuxResult};

/// A readiness notification from the platform backend
#[derive(Debug, Clone, Copy)]
pub struct ReadyEvent {
    /// The token supplied at `add` time (a packed `SocketKey`)
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
}

/// Interest-set mirror of the registry plus the blocking wait
///
/// All methods take `&self`: the underlying OS interest-set operations
/// are thread-safe, so registrations from other threads never contend
/// with a blocked `wait`.
pub trait ReadyWait: Send + Sync {
    /// Start watching a descriptor
    fn add(&self, fd: RawFd, token: u64, interest: Interest) -> MuxResult<()>;

    /// Change the interest set of a watched descriptor
    fn modify(&self, fd: RawFd, token: u64, interest: Interest) -> MuxResult<()>;

    /// Stop watching a descriptor
    ///
    /// May fail with EBADF when the descriptor was already closed; the
    /// caller treats that as best-effort cleanup.
    fn remove(&self, fd: RawFd) -> MuxResult<()>;

    /// Block until readiness or timeout
    ///
    /// Appends up to `max_events` entries to `out` and returns the
    /// count. `None` blocks indefinitely. An interrupted wait (EINTR)
    /// reports zero events rather than an error.
    fn wait(
        &self,
        out: &mut Vec<ReadyEvent>,
        max_events: usize,
        timeout: Option<Duration>,
    ) -> MuxResult<usize>;
}

// Platform-specific implementations
cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod epoll_linux;
        pub use epoll_linux::EpollWait as PlatformWait;
    } else if #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "dragonfly",
    ))] {
        mod kqueue_bsd;
        pub use kqueue_bsd::KqueueWait as PlatformWait;
    } else {
        // No readiness facility known for this target - sockets never
        // report ready, waits just sleep out their timeout.
        mod fallback;
        pub use fallback::SleepWait as PlatformWait;
    }
}

/// Create the platform-appropriate readiness backend
pub fn new_ready_wait() -> MuxResult<PlatformWait> {
    PlatformWait::new()
}
