//! Sleep-only fallback for targets without a readiness facility

use std::os::unix::io::RawFd;
use std::time::Duration;

use netmux_core::{Interest, MuxResult};

use super::{ReadyEvent, ReadyWait};

/// Accepts registrations and sleeps out every wait without ever
/// reporting readiness. Lets the engine link and run on targets with no
/// epoll/kqueue equivalent.
pub struct SleepWait;

const IDLE_SLICE: Duration = Duration::from_millis(100);

impl SleepWait {
    pub fn new() -> MuxResult<Self> {
        Ok(SleepWait)
    }
}

impl ReadyWait for SleepWait {
    fn add(&self, _fd: RawFd, _token: u64, _interest: Interest) -> MuxResult<()> {
        Ok(())
    }

    fn modify(&self, _fd: RawFd, _token: u64, _interest: Interest) -> MuxResult<()> {
        Ok(())
    }

    fn remove(&self, _fd: RawFd) -> MuxResult<()> {
        Ok(())
    }

    fn wait(
        &self,
        _out: &mut Vec<ReadyEvent>,
        _max_events: usize,
        timeout: Option<Duration>,
    ) -> MuxResult<usize> {
        std::thread::sleep(timeout.unwrap_or(IDLE_SLICE));
        Ok(0)
    }
}
