//! epoll readiness backend (Linux)

use std::os::unix::io::RawFd;
use std::time::Duration;

use netmux_core::{Interest, MuxError, MuxResult};

use crate::sockaddr::errno;

use super::{ReadyEvent, ReadyWait};

pub struct EpollWait {
    epfd: RawFd,
}

fn event_mask(interest: Interest) -> u32 {
    let mut mask = 0i32;
    if interest.readable() {
        mask |= libc::EPOLLIN;
    }
    if interest.writable() {
        mask |= libc::EPOLLOUT;
    }
    mask as u32
}

impl EpollWait {
    pub fn new() -> MuxResult<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(MuxError::Platform(errno()));
        }
        Ok(EpollWait { epfd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, interest: Interest) -> MuxResult<()> {
        let mut ev = libc::epoll_event {
            events: event_mask(interest),
            u64: token,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret != 0 {
            return Err(MuxError::Platform(errno()));
        }
        Ok(())
    }
}

impl ReadyWait for EpollWait {
    fn add(&self, fd: RawFd, token: u64, interest: Interest) -> MuxResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    fn modify(&self, fd: RawFd, token: u64, interest: Interest) -> MuxResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    fn remove(&self, fd: RawFd) -> MuxResult<()> {
        let ret = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if ret != 0 {
            return Err(MuxError::Platform(errno()));
        }
        Ok(())
    }

    fn wait(
        &self,
        out: &mut Vec<ReadyEvent>,
        max_events: usize,
        timeout: Option<Duration>,
    ) -> MuxResult<usize> {
        let max = max_events.max(1);
        let mut buf = vec![libc::epoll_event { events: 0, u64: 0 }; max];
        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as libc::c_int,
        };

        let n = unsafe { libc::epoll_wait(self.epfd, buf.as_mut_ptr(), max as libc::c_int, timeout_ms) };
        if n < 0 {
            let e = errno();
            if e == libc::EINTR {
                return Ok(0);
            }
            return Err(MuxError::Poll(e));
        }

        let err_mask = (libc::EPOLLERR | libc::EPOLLHUP) as u32;
        for ev in buf.iter().take(n as usize) {
            let events = ev.events;
            out.push(ReadyEvent {
                token: ev.u64,
                // Errors and hangups surface as readability so the
                // socket observes them on its next read.
                readable: events & ((libc::EPOLLIN as u32) | err_mask) != 0,
                writable: events & (libc::EPOLLOUT as u32) != 0,
            });
        }
        Ok(n as usize)
    }
}

impl Drop for EpollWait {
    fn drop(&mut self) {
        unsafe { libc::close(self.epfd) };
    }
}

// Safety: the epoll fd is valid for the lifetime of the struct and the
// kernel serializes concurrent epoll_ctl/epoll_wait calls on it.
unsafe impl Send for EpollWait {}
unsafe impl Sync for EpollWait {}
