//! kqueue readiness backend (macOS and the BSDs)

use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use netmux_core::{Interest, MuxError, MuxResult};

use crate::sockaddr::errno;

use super::{ReadyEvent, ReadyWait};

pub struct KqueueWait {
    kq: RawFd,
}

fn change(fd: RawFd, filter: i16, flags: u16, token: u64) -> libc::kevent {
    libc::kevent {
        ident: fd as libc::uintptr_t,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: token as *mut libc::c_void,
    }
}

impl KqueueWait {
    pub fn new() -> MuxResult<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(MuxError::Platform(errno()));
        }
        Ok(KqueueWait { kq })
    }

    fn apply(&self, changes: &[libc::kevent], surface_errors: bool) -> MuxResult<()> {
        let ret = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as libc::c_int,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if ret < 0 && surface_errors {
            return Err(MuxError::Platform(errno()));
        }
        Ok(())
    }

    fn set_interest(&self, fd: RawFd, token: u64, interest: Interest) -> MuxResult<()> {
        // Each filter is its own registration; unwanted ones are deleted
        // (a delete of a filter that was never added reports ENOENT,
        // which is fine here).
        if interest.readable() {
            self.apply(&[change(fd, libc::EVFILT_READ, libc::EV_ADD, token)], true)?;
        } else {
            self.apply(&[change(fd, libc::EVFILT_READ, libc::EV_DELETE, 0)], false)?;
        }
        if interest.writable() {
            self.apply(&[change(fd, libc::EVFILT_WRITE, libc::EV_ADD, token)], true)?;
        } else {
            self.apply(&[change(fd, libc::EVFILT_WRITE, libc::EV_DELETE, 0)], false)?;
        }
        Ok(())
    }
}

impl ReadyWait for KqueueWait {
    fn add(&self, fd: RawFd, token: u64, interest: Interest) -> MuxResult<()> {
        self.set_interest(fd, token, interest)
    }

    fn modify(&self, fd: RawFd, token: u64, interest: Interest) -> MuxResult<()> {
        self.set_interest(fd, token, interest)
    }

    fn remove(&self, fd: RawFd) -> MuxResult<()> {
        self.apply(
            &[
                change(fd, libc::EVFILT_READ, libc::EV_DELETE, 0),
                change(fd, libc::EVFILT_WRITE, libc::EV_DELETE, 0),
            ],
            false,
        )
    }

    fn wait(
        &self,
        out: &mut Vec<ReadyEvent>,
        max_events: usize,
        timeout: Option<Duration>,
    ) -> MuxResult<usize> {
        let max = max_events.max(1);
        let mut buf = vec![change(0, 0, 0, 0); max];

        let ts;
        let ts_ptr = match timeout {
            None => ptr::null(),
            Some(d) => {
                ts = libc::timespec {
                    tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
                    tv_nsec: d.subsec_nanos() as _,
                };
                &ts as *const libc::timespec
            }
        };

        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                buf.as_mut_ptr(),
                max as libc::c_int,
                ts_ptr,
            )
        };
        if n < 0 {
            let e = errno();
            if e == libc::EINTR {
                return Ok(0);
            }
            return Err(MuxError::Poll(e));
        }

        for ev in buf.iter().take(n as usize) {
            out.push(ReadyEvent {
                token: ev.udata as u64,
                readable: ev.filter == libc::EVFILT_READ,
                writable: ev.filter == libc::EVFILT_WRITE,
            });
        }
        Ok(n as usize)
    }
}

impl Drop for KqueueWait {
    fn drop(&mut self) {
        unsafe { libc::close(self.kq) };
    }
}

// Safety: the kqueue fd is valid for the lifetime of the struct and the
// kernel serializes concurrent kevent calls on it.
unsafe impl Send for KqueueWait {}
unsafe impl Sync for KqueueWait {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_wait_times_out_when_idle() {
        let kq = KqueueWait::new().unwrap();
        let mut out = Vec::new();
        let n = kq
            .wait(&mut out, 8, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_readable_pair_reports_token() {
        use std::io::Write;

        let (mut a, b) = UnixStream::pair().unwrap();
        let kq = KqueueWait::new().unwrap();
        kq.add(b.as_raw_fd(), 0xfeed, Interest::READ).unwrap();

        a.write_all(b"x").unwrap();

        let mut out = Vec::new();
        let n = kq
            .wait(&mut out, 8, Some(Duration::from_millis(500)))
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(out[0].token, 0xfeed);
        assert!(out[0].readable);
    }
}
