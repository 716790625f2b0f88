//! `Poller` — thin epoll wrapper.
//!
//! Level-triggered. Every registration is readable-interest plus
//! `EPOLLRDHUP`; writable interest is toggled with `modify()` when a
//! connection has queued output. Each registration carries a caller-chosen
//! `u64` token that comes back in [`Event::token`].
//!
//! An epoll descriptor is itself pollable, so a `Poller` can be nested in
//! another one (the TCP transport does exactly that).

use xread_core::error::{Result, XreadError};

use std::os::unix::io::RawFd;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: u64,
    pub readable: bool,
    pub writable: bool,
    /// Peer hung up or the descriptor is in error.
    pub hangup: bool,
}

pub struct Poller {
    epfd: RawFd,
    raw: Vec<libc::epoll_event>,
}

impl Poller {
    /// `capacity` bounds how many events one `wait()` returns.
    pub fn new(capacity: usize) -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(XreadError::last_os());
        }
        let raw = vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)];
        Ok(Self { epfd, raw })
    }

    pub fn fd(&self) -> RawFd {
        self.epfd
    }

    pub fn add(&self, fd: RawFd, token: u64, writable: bool) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, writable)
    }

    pub fn modify(&self, fd: RawFd, token: u64, writable: bool) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, writable)
    }

    pub fn delete(&self, fd: RawFd) -> Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret < 0 {
            return Err(XreadError::last_os());
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, token: u64, writable: bool) -> Result<()> {
        let mut events = (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        if writable {
            events |= libc::EPOLLOUT as u32;
        }
        let mut ev = libc::epoll_event { events, u64: token };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(XreadError::last_os());
        }
        Ok(())
    }

    /// Block until at least one event or the timeout (`None` = forever).
    /// Appends to `events` and returns the count. An interrupted wait
    /// returns 0.
    pub fn wait(&mut self, events: &mut Vec<Event>, timeout: Option<Duration>) -> Result<usize> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
        };
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.raw.as_mut_ptr(),
                self.raw.len() as i32,
                timeout_ms,
            )
        };
        if n < 0 {
            let errno = crate::last_errno();
            if errno == libc::EINTR {
                return Ok(0);
            }
            return Err(XreadError::Backend(errno));
        }

        let n = n as usize;
        for ev in &self.raw[..n] {
            let bits = ev.events;
            let token = ev.u64;
            events.push(Event {
                token,
                readable: bits & (libc::EPOLLIN as u32) != 0,
                writable: bits & (libc::EPOLLOUT as u32) != 0,
                hangup: bits & ((libc::EPOLLHUP | libc::EPOLLERR | libc::EPOLLRDHUP) as u32) != 0,
            });
        }
        Ok(n)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epfd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eventfd::EventFd;

    #[test]
    fn test_wait_reports_token() {
        let mut poller = Poller::new(8).unwrap();
        let efd = EventFd::create().unwrap();
        poller.add(efd.fd(), 77, false).unwrap();

        let mut events = Vec::new();
        assert_eq!(poller.wait(&mut events, Some(Duration::from_millis(0))).unwrap(), 0);

        efd.notify().unwrap();
        assert_eq!(poller.wait(&mut events, Some(Duration::from_millis(100))).unwrap(), 1);
        assert_eq!(events[0].token, 77);
        assert!(events[0].readable);

        poller.delete(efd.fd()).unwrap();
        events.clear();
        assert_eq!(poller.wait(&mut events, Some(Duration::from_millis(0))).unwrap(), 0);
    }
}
