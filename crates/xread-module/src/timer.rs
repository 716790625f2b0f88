//! `TimerFd` — periodic tick as a pollable descriptor.

use xread_core::error::{Result, XreadError};

use std::os::unix::io::RawFd;
use std::time::Duration;

pub struct TimerFd {
    fd: RawFd,
}

impl TimerFd {
    /// Arm a monotonic timer that fires every `interval`.
    pub fn periodic(interval: Duration) -> Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(XreadError::last_os());
        }
        let timer = Self { fd };

        let spec = libc::timespec {
            tv_sec: interval.as_secs() as libc::time_t,
            tv_nsec: interval.subsec_nanos() as libc::c_long,
        };
        let its = libc::itimerspec {
            it_interval: spec,
            it_value: spec,
        };
        let ret = unsafe { libc::timerfd_settime(timer.fd, 0, &its, std::ptr::null_mut()) };
        if ret < 0 {
            return Err(XreadError::last_os());
        }
        Ok(timer)
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Consume pending expirations. Returns how many ticks elapsed.
    pub fn ack(&self) -> u64 {
        let mut ticks: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut ticks as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret == std::mem::size_of::<u64>() as isize {
            ticks
        } else {
            0
        }
    }
}

impl Drop for TimerFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::Poller;

    #[test]
    fn test_timer_ticks() {
        let timer = TimerFd::periodic(Duration::from_millis(10)).unwrap();
        let mut poller = Poller::new(4).unwrap();
        poller.add(timer.fd(), 1, false).unwrap();
        let mut events = Vec::new();
        poller.wait(&mut events, Some(Duration::from_secs(2))).unwrap();
        assert_eq!(events.len(), 1);
        assert!(timer.ack() >= 1);
    }
}
