//! `EventFd` — cross-thread wake primitive.
//!
//! Writes to an eventfd to wake a thread blocked in epoll.
//! Coalescing: multiple calls to `notify()` before the consumer
//! drains the eventfd result in a single wakeup (eventfd counter semantics).

use xread_core::error::{Result, XreadError};

use std::os::unix::io::RawFd;

pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    /// Create a new nonblocking eventfd. The `EventFd` owns it and closes
    /// it on Drop.
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(XreadError::last_os());
        }
        Ok(Self { fd })
    }

    /// Raw descriptor, for registering with a `Poller`.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = crate::last_errno();
            // EAGAIN means the counter would overflow, which implies a
            // wakeup is already pending.
            if errno == libc::EAGAIN {
                return Ok(());
            }
            return Err(XreadError::Backend(errno));
        }
        Ok(())
    }

    /// Reset the counter. Returns how many notifications were coalesced
    /// (0 if none were pending).
    pub fn drain(&self) -> u64 {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret == std::mem::size_of::<u64>() as isize {
            val
        } else {
            0
        }
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_coalesces() {
        let efd = EventFd::create().unwrap();
        assert_eq!(efd.drain(), 0);
        efd.notify().unwrap();
        efd.notify().unwrap();
        efd.notify().unwrap();
        assert_eq!(efd.drain(), 3);
        assert_eq!(efd.drain(), 0);
    }
}
