//! `StatusPipe` — completion records over a pipe.
//!
//! Backends post fixed-size [`IoStatus`] records to the write end; the
//! portal's completion thread polls the read end. Records are 16 bytes,
//! well under `PIPE_BUF`, so concurrent writers never interleave.
//!
//! The write end stays blocking: if the reader falls behind, backend
//! workers stall rather than drop a completion. The read end is
//! nonblocking so it can be drained from an epoll loop.

use xread_core::error::{Result, XreadError};
use xread_core::io_backend::{IoStatus, StatusSink};

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Create a connected writer/reader pair.
pub fn status_pipe() -> Result<(StatusWriter, StatusReader)> {
    let mut fds = [0 as libc::c_int; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if ret < 0 {
        return Err(XreadError::last_os());
    }
    // Safety: pipe2 just returned two fresh descriptors we now own.
    let (rd, wr) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    let flags = unsafe { libc::fcntl(rd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0
        || unsafe { libc::fcntl(rd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
    {
        return Err(XreadError::last_os());
    }

    Ok((
        StatusWriter { fd: wr },
        StatusReader {
            fd: rd,
            carry: Vec::with_capacity(IoStatus::SIZE),
            closed: false,
        },
    ))
}

pub struct StatusWriter {
    fd: OwnedFd,
}

impl StatusSink for StatusWriter {
    fn post(&self, status: IoStatus) -> Result<()> {
        let raw = status.to_bytes();
        loop {
            let ret = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    raw.as_ptr() as *const libc::c_void,
                    raw.len(),
                )
            };
            if ret == raw.len() as isize {
                return Ok(());
            }
            let errno = crate::last_errno();
            if ret < 0 && errno == libc::EINTR {
                continue;
            }
            return Err(XreadError::Backend(if ret < 0 { errno } else { libc::EIO }));
        }
    }
}

pub struct StatusReader {
    fd: OwnedFd,
    /// Bytes of a record split across two reads.
    carry: Vec<u8>,
    closed: bool,
}

impl StatusReader {
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// True once every writer has been dropped and the pipe is drained.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Read every record currently available. Never blocks.
    pub fn read_batch(&mut self, out: &mut Vec<IoStatus>) -> Result<usize> {
        let mut buf = [0u8; IoStatus::SIZE * 256];
        let mut count = 0;
        loop {
            let ret = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if ret < 0 {
                let errno = crate::last_errno();
                match errno {
                    libc::EINTR => continue,
                    libc::EAGAIN => return Ok(count),
                    _ => return Err(XreadError::Backend(errno)),
                }
            }
            if ret == 0 {
                self.closed = true;
                return Ok(count);
            }

            self.carry.extend_from_slice(&buf[..ret as usize]);
            let whole = self.carry.len() / IoStatus::SIZE * IoStatus::SIZE;
            for chunk in self.carry[..whole].chunks_exact(IoStatus::SIZE) {
                let mut rec = [0u8; IoStatus::SIZE];
                rec.copy_from_slice(chunk);
                out.push(IoStatus::from_bytes(&rec));
                count += 1;
            }
            self.carry.drain(..whole);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_records_cross_threads() {
        let (writer, mut reader) = status_pipe().unwrap();
        let writer = Arc::new(writer);

        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let w = Arc::clone(&writer);
                thread::spawn(move || {
                    for i in 0..100u64 {
                        w.post(IoStatus::ok(t * 1000 + i, 4096)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut out = Vec::new();
        reader.read_batch(&mut out).unwrap();
        assert_eq!(out.len(), 400);
        assert!(out.iter().all(|s| s.is_ok() && s.bytes == 4096));
        let mut tokens: Vec<u64> = out.iter().map(|s| s.token).collect();
        tokens.sort_unstable();
        tokens.dedup();
        assert_eq!(tokens.len(), 400);
    }

    #[test]
    fn test_empty_and_closed() {
        let (writer, mut reader) = status_pipe().unwrap();
        let mut out = Vec::new();
        assert_eq!(reader.read_batch(&mut out).unwrap(), 0);
        assert!(!reader.is_closed());
        writer.post(IoStatus::failed(9, libc::EIO)).unwrap();
        drop(writer);
        assert_eq!(reader.read_batch(&mut out).unwrap(), 1);
        assert_eq!(out[0], IoStatus::failed(9, libc::EIO));
        assert!(reader.is_closed());
    }
}
