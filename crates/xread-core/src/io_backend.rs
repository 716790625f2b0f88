//! File I/O backend abstraction.
//!
//! A `FileBackend` executes reads asynchronously. The caller hands over a
//! destination pointer and a token; when the read finishes the backend
//! posts a fixed-size [`IoStatus`] record to the caller's [`StatusSink`].
//! The sink is normally the write end of a pipe that a completion thread
//! polls, so the backend never calls back into the submitting reactor.
//!
//! # Implementors (in xread-module)
//!
//! - `PreadPool` (default): N worker threads doing positional reads.
//!   Works on any kernel and any filesystem.
//!
//! - `UringBackend`: one submitter thread driving an io_uring instance.
//!   Lower syscall overhead; needs io_uring (5.1+).

use crate::error::Result;

use std::path::PathBuf;
use std::sync::Arc;

/// One read to execute.
#[derive(Debug)]
pub struct ReadOp {
    /// Already-resolved local path.
    pub path: PathBuf,
    pub offset: u64,
    pub len: usize,
    /// Destination, valid for `len` bytes until the matching status is posted.
    pub dest: *mut u8,
    /// Echoed back in the completion status.
    pub token: u64,
}

// Safety: `dest` is only written by the backend while the submitter keeps
// the buffer alive and untouched (see `FileBackend::submit_read`).
unsafe impl Send for ReadOp {}

/// Completion record: `{token, error, bytes}`, 16 bytes on the wire.
///
/// `error == 0` means success and `bytes` holds the number of bytes read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoStatus {
    pub token: u64,
    pub error: i32,
    pub bytes: u32,
}

impl IoStatus {
    pub const SIZE: usize = 16;

    pub fn ok(token: u64, bytes: usize) -> Self {
        Self {
            token,
            error: 0,
            bytes: bytes.min(u32::MAX as usize) as u32,
        }
    }

    pub fn failed(token: u64, errno: i32) -> Self {
        Self {
            token,
            error: errno,
            bytes: 0,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error == 0
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&self.token.to_le_bytes());
        out[8..12].copy_from_slice(&self.error.to_le_bytes());
        out[12..16].copy_from_slice(&self.bytes.to_le_bytes());
        out
    }

    pub fn from_bytes(raw: &[u8; Self::SIZE]) -> Self {
        let mut token = [0u8; 8];
        let mut error = [0u8; 4];
        let mut bytes = [0u8; 4];
        token.copy_from_slice(&raw[0..8]);
        error.copy_from_slice(&raw[8..12]);
        bytes.copy_from_slice(&raw[12..16]);
        Self {
            token: u64::from_le_bytes(token),
            error: i32::from_le_bytes(error),
            bytes: u32::from_le_bytes(bytes),
        }
    }
}

/// Where a backend reports completions.
///
/// Implementations must be callable from any backend thread concurrently
/// and must never block for long.
pub trait StatusSink: Send + Sync {
    fn post(&self, status: IoStatus) -> Result<()>;
}

/// Asynchronous file reads.
///
/// **Contract:** `submit_read()` must not block on the disk. Exactly one
/// status is posted for every accepted submission. A submission that
/// returns `Err` posts nothing.
pub trait FileBackend: Send + Sync {
    /// Queue a read.
    ///
    /// # Safety
    ///
    /// `op.dest` must stay valid for writes of `op.len` bytes, and must not be
    /// read or written by anyone else, until the status for `op.token` has
    /// been posted to `sink`.
    unsafe fn submit_read(&self, op: ReadOp, sink: Arc<dyn StatusSink>) -> Result<()>;

    /// Reads accepted but not yet completed.
    fn inflight(&self) -> usize;

    /// Stop accepting work. Already-accepted reads still complete.
    fn shutdown(&self);

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_record_layout() {
        let st = IoStatus::failed(0x0102_0304_0506_0708, libc::ENOENT);
        let raw = st.to_bytes();
        assert_eq!(raw[0], 0x08);
        assert_eq!(IoStatus::from_bytes(&raw), st);
        assert!(!st.is_ok());
        assert!(IoStatus::ok(1, 4096).is_ok());
    }
}
