//! Client-side request state and handles.
//!
//! An `AioRequest` is shared between the caller's [`AioHandle`] and the
//! connection's I/O thread. The I/O thread publishes the outcome exactly
//! once; the caller reads it after `wait`. Dropping the handle (through
//! `Client::reclaim`) releases the caller's share.

use crate::notifier::Countdown;

use xread_core::error::{Result, XreadError};
use xread_core::wire::{WireMessage, MAX_FILENAME_LEN};

use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// One read: `size` bytes of `filename` starting at `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOp {
    pub filename: String,
    pub offset: u64,
    pub size: u64,
}

impl ReadOp {
    pub fn new(filename: impl Into<String>, offset: u64, size: u64) -> Self {
        Self {
            filename: filename.into(),
            offset,
            size,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.size == 0 {
            return Err(XreadError::InvalidArgument("size must be positive"));
        }
        if self.offset.checked_add(self.size).is_none() {
            return Err(XreadError::InvalidArgument("offset + size overflows"));
        }
        if self.filename.is_empty() {
            return Err(XreadError::InvalidArgument("empty filename"));
        }
        if self.filename.len() > MAX_FILENAME_LEN {
            return Err(XreadError::InvalidArgument("filename too long"));
        }
        Ok(())
    }
}

/// Outcome of a completed request.
///
/// Success: `retval` is the byte count and `errno == 0`. Failure:
/// `retval == -1` and `errno` carries the reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub retval: i64,
    pub errno: i32,
}

impl Completion {
    pub fn ok(retval: i64) -> Self {
        Self { retval, errno: 0 }
    }

    pub fn failed(errno: i32) -> Self {
        Self { retval: -1, errno }
    }

    pub fn is_ok(&self) -> bool {
        self.errno == 0 && self.retval >= 0
    }
}

#[derive(Debug)]
pub(crate) enum OpKind {
    Open,
    Read(ReadOp),
}

struct Outcome {
    completion: Completion,
    data: Option<Bytes>,
}

pub(crate) struct AioRequest {
    pub(crate) owner: u64,
    pub(crate) kind: OpKind,
    pub(crate) opaque: u64,
    pub(crate) notifier: Arc<Countdown>,
    pub(crate) submitted_at: Instant,
    claimed: AtomicBool,
    done: AtomicBool,
    outcome: Mutex<Option<Outcome>>,
}

impl AioRequest {
    pub(crate) fn new(owner: u64, kind: OpKind, opaque: u64, notifier: Arc<Countdown>) -> Arc<Self> {
        Arc::new(Self {
            owner,
            kind,
            opaque,
            notifier,
            submitted_at: Instant::now(),
            claimed: AtomicBool::new(false),
            done: AtomicBool::new(false),
            outcome: Mutex::new(None),
        })
    }

    pub(crate) fn is_read(&self) -> bool {
        matches!(self.kind, OpKind::Read(_))
    }

    pub(crate) fn message(&self) -> WireMessage {
        match &self.kind {
            OpKind::Open => WireMessage::open_req(self.opaque),
            OpKind::Read(op) => WireMessage::read_req(self.opaque, &op.filename, op.offset, op.size),
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Publish the outcome and wake waiters. Only the first call wins;
    /// `before_wake` runs after the outcome is stored and before anyone
    /// can observe completion.
    pub(crate) fn complete(
        &self,
        completion: Completion,
        data: Option<Bytes>,
        before_wake: impl FnOnce(&Self, &Completion),
    ) -> bool {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.outcome.lock() = Some(Outcome { completion, data });
        before_wake(self, &completion);
        self.done.store(true, Ordering::Release);
        self.notifier.signal(completion.errno);
        true
    }

    pub(crate) fn completion(&self) -> Option<Completion> {
        if !self.is_done() {
            return None;
        }
        self.outcome.lock().as_ref().map(|o| o.completion)
    }

    pub(crate) fn data(&self) -> Option<Bytes> {
        if !self.is_done() {
            return None;
        }
        self.outcome.lock().as_ref().and_then(|o| o.data.clone())
    }
}

/// Caller's reference to a submitted read.
///
/// Not `Clone`: [`Client::reclaim`](crate::Client::reclaim) takes it by
/// value, so a handle cannot be reclaimed twice.
pub struct AioHandle {
    pub(crate) req: Arc<AioRequest>,
}

impl AioHandle {
    pub fn opaque(&self) -> u64 {
        self.req.opaque
    }

    pub fn is_complete(&self) -> bool {
        self.req.is_done()
    }

    pub fn op(&self) -> Option<&ReadOp> {
        match &self.req.kind {
            OpKind::Read(op) => Some(op),
            OpKind::Open => None,
        }
    }

    /// True if both handles were submitted in the same batch.
    pub fn same_batch(&self, other: &AioHandle) -> bool {
        Arc::ptr_eq(&self.req.notifier, &other.req.notifier)
    }
}

impl fmt::Debug for AioHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AioHandle")
            .field("opaque", &self.req.opaque)
            .field("op", &self.req.kind)
            .field("complete", &self.req.is_done())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(ReadOp::new("obj", 0, 4096).validate().is_ok());
        for bad in [
            ReadOp::new("obj", 0, 0),
            ReadOp::new("obj", u64::MAX, 2),
            ReadOp::new("", 0, 1),
            ReadOp::new("x".repeat(MAX_FILENAME_LEN + 1), 0, 1),
        ] {
            assert_eq!(bad.validate().unwrap_err().errno(), libc::EINVAL, "{:?}", bad);
        }
    }

    #[test]
    fn test_complete_once() {
        let cd = Arc::new(Countdown::new(1));
        let req = AioRequest::new(1, OpKind::Read(ReadOp::new("f", 0, 3)), 7, Arc::clone(&cd));
        assert!(req.completion().is_none());

        let mut hooks = 0;
        assert!(req.complete(Completion::ok(3), Some(Bytes::from_static(b"abc")), |_, _| hooks += 1));
        assert!(!req.complete(Completion::failed(libc::EIO), None, |_, _| hooks += 1));
        assert_eq!(hooks, 1);
        assert_eq!(req.completion(), Some(Completion::ok(3)));
        assert_eq!(req.data().as_deref(), Some(&b"abc"[..]));
        assert_eq!(cd.remaining(), 0);
    }
}
