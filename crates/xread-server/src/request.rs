//! Server-side request record.
//!
//! ```text
//! Received ──► Dispatched ──► Completed ──► ResponseQueued ──► (released)
//!     │                          ▲
//!     └── open / close / error ──┘
//! ```
//!
//! A record lives in its portal's arena (`Slab<RequestRecord>`); its key is
//! the backend token and the transport send token. It is released exactly
//! once, after the transport hands the payload back or the send could not
//! be started.

use crate::connection::ConnRef;

use xread_core::buffer::IoBuffer;
use xread_core::wire::{Opcode, WireMessage};

use std::time::Instant;

pub type RequestKey = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    /// Buffer handed to the backend. Nothing may touch it until the status
    /// for this record arrives.
    Dispatched,
    Completed,
    /// Response (and payload, if any) owned by the transport. Last stage a
    /// live record can be in: the send confirmation (delivered or not)
    /// goes straight to `Portal::finish`, which removes the record from the
    /// arena, so "confirmed" and "released" have no record left to tag.
    ResponseQueued,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Pending,
    Ok(u64),
    Failed(i32),
}

#[derive(Debug)]
pub struct RequestRecord {
    conn: ConnRef,
    pub opcode: Opcode,
    pub opaque: u64,
    pub offset: u64,
    pub size: u64,
    pub buffer: Option<IoBuffer>,
    pub outcome: Outcome,
    pub stage: Stage,
    pub received_at: Instant,
}

impl RequestRecord {
    pub fn new(conn: ConnRef, opaque: u64) -> Self {
        Self {
            conn,
            opcode: Opcode::ErrorRsp,
            opaque,
            offset: 0,
            size: 0,
            buffer: None,
            outcome: Outcome::Pending,
            stage: Stage::Received,
            received_at: Instant::now(),
        }
    }

    pub fn conn(&self) -> u64 {
        self.conn.conn()
    }

    pub fn complete_ok(&mut self, retval: u64) {
        self.outcome = Outcome::Ok(retval);
        self.stage = Stage::Completed;
    }

    pub fn fail(&mut self, errno: i32) {
        self.outcome = Outcome::Failed(errno);
        self.stage = Stage::Completed;
    }

    /// Read data to ship with the response: only on a successful read.
    pub fn take_payload(&mut self) -> Option<IoBuffer> {
        match (self.opcode, self.outcome) {
            (Opcode::ReadRsp, Outcome::Ok(_)) => self.buffer.take(),
            _ => None,
        }
    }

    /// Response header for the current outcome.
    pub fn response(&self) -> WireMessage {
        let (retval, errval) = match self.outcome {
            Outcome::Ok(n) => (n as i64, 0),
            Outcome::Failed(e) => (-1, e),
            Outcome::Pending => (-1, libc::EIO),
        };
        // A failure always travels as the operation's own response opcode,
        // except for requests that never parsed.
        WireMessage::response(self.opcode, self.opaque, retval, errval)
    }

    pub(crate) fn into_parts(self) -> (ConnRef, Option<IoBuffer>) {
        (self.conn, self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionTable;
    use xread_core::buffer::BufferOrigin;

    #[test]
    fn test_response_reflects_outcome() {
        let mut table = ConnectionTable::new();
        table.open(1, None);

        let mut rec = RequestRecord::new(table.acquire(1).unwrap(), 42);
        rec.opcode = Opcode::ReadRsp;
        rec.fail(libc::ENOENT);
        let rsp = rec.response();
        assert_eq!(rsp.opaque, 42);
        assert_eq!(rsp.retval, -1);
        assert_eq!(rsp.errval, libc::ENOENT);

        rec.buffer = IoBuffer::alloc(4096, BufferOrigin::Fallback);
        assert!(rec.take_payload().is_none());
        rec.complete_ok(10);
        assert_eq!(rec.response().retval, 10);
        assert!(rec.take_payload().is_some());

        let (conn, buf) = rec.into_parts();
        assert!(buf.is_none());
        table.release(conn);
    }
}
