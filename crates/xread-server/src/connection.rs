//! Connection contexts and the teardown gate.
//!
//! A portal owns every `ConnectionContext` it serves in a
//! `ConnectionTable`. In-flight requests do not own their connection; each
//! holds a [`ConnRef`], a non-clonable token minted by
//! [`ConnectionTable::acquire`] that bumps the connection's outstanding
//! count. The token can only be retired through
//! [`ConnectionTable::release`], which decrements and runs the gate.
//!
//! The gate is the single place a context is destroyed:
//! `disconnected && outstanding == 0`. It runs on teardown and on every
//! release, so whichever happens last destroys the context, exactly once.

use crate::request::RequestKey;

use xread_core::transport::ConnId;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct ConnectionContext {
    id: ConnId,
    peer: Option<SocketAddr>,
    disconnected: bool,
    outstanding: AtomicU64,
    /// Requests whose response is queued in the transport, oldest first.
    pub(crate) pending_sent: VecDeque<RequestKey>,
    opened_at: Instant,
}

impl ConnectionContext {
    fn new(id: ConnId, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            peer,
            disconnected: false,
            outstanding: AtomicU64::new(0),
            pending_sent: VecDeque::new(),
            opened_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn outstanding(&self) -> u64 {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Forget a confirmed send. Responses normally complete in queue order.
    pub(crate) fn confirm_sent(&mut self, key: RequestKey) {
        if self.pending_sent.front() == Some(&key) {
            self.pending_sent.pop_front();
        } else if let Some(pos) = self.pending_sent.iter().position(|&k| k == key) {
            self.pending_sent.remove(pos);
        }
    }
}

/// Counted back-reference from a request to its connection.
///
/// Deliberately neither `Clone` nor `Copy`: one token per increment.
#[must_use = "a ConnRef must be returned through ConnectionTable::release"]
#[derive(Debug)]
pub struct ConnRef {
    conn: ConnId,
    released: bool,
}

impl ConnRef {
    pub fn conn(&self) -> ConnId {
        self.conn
    }
}

impl Drop for ConnRef {
    fn drop(&mut self) {
        debug_assert!(
            self.released || std::thread::panicking(),
            "ConnRef for connection {} dropped without release",
            self.conn
        );
    }
}

#[derive(Default)]
pub struct ConnectionTable {
    conns: HashMap<ConnId, ConnectionContext>,
    destroyed: u64,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, id: ConnId, peer: Option<SocketAddr>) {
        self.conns.insert(id, ConnectionContext::new(id, peer));
    }

    pub fn get(&self, id: ConnId) -> Option<&ConnectionContext> {
        self.conns.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut ConnectionContext> {
        self.conns.get_mut(&id)
    }

    /// Connected and not yet torn down.
    pub fn is_live(&self, id: ConnId) -> bool {
        self.conns.get(&id).map_or(false, |c| !c.disconnected)
    }

    /// Take a counted reference. `None` if the connection is unknown or
    /// already torn down.
    pub fn acquire(&mut self, id: ConnId) -> Option<ConnRef> {
        let ctx = self.conns.get(&id)?;
        if ctx.disconnected {
            return None;
        }
        ctx.outstanding.fetch_add(1, Ordering::AcqRel);
        Some(ConnRef {
            conn: id,
            released: false,
        })
    }

    /// Retire a reference. Returns true if this destroyed the context.
    pub fn release(&mut self, mut r: ConnRef) -> bool {
        r.released = true;
        let id = r.conn;
        match self.conns.get(&id) {
            Some(ctx) => {
                let prev = ctx.outstanding.fetch_sub(1, Ordering::AcqRel);
                debug_assert!(prev > 0, "outstanding underflow on connection {}", id);
                self.try_destroy(id)
            }
            None => {
                tracing::error!(conn = id, "release on a destroyed connection");
                false
            }
        }
    }

    /// Mark torn down. Returns true if this destroyed the context.
    pub fn disconnect(&mut self, id: ConnId) -> bool {
        match self.conns.get_mut(&id) {
            Some(ctx) => {
                ctx.disconnected = true;
                self.try_destroy(id)
            }
            None => false,
        }
    }

    fn try_destroy(&mut self, id: ConnId) -> bool {
        let ready = self
            .conns
            .get(&id)
            .map_or(false, |c| c.disconnected && c.outstanding() == 0);
        if !ready {
            return false;
        }
        if let Some(ctx) = self.conns.remove(&id) {
            debug_assert!(ctx.pending_sent.is_empty());
            tracing::debug!(
                conn = id,
                peer = ?ctx.peer,
                lifetime_ms = ctx.opened_at.elapsed().as_millis() as u64,
                "connection destroyed"
            );
            self.destroyed += 1;
        }
        true
    }

    pub fn ids(&self) -> Vec<ConnId> {
        self.conns.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Contexts destroyed since creation.
    pub fn destroyed(&self) -> u64 {
        self.destroyed
    }
}
