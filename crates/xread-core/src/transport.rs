//! Message transport abstraction, portal side.
//!
//! A `PortalTransport` owns the connections bound to one portal. The portal
//! polls it from its event loop and gets back a batch of
//! [`TransportEvent`]s; it answers requests through `send()`.
//!
//! **Payload contract:** a payload accepted by `send()` is owned by the
//! transport until it comes back in exactly one `SendComplete` event, with
//! `delivered = false` if the connection died first. A payload that `send()`
//! refuses is handed back inside [`SendRejected`]. Either way the caller
//! gets every buffer back exactly once, and only after the transport has
//! stopped reading it.
//!
//! # Implementors
//!
//! - `TcpPortalTransport` (xread-module): length-prefixed frames over
//!   nonblocking TCP sockets, multiplexed with a private epoll instance.

use crate::buffer::IoBuffer;
use crate::error::Result;

use bytes::Bytes;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

/// Portal-local connection identifier. Never reused within a transport.
pub type ConnId = u64;

#[derive(Debug)]
pub enum TransportEvent {
    NewConnection {
        conn: ConnId,
        peer: Option<SocketAddr>,
    },
    /// One inbound message header.
    Message { conn: ConnId, header: Bytes },
    SendComplete {
        conn: ConnId,
        token: u64,
        payload: Option<IoBuffer>,
        delivered: bool,
    },
    /// Emitted once, after the connection's pending sends have been returned.
    ConnectionTeardown { conn: ConnId },
}

#[derive(Debug, thiserror::Error)]
#[error("send on connection {conn} rejected: {reason}")]
pub struct SendRejected {
    pub conn: ConnId,
    pub reason: &'static str,
    pub payload: Option<IoBuffer>,
}

pub trait PortalTransport: Send {
    /// Descriptor that becomes readable when `poll_events` has work.
    fn poll_fd(&self) -> RawFd;

    /// Perform pending socket work without blocking and append the
    /// resulting events.
    fn poll_events(&mut self, events: &mut Vec<TransportEvent>) -> Result<()>;

    /// Queue `header` (and an optional payload) on `conn`. `token` comes
    /// back in the matching `SendComplete`.
    fn send(
        &mut self,
        conn: ConnId,
        token: u64,
        header: Bytes,
        payload: Option<IoBuffer>,
    ) -> std::result::Result<(), SendRejected>;

    /// Tear down one connection. Its events show up on the next poll.
    fn close(&mut self, conn: ConnId);

    /// Live connection count.
    fn connections(&self) -> usize;

    /// Close every connection, appending the resulting events.
    fn shutdown(&mut self, events: &mut Vec<TransportEvent>);
}
