//! `TcpPortalTransport` — default `PortalTransport` implementation.
//!
//! Each portal owns one transport. The transport keeps a private `Poller`
//! with every socket it serves plus a wake eventfd; the poller's own
//! descriptor is what the portal registers in its event loop, so socket
//! readiness surfaces there without the portal knowing about sockets.
//!
//! New connections arrive from the acceptor thread through a
//! [`PortalHandoff`]: a lock-free queue of accepted streams plus the wake
//! eventfd. Outbound frames are written with `writev` straight from the
//! header bytes and the payload `IoBuffer`, which stays owned by the
//! transport until the frame is fully written (or the connection dies)
//! and is then returned in `SendComplete`.

use crate::eventfd::EventFd;
use crate::frame::{frame_prefix, FrameDecoder, FRAME_PREFIX_LEN, MAX_PAYLOAD_LEN};
use crate::poller::{Event, Poller};

use xread_core::buffer::IoBuffer;
use xread_core::error::Result;
use xread_core::transport::{ConnId, PortalTransport, SendRejected, TransportEvent};

use bytes::Bytes;
use crossbeam_queue::SegQueue;
use std::collections::{HashMap, VecDeque};
use std::io::{self, IoSlice, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

const WAKE_TOKEN: u64 = u64::MAX;
const READ_CHUNK: usize = 64 << 10;

/// Cloneable handle the acceptor uses to give a stream to a portal.
#[derive(Clone)]
pub struct PortalHandoff {
    queue: Arc<SegQueue<TcpStream>>,
    wake: Arc<EventFd>,
}

impl PortalHandoff {
    pub fn hand_off(&self, stream: TcpStream) -> Result<()> {
        self.queue.push(stream);
        self.wake.notify()
    }

    /// Streams handed off but not yet adopted by the portal.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

struct OutFrame {
    prefix: [u8; FRAME_PREFIX_LEN],
    header: Bytes,
    payload: Option<IoBuffer>,
    token: u64,
    written: usize,
}

impl OutFrame {
    fn total(&self) -> usize {
        FRAME_PREFIX_LEN + self.header.len() + self.payload.as_ref().map_or(0, |p| p.len())
    }

    /// Unwritten remainder as up to three slices.
    fn remaining(&self) -> [&[u8]; 3] {
        let payload: &[u8] = match &self.payload {
            Some(p) => p.as_slice(),
            None => &[],
        };
        let parts: [&[u8]; 3] = [&self.prefix[..], &self.header[..], payload];
        let mut skip = self.written;
        let mut out: [&[u8]; 3] = [&[], &[], &[]];
        for (i, part) in parts.iter().enumerate() {
            if skip >= part.len() {
                skip -= part.len();
            } else {
                out[i] = &part[skip..];
                skip = 0;
            }
        }
        out
    }
}

struct TcpConn {
    stream: TcpStream,
    decoder: FrameDecoder,
    out: VecDeque<OutFrame>,
    want_write: bool,
    dead: bool,
}

pub struct TcpPortalTransport {
    poller: Poller,
    queue: Arc<SegQueue<TcpStream>>,
    wake: Arc<EventFd>,
    conns: HashMap<ConnId, TcpConn>,
    next_conn: ConnId,
    ready: Vec<Event>,
    /// Events produced outside `poll_events` (inline sends, closes).
    deferred: Vec<TransportEvent>,
    doomed: Vec<ConnId>,
    scratch: Box<[u8]>,
}

impl TcpPortalTransport {
    pub fn new() -> Result<Self> {
        let poller = Poller::new(256)?;
        let wake = Arc::new(EventFd::create()?);
        poller.add(wake.fd(), WAKE_TOKEN, false)?;
        Ok(Self {
            poller,
            queue: Arc::new(SegQueue::new()),
            wake,
            conns: HashMap::new(),
            next_conn: 1,
            ready: Vec::with_capacity(256),
            deferred: Vec::new(),
            doomed: Vec::new(),
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
        })
    }

    pub fn handoff(&self) -> PortalHandoff {
        PortalHandoff {
            queue: Arc::clone(&self.queue),
            wake: Arc::clone(&self.wake),
        }
    }

    fn adopt(&mut self, stream: TcpStream, events: &mut Vec<TransportEvent>) {
        let peer: Option<SocketAddr> = stream.peer_addr().ok();
        if let Err(e) = stream.set_nonblocking(true) {
            tracing::warn!(error = %e, "dropping connection: set_nonblocking failed");
            return;
        }
        let _ = stream.set_nodelay(true);

        let conn = self.next_conn;
        self.next_conn += 1;
        if let Err(e) = self.poller.add(stream.as_raw_fd(), conn, false) {
            tracing::warn!(error = %e, "dropping connection: epoll add failed");
            return;
        }
        self.conns.insert(
            conn,
            TcpConn {
                stream,
                decoder: FrameDecoder::new(),
                out: VecDeque::new(),
                want_write: false,
                dead: false,
            },
        );
        events.push(TransportEvent::NewConnection { conn, peer });
    }

    /// Drain readable bytes and emit one `Message` per complete frame.
    fn read_conn(&mut self, id: ConnId, events: &mut Vec<TransportEvent>) {
        let Some(conn) = self.conns.get_mut(&id) else { return };
        loop {
            match conn.stream.read(&mut self.scratch) {
                Ok(0) => {
                    conn.dead = true;
                    break;
                }
                Ok(n) => conn.decoder.extend(&self.scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(conn = id, error = %e, "read failed");
                    conn.dead = true;
                    break;
                }
            }
        }
        loop {
            match conn.decoder.decode() {
                Ok(Some(frame)) => events.push(TransportEvent::Message {
                    conn: id,
                    header: frame.header,
                }),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(conn = id, error = %e, "bad frame, closing connection");
                    conn.dead = true;
                    break;
                }
            }
        }
    }

    /// Write as much queued output as the socket takes.
    fn flush_conn(&mut self, id: ConnId, events: &mut Vec<TransportEvent>) {
        let Some(conn) = self.conns.get_mut(&id) else { return };
        while let Some(front) = conn.out.front_mut() {
            let parts = front.remaining();
            let slices = [
                IoSlice::new(parts[0]),
                IoSlice::new(parts[1]),
                IoSlice::new(parts[2]),
            ];
            match conn.stream.write_vectored(&slices) {
                Ok(0) => {
                    conn.dead = true;
                    break;
                }
                Ok(n) => {
                    front.written += n;
                    if front.written == front.total() {
                        if let Some(done) = conn.out.pop_front() {
                            events.push(TransportEvent::SendComplete {
                                conn: id,
                                token: done.token,
                                payload: done.payload,
                                delivered: true,
                            });
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(conn = id, error = %e, "write failed");
                    conn.dead = true;
                    break;
                }
            }
        }

        let want_write = !conn.out.is_empty() && !conn.dead;
        if want_write != conn.want_write {
            conn.want_write = want_write;
            let _ = self.poller.modify(conn.stream.as_raw_fd(), id, want_write);
        }
    }

    /// Remove a connection, returning its queued payloads undelivered.
    fn teardown(&mut self, id: ConnId, events: &mut Vec<TransportEvent>) {
        let Some(conn) = self.conns.remove(&id) else { return };
        let _ = self.poller.delete(conn.stream.as_raw_fd());
        for frame in conn.out {
            events.push(TransportEvent::SendComplete {
                conn: id,
                token: frame.token,
                payload: frame.payload,
                delivered: false,
            });
        }
        events.push(TransportEvent::ConnectionTeardown { conn: id });
    }

    fn reap_dead(&mut self, events: &mut Vec<TransportEvent>) {
        let mut dead: Vec<ConnId> = std::mem::take(&mut self.doomed);
        dead.extend(self.conns.iter().filter(|(_, c)| c.dead).map(|(&id, _)| id));
        for id in dead {
            self.teardown(id, events);
        }
    }
}

impl PortalTransport for TcpPortalTransport {
    fn poll_fd(&self) -> RawFd {
        self.poller.fd()
    }

    fn poll_events(&mut self, events: &mut Vec<TransportEvent>) -> Result<()> {
        events.append(&mut self.deferred);

        self.ready.clear();
        let mut ready = std::mem::take(&mut self.ready);
        self.poller.wait(&mut ready, Some(Duration::ZERO))?;

        for ev in &ready {
            if ev.token == WAKE_TOKEN {
                self.wake.drain();
                while let Some(stream) = self.queue.pop() {
                    self.adopt(stream, events);
                }
                continue;
            }
            if ev.readable || ev.hangup {
                self.read_conn(ev.token, events);
                if ev.hangup && !ev.readable {
                    if let Some(c) = self.conns.get_mut(&ev.token) {
                        c.dead = true;
                    }
                }
            }
            if ev.writable {
                self.flush_conn(ev.token, events);
            }
        }
        self.ready = ready;

        self.reap_dead(events);
        Ok(())
    }

    fn send(
        &mut self,
        conn: ConnId,
        token: u64,
        header: Bytes,
        payload: Option<IoBuffer>,
    ) -> std::result::Result<(), SendRejected> {
        let payload_len = payload.as_ref().map_or(0, |p| p.len());
        let Some(c) = self.conns.get_mut(&conn) else {
            return Err(SendRejected {
                conn,
                reason: "connection closed",
                payload,
            });
        };
        if c.dead {
            return Err(SendRejected {
                conn,
                reason: "connection closing",
                payload,
            });
        }
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(SendRejected {
                conn,
                reason: "payload too large",
                payload,
            });
        }

        c.out.push_back(OutFrame {
            prefix: frame_prefix(header.len(), payload_len),
            header,
            payload,
            token,
            written: 0,
        });

        let mut produced = std::mem::take(&mut self.deferred);
        self.flush_conn(conn, &mut produced);
        self.deferred = produced;
        let dead = self.conns.get(&conn).map_or(false, |c| c.dead);
        if dead || !self.deferred.is_empty() {
            // Make the poll descriptor readable so the portal comes back
            // for the deferred events.
            let _ = self.wake.notify();
        }
        Ok(())
    }

    fn close(&mut self, conn: ConnId) {
        if self.conns.contains_key(&conn) {
            self.doomed.push(conn);
            let _ = self.wake.notify();
        }
    }

    fn connections(&self) -> usize {
        self.conns.len()
    }

    fn shutdown(&mut self, events: &mut Vec<TransportEvent>) {
        events.append(&mut self.deferred);
        while self.queue.pop().is_some() {}
        let ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for id in ids {
            self.teardown(id, events);
        }
        self.doomed.clear();
    }
}
