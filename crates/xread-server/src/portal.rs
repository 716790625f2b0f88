//! Portal: one reactor thread and everything it exclusively owns.
//!
//! | Owned state        | Purpose                                        |
//! |--------------------|------------------------------------------------|
//! | transport          | connections handed to this portal              |
//! | ConnectionTable    | contexts + teardown gate                       |
//! | Slab<RequestRecord>| request arena; key = backend and send token    |
//! | SlabPool           | read buffers                                   |
//! | CompletionInbox    | statuses forwarded from the backend            |
//!
//! ```text
//!   epoll ─┬─ wake eventfd ──► drain inbox ──► on_status ──► respond
//!          ├─ transport fd ──► poll_events ──► on_message / on_send_complete / on_teardown
//!          └─ timerfd ───────► stats line
//! ```
//!
//! Nothing in here is shared with another thread except the inbox, the
//! stop flag and the stats counters.

use crate::connection::ConnectionTable;
use crate::forwarder::CompletionInbox;
use crate::request::{Outcome, RequestKey, RequestRecord, Stage};
use crate::resolver::FileResolver;
use crate::stats::{add, bump, PortalStats};

use xread_core::error::{Result, XreadError};
use xread_core::io_backend::{FileBackend, IoStatus, ReadOp, StatusSink};
use xread_core::transport::{ConnId, PortalTransport, TransportEvent};
use xread_core::wire::{self, Opcode, Request, WireMessage};
use xread_module::poller::Poller;
use xread_module::pool::SlabPool;
use xread_module::timer::TimerFd;

use bytes::Bytes;
use slab::Slab;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const TOKEN_WAKE: u64 = 0;
const TOKEN_TRANSPORT: u64 = 1;
const TOKEN_TIMER: u64 = 2;

/// Everything a portal is built from.
pub struct PortalParts {
    pub id: usize,
    pub transport: Box<dyn PortalTransport>,
    pub backend: Arc<dyn FileBackend>,
    /// Where the backend posts this portal's completions.
    pub sink: Arc<dyn StatusSink>,
    pub inbox: Arc<CompletionInbox>,
    pub pool: SlabPool,
    pub resolver: Arc<FileResolver>,
    pub max_read_size: usize,
    pub stats_interval: Option<Duration>,
    pub drain_timeout: Duration,
    pub core: Option<usize>,
}

/// Asks a running portal to stop.
#[derive(Clone)]
pub struct PortalStop {
    flag: Arc<AtomicBool>,
    inbox: Arc<CompletionInbox>,
}

impl PortalStop {
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.inbox.signal();
    }
}

pub struct Portal {
    id: usize,
    transport: Box<dyn PortalTransport>,
    backend: Arc<dyn FileBackend>,
    sink: Arc<dyn StatusSink>,
    inbox: Arc<CompletionInbox>,
    pool: SlabPool,
    resolver: Arc<FileResolver>,
    conns: ConnectionTable,
    requests: Slab<RequestRecord>,
    stats: Arc<PortalStats>,
    stop: Arc<AtomicBool>,
    max_read_size: usize,
    stats_interval: Option<Duration>,
    drain_timeout: Duration,
    core: Option<usize>,
    events: Vec<TransportEvent>,
    statuses: Vec<IoStatus>,
}

impl Portal {
    pub fn new(parts: PortalParts) -> Self {
        Self {
            id: parts.id,
            transport: parts.transport,
            backend: parts.backend,
            sink: parts.sink,
            inbox: parts.inbox,
            pool: parts.pool,
            resolver: parts.resolver,
            conns: ConnectionTable::new(),
            requests: Slab::new(),
            stats: Arc::new(PortalStats::default()),
            stop: Arc::new(AtomicBool::new(false)),
            max_read_size: parts.max_read_size,
            stats_interval: parts.stats_interval,
            drain_timeout: parts.drain_timeout,
            core: parts.core,
            events: Vec::with_capacity(64),
            statuses: Vec::with_capacity(256),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn stats(&self) -> Arc<PortalStats> {
        Arc::clone(&self.stats)
    }

    pub fn stop_handle(&self) -> PortalStop {
        PortalStop {
            flag: Arc::clone(&self.stop),
            inbox: Arc::clone(&self.inbox),
        }
    }

    /// Thread body. Returns after a stop request once every buffer is back.
    pub fn run(mut self) {
        if let Some(core) = self.core {
            match xread_module::affinity::pin_current_thread(core) {
                Ok(()) => tracing::debug!(portal = self.id, core, "portal pinned"),
                Err(e) => tracing::warn!(portal = self.id, core, error = %e, "failed to pin portal"),
            }
        }

        if let Err(e) = self.event_loop() {
            tracing::error!(portal = self.id, error = %e, "portal event loop failed");
        }
        self.drain();
    }

    fn event_loop(&mut self) -> Result<()> {
        let mut poller = Poller::new(16)?;
        poller.add(self.inbox.wake_fd(), TOKEN_WAKE, false)?;
        poller.add(self.transport.poll_fd(), TOKEN_TRANSPORT, false)?;
        let timer = match self.stats_interval {
            Some(interval) => {
                let timer = TimerFd::periodic(interval)?;
                poller.add(timer.fd(), TOKEN_TIMER, false)?;
                Some(timer)
            }
            None => None,
        };

        tracing::info!(portal = self.id, backend = self.backend.name(), "portal started");
        let mut ready = Vec::with_capacity(16);
        while !self.stop.load(Ordering::Acquire) {
            ready.clear();
            poller.wait(&mut ready, None)?;
            for ev in &ready {
                match ev.token {
                    TOKEN_WAKE => self.process_inbox(),
                    TOKEN_TRANSPORT => self.process_transport(),
                    TOKEN_TIMER => {
                        if let Some(t) = &timer {
                            t.ack();
                        }
                        self.log_stats();
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Tear down every connection, then wait (bounded) for reads still
    /// owned by the backend.
    fn drain(&mut self) {
        // ── Step 1: close all connections ──
        let mut events = std::mem::take(&mut self.events);
        self.transport.shutdown(&mut events);
        for ev in events.drain(..) {
            self.on_transport_event(ev);
        }
        self.events = events;

        // ── Step 2: wait for backend completions ──
        let deadline = Instant::now() + self.drain_timeout;
        let wake_fd = self.inbox.wake_fd();
        let mut waiter = Poller::new(1)
            .and_then(|p| p.add(wake_fd, TOKEN_WAKE, false).map(|()| p))
            .ok();
        let mut ready = Vec::with_capacity(1);
        while !self.requests.is_empty() && Instant::now() < deadline {
            match waiter.as_mut() {
                Some(p) => {
                    ready.clear();
                    let _ = p.wait(&mut ready, Some(Duration::from_millis(10)));
                }
                None => std::thread::sleep(Duration::from_millis(1)),
            }
            self.process_inbox();
        }

        // ── Step 3: abandon what never came back ──
        if !self.requests.is_empty() {
            tracing::warn!(
                portal = self.id,
                abandoned = self.requests.len(),
                "reads still in the backend at shutdown; leaking their buffers"
            );
            // The backend may still write into these buffers.
            for rec in self.requests.drain() {
                std::mem::forget(rec);
            }
        }
        self.stats.inflight.store(0, Ordering::Relaxed);
        tracing::info!(portal = self.id, stats = %self.stats.snapshot(), "portal stopped");
    }

    pub(crate) fn process_inbox(&mut self) {
        let mut statuses = std::mem::take(&mut self.statuses);
        self.inbox.drain(&mut statuses);
        for st in statuses.drain(..) {
            self.on_status(st);
        }
        self.statuses = statuses;
        self.update_inflight();
    }

    pub(crate) fn process_transport(&mut self) {
        let mut events = std::mem::take(&mut self.events);
        if let Err(e) = self.transport.poll_events(&mut events) {
            tracing::warn!(portal = self.id, error = %e, "transport poll failed");
        }
        for ev in events.drain(..) {
            self.on_transport_event(ev);
        }
        self.events = events;
        self.update_inflight();
    }

    fn update_inflight(&self) {
        self.stats
            .inflight
            .store(self.requests.len() as u64, Ordering::Relaxed);
    }

    fn on_transport_event(&mut self, ev: TransportEvent) {
        match ev {
            TransportEvent::NewConnection { conn, peer } => self.on_new_connection(conn, peer),
            TransportEvent::Message { conn, header } => self.on_message(conn, header),
            TransportEvent::SendComplete {
                conn,
                token,
                payload,
                delivered,
            } => {
                if let Some(buf) = payload {
                    self.pool.release(buf);
                }
                self.on_send_complete(conn, token as RequestKey, delivered);
            }
            TransportEvent::ConnectionTeardown { conn } => self.on_teardown(conn),
        }
    }

    fn on_new_connection(&mut self, conn: ConnId, peer: Option<SocketAddr>) {
        self.conns.open(conn, peer);
        bump(&self.stats.conns_opened);
        tracing::debug!(portal = self.id, conn, peer = ?peer, "connection attached");
    }

    fn on_teardown(&mut self, conn: ConnId) {
        let outstanding = self.conns.get(conn).map_or(0, |c| c.outstanding());
        tracing::debug!(portal = self.id, conn, outstanding, "connection torn down");
        if self.conns.disconnect(conn) {
            bump(&self.stats.conns_destroyed);
        }
    }

    fn on_message(&mut self, conn: ConnId, header: Bytes) {
        bump(&self.stats.requests);
        let Some(conn_ref) = self.conns.acquire(conn) else {
            tracing::debug!(portal = self.id, conn, "message on a dead connection");
            return;
        };

        let (opaque, parsed) = match WireMessage::decode(&header) {
            Ok(msg) => (msg.opaque, Request::parse(&msg)),
            Err(e) => (wire::peek_opaque(&header).unwrap_or(0), Err(e)),
        };
        let key = self.requests.insert(RequestRecord::new(conn_ref, opaque));

        match parsed {
            Err(e) => {
                bump(&self.stats.protocol_errors);
                tracing::debug!(portal = self.id, conn, opaque, error = %e, "bad request");
                self.requests[key].fail(XreadError::from(e).errno());
                self.respond(key);
            }
            Ok(Request::Open) => {
                bump(&self.stats.opens);
                let rec = &mut self.requests[key];
                rec.opcode = Opcode::OpenRsp;
                rec.complete_ok(0);
                self.respond(key);
            }
            Ok(Request::Close) => {
                bump(&self.stats.closes);
                let rec = &mut self.requests[key];
                rec.opcode = Opcode::CloseRsp;
                rec.complete_ok(0);
                self.respond(key);
            }
            Ok(Request::Read {
                filename,
                offset,
                size,
            }) => {
                bump(&self.stats.reads);
                self.dispatch_read(key, &filename, offset, size);
            }
        }
    }

    fn dispatch_read(&mut self, key: RequestKey, filename: &str, offset: u64, size: u64) {
        {
            let rec = &mut self.requests[key];
            rec.opcode = Opcode::ReadRsp;
            rec.offset = offset;
            rec.size = size;
        }

        if size == 0 || size > self.max_read_size as u64 {
            self.fail_read(key, libc::EINVAL);
            return;
        }
        if offset.checked_add(size).is_none() {
            self.fail_read(key, libc::EINVAL);
            return;
        }
        let path = match self.resolver.resolve(filename) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(portal = self.id, filename, error = %e, "rejected filename");
                self.fail_read(key, e.errno());
                return;
            }
        };

        let len = size as usize;
        let mut buf = match self.pool.acquire(len) {
            Some(b) => b,
            None => match self.pool.acquire_fallback(len) {
                Ok(b) => {
                    bump(&self.stats.fallback_allocs);
                    b
                }
                Err(e) => {
                    bump(&self.stats.enomem);
                    tracing::debug!(portal = self.id, size, "no buffer for read");
                    self.fail_read(key, e.errno());
                    return;
                }
            },
        };
        buf.prepare(len);

        let op = ReadOp {
            path,
            offset,
            len,
            dest: buf.as_mut_ptr(),
            token: key as u64,
        };
        let rec = &mut self.requests[key];
        rec.buffer = Some(buf);
        rec.stage = Stage::Dispatched;

        // Safety: the buffer now lives in the record, which stays in the
        // arena untouched until the status for `key` comes back.
        let submitted = unsafe { self.backend.submit_read(op, Arc::clone(&self.sink)) };
        if let Err(e) = submitted {
            tracing::warn!(portal = self.id, error = %e, "backend refused read");
            self.fail_read(key, libc::EIO);
        }
    }

    fn fail_read(&mut self, key: RequestKey, errno: i32) {
        bump(&self.stats.read_errors);
        self.requests[key].fail(errno);
        self.respond(key);
    }

    fn on_status(&mut self, status: IoStatus) {
        let key = status.token as RequestKey;
        let Some(rec) = self.requests.get_mut(key) else {
            tracing::error!(portal = self.id, token = status.token, "status for unknown record");
            return;
        };
        if rec.stage != Stage::Dispatched {
            tracing::error!(portal = self.id, token = status.token, stage = ?rec.stage, "status for record not in the backend");
            return;
        }

        if status.is_ok() {
            let n = status.bytes as usize;
            if let Some(buf) = rec.buffer.as_mut() {
                buf.truncate(n);
            }
            rec.complete_ok(n as u64);
            add(&self.stats.read_bytes, n as u64);
        } else {
            rec.fail(status.error);
            bump(&self.stats.read_errors);
        }
        tracing::trace!(
            portal = self.id,
            token = status.token,
            error = status.error,
            latency_us = rec.received_at.elapsed().as_micros() as u64,
            "read completed"
        );
        self.respond(key);
    }

    /// Queue the response for a completed record, or release it if its
    /// connection is gone or the send cannot start.
    fn respond(&mut self, key: RequestKey) {
        let Some(rec) = self.requests.get_mut(key) else {
            return;
        };
        debug_assert_eq!(rec.stage, Stage::Completed);
        let conn = rec.conn();
        if !self.conns.is_live(conn) {
            self.finish(key);
            return;
        }

        let header = rec.response().encode();
        let payload = rec.take_payload();
        match self.transport.send(conn, key as u64, header, payload) {
            Ok(()) => {
                rec.stage = Stage::ResponseQueued;
                bump(&self.stats.sends);
                if let Some(ctx) = self.conns.get_mut(conn) {
                    ctx.pending_sent.push_back(key);
                }
            }
            Err(rejected) => {
                tracing::debug!(portal = self.id, conn, reason = rejected.reason, "response dropped");
                if let Some(buf) = rejected.payload {
                    self.pool.release(buf);
                }
                bump(&self.stats.send_failures);
                self.finish(key);
            }
        }
    }

    fn on_send_complete(&mut self, conn: ConnId, key: RequestKey, delivered: bool) {
        if !delivered {
            bump(&self.stats.send_failures);
        }
        if let Some(ctx) = self.conns.get_mut(conn) {
            ctx.confirm_sent(key);
        }
        let queued = matches!(
            self.requests.get(key),
            Some(rec) if rec.stage == Stage::ResponseQueued && rec.conn() == conn
        );
        if queued {
            self.finish(key);
        } else {
            tracing::error!(portal = self.id, conn, token = key, "send completion for unknown record");
        }
    }

    /// Free the arena slot, return the buffer and drop the connection
    /// reference through the gate.
    fn finish(&mut self, key: RequestKey) {
        let Some(rec) = self.requests.try_remove(key) else {
            return;
        };
        if let Outcome::Pending = rec.outcome {
            tracing::error!(portal = self.id, token = key, "released a pending record");
        }
        let (conn_ref, buffer) = rec.into_parts();
        if let Some(buf) = buffer {
            self.pool.release(buf);
        }
        if self.conns.release(conn_ref) {
            bump(&self.stats.conns_destroyed);
        }
    }

    fn log_stats(&self) {
        tracing::info!(
            portal = self.id,
            conns = self.conns.len(),
            pool_in_use = self.pool.in_use(),
            pool_allocated = self.pool.allocated(),
            fallback_in_use = self.pool.fallback_in_use(),
            backend_inflight = self.backend.inflight(),
            "{}",
            self.stats.snapshot()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xread_core::buffer::IoBuffer;
    use xread_core::transport::SendRejected;
    use xread_module::pool::{FallbackAllocator, PoolConfig};

    use std::collections::VecDeque;
    use std::os::unix::io::RawFd;
    use std::sync::Mutex;

    struct Sent {
        conn: ConnId,
        token: u64,
        header: WireMessage,
        payload: Option<IoBuffer>,
    }

    #[derive(Default)]
    struct Script {
        inbound: VecDeque<TransportEvent>,
        sent: Vec<Sent>,
        conns: Vec<ConnId>,
        refuse: bool,
        closed: bool,
    }

    /// Transport driven by the test: events are queued by hand and sends
    /// are parked until the test confirms them.
    struct ScriptedTransport(Arc<Mutex<Script>>);

    impl PortalTransport for ScriptedTransport {
        fn poll_fd(&self) -> RawFd {
            -1
        }

        fn poll_events(&mut self, events: &mut Vec<TransportEvent>) -> Result<()> {
            let mut script = self.0.lock().unwrap();
            while let Some(ev) = script.inbound.pop_front() {
                if let TransportEvent::NewConnection { conn, .. } = &ev {
                    script.conns.push(*conn);
                }
                events.push(ev);
            }
            Ok(())
        }

        fn send(
            &mut self,
            conn: ConnId,
            token: u64,
            header: Bytes,
            payload: Option<IoBuffer>,
        ) -> std::result::Result<(), SendRejected> {
            let mut script = self.0.lock().unwrap();
            if script.refuse || script.closed {
                return Err(SendRejected {
                    conn,
                    reason: "refused",
                    payload,
                });
            }
            script.sent.push(Sent {
                conn,
                token,
                header: WireMessage::decode(&header).unwrap(),
                payload,
            });
            Ok(())
        }

        fn close(&mut self, conn: ConnId) {
            self.0
                .lock()
                .unwrap()
                .inbound
                .push_back(TransportEvent::ConnectionTeardown { conn });
        }

        fn connections(&self) -> usize {
            0
        }

        fn shutdown(&mut self, events: &mut Vec<TransportEvent>) {
            let mut script = self.0.lock().unwrap();
            script.closed = true;
            for s in script.sent.drain(..) {
                events.push(TransportEvent::SendComplete {
                    conn: s.conn,
                    token: s.token,
                    payload: s.payload,
                    delivered: false,
                });
            }
            for conn in script.conns.drain(..) {
                events.push(TransportEvent::ConnectionTeardown { conn });
            }
        }
    }

    /// Backend that parks reads until the test completes them.
    #[derive(Default)]
    struct ManualBackend {
        ops: Mutex<Vec<ReadOp>>,
        refuse: AtomicBool,
    }

    impl FileBackend for ManualBackend {
        unsafe fn submit_read(&self, op: ReadOp, _sink: Arc<dyn StatusSink>) -> Result<()> {
            if self.refuse.load(Ordering::Relaxed) {
                return Err(XreadError::Backend(libc::EAGAIN));
            }
            self.ops.lock().unwrap().push(op);
            Ok(())
        }

        fn inflight(&self) -> usize {
            self.ops.lock().unwrap().len()
        }

        fn shutdown(&self) {}

        fn name(&self) -> &'static str {
            "manual"
        }
    }

    struct NullSink;

    impl StatusSink for NullSink {
        fn post(&self, _status: IoStatus) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        portal: Portal,
        script: Arc<Mutex<Script>>,
        backend: Arc<ManualBackend>,
    }

    impl Harness {
        fn new(pool: PoolConfig, fallback_limit: usize) -> Self {
            let script = Arc::new(Mutex::new(Script::default()));
            let backend = Arc::new(ManualBackend::default());
            let portal = Portal::new(PortalParts {
                id: 0,
                transport: Box::new(ScriptedTransport(Arc::clone(&script))),
                backend: Arc::clone(&backend) as Arc<dyn FileBackend>,
                sink: Arc::new(NullSink),
                inbox: Arc::new(CompletionInbox::new().unwrap()),
                pool: SlabPool::new(pool, Arc::new(FallbackAllocator::new(fallback_limit))),
                resolver: Arc::new(FileResolver::new("/data")),
                max_read_size: 1 << 20,
                stats_interval: None,
                drain_timeout: Duration::from_millis(100),
                core: None,
            });
            let mut h = Self {
                portal,
                script,
                backend,
            };
            h.inject(TransportEvent::NewConnection { conn: 1, peer: None });
            h
        }

        fn inject(&mut self, ev: TransportEvent) {
            self.script.lock().unwrap().inbound.push_back(ev);
            self.portal.process_transport();
        }

        fn request(&mut self, msg: WireMessage) {
            self.inject(TransportEvent::Message {
                conn: 1,
                header: msg.encode(),
            });
        }

        /// Fill every parked read with `fill` and report `n` bytes each.
        fn complete_reads(&mut self, fill: u8, n: Option<usize>) {
            let ops: Vec<ReadOp> = self.backend.ops.lock().unwrap().drain(..).collect();
            for op in ops {
                let done = n.unwrap_or(op.len).min(op.len);
                unsafe { std::ptr::write_bytes(op.dest, fill, done) };
                self.portal.inbox.push(IoStatus::ok(op.token, done));
            }
            self.portal.process_inbox();
        }

        fn fail_reads(&mut self, errno: i32) {
            let ops: Vec<ReadOp> = self.backend.ops.lock().unwrap().drain(..).collect();
            for op in ops {
                self.portal.inbox.push(IoStatus::failed(op.token, errno));
            }
            self.portal.process_inbox();
        }

        /// Hand every parked send back to the portal.
        fn confirm_sends(&mut self, delivered: bool) -> Vec<(WireMessage, Option<Vec<u8>>)> {
            let sent: Vec<Sent> = self.script.lock().unwrap().sent.drain(..).collect();
            let mut out = Vec::new();
            for s in sent {
                out.push((s.header, s.payload.as_ref().map(|p| p.as_slice().to_vec())));
                self.inject(TransportEvent::SendComplete {
                    conn: s.conn,
                    token: s.token,
                    payload: s.payload,
                    delivered,
                });
            }
            out
        }

        fn sent_len(&self) -> usize {
            self.script.lock().unwrap().sent.len()
        }
    }

    #[test]
    fn test_open_then_read_roundtrip() {
        let mut h = Harness::new(PoolConfig::default(), 1 << 20);
        h.request(WireMessage::open_req(1));
        let rsp = h.confirm_sends(true);
        assert_eq!(rsp[0].0.opcode, Opcode::OpenRsp);
        assert_eq!(rsp[0].0.retval, 0);

        h.request(WireMessage::read_req(9, "obj", 0, 100));
        assert_eq!(h.backend.inflight(), 1);
        h.complete_reads(0xab, None);

        let rsp = h.confirm_sends(true);
        assert_eq!(rsp.len(), 1);
        let (header, payload) = &rsp[0];
        assert_eq!(header.opcode, Opcode::ReadRsp);
        assert_eq!(header.opaque, 9);
        assert_eq!(header.retval, 100);
        assert_eq!(payload.as_deref(), Some(&[0xab; 100][..]));
        assert!(h.portal.requests.is_empty());
        assert_eq!(h.portal.pool.in_use(), 0);
    }

    #[test]
    fn test_buffer_held_until_send_confirmed() {
        let mut h = Harness::new(PoolConfig::default(), 1 << 20);
        h.request(WireMessage::read_req(1, "a", 0, 4096));
        h.request(WireMessage::read_req(2, "b", 0, 4096));
        h.complete_reads(1, None);

        // Responses queued, transport still owns the payloads.
        assert_eq!(h.sent_len(), 2);
        assert_eq!(h.portal.requests.len(), 2);
        assert_eq!(h.portal.pool.in_use(), 2);
        assert_eq!(h.portal.conns.get(1).unwrap().outstanding(), 2);

        h.confirm_sends(true);
        assert!(h.portal.requests.is_empty());
        assert_eq!(h.portal.pool.in_use(), 0);
        assert_eq!(h.portal.conns.get(1).unwrap().outstanding(), 0);
    }

    #[test]
    fn test_short_read_and_backend_error() {
        let mut h = Harness::new(PoolConfig::default(), 1 << 20);
        h.request(WireMessage::read_req(1, "short", 10, 500));
        h.complete_reads(7, Some(30));
        h.request(WireMessage::read_req(2, "missing", 0, 500));
        h.fail_reads(libc::ENOENT);

        let rsp = h.confirm_sends(true);
        assert_eq!(rsp[0].0.retval, 30);
        assert_eq!(rsp[0].1.as_ref().map(Vec::len), Some(30));
        assert_eq!(rsp[1].0.opcode, Opcode::ReadRsp);
        assert_eq!(rsp[1].0.retval, -1);
        assert_eq!(rsp[1].0.errval, libc::ENOENT);
        assert!(rsp[1].1.is_none());
        assert_eq!(h.portal.pool.in_use(), 0);
        assert_eq!(h.portal.stats.snapshot().read_errors, 1);
    }

    #[test]
    fn test_teardown_while_in_backend_defers_release() {
        let mut h = Harness::new(PoolConfig::default(), 1 << 20);
        h.request(WireMessage::read_req(1, "obj", 0, 4096));
        h.inject(TransportEvent::ConnectionTeardown { conn: 1 });

        assert!(h.portal.conns.get(1).is_some());
        assert_eq!(h.portal.stats.snapshot().conns_destroyed, 0);
        assert_eq!(h.portal.pool.in_use(), 1);

        h.complete_reads(0, None);
        assert_eq!(h.sent_len(), 0);
        assert!(h.portal.requests.is_empty());
        assert!(h.portal.conns.get(1).is_none());
        assert_eq!(h.portal.stats.snapshot().conns_destroyed, 1);
        assert_eq!(h.portal.pool.in_use(), 0);
    }

    #[test]
    fn test_teardown_with_many_reads_out_of_order() {
        const READS: u64 = 8;
        let mut h = Harness::new(PoolConfig::default(), 1 << 20);
        for i in 0..READS {
            h.request(WireMessage::read_req(i, "obj", i * 4096, 4096));
        }
        h.inject(TransportEvent::ConnectionTeardown { conn: 1 });
        assert_eq!(h.portal.pool.in_use(), READS as usize);

        let mut ops: Vec<ReadOp> = h.backend.ops.lock().unwrap().drain(..).collect();
        ops.reverse();
        ops.swap(1, 5);
        for (n, op) in ops.into_iter().enumerate() {
            let before = h.portal.pool.in_use();
            h.portal.inbox.push(IoStatus::ok(op.token, op.len));
            h.portal.process_inbox();

            assert_eq!(h.portal.pool.in_use(), before - 1);
            let destroyed = h.portal.stats.snapshot().conns_destroyed;
            if n + 1 < READS as usize {
                assert_eq!(destroyed, 0, "destroyed after {} completions", n + 1);
                assert!(h.portal.conns.get(1).is_some());
            } else {
                assert_eq!(destroyed, 1);
                assert!(h.portal.conns.get(1).is_none());
            }
        }

        // A stray status after the last release changes nothing.
        h.portal.inbox.push(IoStatus::ok(0, 4096));
        h.portal.process_inbox();
        assert_eq!(h.sent_len(), 0);
        assert!(h.portal.requests.is_empty());
        assert_eq!(h.portal.pool.in_use(), 0);
        assert_eq!(h.portal.stats.snapshot().conns_destroyed, 1);
    }

    #[test]
    fn test_undelivered_send_still_releases() {
        let mut h = Harness::new(PoolConfig::default(), 1 << 20);
        h.request(WireMessage::read_req(1, "obj", 0, 64));
        h.complete_reads(0, None);
        h.inject(TransportEvent::ConnectionTeardown { conn: 1 });
        assert!(h.portal.conns.get(1).is_some());

        h.confirm_sends(false);
        assert!(h.portal.conns.get(1).is_none());
        assert_eq!(h.portal.pool.in_use(), 0);
        assert_eq!(h.portal.stats.snapshot().send_failures, 1);
    }

    #[test]
    fn test_malformed_requests_get_error_responses() {
        let mut h = Harness::new(PoolConfig::default(), 1 << 20);

        let mut unknown = WireMessage::open_req(55).encode().to_vec();
        unknown[3] = 0x7f;
        h.inject(TransportEvent::Message {
            conn: 1,
            header: Bytes::from(unknown),
        });
        h.inject(TransportEvent::Message {
            conn: 1,
            header: Bytes::from_static(b"garbage"),
        });
        h.request(WireMessage::response(Opcode::ReadRsp, 56, 0, 0));
        let mut no_size = WireMessage::read_req(57, "x", 0, 1);
        no_size.size = None;
        h.request(no_size);

        assert_eq!(h.backend.inflight(), 0);
        let rsp = h.confirm_sends(true);
        let got: Vec<(Opcode, u64, i32)> = rsp
            .iter()
            .map(|(m, _)| (m.opcode, m.opaque, m.errval))
            .collect();
        assert_eq!(
            got,
            vec![
                (Opcode::ErrorRsp, 55, libc::EIO),
                (Opcode::ErrorRsp, 0, libc::EBADMSG),
                (Opcode::ErrorRsp, 56, libc::EIO),
                (Opcode::ErrorRsp, 57, libc::EBADMSG),
            ]
        );
        assert_eq!(h.portal.stats.snapshot().protocol_errors, 4);
    }

    #[test]
    fn test_invalid_reads_never_reach_backend() {
        let mut h = Harness::new(PoolConfig::default(), 1 << 20);
        h.request(WireMessage::read_req(1, "obj", 0, 0));
        h.request(WireMessage::read_req(2, "obj", 0, (1 << 20) + 1));
        h.request(WireMessage::read_req(3, "../etc/passwd", 0, 10));
        h.request(WireMessage::read_req(4, "/abs", 0, 10));
        h.request(WireMessage::read_req(5, "obj", u64::MAX, 10));

        assert_eq!(h.backend.inflight(), 0);
        for (msg, _) in h.confirm_sends(true) {
            assert_eq!(msg.opcode, Opcode::ReadRsp);
            assert_eq!(msg.errval, libc::EINVAL, "opaque {}", msg.opaque);
        }
        assert!(h.portal.requests.is_empty());
    }

    #[test]
    fn test_pool_and_fallback_exhausted_is_enomem() {
        let mut h = Harness::new(PoolConfig { tier_caps: [1, 0, 0, 0, 0] }, 0);
        h.request(WireMessage::read_req(1, "obj", 0, 4096));
        h.request(WireMessage::read_req(2, "obj", 0, 4096));
        assert_eq!(h.backend.inflight(), 1);

        let rsp = h.confirm_sends(true);
        assert_eq!(rsp.len(), 1);
        assert_eq!(rsp[0].0.opaque, 2);
        assert_eq!(rsp[0].0.errval, libc::ENOMEM);
        assert_eq!(h.portal.stats.snapshot().enomem, 1);

        h.complete_reads(0, None);
        h.confirm_sends(true);
        assert_eq!(h.portal.pool.in_use(), 0);
    }

    #[test]
    fn test_fallback_used_when_tier_full() {
        let mut h = Harness::new(PoolConfig { tier_caps: [0; 5] }, 1 << 20);
        h.request(WireMessage::read_req(1, "obj", 0, 4096));
        assert_eq!(h.portal.pool.fallback_in_use(), 1);
        h.complete_reads(3, None);
        h.confirm_sends(true);
        assert_eq!(h.portal.pool.fallback_in_use(), 0);
        assert_eq!(h.portal.stats.snapshot().fallback_allocs, 1);
    }

    #[test]
    fn test_submit_failure_is_eio() {
        let mut h = Harness::new(PoolConfig::default(), 1 << 20);
        h.backend.refuse.store(true, Ordering::Relaxed);
        h.request(WireMessage::read_req(1, "obj", 0, 10));
        let rsp = h.confirm_sends(true);
        assert_eq!(rsp[0].0.errval, libc::EIO);
        assert_eq!(h.portal.pool.in_use(), 0);
    }

    #[test]
    fn test_rejected_send_releases_immediately() {
        let mut h = Harness::new(PoolConfig::default(), 1 << 20);
        h.request(WireMessage::read_req(1, "obj", 0, 10));
        h.script.lock().unwrap().refuse = true;
        h.complete_reads(0, None);
        assert!(h.portal.requests.is_empty());
        assert_eq!(h.portal.pool.in_use(), 0);
        assert_eq!(h.portal.conns.get(1).unwrap().outstanding(), 0);
    }

    #[test]
    fn test_drain_returns_every_buffer() {
        let mut h = Harness::new(PoolConfig::default(), 1 << 20);
        h.request(WireMessage::read_req(1, "obj", 0, 10));
        h.request(WireMessage::read_req(2, "obj", 0, 10));
        h.complete_reads(0, None);
        h.request(WireMessage::read_req(3, "obj", 0, 10));

        // One read still in the backend; complete it from another thread
        // while the portal drains.
        let ops: Vec<ReadOp> = h.backend.ops.lock().unwrap().drain(..).collect();
        let token = ops[0].token;
        let inbox = Arc::clone(&h.portal.inbox);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            inbox.push(IoStatus::ok(token, 10));
            inbox.signal().unwrap();
        });
        h.portal.drain();
        t.join().unwrap();

        assert!(h.portal.requests.is_empty());
        assert_eq!(h.portal.pool.in_use(), 0);
        assert!(h.portal.conns.is_empty());
        assert_eq!(h.portal.stats.snapshot().conns_destroyed, 1);
    }
}
