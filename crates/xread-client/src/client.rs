//! `Client` — one connection, one I/O thread.
//!
//! ```text
//!  caller threads                         xread-client-{id}
//!  ──────────────                         ─────────────────
//!  submit()/submit_batch()
//!     │ push Command ──► SegQueue ──┐
//!     │ 0→1 pending ──► eventfd ────┼──► epoll ──► encode ──► socket
//!     ▼                             │                           │
//!  wait()/wait_batch()              │     decode ◄──────────────┘
//!     ▲                             │       │ match opaque
//!     └──── Countdown::signal ◄─────┴───────┘
//! ```
//!
//! The I/O thread owns the socket and the opaque → request map. Callers
//! only touch the command queue and the shared request state. When the
//! connection dies the client is dead for good: everything in flight and
//! everything still queued completes with `ENOTCONN`.

use crate::config::ClientConfig;
use crate::notifier::Countdown;
use crate::request::{AioHandle, AioRequest, Completion, OpKind, ReadOp};
use crate::stats::{ClientStats, ClientStatsSnapshot};

use xread_core::error::{Result, XreadError};
use xread_core::wire::{self, Opcode, WireMessage};
use xread_module::eventfd::EventFd;
use xread_module::frame::{put_frame, Frame, FrameDecoder};
use xread_module::poller::{Event, Poller};

use bytes::{Buf, Bytes, BytesMut};
use crossbeam_queue::SegQueue;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque of the close handshake. Request opaques start at 1.
const CLOSE_OPAQUE: u64 = 0;

const SOCKET: u64 = 0;
const WAKE: u64 = 1;

const READ_CHUNK: usize = 64 * 1024;

enum Command {
    Submit(Arc<AioRequest>),
    Close,
}

/// State shared by the caller-facing `Client` and its I/O thread.
struct Shared {
    id: u64,
    commands: SegQueue<Command>,
    wake: EventFd,
    /// Commands pushed since the I/O thread last drained the queue. Only
    /// the 0 → 1 transition writes the eventfd.
    pending: AtomicU32,
    /// Reads submitted and not yet completed.
    inflight: AtomicUsize,
    dead: AtomicBool,
    next_opaque: AtomicU64,
    stats: ClientStats,
}

impl Shared {
    fn dispatch(&self, cmd: Command) {
        self.commands.push(cmd);
        // Pairs with the fence in `IoLoop::exit`: either the loop's final
        // drain sees this command or we see `dead` and drain it ourselves.
        fence(Ordering::SeqCst);
        if self.dead.load(Ordering::Relaxed) {
            self.fail_queued();
            return;
        }
        if self.pending.fetch_add(1, Ordering::AcqRel) == 0 {
            if let Err(e) = self.wake.notify() {
                tracing::warn!(client = self.id, error = %e, "failed to wake I/O thread");
            }
        }
    }

    fn fail_queued(&self) {
        while let Some(cmd) = self.commands.pop() {
            if let Command::Submit(req) = cmd {
                self.complete(&req, Completion::failed(libc::ENOTCONN), None);
            }
        }
    }

    fn complete(&self, req: &AioRequest, completion: Completion, data: Option<Bytes>) {
        req.complete(completion, data, |req, c| {
            if req.is_read() {
                self.inflight.fetch_sub(1, Ordering::AcqRel);
                self.stats
                    .record_completion(c.is_ok(), req.submitted_at.elapsed());
            }
        });
    }

    fn reserve(&self, n: usize, max: usize) -> Result<()> {
        self.inflight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur + n <= max).then_some(cur + n)
            })
            .map(|_| ())
            .map_err(|_| XreadError::ResourceExhausted)
    }
}

/// A connection to an xread server.
///
/// `Send + Sync`: any number of threads may submit and wait concurrently.
/// Handles are tied to the client that issued them.
pub struct Client {
    shared: Arc<Shared>,
    config: ClientConfig,
    peer: SocketAddr,
    io_thread: Option<JoinHandle<()>>,
}

impl Client {
    /// Connect, start the I/O thread and perform the open handshake, all
    /// within `config.connect_timeout`.
    pub fn connect(addr: impl ToSocketAddrs, config: ClientConfig) -> Result<Self> {
        let started = Instant::now();
        let stream = connect_any(addr, config.connect_timeout)?;
        let peer = stream.peer_addr()?;
        stream.set_nodelay(config.nodelay)?;
        stream.set_nonblocking(true)?;

        let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(Shared {
            id,
            commands: SegQueue::new(),
            wake: EventFd::create()?,
            pending: AtomicU32::new(0),
            inflight: AtomicUsize::new(0),
            dead: AtomicBool::new(false),
            next_opaque: AtomicU64::new(CLOSE_OPAQUE + 1),
            stats: ClientStats::new(),
        });

        let io = IoLoop::new(Arc::clone(&shared), stream, config.close_timeout)?;
        let io_thread = thread::Builder::new()
            .name(format!("xread-client-{}", id))
            .spawn(move || io.run())?;

        let client = Self {
            shared,
            config,
            peer,
            io_thread: Some(io_thread),
        };

        // ── Handshake ──
        let open = client.new_request(OpKind::Open, Arc::new(Countdown::new(1)));
        client.shared.dispatch(Command::Submit(Arc::clone(&open)));
        let budget = client.config.connect_timeout.saturating_sub(started.elapsed());
        if !open.notifier.wait_for(|| open.is_done(), Some(budget)) {
            tracing::warn!(client = id, %peer, "open handshake timed out");
            return Err(XreadError::TimedOut);
        }
        match open.completion() {
            Some(c) if c.is_ok() => {}
            Some(c) => return Err(XreadError::from_errno(c.errno)),
            None => return Err(XreadError::Disconnected),
        }

        tracing::debug!(client = id, %peer, "connected");
        Ok(client)
    }

    /// Queue one read. Returns as soon as the request is handed to the I/O
    /// thread.
    pub fn submit(&self, op: ReadOp) -> Result<AioHandle> {
        op.validate()?;
        self.check_alive()?;
        self.shared.reserve(1, self.config.max_inflight)?;

        let req = self.new_request(OpKind::Read(op), Arc::new(Countdown::new(1)));
        self.shared.stats.record_queued(1);
        self.shared.dispatch(Command::Submit(Arc::clone(&req)));
        Ok(AioHandle { req })
    }

    /// Queue several reads sharing one countdown. Every op is validated
    /// before anything is sent; one invalid op rejects the whole batch.
    pub fn submit_batch(&self, ops: Vec<ReadOp>) -> Result<Vec<AioHandle>> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        for op in &ops {
            op.validate()?;
        }
        self.check_alive()?;
        self.shared.reserve(ops.len(), self.config.max_inflight)?;

        let countdown = Arc::new(Countdown::new(ops.len()));
        let reqs: Vec<_> = ops
            .into_iter()
            .map(|op| self.new_request(OpKind::Read(op), Arc::clone(&countdown)))
            .collect();
        self.shared.stats.record_queued(reqs.len() as u64);
        for req in &reqs {
            self.shared.dispatch(Command::Submit(Arc::clone(req)));
        }
        Ok(reqs.into_iter().map(|req| AioHandle { req }).collect())
    }

    /// Block until `handle` completes (successfully or not). Inspect the
    /// outcome with [`result`](Self::result).
    pub fn wait(&self, handle: &AioHandle, timeout: Option<Duration>) -> Result<()> {
        self.check_owner(handle)?;
        let req = &handle.req;
        if req.notifier.wait_for(|| req.is_done(), timeout) {
            Ok(())
        } else {
            Err(XreadError::TimedOut)
        }
    }

    /// Block until every member of the batch completed.
    ///
    /// Returns the first failure delivered while the batch was completing,
    /// which is not necessarily the first in submission order. Check each
    /// member with [`result`](Self::result) for the full picture.
    pub fn wait_batch(&self, handles: &[AioHandle], timeout: Option<Duration>) -> Result<()> {
        let Some(first) = handles.first() else {
            return Ok(());
        };
        for h in handles {
            self.check_owner(h)?;
            if !first.same_batch(h) {
                return Err(XreadError::InvalidArgument("handles from different batches"));
            }
        }
        first.req.notifier.wait(timeout)
    }

    /// `{retval, errno}` of a completed request.
    pub fn result(&self, handle: &AioHandle) -> Result<Completion> {
        self.check_owner(handle)?;
        handle.req.completion().ok_or(XreadError::InProgress)
    }

    /// Payload of a successful read. `None` while in flight or on failure.
    pub fn data(&self, handle: &AioHandle) -> Option<Bytes> {
        if handle.req.owner != self.shared.id {
            return None;
        }
        handle.req.data()
    }

    /// Copy the payload of a successful read into `buf`; returns the bytes
    /// copied. A failed read returns its error.
    pub fn read_into(&self, handle: &AioHandle, buf: &mut [u8]) -> Result<usize> {
        let completion = self.result(handle)?;
        if !completion.is_ok() {
            return Err(XreadError::from_errno(completion.errno));
        }
        let data = handle.req.data().unwrap_or_default();
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    /// Release a completed handle.
    ///
    /// A handle still in flight is rejected with `InProgress`; the request
    /// keeps running and its completion is still counted in the stats.
    ///
    /// ```compile_fail
    /// # fn demo(client: &xread_client::Client, handle: xread_client::AioHandle) {
    /// let _ = client.reclaim(handle);
    /// let _ = client.reclaim(handle);
    /// # }
    /// ```
    pub fn reclaim(&self, handle: AioHandle) -> Result<()> {
        self.check_owner(&handle)?;
        if !handle.req.is_done() {
            return Err(XreadError::InProgress);
        }
        drop(handle);
        Ok(())
    }

    /// Cancellation is not supported.
    pub fn cancel(&self, handle: &AioHandle) -> Result<()> {
        self.check_owner(handle)?;
        Err(XreadError::Unsupported)
    }

    /// Synchronous read: submit, wait, collect the payload.
    pub fn read(&self, filename: &str, offset: u64, size: u64) -> Result<Bytes> {
        let handle = self.submit(ReadOp::new(filename, offset, size))?;
        self.wait(&handle, None)?;
        let completion = self.result(&handle)?;
        let data = handle.req.data();
        self.reclaim(handle)?;
        if !completion.is_ok() {
            return Err(XreadError::from_errno(completion.errno));
        }
        Ok(data.unwrap_or_default())
    }

    pub fn stats(&self) -> ClientStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// `num_queued=Q num_completed=C num_failed=F p50_us=.. p90_us=.. p99_us=..`
    pub fn stats_string(&self) -> String {
        self.stats().to_string()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_connected(&self) -> bool {
        !self.shared.dead.load(Ordering::Acquire)
    }

    /// Reads submitted and not yet completed.
    pub fn inflight(&self) -> usize {
        self.shared.inflight.load(Ordering::Acquire)
    }

    fn new_request(&self, kind: OpKind, notifier: Arc<Countdown>) -> Arc<AioRequest> {
        let opaque = self.shared.next_opaque.fetch_add(1, Ordering::Relaxed);
        AioRequest::new(self.shared.id, kind, opaque, notifier)
    }

    fn check_alive(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(XreadError::Disconnected)
        }
    }

    fn check_owner(&self, handle: &AioHandle) -> Result<()> {
        if handle.req.owner == self.shared.id {
            Ok(())
        } else {
            Err(XreadError::InvalidArgument("handle belongs to another client"))
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(io_thread) = self.io_thread.take() {
            self.shared.dispatch(Command::Close);
            if io_thread.join().is_err() {
                tracing::error!(client = self.shared.id, "I/O thread panicked");
            }
        }
        // Anything the I/O thread never saw.
        self.shared.fail_queued();
    }
}

fn connect_any(addr: impl ToSocketAddrs, timeout: Duration) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!(%addr, error = %e, "connect failed");
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) if e.kind() == io::ErrorKind::TimedOut => XreadError::TimedOut,
        Some(e) => XreadError::Io(e),
        None => XreadError::InvalidArgument("address resolved to nothing"),
    })
}

/// Why the I/O loop stopped.
#[derive(Debug)]
enum Exit {
    /// Close handshake finished or timed out.
    Closed,
    PeerClosed,
    Failed(XreadError),
}

struct IoLoop {
    shared: Arc<Shared>,
    stream: TcpStream,
    poller: Poller,
    decoder: FrameDecoder,
    scratch: Vec<u8>,
    out: BytesMut,
    want_write: bool,
    inflight: HashMap<u64, Arc<AioRequest>>,
    close_timeout: Duration,
    close_deadline: Option<Instant>,
}

impl IoLoop {
    fn new(shared: Arc<Shared>, stream: TcpStream, close_timeout: Duration) -> Result<Self> {
        let poller = Poller::new(4)?;
        poller.add(stream.as_raw_fd(), SOCKET, false)?;
        poller.add(shared.wake.fd(), WAKE, false)?;
        Ok(Self {
            shared,
            stream,
            poller,
            decoder: FrameDecoder::new(),
            scratch: vec![0u8; READ_CHUNK],
            out: BytesMut::new(),
            want_write: false,
            inflight: HashMap::new(),
            close_timeout,
            close_deadline: None,
        })
    }

    fn run(mut self) {
        let mut events: Vec<Event> = Vec::with_capacity(4);
        let exit = loop {
            let timeout = self
                .close_deadline
                .map(|d| d.saturating_duration_since(Instant::now()));
            events.clear();
            if let Err(e) = self.poller.wait(&mut events, timeout) {
                break Exit::Failed(e);
            }
            if let Err(exit) = self.handle(&events) {
                break exit;
            }
            if self.close_deadline.is_some_and(|d| Instant::now() >= d) {
                tracing::debug!(client = self.shared.id, "close not acknowledged in time");
                break Exit::Closed;
            }
        };
        self.exit(exit);
    }

    fn handle(&mut self, events: &[Event]) -> std::result::Result<(), Exit> {
        for ev in events {
            match ev.token {
                WAKE => self.on_wake()?,
                SOCKET => {
                    if ev.readable || ev.hangup {
                        self.on_readable()?;
                    }
                    if ev.writable {
                        self.flush()?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn on_wake(&mut self) -> std::result::Result<(), Exit> {
        self.shared.wake.drain();
        self.shared.pending.store(0, Ordering::Release);
        while let Some(cmd) = self.shared.commands.pop() {
            match cmd {
                Command::Submit(req) => {
                    if self.close_deadline.is_some() {
                        self.shared
                            .complete(&req, Completion::failed(libc::ENOTCONN), None);
                        continue;
                    }
                    put_frame(&mut self.out, &req.message().encode(), &[]);
                    self.inflight.insert(req.opaque, req);
                }
                Command::Close => {
                    if self.close_deadline.is_none() {
                        put_frame(
                            &mut self.out,
                            &WireMessage::close_req(CLOSE_OPAQUE).encode(),
                            &[],
                        );
                        self.close_deadline = Some(Instant::now() + self.close_timeout);
                    }
                }
            }
        }
        self.flush()
    }

    fn on_readable(&mut self) -> std::result::Result<(), Exit> {
        loop {
            match self.stream.read(&mut self.scratch) {
                Ok(0) => return Err(Exit::PeerClosed),
                Ok(n) => self.decoder.extend(&self.scratch[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Exit::Failed(e.into())),
            }
            self.decode_frames()?;
        }
        self.decode_frames()
    }

    fn decode_frames(&mut self) -> std::result::Result<(), Exit> {
        loop {
            match self.decoder.decode() {
                Ok(Some(frame)) => self.on_frame(frame)?,
                Ok(None) => return Ok(()),
                Err(e) => return Err(Exit::Failed(e.into())),
            }
        }
    }

    fn on_frame(&mut self, frame: Frame) -> std::result::Result<(), Exit> {
        let msg = match WireMessage::decode(&frame.header) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(client = self.shared.id, error = %e, "undecodable response");
                if let Some(req) = wire::peek_opaque(&frame.header)
                    .and_then(|opaque| self.inflight.remove(&opaque))
                {
                    self.shared
                        .complete(&req, Completion::failed(libc::EBADMSG), None);
                }
                return Ok(());
            }
        };

        if msg.opcode == Opcode::CloseRsp && msg.opaque == CLOSE_OPAQUE {
            return Err(Exit::Closed);
        }
        if msg.opcode == Opcode::Noop {
            return Ok(());
        }
        let Some(req) = self.inflight.remove(&msg.opaque) else {
            tracing::debug!(
                client = self.shared.id,
                opaque = msg.opaque,
                opcode = ?msg.opcode,
                "response for unknown request"
            );
            return Ok(());
        };

        let (completion, data) = classify(&req, &msg, frame.payload);
        self.shared.complete(&req, completion, data);
        Ok(())
    }

    fn flush(&mut self) -> std::result::Result<(), Exit> {
        while !self.out.is_empty() {
            match self.stream.write(&self.out) {
                Ok(0) => return Err(Exit::PeerClosed),
                Ok(n) => self.out.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Exit::Failed(e.into())),
            }
        }
        let want_write = !self.out.is_empty();
        if want_write != self.want_write {
            self.want_write = want_write;
            self.poller
                .modify(self.stream.as_raw_fd(), SOCKET, want_write)
                .map_err(Exit::Failed)?;
        }
        Ok(())
    }

    fn exit(mut self, exit: Exit) {
        let id = self.shared.id;
        match &exit {
            Exit::Closed => tracing::debug!(client = id, "connection closed"),
            Exit::PeerClosed => tracing::warn!(client = id, "server closed the connection"),
            Exit::Failed(e) => tracing::warn!(client = id, error = %e, "connection failed"),
        }

        self.shared.dead.store(true, Ordering::Relaxed);
        // Pairs with the fence in `Shared::dispatch`.
        fence(Ordering::SeqCst);

        let orphaned = self.inflight.len();
        for (_, req) in self.inflight.drain() {
            self.shared
                .complete(&req, Completion::failed(libc::ENOTCONN), None);
        }
        self.shared.fail_queued();
        if orphaned > 0 {
            tracing::debug!(client = id, orphaned, "failed in-flight requests");
        }
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Turn a response into the caller-visible outcome.
fn classify(req: &AioRequest, msg: &WireMessage, payload: Bytes) -> (Completion, Option<Bytes>) {
    if msg.opcode == Opcode::ErrorRsp || msg.errval != 0 || msg.retval < 0 {
        let errno = match msg.errval {
            0 => libc::EIO,
            e => e,
        };
        return (Completion::failed(errno), None);
    }

    match (&req.kind, msg.opcode) {
        (OpKind::Open, Opcode::OpenRsp) => (Completion::ok(msg.retval), None),
        (OpKind::Read(op), Opcode::ReadRsp) => {
            if payload.len() as u64 != msg.retval as u64 || msg.retval as u64 > op.size {
                return (Completion::failed(libc::EBADMSG), None);
            }
            (Completion::ok(msg.retval), Some(payload))
        }
        _ => (Completion::failed(libc::EIO), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    enum Reply {
        Send(WireMessage, Vec<u8>),
        Hold,
        Hangup,
    }

    /// One-connection server driven by `respond`.
    fn fake_server<F>(mut respond: F) -> (SocketAddr, JoinHandle<()>)
    where
        F: FnMut(&WireMessage) -> Reply + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut decoder = FrameDecoder::new();
            let mut buf = vec![0u8; 4096];
            loop {
                let n = match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                decoder.extend(&buf[..n]);
                while let Some(frame) = decoder.decode().unwrap() {
                    let msg = WireMessage::decode(&frame.header).unwrap();
                    match respond(&msg) {
                        Reply::Send(rsp, payload) => {
                            let mut out = BytesMut::new();
                            put_frame(&mut out, &rsp.encode(), &payload);
                            if stream.write_all(&out).is_err() {
                                return;
                            }
                        }
                        Reply::Hold => {}
                        Reply::Hangup => return,
                    }
                }
            }
        });
        (addr, handle)
    }

    fn echo_reads(msg: &WireMessage) -> Reply {
        match msg.opcode {
            Opcode::OpenReq => Reply::Send(WireMessage::response(Opcode::OpenRsp, msg.opaque, 0, 0), vec![]),
            Opcode::CloseReq => Reply::Send(WireMessage::response(Opcode::CloseRsp, msg.opaque, 0, 0), vec![]),
            Opcode::ReadReq if msg.filename.as_deref() == Some("missing") => Reply::Send(
                WireMessage::response(Opcode::ReadRsp, msg.opaque, -1, libc::ENOENT),
                vec![],
            ),
            Opcode::ReadReq => {
                let size = msg.size.unwrap_or(0);
                Reply::Send(
                    WireMessage::response(Opcode::ReadRsp, msg.opaque, size as i64, 0),
                    vec![b'x'; size as usize],
                )
            }
            _ => Reply::Hold,
        }
    }

    #[test]
    fn test_read_roundtrip_and_stats() {
        let (addr, server) = fake_server(echo_reads);
        let client = Client::connect(addr, ClientConfig::default()).unwrap();

        let h = client.submit(ReadOp::new("obj", 0, 10)).unwrap();
        client.wait(&h, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(client.result(&h).unwrap(), Completion::ok(10));
        let mut buf = [0u8; 4];
        assert_eq!(client.read_into(&h, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"xxxx");
        client.reclaim(h).unwrap();

        let missing = client.submit(ReadOp::new("missing", 0, 10)).unwrap();
        client.wait(&missing, None).unwrap();
        assert_eq!(client.result(&missing).unwrap(), Completion::failed(libc::ENOENT));
        assert!(client.data(&missing).is_none());
        client.reclaim(missing).unwrap();

        assert_eq!(&client.read("obj", 4, 3).unwrap()[..], b"xxx");

        let stats = client.stats();
        assert_eq!(stats.num_queued, 3);
        assert_eq!(stats.num_completed, 3);
        assert_eq!(stats.num_failed, 1);
        assert_eq!(client.inflight(), 0);

        drop(client);
        server.join().unwrap();
    }

    #[test]
    fn test_batch_shares_countdown() {
        let (addr, _server) = fake_server(echo_reads);
        let client = Client::connect(addr, ClientConfig::default()).unwrap();

        let batch = client
            .submit_batch(vec![
                ReadOp::new("a", 0, 8),
                ReadOp::new("missing", 0, 8),
                ReadOp::new("b", 8, 8),
            ])
            .unwrap();
        let err = client.wait_batch(&batch, Some(Duration::from_secs(5))).unwrap_err();
        assert_eq!(err.errno(), libc::ENOENT);
        assert!(client.result(&batch[0]).unwrap().is_ok());
        assert!(!client.result(&batch[1]).unwrap().is_ok());
        assert!(client.result(&batch[2]).unwrap().is_ok());

        let single = client.submit(ReadOp::new("a", 0, 1)).unwrap();
        let mixed = [single];
        client.wait(&mixed[0], None).unwrap();
        assert!(!batch[0].same_batch(&mixed[0]));

        // Invalid op rejects the whole batch before anything is queued.
        let before = client.stats().num_queued;
        let err = client
            .submit_batch(vec![ReadOp::new("a", 0, 8), ReadOp::new("a", 0, 0)])
            .unwrap_err();
        assert_eq!(err.errno(), libc::EINVAL);
        assert_eq!(client.stats().num_queued, before);
    }

    #[test]
    fn test_reclaim_in_flight_and_cancel() {
        let (addr, _server) = fake_server(|msg| match msg.opcode {
            Opcode::ReadReq => Reply::Hold,
            _ => echo_reads(msg),
        });
        let client = Client::connect(addr, ClientConfig::default()).unwrap();

        let h = client.submit(ReadOp::new("slow", 0, 16)).unwrap();
        assert!(matches!(
            client.wait(&h, Some(Duration::from_millis(20))),
            Err(XreadError::TimedOut)
        ));
        assert!(matches!(client.result(&h), Err(XreadError::InProgress)));
        assert!(matches!(client.cancel(&h), Err(XreadError::Unsupported)));
        assert!(matches!(client.reclaim(h), Err(XreadError::InProgress)));
        assert_eq!(client.inflight(), 1);
    }

    #[test]
    fn test_disconnect_fails_everything() {
        let (addr, server) = fake_server(|msg| match msg.opcode {
            Opcode::ReadReq if msg.filename.as_deref() == Some("bye") => Reply::Hangup,
            Opcode::ReadReq => Reply::Hold,
            _ => echo_reads(msg),
        });
        let client = Client::connect(addr, ClientConfig::default()).unwrap();

        let held = client.submit(ReadOp::new("held", 0, 16)).unwrap();
        let bye = client.submit(ReadOp::new("bye", 0, 16)).unwrap();
        server.join().unwrap();

        client.wait(&held, Some(Duration::from_secs(5))).unwrap();
        client.wait(&bye, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(client.result(&held).unwrap().errno, libc::ENOTCONN);
        assert_eq!(client.result(&bye).unwrap().errno, libc::ENOTCONN);
        assert!(!client.is_connected());
        assert!(matches!(
            client.submit(ReadOp::new("again", 0, 1)),
            Err(XreadError::Disconnected)
        ));

        let stats = client.stats();
        assert_eq!(stats.num_completed, stats.num_queued);
        assert_eq!(stats.num_failed, 2);
    }

    #[test]
    fn test_handshake_timeout() {
        let (addr, _server) = fake_server(|_| Reply::Hold);
        let config = ClientConfig::default().connect_timeout(Duration::from_millis(100));
        assert!(matches!(Client::connect(addr, config), Err(XreadError::TimedOut)));
    }

    #[test]
    fn test_foreign_handle_and_capacity() {
        let (addr_a, _a) = fake_server(|msg| match msg.opcode {
            Opcode::ReadReq => Reply::Hold,
            _ => echo_reads(msg),
        });
        let (addr_b, _b) = fake_server(echo_reads);
        let a = Client::connect(addr_a, ClientConfig::default().max_inflight(1)).unwrap();
        let b = Client::connect(addr_b, ClientConfig::default()).unwrap();

        let h = a.submit(ReadOp::new("f", 0, 1)).unwrap();
        assert!(matches!(
            a.submit(ReadOp::new("f", 0, 1)),
            Err(XreadError::ResourceExhausted)
        ));
        assert_eq!(b.result(&h).unwrap_err().errno(), libc::EINVAL);
        assert!(b.data(&h).is_none());
    }
}
