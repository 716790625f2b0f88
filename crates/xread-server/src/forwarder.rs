//! Completion forwarding: status pipe → portal inbox.
//!
//! ```text
//!  backend threads ──write 16B──► status pipe ──► forwarder thread
//!                                                     │ push
//!                                                     ▼
//!                                  portal ◄──wake── CompletionInbox (SegQueue)
//! ```
//!
//! The forwarder never touches portal state. It only moves records into the
//! inbox and pokes the portal's wake eventfd; the portal drains the inbox
//! on its own thread.

use xread_core::error::Result;
use xread_core::io_backend::IoStatus;
use xread_module::eventfd::EventFd;
use xread_module::poller::Poller;
use xread_module::status_pipe::StatusReader;

use crossbeam_queue::SegQueue;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::thread;

const TOKEN_STATUS: u64 = 0;
const TOKEN_STOP: u64 = 1;

/// Cross-thread handoff of completions to one portal.
///
/// The wake eventfd doubles as the portal's general doorbell (shutdown).
pub struct CompletionInbox {
    queue: SegQueue<IoStatus>,
    wake: EventFd,
}

impl CompletionInbox {
    pub fn new() -> Result<Self> {
        Ok(Self {
            queue: SegQueue::new(),
            wake: EventFd::create()?,
        })
    }

    pub fn push(&self, status: IoStatus) {
        self.queue.push(status);
    }

    /// Wake the portal.
    pub fn signal(&self) -> Result<()> {
        self.wake.notify()
    }

    pub fn wake_fd(&self) -> RawFd {
        self.wake.fd()
    }

    /// Reset the doorbell and move every queued record into `out`.
    pub fn drain(&self, out: &mut Vec<IoStatus>) -> usize {
        self.wake.drain();
        let before = out.len();
        while let Some(st) = self.queue.pop() {
            out.push(st);
        }
        out.len() - before
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

pub struct CompletionForwarder {
    stop: Arc<EventFd>,
    thread: Option<thread::JoinHandle<()>>,
}

impl CompletionForwarder {
    pub fn spawn(portal_id: usize, reader: StatusReader, inbox: Arc<CompletionInbox>) -> Result<Self> {
        let stop = Arc::new(EventFd::create()?);
        let poller = Poller::new(4)?;
        poller.add(reader.fd(), TOKEN_STATUS, false)?;
        poller.add(stop.fd(), TOKEN_STOP, false)?;

        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name(format!("xread-fwd-{}", portal_id))
            .spawn(move || forward_loop(portal_id, poller, reader, inbox, thread_stop))?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// Stop and join. Records already in the pipe are forwarded first.
    pub fn stop(&mut self) {
        if let Some(t) = self.thread.take() {
            let _ = self.stop.notify();
            let _ = t.join();
        }
    }
}

impl Drop for CompletionForwarder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn forward(reader: &mut StatusReader, inbox: &CompletionInbox, batch: &mut Vec<IoStatus>) -> bool {
    batch.clear();
    if let Err(e) = reader.read_batch(batch) {
        tracing::error!(error = %e, "status pipe read failed");
        return false;
    }
    if batch.is_empty() {
        return true;
    }
    for st in batch.drain(..) {
        inbox.push(st);
    }
    if let Err(e) = inbox.signal() {
        tracing::error!(error = %e, "failed to wake portal");
    }
    true
}

fn forward_loop(
    portal_id: usize,
    mut poller: Poller,
    mut reader: StatusReader,
    inbox: Arc<CompletionInbox>,
    stop: Arc<EventFd>,
) {
    let mut events = Vec::with_capacity(4);
    let mut batch = Vec::with_capacity(256);
    tracing::debug!(portal = portal_id, "completion forwarder started");

    loop {
        events.clear();
        if let Err(e) = poller.wait(&mut events, None) {
            tracing::error!(portal = portal_id, error = %e, "forwarder poll failed");
            break;
        }
        let mut stopping = false;
        for ev in &events {
            match ev.token {
                TOKEN_STATUS => {
                    if !forward(&mut reader, &inbox, &mut batch) {
                        stopping = true;
                    }
                }
                TOKEN_STOP => stopping = true,
                _ => {}
            }
        }
        if stopping || reader.is_closed() {
            break;
        }
    }

    forward(&mut reader, &inbox, &mut batch);
    tracing::debug!(portal = portal_id, "completion forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use xread_core::io_backend::StatusSink;
    use xread_module::status_pipe::status_pipe;
    use std::time::{Duration, Instant};

    #[test]
    fn test_statuses_reach_inbox() {
        let (writer, reader) = status_pipe().unwrap();
        let inbox = Arc::new(CompletionInbox::new().unwrap());
        let mut fwd = CompletionForwarder::spawn(0, reader, Arc::clone(&inbox)).unwrap();

        for t in 0..50u64 {
            writer.post(IoStatus::ok(t, 512)).unwrap();
        }

        let mut wake = Poller::new(1).unwrap();
        wake.add(inbox.wake_fd(), 0, false).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut got = Vec::new();
        while got.len() < 50 && Instant::now() < deadline {
            let mut ev = Vec::new();
            wake.wait(&mut ev, Some(Duration::from_millis(50))).unwrap();
            inbox.drain(&mut got);
        }
        fwd.stop();

        assert_eq!(got.len(), 50);
        let tokens: Vec<u64> = got.iter().map(|s| s.token).collect();
        assert_eq!(tokens, (0..50).collect::<Vec<_>>());
    }
}
