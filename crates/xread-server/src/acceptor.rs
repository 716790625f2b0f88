//! Acceptor thread: listener → portals, round-robin.
//!
//! Every accepted stream is a new session. The acceptor does no I/O on it;
//! it only picks the next portal and pushes the stream through that
//! portal's [`PortalHandoff`].

use xread_core::error::Result;
use xread_module::eventfd::EventFd;
use xread_module::poller::Poller;
use xread_module::tcp::PortalHandoff;

use std::io;
use std::net::TcpListener;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

const TOKEN_LISTENER: u64 = 0;
const TOKEN_STOP: u64 = 1;

pub struct Acceptor {
    stop: Arc<EventFd>,
    sessions: Arc<AtomicU64>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Acceptor {
    pub fn spawn(listener: TcpListener, portals: Vec<PortalHandoff>) -> Result<Self> {
        listener.set_nonblocking(true)?;
        let stop = Arc::new(EventFd::create()?);
        let poller = Poller::new(4)?;
        poller.add(listener.as_raw_fd(), TOKEN_LISTENER, false)?;
        poller.add(stop.fd(), TOKEN_STOP, false)?;

        let sessions = Arc::new(AtomicU64::new(0));
        let thread_stop = Arc::clone(&stop);
        let thread_sessions = Arc::clone(&sessions);
        let thread = thread::Builder::new()
            .name("xread-acceptor".into())
            .spawn(move || accept_loop(listener, poller, portals, thread_sessions, thread_stop))?;
        Ok(Self {
            stop,
            sessions,
            thread: Some(thread),
        })
    }

    /// Sessions accepted so far.
    pub fn sessions(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        if let Some(t) = self.thread.take() {
            let _ = self.stop.notify();
            let _ = t.join();
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    mut poller: Poller,
    portals: Vec<PortalHandoff>,
    sessions: Arc<AtomicU64>,
    stop: Arc<EventFd>,
) {
    let mut events = Vec::with_capacity(4);
    let mut next = 0usize;
    tracing::debug!(portals = portals.len(), "acceptor started");

    'outer: loop {
        events.clear();
        if let Err(e) = poller.wait(&mut events, None) {
            tracing::error!(error = %e, "acceptor poll failed");
            break;
        }
        for ev in &events {
            if ev.token == TOKEN_STOP {
                break 'outer;
            }
        }

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let idx = next % portals.len();
                    next = next.wrapping_add(1);
                    let session = sessions.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::info!(session, %peer, portal = idx, "session started");
                    if let Err(e) = portals[idx].hand_off(stream) {
                        tracing::warn!(%peer, portal = idx, error = %e, "handoff failed");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EMFILE and friends: the listener stays readable, so
                    // back off instead of spinning.
                    tracing::warn!(error = %e, "accept failed");
                    thread::sleep(std::time::Duration::from_millis(10));
                    break;
                }
            }
        }
    }
    tracing::debug!(sessions = sessions.load(Ordering::Relaxed), "acceptor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use xread_module::tcp::TcpPortalTransport;
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    #[test]
    fn test_round_robin_handoff() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpPortalTransport::new().unwrap();
        let b = TcpPortalTransport::new().unwrap();
        let (ha, hb) = (a.handoff(), b.handoff());
        let mut acceptor = Acceptor::spawn(listener, vec![ha.clone(), hb.clone()]).unwrap();

        let _clients: Vec<TcpStream> = (0..4).map(|_| TcpStream::connect(addr).unwrap()).collect();
        let deadline = Instant::now() + Duration::from_secs(5);
        while acceptor.sessions() < 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        acceptor.stop();

        assert_eq!(acceptor.sessions(), 4);
        assert_eq!(ha.pending(), 2);
        assert_eq!(hb.pending(), 2);
    }
}
