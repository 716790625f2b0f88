//! `Server`: builds and owns every server thread.
//!
//! ```text
//!              ┌──────────────┐
//!  listener ──►│ acceptor     │── round robin ──┐
//!              └──────────────┘                  ▼
//!                        ┌────────────┬────────────┬────────────┐
//!                        │ portal 0   │ portal 1   │ portal N-1 │
//!                        │ + fwd 0    │ + fwd 1    │ + fwd N-1  │
//!                        └────────────┴────────────┴────────────┘
//!                                       │ submit_read
//!                                       ▼
//!                                 FileBackend (shared)
//! ```
//!
//! Shutdown order matters: the acceptor stops first so no new session
//! lands on a stopping portal; portals drain while their forwarders are
//! still running; forwarders stop last.

use crate::acceptor::Acceptor;
use crate::config::ServerConfig;
use crate::forwarder::{CompletionForwarder, CompletionInbox};
use crate::portal::{Portal, PortalParts, PortalStop};
use crate::resolver::FileResolver;
use crate::stats::{PortalStats, StatsSnapshot};

use xread_core::error::{Result, XreadError};
use xread_core::io_backend::{FileBackend, StatusSink};
use xread_module::pool::{FallbackAllocator, SlabPool};
use xread_module::status_pipe::status_pipe;
use xread_module::tcp::TcpPortalTransport;

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct PortalHandle {
    stop: PortalStop,
    stats: Arc<PortalStats>,
    thread: Option<thread::JoinHandle<()>>,
}

pub struct Server {
    local_addr: SocketAddr,
    acceptor: Option<Acceptor>,
    portals: Vec<PortalHandle>,
    forwarders: Vec<CompletionForwarder>,
    backend: Arc<dyn FileBackend>,
    fallback: Arc<FallbackAllocator>,
    stopped: bool,
}

impl Server {
    /// Bind, build N portals and start every thread. Any failure here is
    /// fatal; threads already started are stopped before returning.
    pub fn start(config: &ServerConfig, backend: Arc<dyn FileBackend>) -> Result<Self> {
        config.validate().map_err(|e| {
            tracing::error!(error = %e, "refusing to start");
            XreadError::InvalidArgument("invalid server config")
        })?;

        let listener = TcpListener::bind(config.listen).map_err(|e| {
            tracing::error!(listen = %config.listen, error = %e, "bind failed");
            e
        })?;
        let local_addr = listener.local_addr()?;
        let fallback = Arc::new(FallbackAllocator::new(config.fallback_limit));
        let resolver = Arc::new(FileResolver::new(&config.root_dir));

        let mut server = Server {
            local_addr,
            acceptor: None,
            portals: Vec::with_capacity(config.portals),
            forwarders: Vec::with_capacity(config.portals),
            backend,
            fallback,
            stopped: false,
        };

        let mut handoffs = Vec::with_capacity(config.portals);
        for id in 0..config.portals {
            // ── Step 1: transport + completion path ──
            let transport = TcpPortalTransport::new()?;
            handoffs.push(transport.handoff());
            let (writer, reader) = status_pipe()?;
            let inbox = Arc::new(CompletionInbox::new()?);
            server
                .forwarders
                .push(CompletionForwarder::spawn(id, reader, Arc::clone(&inbox))?);

            // ── Step 2: portal ──
            let sink: Arc<dyn StatusSink> = Arc::new(writer);
            let portal = Portal::new(PortalParts {
                id,
                transport: Box::new(transport),
                backend: Arc::clone(&server.backend),
                sink,
                inbox,
                pool: SlabPool::new(config.pool_config(), Arc::clone(&server.fallback)),
                resolver: Arc::clone(&resolver),
                max_read_size: config.max_read_size,
                stats_interval: config.stats_interval(),
                drain_timeout: config.drain_timeout(),
                core: config.portal_core(id),
            });
            let stop = portal.stop_handle();
            let stats = portal.stats();

            // ── Step 3: portal thread ──
            let thread = thread::Builder::new()
                .name(format!("xread-portal-{}", id))
                .spawn(move || portal.run())?;
            server.portals.push(PortalHandle {
                stop,
                stats,
                thread: Some(thread),
            });
        }

        server.acceptor = Some(Acceptor::spawn(listener, handoffs)?);
        tracing::info!(
            listen = %local_addr,
            portals = config.portals,
            backend = server.backend.name(),
            root = %config.root_dir.display(),
            "server started"
        );
        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Counters summed over every portal.
    pub fn stats(&self) -> StatsSnapshot {
        let mut total = StatsSnapshot::default();
        for p in &self.portals {
            total.merge(&p.stats.snapshot());
        }
        total
    }

    pub fn portal_stats(&self) -> Vec<StatsSnapshot> {
        self.portals.iter().map(|p| p.stats.snapshot()).collect()
    }

    /// Sessions accepted since start.
    pub fn sessions(&self) -> u64 {
        self.acceptor.as_ref().map_or(0, |a| a.sessions())
    }

    /// Fallback bytes currently allocated across all portals.
    pub fn fallback_outstanding(&self) -> usize {
        self.fallback.outstanding()
    }

    /// Block until `flag` is set, then shut down.
    pub fn wait_for_shutdown(&mut self, flag: &AtomicBool) {
        while !flag.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(100));
        }
        self.shutdown();
    }

    /// Stop accepting, stop every portal and join all threads. Idempotent.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        tracing::info!(listen = %self.local_addr, "server shutting down");

        if let Some(mut acceptor) = self.acceptor.take() {
            acceptor.stop();
        }
        for p in &self.portals {
            p.stop.request();
        }
        for p in &mut self.portals {
            if let Some(t) = p.thread.take() {
                if t.join().is_err() {
                    tracing::error!("portal thread panicked");
                }
            }
        }
        self.backend.shutdown();
        for f in &mut self.forwarders {
            f.stop();
        }
        tracing::info!(stats = %self.stats(), "server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}
