//! Per-portal counters.
//!
//! Written by the owning portal thread only, read by anyone holding the
//! `Arc` (`Server::stats`, the periodic log line). Relaxed ordering is
//! enough: the counters are independent and only ever summed for display.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PortalStats {
    pub requests: AtomicU64,
    pub opens: AtomicU64,
    pub closes: AtomicU64,
    pub reads: AtomicU64,
    pub read_bytes: AtomicU64,
    pub read_errors: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub enomem: AtomicU64,
    pub fallback_allocs: AtomicU64,
    pub sends: AtomicU64,
    pub send_failures: AtomicU64,
    pub conns_opened: AtomicU64,
    pub conns_destroyed: AtomicU64,
    /// Gauge: records currently in the arena.
    pub inflight: AtomicU64,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl PortalStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            requests: get(&self.requests),
            opens: get(&self.opens),
            closes: get(&self.closes),
            reads: get(&self.reads),
            read_bytes: get(&self.read_bytes),
            read_errors: get(&self.read_errors),
            protocol_errors: get(&self.protocol_errors),
            enomem: get(&self.enomem),
            fallback_allocs: get(&self.fallback_allocs),
            sends: get(&self.sends),
            send_failures: get(&self.send_failures),
            conns_opened: get(&self.conns_opened),
            conns_destroyed: get(&self.conns_destroyed),
            inflight: get(&self.inflight),
        }
    }
}

/// Point-in-time copy of one or more portals' counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub opens: u64,
    pub closes: u64,
    pub reads: u64,
    pub read_bytes: u64,
    pub read_errors: u64,
    pub protocol_errors: u64,
    pub enomem: u64,
    pub fallback_allocs: u64,
    pub sends: u64,
    pub send_failures: u64,
    pub conns_opened: u64,
    pub conns_destroyed: u64,
    pub inflight: u64,
}

impl StatsSnapshot {
    pub fn merge(&mut self, other: &StatsSnapshot) {
        self.requests += other.requests;
        self.opens += other.opens;
        self.closes += other.closes;
        self.reads += other.reads;
        self.read_bytes += other.read_bytes;
        self.read_errors += other.read_errors;
        self.protocol_errors += other.protocol_errors;
        self.enomem += other.enomem;
        self.fallback_allocs += other.fallback_allocs;
        self.sends += other.sends;
        self.send_failures += other.send_failures;
        self.conns_opened += other.conns_opened;
        self.conns_destroyed += other.conns_destroyed;
        self.inflight += other.inflight;
    }

    /// Connections opened and not yet destroyed.
    pub fn live_connections(&self) -> u64 {
        self.conns_opened.saturating_sub(self.conns_destroyed)
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requests={} opens={} closes={} reads={} read_bytes={} read_errors={} \
             protocol_errors={} enomem={} fallback_allocs={} sends={} send_failures={} \
             conns={}/{} inflight={}",
            self.requests,
            self.opens,
            self.closes,
            self.reads,
            self.read_bytes,
            self.read_errors,
            self.protocol_errors,
            self.enomem,
            self.fallback_allocs,
            self.sends,
            self.send_failures,
            self.live_connections(),
            self.conns_opened,
            self.inflight,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge() {
        let a = PortalStats::default();
        bump(&a.reads);
        add(&a.read_bytes, 4096);
        bump(&a.conns_opened);
        let b = PortalStats::default();
        bump(&b.reads);
        bump(&b.conns_opened);
        bump(&b.conns_destroyed);

        let mut total = a.snapshot();
        total.merge(&b.snapshot());
        assert_eq!(total.reads, 2);
        assert_eq!(total.read_bytes, 4096);
        assert_eq!(total.live_connections(), 1);
        assert!(total.to_string().contains("conns=1/2"));
    }
}
