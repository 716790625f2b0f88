use std::time::Duration;

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bounds TCP connect and the open handshake (default: 5s).
    pub connect_timeout: Duration,
    /// Reads submitted and not yet completed before `submit` refuses
    /// with `ResourceExhausted` (default: 4096).
    pub max_inflight: usize,
    /// TCP_NODELAY (default: true).
    pub nodelay: bool,
    /// How long `Drop` waits for the server to acknowledge the close
    /// (default: 1s).
    pub close_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_inflight: 4096,
            nodelay: true,
            close_timeout: Duration::from_secs(1),
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn max_inflight(mut self, n: usize) -> Self {
        self.max_inflight = n.max(1);
        self
    }

    pub fn nodelay(mut self, on: bool) -> Self {
        self.nodelay = on;
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}
