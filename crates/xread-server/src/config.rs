//! Server configuration.
//!
//! Loaded from TOML. Every field has a default, so an empty file is a
//! valid configuration; unknown keys are rejected.
//!
//! ```toml
//! listen = "0.0.0.0:21321"
//! root_dir = "/srv/xread"
//! portals = 4
//!
//! [backend]
//! kind = "uring"
//!
//! [logging]
//! level = "debug"
//! ```

use xread_core::error::Result as XreadResult;
use xread_core::io_backend::FileBackend;
use xread_module::pool::PoolConfig;
use xread_module::pread_pool::PreadPool;
use xread_module::uring_backend::{UringBackend, UringConfig};

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Object names resolve relative to this directory.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    #[serde(default = "default_portals")]
    pub portals: usize,
    /// Pin portal `i` to core `start_core + i`.
    #[serde(default)]
    pub pin_cores: bool,
    #[serde(default = "default_start_core")]
    pub start_core: usize,
    /// Sizes the small buffer tiers of every portal pool.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_max_read_size")]
    pub max_read_size: usize,
    /// Byte limit of the process-wide fallback allocator.
    #[serde(default = "default_fallback_limit")]
    pub fallback_limit: usize,
    /// 0 disables the periodic stats line.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    /// Upper bound on waiting for in-flight reads at shutdown.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Threads,
    Uring,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,
    /// pread worker count; `None` sizes from the CPU count.
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default = "default_ring_entries")]
    pub ring_entries: u32,
    /// Reads queued ahead of the workers or the ring.
    #[serde(default = "default_backend_queue_depth")]
    pub queue_depth: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` overrides it.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_true")]
    pub thread_names: bool,
    #[serde(default = "default_true")]
    pub timestamps: bool,
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 21321))
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_portals() -> usize {
    2
}

fn default_start_core() -> usize {
    1
}

fn default_queue_depth() -> usize {
    200
}

fn default_max_read_size() -> usize {
    4 << 20
}

fn default_fallback_limit() -> usize {
    256 << 20
}

fn default_stats_interval_secs() -> u64 {
    60
}

fn default_drain_timeout_ms() -> u64 {
    5000
}

fn default_ring_entries() -> u32 {
    256
}

fn default_backend_queue_depth() -> usize {
    4096
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            threads: None,
            ring_entries: default_ring_entries(),
            queue_depth: default_backend_queue_depth(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            thread_names: true,
            timestamps: true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            root_dir: default_root_dir(),
            portals: default_portals(),
            pin_cores: false,
            start_core: default_start_core(),
            queue_depth: default_queue_depth(),
            max_read_size: default_max_read_size(),
            fallback_limit: default_fallback_limit(),
            stats_interval_secs: default_stats_interval_secs(),
            drain_timeout_ms: default_drain_timeout_ms(),
            backend: BackendConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.portals == 0 {
            return Err(ConfigError::Invalid("portals must be at least 1".into()));
        }
        if self.queue_depth == 0 {
            return Err(ConfigError::Invalid("queue_depth must be at least 1".into()));
        }
        if self.max_read_size == 0 {
            return Err(ConfigError::Invalid("max_read_size must be positive".into()));
        }
        if self.max_read_size > xread_module::frame::MAX_PAYLOAD_LEN {
            return Err(ConfigError::Invalid(format!(
                "max_read_size {} exceeds the frame limit {}",
                self.max_read_size,
                xread_module::frame::MAX_PAYLOAD_LEN
            )));
        }
        if !self.backend.ring_entries.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "backend.ring_entries must be a power of two, got {}",
                self.backend.ring_entries
            )));
        }
        if !self.root_dir.is_dir() {
            return Err(ConfigError::Invalid(format!(
                "root_dir {} is not a directory",
                self.root_dir.display()
            )));
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::for_queue_depth(self.queue_depth)
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        match self.stats_interval_secs {
            0 => None,
            s => Some(Duration::from_secs(s)),
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Core for portal `id`, if pinning is on.
    pub fn portal_core(&self, id: usize) -> Option<usize> {
        self.pin_cores.then(|| self.start_core + id)
    }

    /// Create the configured file backend.
    pub fn build_backend(&self) -> XreadResult<Arc<dyn FileBackend>> {
        let backend: Arc<dyn FileBackend> = match self.backend.kind {
            BackendKind::Threads => match self.backend.threads {
                Some(n) => Arc::new(PreadPool::new(n, self.backend.queue_depth)?),
                None => Arc::new(PreadPool::auto_sized(self.backend.queue_depth)?),
            },
            BackendKind::Uring => Arc::new(UringBackend::new(UringConfig {
                entries: self.backend.ring_entries,
                queue_depth: self.backend.queue_depth,
            })?),
        };
        tracing::info!(backend = backend.name(), "file backend ready");
        Ok(backend)
    }
}

/// Commented sample printed by `xread-server --print-config`.
pub const SAMPLE_CONFIG: &str = r#"# xread-server configuration. Every key is optional.
listen = "127.0.0.1:21321"
root_dir = "."
portals = 2
pin_cores = false
start_core = 1
queue_depth = 200
max_read_size = 4194304
fallback_limit = 268435456
stats_interval_secs = 60
drain_timeout_ms = 5000

[backend]
kind = "threads"        # or "uring"
# threads = 8
ring_entries = 256
queue_depth = 4096

[logging]
level = "info"          # RUST_LOG overrides
thread_names = true
timestamps = true
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ServerConfig::from_toml("").unwrap();
        assert_eq!(config.portals, 2);
        assert_eq!(config.backend.kind, BackendKind::Threads);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.portal_core(1), None);
    }

    #[test]
    fn test_sample_config_parses() {
        let config = ServerConfig::from_toml(SAMPLE_CONFIG).unwrap();
        assert_eq!(config.listen, default_listen());
        assert_eq!(config.max_read_size, 4 << 20);
        assert_eq!(config.stats_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_overrides_and_rejections() {
        let config = ServerConfig::from_toml(
            "portals = 4\npin_cores = true\nstart_core = 2\n[backend]\nkind = \"uring\"\n",
        )
        .unwrap();
        assert_eq!(config.backend.kind, BackendKind::Uring);
        assert_eq!(config.portal_core(3), Some(5));

        assert!(matches!(
            ServerConfig::from_toml("portals = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            ServerConfig::from_toml("bogus = 1"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            ServerConfig::from_toml("[backend]\nring_entries = 100"),
            Err(ConfigError::Invalid(_))
        ));
    }
}
