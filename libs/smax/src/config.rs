//! Client configuration.

use serde::Deserialize;
use smax_driver::DriverConfig;

/// Default maximum number of pull requests queued at once.
pub const DEFAULT_MAX_QUEUED: usize = 1024;

/// Default timeout for pipelined (queued) pull requests, in milliseconds.
pub const DEFAULT_PIPE_READ_TIMEOUT_MS: u64 = 3000;

/// Default time between reconnection attempts, in seconds.
pub const DEFAULT_RECONNECT_RETRY_SECS: u64 = 3;

/// Configuration for an [`crate::Smax`] instance.
///
/// All fields have usable defaults; a plain `SmaxConfig::default()` connects
/// to the host named by `SMAX_HOST` (or `smax`, or localhost) with pipelined
/// reads and resilient reconnection enabled.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SmaxConfig {
    /// Server address, authentication and TLS options.
    pub server: DriverConfig,

    /// Whether to open the dedicated pipeline channel for queued pulls.
    pub pipelined: bool,

    /// Maximum number of pull requests allowed to be queued at once; when
    /// exceeded, submissions wait for the queue to drain to half.
    pub max_pending: usize,

    /// Timeout for waiting on a saturated pull queue, in milliseconds.
    pub pipe_read_timeout_ms: u64,

    /// Time between reconnection attempts on a lost connection, in seconds.
    pub reconnect_retry_secs: u64,

    /// Keep running through outages: defer writes locally and reconnect in
    /// the background instead of failing hard.
    pub resilient: bool,

    /// Exit the process after a post-outage drain of deferred writes, so
    /// the application restarts with fresh subscriptions.
    pub resilient_exit: bool,

    /// Re-issue still-queued pipelined reads after a reconnect. When
    /// disabled, the queue is discarded on disconnect instead.
    pub restore_queue_on_reconnect: bool,

    /// Override for the `<host>:<prog>` origin tag.
    pub origin: Option<String>,
}

impl Default for SmaxConfig {
    fn default() -> Self {
        Self {
            server: DriverConfig::default(),
            pipelined: true,
            max_pending: DEFAULT_MAX_QUEUED,
            pipe_read_timeout_ms: DEFAULT_PIPE_READ_TIMEOUT_MS,
            reconnect_retry_secs: DEFAULT_RECONNECT_RETRY_SECS,
            resilient: true,
            resilient_exit: true,
            restore_queue_on_reconnect: true,
            origin: None,
        }
    }
}

impl SmaxConfig {
    /// Configuration for a specific server host (default port).
    pub fn for_server(host: impl Into<String>) -> Self {
        Self {
            server: DriverConfig::for_server(host, 0),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = SmaxConfig::default();
        assert!(cfg.pipelined);
        assert!(cfg.resilient);
        assert!(cfg.restore_queue_on_reconnect);
        assert_eq!(cfg.max_pending, 1024);
        assert_eq!(cfg.pipe_read_timeout_ms, 3000);
        assert_eq!(cfg.reconnect_retry_secs, 3);
    }

    #[test]
    fn test_deserialize_partial() {
        let cfg: SmaxConfig =
            serde_json::from_str(r#"{"pipelined": false, "max_pending": 64}"#).unwrap();
        assert!(!cfg.pipelined);
        assert_eq!(cfg.max_pending, 64);
        assert!(cfg.resilient);
    }
}
