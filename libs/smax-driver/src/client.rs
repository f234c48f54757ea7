//! Driver connection management and channel access.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::error::{DriverError, Result};
use crate::pubsub::{PubSubHub, SubscriberCall};

/// Connection handle to the SMA-X Redis server.
///
/// Owns two request channels plus the pub/sub pump:
/// - the *interactive* channel, locked exclusively per request (or across a
///   multi-command sequence via [`Driver::interactive`]);
/// - the *pipeline* channel, a separate connection whose clones are handed to
///   callers so bulk reads can be in flight concurrently.
///
/// Cloning the handle shares the underlying connections.
#[derive(Clone)]
pub struct Driver {
    shared: Arc<DriverShared>,
}

struct DriverShared {
    config: DriverConfig,
    client: Mutex<Option<redis::Client>>,
    interactive: tokio::sync::Mutex<Option<MultiplexedConnection>>,
    pipeline: Mutex<Option<MultiplexedConnection>>,
    connected: AtomicBool,
    hub: Arc<PubSubHub>,
}

/// Exclusive lease on the interactive channel.
pub struct InteractiveGuard<'a> {
    guard: tokio::sync::MutexGuard<'a, Option<MultiplexedConnection>>,
}

impl InteractiveGuard<'_> {
    /// The locked connection, or an error if the channel was torn down while
    /// waiting for the lock.
    pub fn conn(&mut self) -> Result<&mut MultiplexedConnection> {
        self.guard.as_mut().ok_or(DriverError::NotConnected)
    }
}

impl Driver {
    pub fn new(config: DriverConfig) -> Self {
        Self {
            shared: Arc::new(DriverShared {
                config,
                client: Mutex::new(None),
                interactive: tokio::sync::Mutex::new(None),
                pipeline: Mutex::new(None),
                connected: AtomicBool::new(false),
                hub: PubSubHub::new(),
            }),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.shared.config
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn has_pipeline(&self) -> bool {
        self.shared.pipeline.lock().is_some()
    }

    /// Resolve the master address through one of the configured Sentinels.
    async fn resolve_sentinel(&self) -> Result<(String, u16)> {
        let cfg = &self.shared.config;
        let mut last = DriverError::NotConnected;

        for server in &cfg.sentinels {
            let url = format!("redis://{}:{}/", server.host, server.port);
            let addr: Result<Vec<String>> = async {
                let client = redis::Client::open(url.as_str())?;
                let mut conn = client.get_multiplexed_async_connection().await?;
                let addr: Vec<String> = redis::cmd("SENTINEL")
                    .arg("get-master-addr-by-name")
                    .arg(&cfg.service_name)
                    .query_async(&mut conn)
                    .await?;
                Ok(addr)
            }
            .await;

            match addr {
                Ok(addr) if addr.len() == 2 => {
                    let port = addr[1].parse::<u16>().map_err(|_| {
                        DriverError::Config(format!("bad sentinel port: {}", addr[1]))
                    })?;
                    debug!(host = %addr[0], port, "sentinel resolved master");
                    return Ok((addr[0].clone(), port));
                }
                Ok(_) => last = DriverError::Config("incomplete sentinel reply".into()),
                Err(e) => {
                    warn!(sentinel = %server.host, error = %e, "sentinel query failed");
                    last = e;
                }
            }
        }
        Err(last)
    }

    async fn open_at(&self, host: &str, port: u16, with_pipeline: bool) -> Result<()> {
        let url = self.shared.config.url_for(host, port);
        let client = redis::Client::open(url.as_str())?;

        let mut conn = client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        let pipeline = if with_pipeline {
            Some(client.get_multiplexed_async_connection().await?)
        } else {
            None
        };

        Arc::clone(&self.shared.hub).start(client.clone()).await?;

        *self.shared.client.lock() = Some(client);
        *self.shared.interactive.lock().await = Some(conn);
        *self.shared.pipeline.lock() = pipeline;
        self.shared.connected.store(true, Ordering::Release);

        info!(host, port, pipeline = with_pipeline, "connected");
        Ok(())
    }

    /// Establish the interactive (and optionally pipeline) channels and start
    /// the pub/sub pump. When no server was explicitly configured, the
    /// default host is tried first and localhost second.
    pub async fn connect(&self, with_pipeline: bool) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let cfg = &self.shared.config;

        let (host, port) = if cfg.sentinels.is_empty() {
            (cfg.preferred_host(), cfg.port)
        } else {
            self.resolve_sentinel().await?
        };

        match self.open_at(&host, port, with_pipeline).await {
            Ok(()) => Ok(()),
            Err(e) if !cfg.has_explicit_server() => {
                debug!(error = %e, "default host unreachable, trying localhost");
                self.open_at("127.0.0.1", port, with_pipeline).await
            }
            Err(e) => Err(e),
        }
    }

    /// Tear down all channels. Registered subscriber callbacks are kept;
    /// pattern subscriptions are lost with the connection.
    pub async fn disconnect(&self) {
        self.shared.connected.store(false, Ordering::Release);
        self.shared.hub.stop();
        self.shared.interactive.lock().await.take();
        self.shared.pipeline.lock().take();
        self.shared.client.lock().take();
        info!("disconnected");
    }

    pub async fn reconnect(&self, with_pipeline: bool) -> Result<()> {
        self.disconnect().await;
        self.connect(with_pipeline).await
    }

    /// Lock the interactive channel for a multi-command sequence.
    pub async fn interactive(&self) -> Result<InteractiveGuard<'_>> {
        let guard = self.shared.interactive.lock().await;
        if guard.is_none() {
            return Err(DriverError::NotConnected);
        }
        Ok(InteractiveGuard { guard })
    }

    /// Run a single command on the interactive channel.
    pub async fn request<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        let mut guard = self.interactive().await?;
        Ok(cmd.query_async(guard.conn()?).await?)
    }

    /// A clone of the pipeline connection; requests issued on clones share
    /// one socket and are multiplexed, keeping many reads in flight at once.
    pub fn pipeline_connection(&self) -> Result<MultiplexedConnection> {
        self.shared
            .pipeline
            .lock()
            .clone()
            .ok_or(DriverError::NotConnected)
    }

    /// PUBLISH a message, returning the number of receivers.
    pub async fn publish(&self, channel: &str, message: &str) -> Result<i64> {
        self.request(redis::cmd("PUBLISH").arg(channel).arg(message))
            .await
    }

    /// Server time as `(seconds, microseconds)`.
    pub async fn server_time(&self) -> Result<(i64, i64)> {
        self.request(&redis::cmd("TIME")).await
    }

    pub async fn psubscribe(&self, pattern: &str) -> Result<()> {
        self.shared.hub.psubscribe(pattern).await
    }

    pub async fn punsubscribe(&self, pattern: &str) -> Result<()> {
        self.shared.hub.punsubscribe(pattern).await
    }

    /// Register a callback for incoming messages on channels starting with
    /// `stem`. Returns an id for [`Driver::remove_subscriber`].
    pub fn add_subscriber(&self, stem: &str, call: SubscriberCall) -> usize {
        self.shared.hub.add_subscriber(stem, call)
    }

    pub fn remove_subscriber(&self, id: usize) {
        self.shared.hub.remove_subscriber(id);
    }

    pub fn has_subscription_channel(&self) -> bool {
        self.shared.hub.is_running()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_new_driver_is_disconnected() {
        let driver = Driver::new(DriverConfig::for_server("localhost", 6379));
        assert!(!driver.is_connected());
        assert!(!driver.has_pipeline());
        assert!(driver.pipeline_connection().is_err());
    }

    #[tokio::test]
    async fn test_interactive_fails_when_disconnected() {
        let driver = Driver::new(DriverConfig::for_server("localhost", 6379));
        assert!(driver.interactive().await.is_err());
    }

    #[tokio::test]
    #[ignore = "requires Redis"]
    async fn test_connect_ping_roundtrip() {
        let driver = Driver::new(DriverConfig::for_server("127.0.0.1", 6379));
        driver.connect(true).await.unwrap();
        assert!(driver.is_connected());
        assert!(driver.has_pipeline());

        let (sec, usec) = driver.server_time().await.unwrap();
        assert!(sec > 0);
        assert!(usec >= 0);

        driver.disconnect().await;
        assert!(!driver.is_connected());
    }
}
