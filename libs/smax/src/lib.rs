//! Client library for SMA-X, a structured shared-variable store backed by a
//! Redis-compatible server.
//!
//! Many distributed processes publish and subscribe to typed, possibly
//! multi-dimensional values kept under `table:key` identifiers with attached
//! metadata (type, shape, timestamp, origin, write serial). On top of the
//! basic [`Smax::share`] / [`Smax::pull`] exchange the library provides:
//!
//! - pipelined bulk reads with ordered dispatch, synchronization points and
//!   callbacks ([`Smax::queue`], [`Smax::sync`]);
//! - lazy local mirrors that invalidate on push notification
//!   ([`Smax::lazy_pull`]);
//! - waits on update notifications ([`Smax::wait_on_subscribed`]);
//! - time-series ring buffers with interpolation and window statistics
//!   ([`Smax::buffer_data`]);
//! - resilient reconnection with deferred writes during outages;
//! - program broadcast messages ([`Smax::send_info`]).

pub mod buffers;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod lazy;
pub mod messages;
pub mod meta;
pub mod notify;
pub mod queue;
pub mod resilient;
pub mod scripts;
pub mod types;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use smax_driver::Driver;
use tracing::{debug, warn};

pub use buffers::Window;
pub use config::SmaxConfig;
pub use error::{Result, SmaxError};
pub use messages::Message;
pub use meta::{CoordinateAxis, CoordinateSystem};
pub use queue::{PullSlot, SyncPoint};
pub use smax_driver::{DriverConfig, RedisServer, TlsOptions};
pub use types::{
    aggregate_id, split_id, DataType, Metadata, Shape, SmaxField, SmaxStruct, SmaxValue,
    Timestamp, MAX_DIMS, MAX_ELEMENTS, ORIGIN_LENGTH, SEP,
};

/// Metadata hash of variable type names.
pub const TYPES_TABLE: &str = "<types>";
/// Metadata hash of variable shapes.
pub const DIMS_TABLE: &str = "<dims>";
/// Metadata hash of last-write timestamps.
pub const TIMESTAMPS_TABLE: &str = "<timestamps>";
/// Metadata hash of last-writer origins.
pub const ORIGINS_TABLE: &str = "<origins>";
/// Metadata hash of write counters.
pub const WRITES_TABLE: &str = "<writes>";
/// Metadata hash of read counters.
pub const READS_TABLE: &str = "<reads>";
/// Optional static metadata: descriptions.
pub const DESCRIPTIONS_TABLE: &str = "<descriptions>";
/// Optional static metadata: physical units.
pub const UNITS_TABLE: &str = "<units>";
/// Optional static metadata: coordinate systems.
pub const COORDS_TABLE: &str = "<coords>";

/// Notification class for update notifications.
pub const UPDATES_ROOT: &str = "smax";
/// Pub/sub channel prefix for update notifications.
pub const UPDATES_PREFIX: &str = "smax:";

/// Handle to the shared-variable store.
///
/// Cheap to clone; all clones share one connection, one pull queue and one
/// set of caches. Lifecycle is explicit: [`Smax::connect`] establishes the
/// channels, [`Smax::disconnect`] tears them down.
#[derive(Clone)]
pub struct Smax {
    pub(crate) inner: Arc<SmaxInner>,
}

pub(crate) struct SmaxInner {
    pub(crate) driver: Driver,
    pub(crate) config: SmaxConfig,
    pub(crate) scripts: scripts::ScriptRegistry,
    pub(crate) origin: Mutex<String>,
    pub(crate) queue: Arc<queue::PullQueue>,
    pub(crate) lazy: lazy::LazyRegistry,
    pub(crate) notify: notify::NotifyCenter,
    pub(crate) buffers: buffers::BufferRegistry,
    pub(crate) store: resilient::WriteStore,
    pub(crate) supervisor: resilient::Supervisor,
    pub(crate) messages: messages::MessagePipe,
}

impl Smax {
    /// Connect to the configured server and initialize all subsystems.
    ///
    /// If the server-side scripts are not yet published this still succeeds;
    /// script-dependent calls then fail with
    /// [`SmaxError::ScriptMissing`] until the scripts appear (the resilient
    /// reconnect path re-checks them).
    pub async fn connect(config: SmaxConfig) -> Result<Smax> {
        let origin = config
            .origin
            .clone()
            .unwrap_or_else(default_origin);

        let smax = Smax {
            inner: Arc::new(SmaxInner {
                driver: Driver::new(config.server.clone()),
                scripts: scripts::ScriptRegistry::new(),
                origin: Mutex::new(origin),
                queue: Arc::new(queue::PullQueue::new(config.max_pending)),
                lazy: lazy::LazyRegistry::new(),
                notify: notify::NotifyCenter::new(),
                buffers: buffers::BufferRegistry::new(),
                store: resilient::WriteStore::new(),
                supervisor: resilient::Supervisor::new(&config),
                messages: messages::MessagePipe::new(),
                config,
            }),
        };

        smax.inner
            .driver
            .connect(smax.inner.config.pipelined)
            .await?;

        notify::install_dispatcher(&smax);

        if let Err(e) = smax.inner.scripts.load(&smax.inner.driver).await {
            warn!(error = %e, "server scripts not available yet");
        }

        if smax.inner.config.pipelined {
            queue::start_consumer(&smax);
        }

        debug!(origin = %smax.origin(), "sharing opened");
        Ok(smax)
    }

    /// Connect to a specific server host with otherwise default options.
    pub async fn connect_to(host: &str) -> Result<Smax> {
        Self::connect(SmaxConfig {
            server: DriverConfig::for_server(host, 0),
            ..Default::default()
        })
        .await
    }

    /// Close the connection. Lazy mirrors are flushed, pending waiters are
    /// released, and (unless queue restore is configured) queued pulls are
    /// discarded.
    pub async fn disconnect(&self) {
        self.run_disconnect_chain().await;
        self.inner.driver.disconnect().await;
    }

    pub(crate) async fn run_disconnect_chain(&self) {
        self.lazy_flush().await;
        self.inner.notify.notify_disconnect();
        if self.inner.config.restore_queue_on_reconnect {
            self.inner.queue.stall();
        } else {
            self.inner.queue.discard();
        }
        self.inner.supervisor.run_disconnect_hooks();
    }

    pub fn is_connected(&self) -> bool {
        self.inner.driver.is_connected()
    }

    /// The underlying driver, for commands outside this API.
    pub fn driver(&self) -> &Driver {
        &self.inner.driver
    }

    /// The `<host>:<prog>` identity used as write origin and message sender.
    pub fn origin(&self) -> String {
        self.inner.origin.lock().clone()
    }

    /// Override the origin identity.
    pub fn set_origin(&self, origin: impl Into<String>) {
        *self.inner.origin.lock() = origin.into();
    }

    /// Current time on the server.
    pub async fn server_time(&self) -> Result<Timestamp> {
        let (seconds, micros) = self.inner.driver.server_time().await?;
        Ok(Timestamp {
            seconds,
            nanos: (micros as u32).saturating_mul(1000),
        })
    }

    /// Register a callback to run after every successful (re)connect.
    pub fn add_connect_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.inner.supervisor.add_connect_hook(Box::new(hook));
    }

    /// Register a callback to run on every disconnect.
    pub fn add_disconnect_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.inner.supervisor.add_disconnect_hook(Box::new(hook));
    }

    pub(crate) fn downgrade(&self) -> Weak<SmaxInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<SmaxInner>) -> Option<Smax> {
        weak.upgrade().map(|inner| Smax { inner })
    }
}

/// Default `<host>:<prog>` identity: the leading label of the host name and
/// the executable name.
fn default_origin() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    let host = host.split('.').next().unwrap_or("localhost");

    let prog = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|f| f.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "program".to_string());

    format!("{}{}{}", host, SEP, prog)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_origin_shape() {
        let origin = default_origin();
        let (host, prog) = origin.split_once(':').expect("host:prog");
        assert!(!host.is_empty());
        assert!(!prog.is_empty());
        assert!(!host.contains('.'));
    }
}
