//! Outage resilience: deferred writes and the reconnect supervisor.
//!
//! In resilient mode, shares that fail because the server is unreachable
//! are kept in a local last-write-wins store and delivered once the
//! connection is re-established, so updates from long-running daemons make
//! it to the database sooner or later. A background task owns the reconnect
//! loop and the connect/disconnect chains.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::codec;
use crate::error::Result;
use crate::types::{aggregate_id, DataType, Shape, SmaxField, SmaxStruct, SmaxValue};
use crate::{Smax, SmaxConfig};

struct StoredField {
    serialized: Bytes,
    ty: DataType,
    shape: Shape,
}

/// Last-write-wins store of shares that could not be delivered.
pub(crate) struct WriteStore {
    pending: DashMap<(String, String), StoredField>,
}

impl WriteStore {
    pub(crate) fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Record a failed share; a newer value for the same variable replaces
    /// the old one.
    pub(crate) fn push_field(&self, table: &str, field: &SmaxField) {
        if let SmaxValue::Struct(s) = &field.value {
            self.push_struct(&aggregate_id(table, &field.name), s);
            return;
        }
        match codec::serialize_value(&field.value) {
            Ok(serialized) => {
                self.pending.insert(
                    (table.to_string(), field.name.clone()),
                    StoredField {
                        serialized,
                        ty: field.value.data_type(),
                        shape: field.shape.clone(),
                    },
                );
            }
            Err(e) => warn!(table, key = %field.name, error = %e, "cannot defer share"),
        }
    }

    /// Structures are stored denormalized, one leaf field per entry under
    /// the aggregated level id, so each level is delivered independently.
    pub(crate) fn push_struct(&self, id: &str, s: &SmaxStruct) {
        for f in s.fields() {
            match &f.value {
                SmaxValue::Struct(child) => self.push_struct(&aggregate_id(id, &f.name), child),
                _ => self.push_field(id, f),
            }
        }
    }
}

/// Lifecycle owner: reconnect retry loop and hook chains.
pub(crate) struct Supervisor {
    /// Set while a reconnect is in progress; guarded like the rest of the
    /// connection configuration.
    disabled: Mutex<bool>,
    resilient: AtomicBool,
    resilient_exit: AtomicBool,
    connect_hooks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    disconnect_hooks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl Supervisor {
    pub(crate) fn new(config: &SmaxConfig) -> Self {
        Self {
            disabled: Mutex::new(false),
            resilient: AtomicBool::new(config.resilient),
            resilient_exit: AtomicBool::new(config.resilient_exit),
            connect_hooks: Mutex::new(Vec::new()),
            disconnect_hooks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_disabled(&self) -> bool {
        *self.disabled.lock()
    }

    pub(crate) fn is_resilient(&self) -> bool {
        self.resilient.load(Ordering::Relaxed)
    }

    pub(crate) fn set_resilient(&self, value: bool) {
        self.resilient.store(value, Ordering::Relaxed);
    }

    pub(crate) fn is_resilient_exit(&self) -> bool {
        self.resilient_exit.load(Ordering::Relaxed)
    }

    pub(crate) fn set_resilient_exit(&self, value: bool) {
        self.resilient_exit.store(value, Ordering::Relaxed);
    }

    pub(crate) fn add_connect_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        self.connect_hooks.lock().push(hook);
    }

    pub(crate) fn add_disconnect_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        self.disconnect_hooks.lock().push(hook);
    }

    pub(crate) fn run_connect_hooks(&self) {
        for hook in self.connect_hooks.lock().iter() {
            hook();
        }
    }

    pub(crate) fn run_disconnect_hooks(&self) {
        for hook in self.disconnect_hooks.lock().iter() {
            hook();
        }
    }

    /// Transmit failure: start the background reconnect, once.
    pub(crate) fn transmit_error(&self, smax: &Smax) {
        if !self.begin_reconnect() {
            return;
        }
        warn!("transmit error; reconnecting in the background (further errors suppressed)");
        spawn_reconnect(smax);
    }

    /// A required server script is missing: same path, the connect chain
    /// re-verifies scripts.
    pub(crate) fn script_error(&self, smax: &Smax) {
        if !self.begin_reconnect() {
            return;
        }
        warn!("server script missing; waiting for scripts to be reloaded");
        spawn_reconnect(smax);
    }

    fn begin_reconnect(&self) -> bool {
        let mut disabled = self.disabled.lock();
        if *disabled {
            return false;
        }
        *disabled = true;
        true
    }

    fn end_reconnect(&self) {
        *self.disabled.lock() = false;
    }
}

fn spawn_reconnect(smax: &Smax) {
    let weak = smax.downgrade();

    tokio::spawn(async move {
        if let Some(smax) = Smax::upgrade(&weak) {
            smax.run_disconnect_chain().await;
        }

        loop {
            let smax = match Smax::upgrade(&weak) {
                Some(s) => s,
                None => return,
            };
            let retry = Duration::from_secs(smax.inner.config.reconnect_retry_secs.max(1));

            match smax.reconnect().await {
                Ok(()) => {
                    info!("reconnected");
                    drop(smax);
                    // One more interval to let residual errors drain before
                    // leaving the reconnecting state.
                    tokio::time::sleep(retry).await;
                    if let Some(smax) = Smax::upgrade(&weak) {
                        smax.inner.supervisor.end_reconnect();
                    }
                    return;
                }
                Err(e) => {
                    debug!(error = %e, "reconnect attempt failed");
                    drop(smax);
                    tokio::time::sleep(retry).await;
                }
            }
        }
    });
}

impl Smax {
    /// Re-establish the connection and run the connect chain: verify the
    /// server scripts, re-issue queued pipelined reads, flush deferred
    /// writes, then any user connect hooks.
    ///
    /// Subscriptions are not re-established automatically; reinstate them
    /// from a connect hook or by resubscribing.
    pub async fn reconnect(&self) -> Result<()> {
        self.inner
            .driver
            .reconnect(self.inner.config.pipelined)
            .await?;

        self.inner.scripts.clear();
        self.inner.scripts.load(&self.inner.driver).await?;

        if self.inner.config.restore_queue_on_reconnect {
            self.inner.queue.restore(self);
        }

        if let Err(e) = self.drain_write_store().await {
            // The remainder stays stored for the next reconnect.
            warn!(error = %e, "not all deferred shares were sent");
        }

        self.inner.supervisor.run_connect_hooks();
        Ok(())
    }

    /// Whether resilient mode is active.
    pub fn is_resilient(&self) -> bool {
        self.inner.supervisor.is_resilient()
    }

    /// Enable or disable resilient mode at runtime.
    pub fn set_resilient(&self, value: bool) {
        self.inner.supervisor.set_resilient(value);
    }

    /// Whether the process exits after a post-outage drain of deferred
    /// writes.
    pub fn is_resilient_exit(&self) -> bool {
        self.inner.supervisor.is_resilient_exit()
    }

    pub fn set_resilient_exit(&self, value: bool) {
        self.inner.supervisor.set_resilient_exit(value);
    }

    /// Number of deferred writes awaiting delivery.
    pub fn pending_writes(&self) -> usize {
        self.inner.store.len()
    }

    pub(crate) async fn drain_write_store(&self) -> Result<()> {
        if self.inner.store.len() == 0 {
            return Ok(());
        }

        info!(pending = self.inner.store.len(), "sending deferred shares");

        let keys: Vec<(String, String)> = self
            .inner
            .store
            .pending
            .iter()
            .map(|e| e.key().clone())
            .collect();

        for key in keys {
            let Some((key, field)) = self.inner.store.pending.remove(&key) else {
                continue;
            };
            if let Err(e) = self
                .write_serialized(&key.0, &key.1, &field.serialized, field.ty, &field.shape)
                .await
            {
                self.inner.store.pending.insert(key, field);
                return Err(e);
            }
        }

        if self.inner.store.len() == 0 && self.inner.supervisor.is_resilient_exit() {
            eprintln!(
                "WARNING! exiting after prior connection errors; all local updates were delivered."
            );
            std::process::exit(1);
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_store_last_write_wins() {
        let store = WriteStore::new();
        store.push_field("t", &SmaxField::new("x", 1i32));
        store.push_field("t", &SmaxField::new("x", 2i32));
        store.push_field("t", &SmaxField::new("y", 3i32));

        assert_eq!(store.len(), 2);
        let kept = store
            .pending
            .get(&("t".to_string(), "x".to_string()))
            .unwrap();
        assert_eq!(&kept.serialized[..], b"2");
    }

    #[test]
    fn test_store_flattens_structs() {
        let mut sub = SmaxStruct::new();
        sub.set(SmaxField::new("leaf", 1.5f64));
        let mut top = SmaxStruct::new();
        top.set(SmaxField::new("a", 1i32));
        top.set(SmaxField::new("sub", SmaxValue::Struct(sub)));

        let store = WriteStore::new();
        store.push_struct("sys:top", &top);

        assert_eq!(store.len(), 2);
        assert!(store
            .pending
            .contains_key(&("sys:top".to_string(), "a".to_string())));
        assert!(store
            .pending
            .contains_key(&("sys:top:sub".to_string(), "leaf".to_string())));
    }

    #[test]
    fn test_begin_reconnect_is_one_shot() {
        let sup = Supervisor::new(&SmaxConfig::default());
        assert!(sup.begin_reconnect());
        assert!(!sup.begin_reconnect());
        assert!(sup.is_disabled());
        sup.end_reconnect();
        assert!(sup.begin_reconnect());
    }
}
