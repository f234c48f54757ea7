//! Lazy pulling: push-driven local mirrors of slowly-changing variables.
//!
//! The first lazy pull of a variable fetches it and subscribes to its update
//! notifications; subsequent pulls are served from the local mirror without
//! network traffic until a notification invalidates it. Mirrors that keep
//! receiving updates nobody consumes are unsubscribed and dropped, so idle
//! monitors cost nothing; the next lazy pull recreates them with one
//! round-trip.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec;
use crate::error::{Result, SmaxError};
use crate::queue::PullSlot;
use crate::types::{aggregate_id, DataType, Metadata, SmaxStruct, SmaxValue, SEP};
use crate::{Smax, UPDATES_PREFIX};

/// Consecutive unconsumed updates after which an idle monitor is dropped.
const MAX_UNPULLED: u32 = 10;

pub(crate) enum CachedData {
    /// Serialized bytes exactly as stored in the server hash.
    Serialized(Bytes),
    Struct(SmaxStruct),
}

#[derive(Default)]
pub(crate) struct MonitorData {
    pub(crate) value: Option<CachedData>,
    pub(crate) meta: Option<Metadata>,
}

/// Local mirror of one variable (or one whole structure, with `key` unset).
pub(crate) struct Monitor {
    pub(crate) table: String,
    pub(crate) key: Option<String>,
    pub(crate) channel: String,
    /// Data lock, separate from the registry so copy-out never contends
    /// with lookups.
    pub(crate) data: Mutex<MonitorData>,
    /// Whether the mirrored value matches the server.
    pub(crate) current: AtomicBool,
    /// Always-cache mode: refresh in the background on every update.
    pub(crate) cached: AtomicBool,
    pub(crate) update_count: AtomicU64,
    /// Updates since the last consuming pull.
    pub(crate) unpulled: AtomicU32,
}

pub(crate) struct LazyRegistry {
    /// update channel -> monitor
    monitors: DashMap<String, Arc<Monitor>>,
    dispatcher_installed: AtomicBool,
}

impl LazyRegistry {
    pub(crate) fn new() -> Self {
        Self {
            monitors: DashMap::new(),
            dispatcher_installed: AtomicBool::new(false),
        }
    }

    fn get(&self, channel: &str) -> Option<Arc<Monitor>> {
        self.monitors.get(channel).map(|e| Arc::clone(e.value()))
    }
}

fn monitor_channel(table: &str, key: Option<&str>) -> String {
    format!(
        "{}{}",
        UPDATES_PREFIX,
        aggregate_id(table, key.unwrap_or(""))
    )
}

impl Smax {
    /// Find or create the monitor for `(table, key)`. Structure monitors are
    /// normalized to the aggregated id so the same structure maps to the
    /// same monitor no matter how its name was split.
    async fn lazy_monitor(&self, table: &str, key: &str, ty: DataType) -> Result<Arc<Monitor>> {
        let (table, key) = if ty == DataType::Struct {
            (aggregate_id(table, key), None)
        } else {
            crate::client::check_table(table)?;
            crate::client::check_key(key)?;
            (table.to_string(), Some(key.to_string()))
        };
        if table.is_empty() {
            return Err(SmaxError::invalid("empty id"));
        }

        let channel = monitor_channel(&table, key.as_deref());
        if let Some(m) = self.inner.lazy.get(&channel) {
            return Ok(m);
        }

        self.subscribe(&table, key.as_deref().unwrap_or("")).await?;
        if key.is_none() {
            // Leaf updates must also invalidate the structure mirror.
            self.subscribe(&table, "*").await?;
        }

        install_lazy_dispatcher(self);

        let monitor = Arc::new(Monitor {
            table,
            key,
            channel: channel.clone(),
            data: Mutex::new(MonitorData::default()),
            current: AtomicBool::new(false),
            cached: AtomicBool::new(false),
            update_count: AtomicU64::new(0),
            unpulled: AtomicU32::new(0),
        });

        let (kept, lost_race) = {
            match self.inner.lazy.monitors.entry(channel) {
                dashmap::mapref::entry::Entry::Occupied(e) => (Arc::clone(e.get()), true),
                dashmap::mapref::entry::Entry::Vacant(e) => {
                    e.insert(Arc::clone(&monitor));
                    (monitor, false)
                }
            }
        };

        if lost_race {
            // A concurrent creator won; balance the extra subscription.
            self.drop_monitor_subscription(&kept).await;
        }
        Ok(kept)
    }

    /// Synchronously refresh a monitor from the server. The mirror keeps the
    /// serialized form plus metadata, so any requested output type can be
    /// decoded on copy-out.
    async fn lazy_refresh(&self, m: &Arc<Monitor>) -> Result<()> {
        match &m.key {
            Some(key) => {
                let (value, meta) = self
                    .pull_with_meta(&m.table, key, DataType::Raw, 1)
                    .await?;
                let bytes = match value {
                    SmaxValue::Raw(b) => b,
                    _ => Bytes::new(),
                };
                let mut d = m.data.lock();
                d.value = Some(CachedData::Serialized(bytes));
                d.meta = Some(meta);
            }
            None => {
                let (s, meta) = self.pull_struct(&m.table).await?;
                let mut d = m.data.lock();
                d.value = Some(CachedData::Struct(s));
                d.meta = Some(meta);
            }
        }
        m.current.store(true, Ordering::Release);
        Ok(())
    }

    /// Copy the mirrored value out as the requested type and count.
    fn lazy_copy_out(
        &self,
        m: &Monitor,
        ty: DataType,
        count: usize,
    ) -> Result<(SmaxValue, Option<Metadata>)> {
        let d = m.data.lock();
        let meta = d.meta.clone();
        let value = match &d.value {
            None => SmaxValue::zeroed(ty, count),
            Some(CachedData::Serialized(b)) => {
                if ty == DataType::Raw {
                    SmaxValue::Raw(b.clone())
                } else {
                    codec::deserialize_value(b, ty, count)?
                }
            }
            Some(CachedData::Struct(s)) => {
                if ty == DataType::Struct {
                    SmaxValue::Struct(s.clone())
                } else {
                    return Err(SmaxError::TypeMismatch {
                        expected: ty.wire_name(),
                        got: "struct".into(),
                    });
                }
            }
        };
        Ok((value, meta))
    }

    async fn lazy_fetch(
        &self,
        table: &str,
        key: &str,
        ty: DataType,
        count: usize,
    ) -> Result<(Arc<Monitor>, SmaxValue, Option<Metadata>)> {
        let m = self.lazy_monitor(table, key, ty).await?;

        let needs_refresh = {
            let d = m.data.lock();
            d.value.is_none()
                || (!m.current.load(Ordering::Acquire) && !m.cached.load(Ordering::Relaxed))
        };
        if needs_refresh {
            self.lazy_refresh(&m).await?;
        }

        m.unpulled.store(0, Ordering::Relaxed);
        let (value, meta) = self.lazy_copy_out(&m, ty, count)?;
        Ok((m, value, meta))
    }

    /// Poll a variable without stressing the network: served from the local
    /// mirror while it is current, refreshed only after an update
    /// notification.
    pub async fn lazy_pull(
        &self,
        table: &str,
        key: &str,
        ty: DataType,
        count: usize,
    ) -> Result<SmaxValue> {
        let (_, value, _) = self.lazy_fetch(table, key, ty, count).await?;
        Ok(value)
    }

    /// Like [`Smax::lazy_pull`], also returning the stored metadata.
    pub async fn lazy_pull_with_meta(
        &self,
        table: &str,
        key: &str,
        ty: DataType,
        count: usize,
    ) -> Result<(SmaxValue, Metadata)> {
        let (m, value, meta) = self.lazy_fetch(table, key, ty, count).await?;
        match meta {
            Some(meta) => Ok((value, meta)),
            None => {
                // The mirror was populated without metadata; refresh once.
                self.lazy_refresh(&m).await?;
                let (value, meta) = self.lazy_copy_out(&m, ty, count)?;
                Ok((value, meta.unwrap_or_default()))
            }
        }
    }

    /// Lazy pull of a whole structure by its aggregated id.
    pub async fn lazy_pull_struct(&self, id: &str) -> Result<SmaxStruct> {
        match self.lazy_pull(id, "", DataType::Struct, 1).await? {
            SmaxValue::Struct(s) => Ok(s),
            _ => Err(SmaxError::Parse("structure mirror without structure".into())),
        }
    }

    /// Keep a variable continuously cached: the mirror refreshes itself in
    /// the background on every update, so reads are always instantaneous.
    pub async fn lazy_cache(&self, table: &str, key: &str, ty: DataType) -> Result<()> {
        let m = self.lazy_monitor(table, key, ty).await?;
        m.cached.store(true, Ordering::Relaxed);
        self.lazy_refresh(&m).await
    }

    /// Read from the always-cache mirror, enabling it on first use.
    pub async fn get_lazy_cached(
        &self,
        table: &str,
        key: &str,
        ty: DataType,
        count: usize,
    ) -> Result<SmaxValue> {
        let (m, value, _) = self.lazy_fetch(table, key, ty, count).await?;
        m.cached.store(true, Ordering::Relaxed);
        Ok(value)
    }

    /// Stop mirroring a variable (or structure, when `key` is empty).
    pub async fn lazy_end(&self, table: &str, key: &str) -> Result<()> {
        for channel in [
            monitor_channel(table, Some(key)),
            monitor_channel(&aggregate_id(table, key), None),
        ] {
            if let Some((_, m)) = self.inner.lazy.monitors.remove(&channel) {
                self.drop_monitor_subscription(&m).await;
                return Ok(());
            }
        }
        Ok(())
    }

    /// Discard every mirror and its subscription. The next lazy pull of any
    /// variable pays one real round-trip again.
    pub async fn lazy_flush(&self) -> usize {
        let monitors: Vec<Arc<Monitor>> = {
            let mut all = Vec::new();
            self.inner.lazy.monitors.retain(|_, m| {
                all.push(Arc::clone(m));
                false
            });
            all
        };

        for m in &monitors {
            self.drop_monitor_subscription(m).await;
        }
        monitors.len()
    }

    async fn drop_monitor_subscription(&self, m: &Monitor) {
        let key = m.key.as_deref().unwrap_or("");
        if let Err(e) = self.unsubscribe(&m.table, key).await {
            debug!(table = %m.table, key, error = %e, "unsubscribe failed");
        }
        if m.key.is_none() {
            let _ = self.unsubscribe(&m.table, "*").await;
        }
    }

    /// Number of times a mirrored variable has received updates, or `None`
    /// if it is not being monitored. Useful for judging whether lazy access
    /// is paying off.
    pub fn lazy_update_count(&self, table: &str, key: &str) -> Option<u64> {
        for channel in [
            monitor_channel(table, Some(key)),
            monitor_channel(&aggregate_id(table, key), None),
        ] {
            if let Some(m) = self.inner.lazy.get(&channel) {
                return Some(m.update_count.load(Ordering::Relaxed));
            }
        }
        None
    }
}

/// Register the update-notification handler that invalidates mirrors.
fn install_lazy_dispatcher(smax: &Smax) {
    if smax
        .inner
        .lazy
        .dispatcher_installed
        .swap(true, Ordering::SeqCst)
    {
        return;
    }

    let weak = smax.downgrade();
    smax.inner.driver.add_subscriber(
        UPDATES_PREFIX,
        Arc::new(move |_pattern, channel, payload| {
            let smax = match Smax::upgrade(&weak) {
                Some(s) => s,
                None => return,
            };

            // Grouped writes produce their own per-field notifications, so
            // a tagged message must not also invalidate parent mirrors.
            let payload = String::from_utf8_lossy(payload);
            let check_parents = !payload.contains("<hmset>") && !payload.contains("<nested>");

            let mut id = channel.to_string();
            loop {
                if let Some(m) = smax.inner.lazy.get(&id) {
                    handle_monitor_update(&smax, m);
                }
                if !check_parents {
                    break;
                }
                // Walk up so structure mirrors see their leaf updates.
                match id.rfind(SEP) {
                    Some(pos) if pos >= UPDATES_PREFIX.len() => id.truncate(pos),
                    _ => break,
                }
            }
        }),
    );
}

fn handle_monitor_update(smax: &Smax, m: Arc<Monitor>) {
    m.current.store(false, Ordering::Release);
    m.update_count.fetch_add(1, Ordering::Relaxed);
    let unpulled = m.unpulled.fetch_add(1, Ordering::Relaxed) + 1;

    // Garbage-collect monitors whose updates nobody consumes. Structure
    // mirrors are exempt: their many leaf updates would evict them even
    // when the consumer legitimately reads rarely.
    if unpulled > MAX_UNPULLED && m.key.is_some() {
        debug!(channel = %m.channel, "dropping unused monitor");
        smax.inner.lazy.monitors.remove(&m.channel);
        let smax = smax.clone();
        tokio::spawn(async move {
            let key = m.key.as_deref().unwrap_or("");
            let _ = smax.unsubscribe(&m.table, key).await;
        });
        return;
    }

    if m.cached.load(Ordering::Relaxed) {
        spawn_background_refresh(smax, m);
    }
}

/// Refresh an always-cache mirror in the background: the new value is
/// captured through the pull queue into a staging slot and swapped into the
/// mirror under its data lock when the response arrives.
fn spawn_background_refresh(smax: &Smax, m: Arc<Monitor>) {
    let smax = smax.clone();
    tokio::spawn(async move {
        if smax.inner.config.pipelined {
            if let Some(key) = m.key.clone() {
                let slot = PullSlot::new();
                if let Err(e) = smax
                    .queue(&m.table, &key, DataType::Raw, 1, &slot, true)
                    .await
                {
                    warn!(table = %m.table, key, error = %e, "background refresh failed");
                    return;
                }
                let monitor = Arc::clone(&m);
                smax.queue_callback(move || {
                    if let Some(SmaxValue::Raw(bytes)) = slot.take() {
                        let meta = slot.meta();
                        let mut d = monitor.data.lock();
                        d.value = Some(CachedData::Serialized(bytes));
                        if meta.is_some() {
                            d.meta = meta;
                        }
                        drop(d);
                        monitor.current.store(true, Ordering::Release);
                    }
                });
                return;
            }
        }
        // Structure mirrors, or pipelining disabled: plain refresh.
        if let Err(e) = smax.lazy_refresh(&m).await {
            warn!(channel = %m.channel, error = %e, "background refresh failed");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_channels() {
        assert_eq!(monitor_channel("tab", Some("key")), "smax:tab:key");
        assert_eq!(monitor_channel("tab:sub", None), "smax:tab:sub");
    }

    #[test]
    fn test_parent_walk_stops_at_root() {
        // Mirrors the dispatcher's trimming loop.
        let mut id = "smax:a:b:c".to_string();
        let mut seen = vec![id.clone()];
        loop {
            match id.rfind(SEP) {
                Some(pos) if pos >= UPDATES_PREFIX.len() => {
                    id.truncate(pos);
                    seen.push(id.clone());
                }
                _ => break,
            }
        }
        assert_eq!(seen, vec!["smax:a:b:c", "smax:a:b", "smax:a"]);
    }
}
