//! Update subscriptions and waits.
//!
//! Pattern subscriptions are reference-counted: only the first subscriber
//! to a pattern reaches the server, and only the last unsubscribe removes
//! it. A single driver-level dispatcher forwards every update notification
//! into a broadcast channel that the `wait_on_*` primitives consume.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{Result, SmaxError};
use crate::types::SEP;
use crate::{Smax, UPDATES_PREFIX};

/// Event delivered to waiters.
#[derive(Debug, Clone)]
pub(crate) enum WaitEvent {
    /// An update notification for the given aggregated id.
    Update(Arc<str>),
    /// `release_waits()` was called; all waiters return interrupted.
    Release,
    /// The connection was lost; all waiters return no-service.
    Disconnected,
}

pub(crate) struct NotifyCenter {
    /// pattern -> number of active subscriptions
    refs: Mutex<HashMap<String, usize>>,
    events: broadcast::Sender<WaitEvent>,
}

impl NotifyCenter {
    pub(crate) fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            refs: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub(crate) fn send(&self, event: WaitEvent) {
        let _ = self.events.send(event);
    }

    /// Disconnect: release all waiters with no-service and forget the
    /// subscription counts (the server side is gone with the connection).
    pub(crate) fn notify_disconnect(&self) {
        self.send(WaitEvent::Disconnected);
        self.refs.lock().clear();
    }
}

/// The pub/sub pattern for update notifications of `(table, key)`.
/// A `None` table stands for any table; a `None` key subscribes to the
/// table stem only.
pub(crate) fn update_channel_pattern(table: Option<&str>, key: Option<&str>) -> String {
    let table = table.unwrap_or("*");
    match key {
        None => format!("{}{}", UPDATES_PREFIX, table),
        Some(k) => format!("{}{}{}{}", UPDATES_PREFIX, table, SEP, k),
    }
}

fn pattern_of(table: &str, key: &str) -> String {
    update_channel_pattern(
        (!table.is_empty()).then_some(table),
        (!key.is_empty()).then_some(key),
    )
}

/// Register the driver-level dispatcher feeding the wait primitives.
pub(crate) fn install_dispatcher(smax: &Smax) {
    let events = smax.inner.notify.events.clone();
    smax.inner.driver.add_subscriber(
        UPDATES_PREFIX,
        Arc::new(move |_pattern, channel, _payload| {
            if let Some(id) = channel.strip_prefix(UPDATES_PREFIX) {
                if !id.is_empty() {
                    let _ = events.send(WaitEvent::Update(Arc::from(id)));
                }
            }
        }),
    );
}

impl Smax {
    /// Subscribe to update notifications for `(table, key)`. Both parts may
    /// contain server-side glob patterns; an empty table matches any table,
    /// and an empty key subscribes to the table stem only.
    pub async fn subscribe(&self, table: &str, key: &str) -> Result<()> {
        let pattern = pattern_of(table, key);

        let first = {
            let mut refs = self.inner.notify.refs.lock();
            let count = refs.entry(pattern.clone()).or_insert(0);
            *count += 1;
            *count == 1
        };

        if first {
            debug!(pattern, "subscribing");
            if let Err(e) = self.inner.driver.psubscribe(&pattern).await {
                let mut refs = self.inner.notify.refs.lock();
                if let Some(count) = refs.get_mut(&pattern) {
                    *count -= 1;
                    if *count == 0 {
                        refs.remove(&pattern);
                    }
                }
                return Err(self.escalate(e.into()));
            }
        }
        Ok(())
    }

    /// Drop one subscription for `(table, key)`. The server-side
    /// subscription is removed when the last user unsubscribes; extra
    /// unsubscribes are no-ops.
    pub async fn unsubscribe(&self, table: &str, key: &str) -> Result<()> {
        let pattern = pattern_of(table, key);

        let last = {
            let mut refs = self.inner.notify.refs.lock();
            match refs.get_mut(&pattern) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        refs.remove(&pattern);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };

        if last {
            debug!(pattern, "unsubscribing");
            if let Err(e) = self.inner.driver.punsubscribe(&pattern).await {
                return Err(self.escalate(e.into()));
            }
        }
        Ok(())
    }

    async fn wait_for_update<T>(
        &self,
        timeout: Option<Duration>,
        mut accept: impl FnMut(&str) -> Option<T>,
    ) -> Result<T> {
        if !self.is_connected() {
            return Err(SmaxError::no_service("not connected"));
        }

        let mut rx = self.inner.notify.events.subscribe();
        let deadline = timeout.map(|d| tokio::time::Instant::now() + d);

        loop {
            let event = match deadline {
                Some(dl) => match tokio::time::timeout_at(dl, rx.recv()).await {
                    Ok(ev) => ev,
                    Err(_) => return Err(SmaxError::Timeout),
                },
                None => rx.recv().await,
            };

            match event {
                Ok(WaitEvent::Update(id)) => {
                    if let Some(out) = accept(&id) {
                        return Ok(out);
                    }
                }
                Ok(WaitEvent::Release) => return Err(SmaxError::Interrupted),
                Ok(WaitEvent::Disconnected) => {
                    return Err(SmaxError::no_service("connection closed"))
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(missed = n, "waiter lagged behind notifications");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(SmaxError::no_service("notifications closed"))
                }
            }
        }
    }

    /// Wait until any subscribed variable is updated, returning its
    /// `(table, key)`; the key is `None` for table-stem notifications.
    pub async fn wait_on_any_subscribed(
        &self,
        timeout: Option<Duration>,
    ) -> Result<(String, Option<String>)> {
        self.wait_for_update(timeout, |id| match id.rfind(SEP) {
            Some(i) => Some((id[..i].to_string(), Some(id[i + SEP.len()..].to_string()))),
            None => Some((id.to_string(), None)),
        })
        .await
    }

    /// Wait until the specific subscribed variable is updated.
    pub async fn wait_on_subscribed(
        &self,
        table: &str,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let want = format!("{}{}{}", table, SEP, key);
        self.wait_for_update(timeout, |id| (id == want).then_some(()))
            .await
    }

    /// Wait until any key changes in the given table, returning the key.
    pub async fn wait_on_subscribed_group(
        &self,
        table: &str,
        timeout: Option<Duration>,
    ) -> Result<String> {
        self.wait_for_update(timeout, |id| {
            id.rfind(SEP).and_then(|i| {
                (&id[..i] == table).then(|| id[i + SEP.len()..].to_string())
            })
        })
        .await
    }

    /// Wait until the given key changes in any table, returning the table.
    pub async fn wait_on_subscribed_var(
        &self,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<String> {
        self.wait_for_update(timeout, |id| {
            id.rfind(SEP).and_then(|i| {
                (&id[i + SEP.len()..] == key).then(|| id[..i].to_string())
            })
        })
        .await
    }

    /// Unblock all pending `wait_on_*` calls; each returns
    /// [`SmaxError::Interrupted`].
    pub fn release_waits(&self) {
        debug!("releasing waiters");
        self.inner.notify.send(WaitEvent::Release);
    }
}
