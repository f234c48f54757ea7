//! Program broadcast messages.
//!
//! Programs publish status, informational, progress and error messages on
//! `messages:<host>:<prog>:<type>` channels; the payload carries the text
//! with an appended `@<timestamp>`. Consumers register processors with
//! optional host/program/type filters.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::codec;
use crate::error::Result;
use crate::types::Timestamp;
use crate::Smax;

/// Pub/sub channel prefix for program messages.
pub const MESSAGES_PREFIX: &str = "messages:";

/// Program status update.
pub const MSG_STATUS: &str = "status";
/// Essential informational message.
pub const MSG_INFO: &str = "info";
/// Additional detail, e.g. for verbose consumers.
pub const MSG_DETAIL: &str = "detail";
/// Progress update.
pub const MSG_PROGRESS: &str = "progress";
/// Debug message.
pub const MSG_DEBUG: &str = "debug";
/// Warning.
pub const MSG_WARNING: &str = "warning";
/// Error report.
pub const MSG_ERROR: &str = "error";

/// A received program message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Host the message originated from.
    pub host: String,
    /// Originating program name.
    pub prog: String,
    /// Message type, e.g. `info` or `error`.
    pub msg_type: String,
    /// Message body, with the timestamp stripped.
    pub text: String,
    /// Message timestamp, if one was attached.
    pub timestamp: Option<Timestamp>,
}

struct Processor {
    id: i32,
    pattern: String,
    host: Option<String>,
    prog: Option<String>,
    msg_type: Option<String>,
    call: Arc<dyn Fn(&Message) + Send + Sync>,
}

impl Processor {
    fn matches(&self, m: &Message) -> bool {
        fn ok(filter: &Option<String>, value: &str) -> bool {
            match filter {
                Some(f) => f == value,
                None => true,
            }
        }
        ok(&self.host, &m.host) && ok(&self.prog, &m.prog) && ok(&self.msg_type, &m.msg_type)
    }
}

pub(crate) struct MessagePipe {
    sender_id: Mutex<Option<String>>,
    processors: Mutex<Vec<Processor>>,
    next_id: AtomicI32,
    dispatcher_installed: AtomicBool,
}

impl MessagePipe {
    pub(crate) fn new() -> Self {
        Self {
            sender_id: Mutex::new(None),
            processors: Mutex::new(Vec::new()),
            next_id: AtomicI32::new(1),
            dispatcher_installed: AtomicBool::new(false),
        }
    }
}

/// Parse a message channel + payload into a [`Message`].
fn parse_message(channel: &str, payload: &str) -> Option<Message> {
    let rest = channel.strip_prefix(MESSAGES_PREFIX)?;
    let parts: Vec<&str> = rest.split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    // The timestamp, when present, trails the text as " @<sec>.<frac>".
    let (text, timestamp) = match payload.rfind(" @") {
        Some(i) => match codec::parse_timestamp(&payload[i + 2..]) {
            Some(t) => (&payload[..i], Some(t)),
            None => (payload, None),
        },
        None => (payload, None),
    };

    Some(Message {
        host: parts[0].to_string(),
        prog: parts[1].to_string(),
        msg_type: parts[2].to_string(),
        text: text.to_string(),
        timestamp,
    })
}

fn install_message_dispatcher(smax: &Smax) {
    if smax
        .inner
        .messages
        .dispatcher_installed
        .swap(true, Ordering::SeqCst)
    {
        return;
    }

    let weak = smax.downgrade();
    smax.inner.driver.add_subscriber(
        MESSAGES_PREFIX,
        Arc::new(move |_pattern, channel, payload| {
            let smax = match Smax::upgrade(&weak) {
                Some(s) => s,
                None => return,
            };
            let payload = String::from_utf8_lossy(payload);
            let Some(message) = parse_message(channel, &payload) else {
                return;
            };

            let calls: Vec<Arc<dyn Fn(&Message) + Send + Sync>> = smax
                .inner
                .messages
                .processors
                .lock()
                .iter()
                .filter(|p| p.matches(&message))
                .map(|p| Arc::clone(&p.call))
                .collect();

            for call in calls {
                call(&message);
            }
        }),
    );
}

impl Smax {
    async fn send_message(&self, msg_type: &str, text: &str) -> Result<()> {
        let sender = self
            .inner
            .messages
            .sender_id
            .lock()
            .clone()
            .unwrap_or_else(|| self.origin());

        let channel = format!("{}{}:{}", MESSAGES_PREFIX, sender, msg_type);
        let payload = format!("{} @{}", text, codec::timestamp_now());

        match self.inner.driver.publish(&channel, &payload).await {
            Ok(_) => Ok(()),
            Err(e) => Err(self.escalate(e.into())),
        }
    }

    /// Broadcast a program status update.
    pub async fn send_status(&self, text: &str) -> Result<()> {
        self.send_message(MSG_STATUS, text).await
    }

    /// Broadcast essential information.
    pub async fn send_info(&self, text: &str) -> Result<()> {
        self.send_message(MSG_INFO, text).await
    }

    /// Broadcast non-essential detail.
    pub async fn send_detail(&self, text: &str) -> Result<()> {
        self.send_message(MSG_DETAIL, text).await
    }

    /// Broadcast a debug message.
    pub async fn send_debug(&self, text: &str) -> Result<()> {
        self.send_message(MSG_DEBUG, text).await
    }

    /// Broadcast a warning.
    pub async fn send_warning(&self, text: &str) -> Result<()> {
        self.send_message(MSG_WARNING, text).await
    }

    /// Broadcast an error report.
    pub async fn send_error(&self, text: &str) -> Result<()> {
        self.send_message(MSG_ERROR, text).await
    }

    /// Broadcast a progress update; `fraction` is the completed part in
    /// `0.0..=1.0` and is prefixed to the text as a percentage.
    pub async fn send_progress(&self, fraction: f64, text: &str) -> Result<()> {
        let text = format!("{:.1}% {}", 100.0 * fraction.clamp(0.0, 1.0), text);
        self.send_message(MSG_PROGRESS, &text).await
    }

    /// Override the sender id of outgoing messages, or reinstate the default
    /// `<host>:<prog>` with `None`.
    pub fn set_message_sender_id(&self, id: Option<String>) {
        *self.inner.messages.sender_id.lock() = id;
    }

    /// Register a processor for incoming program messages. `None` filters
    /// match anything. Returns an id for
    /// [`Smax::remove_message_processor`].
    pub async fn add_message_processor(
        &self,
        host: Option<&str>,
        prog: Option<&str>,
        msg_type: Option<&str>,
        call: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Result<i32> {
        let pattern = format!(
            "{}{}:{}:{}",
            MESSAGES_PREFIX,
            host.unwrap_or("*"),
            prog.unwrap_or("*"),
            msg_type.unwrap_or("*")
        );

        install_message_dispatcher(self);
        self.inner
            .driver
            .psubscribe(&pattern)
            .await
            .map_err(|e| self.escalate(e.into()))?;

        let id = self.inner.messages.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.messages.processors.lock().push(Processor {
            id,
            pattern,
            host: host.map(str::to_string),
            prog: prog.map(str::to_string),
            msg_type: msg_type.map(str::to_string),
            call: Arc::new(call),
        });

        debug!(id, "message processor added");
        Ok(id)
    }

    /// Remove a message processor. The underlying pattern subscription is
    /// dropped when no other processor uses it.
    pub async fn remove_message_processor(&self, id: i32) -> Result<()> {
        let pattern = {
            let mut procs = self.inner.messages.processors.lock();
            let Some(pos) = procs.iter().position(|p| p.id == id) else {
                return Ok(());
            };
            let removed = procs.remove(pos);
            let still_used = procs.iter().any(|p| p.pattern == removed.pattern);
            (!still_used).then_some(removed.pattern)
        };

        if let Some(pattern) = pattern {
            self.inner
                .driver
                .punsubscribe(&pattern)
                .await
                .map_err(|e| self.escalate(e.into()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_parse_message_with_timestamp() {
        let m = parse_message(
            "messages:hal9000:monitor:info",
            "all systems nominal @1650000000.250000",
        )
        .unwrap();
        assert_eq!(m.host, "hal9000");
        assert_eq!(m.prog, "monitor");
        assert_eq!(m.msg_type, "info");
        assert_eq!(m.text, "all systems nominal");
        assert_eq!(m.timestamp.unwrap().seconds, 1650000000);
    }

    #[test]
    fn test_parse_message_without_timestamp() {
        let m = parse_message("messages:h:p:error", "boom").unwrap();
        assert_eq!(m.text, "boom");
        assert!(m.timestamp.is_none());
    }

    #[test]
    fn test_parse_rejects_malformed_channels() {
        assert!(parse_message("messages:h:p", "x").is_none());
        assert!(parse_message("smax:h:p:info", "x").is_none());
    }

    #[test]
    fn test_processor_filters() {
        let p = Processor {
            id: 1,
            pattern: String::new(),
            host: Some("h".into()),
            prog: None,
            msg_type: Some("info".into()),
            call: Arc::new(|_| {}),
        };
        let mut m = parse_message("messages:h:p:info", "x").unwrap();
        assert!(p.matches(&m));
        m.msg_type = "error".into();
        assert!(!p.matches(&m));
    }
}
