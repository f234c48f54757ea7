//! Pub/sub message pump.
//!
//! A single background task owns the Redis pub/sub connection. Pattern
//! subscribe/unsubscribe requests are funneled to it over a command channel,
//! and every incoming message is fanned out to the registered subscriber
//! callbacks whose channel stem matches.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::{DriverError, Result};

/// Callback invoked for each incoming pub/sub message as
/// `(pattern, channel, payload)`. Callbacks run on the pub/sub task and must
/// not block; spawn a task for anything long-running.
pub type SubscriberCall = Arc<dyn Fn(&str, &str, &[u8]) + Send + Sync>;

struct Subscriber {
    id: usize,
    stem: String,
    call: SubscriberCall,
}

enum Command {
    PSubscribe(String, oneshot::Sender<Result<()>>),
    PUnsubscribe(String, oneshot::Sender<Result<()>>),
}

#[derive(Default)]
pub(crate) struct PubSubHub {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicUsize,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

impl PubSubHub {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start the message pump on a fresh pub/sub connection.
    pub(crate) async fn start(self: Arc<Self>, client: redis::Client) -> Result<()> {
        let pubsub = client.get_async_pubsub().await?;
        let (mut sink, mut stream) = pubsub.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        *self.commands.lock() = Some(tx);

        let hub = Arc::clone(&self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    cmd = rx.recv() => match cmd {
                        Some(Command::PSubscribe(pattern, ack)) => {
                            let res = sink.psubscribe(&pattern).await;
                            debug!(pattern, ok = res.is_ok(), "psubscribe");
                            let _ = ack.send(res.map_err(DriverError::from));
                        }
                        Some(Command::PUnsubscribe(pattern, ack)) => {
                            let res = sink.punsubscribe(&pattern).await;
                            debug!(pattern, ok = res.is_ok(), "punsubscribe");
                            let _ = ack.send(res.map_err(DriverError::from));
                        }
                        None => break,
                    },
                    msg = stream.next() => match msg {
                        Some(msg) => hub.dispatch(&msg),
                        None => {
                            warn!("pub/sub stream closed");
                            break;
                        }
                    },
                }
            }
            hub.commands.lock().take();
        });

        Ok(())
    }

    /// Stop the pump. Active pattern subscriptions die with the connection
    /// and are not restored; registered callbacks are kept.
    pub(crate) fn stop(&self) {
        self.commands.lock().take();
    }

    fn dispatch(&self, msg: &redis::Msg) {
        let channel = msg.get_channel_name().to_string();
        let pattern: String = msg.get_pattern().unwrap_or_default();
        let payload = msg.get_payload_bytes().to_vec();

        let calls: Vec<SubscriberCall> = self
            .subscribers
            .lock()
            .iter()
            .filter(|s| channel.starts_with(&s.stem))
            .map(|s| Arc::clone(&s.call))
            .collect();

        for call in calls {
            call(&pattern, &channel, &payload);
        }
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        let tx = self
            .commands
            .lock()
            .as_ref()
            .cloned()
            .ok_or(DriverError::NotConnected)?;
        tx.send(cmd).map_err(|_| DriverError::NotConnected)
    }

    pub(crate) async fn psubscribe(&self, pattern: &str) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(Command::PSubscribe(pattern.to_string(), ack))
            .await?;
        done.await.map_err(|_| DriverError::NotConnected)?
    }

    pub(crate) async fn punsubscribe(&self, pattern: &str) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.send(Command::PUnsubscribe(pattern.to_string(), ack))
            .await?;
        done.await.map_err(|_| DriverError::NotConnected)?
    }

    pub(crate) fn add_subscriber(&self, stem: &str, call: SubscriberCall) -> usize {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(Subscriber {
            id,
            stem: stem.to_string(),
            call,
        });
        id
    }

    pub(crate) fn remove_subscriber(&self, id: usize) {
        self.subscribers.lock().retain(|s| s.id != id);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.commands.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_subscriber_registration() {
        let hub = PubSubHub::new();
        let hit = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&hit);
        let id = hub.add_subscriber(
            "smax:",
            Arc::new(move |_, _, _| flag.store(true, Ordering::SeqCst)),
        );
        assert_eq!(hub.subscribers.lock().len(), 1);

        hub.remove_subscriber(id);
        assert!(hub.subscribers.lock().is_empty());
        assert!(!hit.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_commands_fail_when_stopped() {
        let hub = PubSubHub::new();
        assert!(!hub.is_running());
        assert!(matches!(
            hub.psubscribe("smax:*").await,
            Err(DriverError::NotConnected)
        ));
    }
}
