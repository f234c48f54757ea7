//! Pipelined pull requests.
//!
//! Regular pulls cost a full round-trip each. Queued pulls are dispatched on
//! the dedicated pipeline connection without waiting for replies, so many
//! reads can be in flight at once; a background consumer matches responses
//! to requests in submission order and fills the caller-owned slots. Sync
//! points and callbacks share the queue with data records and are fulfilled
//! exactly when everything submitted before them has been dispatched.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use redis::Value;
use tokio::sync::{oneshot, watch, Notify};
use tracing::{debug, warn};

use crate::client::{decode_read_reply, ReadRequest};
use crate::error::{Result, SmaxError};
use crate::types::{DataType, Metadata, SmaxValue};
use crate::Smax;

/// Destination of a queued pull.
///
/// The slot is shared between the caller and the pipeline consumer; it is
/// filled when the response for its request is dispatched, and outlives the
/// request by construction. Cloning shares the same cell.
#[derive(Clone, Debug, Default)]
pub struct PullSlot {
    shared: std::sync::Arc<Mutex<SlotState>>,
}

#[derive(Debug, Default)]
struct SlotState {
    value: Option<SmaxValue>,
    meta: Option<Metadata>,
    error: Option<SmaxError>,
}

impl PullSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The delivered value, if the response has arrived.
    pub fn value(&self) -> Option<SmaxValue> {
        self.shared.lock().value.clone()
    }

    /// Take the delivered value out of the slot.
    pub fn take(&self) -> Option<SmaxValue> {
        self.shared.lock().value.take()
    }

    /// The delivered metadata, when requested with the pull.
    pub fn meta(&self) -> Option<Metadata> {
        self.shared.lock().meta.clone()
    }

    /// The per-request error, if its dispatch failed.
    pub fn error(&self) -> Option<SmaxError> {
        self.shared.lock().error.clone()
    }

    pub fn is_filled(&self) -> bool {
        let s = self.shared.lock();
        s.value.is_some() || s.error.is_some()
    }

    fn fill(&self, value: SmaxValue, meta: Option<Metadata>) {
        let mut s = self.shared.lock();
        s.value = Some(value);
        s.meta = meta;
        s.error = None;
    }

    fn fail(&self, error: SmaxError) {
        self.shared.lock().error = Some(error);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncStatus {
    Incomplete,
    Success,
    Interrupted,
}

/// A marker in the pull queue that can be waited upon. It completes when all
/// requests queued before it have been dispatched.
#[derive(Clone)]
pub struct SyncPoint {
    tx: std::sync::Arc<watch::Sender<SyncStatus>>,
}

impl SyncPoint {
    fn new(initial: SyncStatus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            tx: std::sync::Arc::new(tx),
        }
    }

    fn complete(&self, status: SyncStatus) {
        self.tx.send_if_modified(|s| {
            if *s == SyncStatus::Incomplete {
                *s = status;
                true
            } else {
                false
            }
        });
    }

    pub fn is_complete(&self) -> bool {
        *self.tx.borrow() != SyncStatus::Incomplete
    }
}

struct PullRecord {
    id: u64,
    req: ReadRequest,
    slot: PullSlot,
    rx: Option<oneshot::Receiver<redis::RedisResult<Value>>>,
}

enum Record {
    Pull(PullRecord),
    Sync(SyncPoint),
    Callback(Box<dyn FnOnce() + Send>),
}

#[derive(Default)]
struct QueueInner {
    records: VecDeque<Record>,
    latched: Option<SmaxError>,
    stalled: bool,
}

/// FIFO of outstanding pipelined pulls, interleaved with sync points and
/// callbacks.
pub(crate) struct PullQueue {
    inner: Mutex<QueueInner>,
    max_pending: usize,
    next_id: AtomicU64,
    /// Wakes the consumer when records are appended.
    work: Notify,
    /// Wakes the consumer after a reconnect restore.
    resume: Notify,
    /// `true` while the queue is empty.
    empty: watch::Sender<bool>,
}

impl PullQueue {
    pub(crate) fn new(max_pending: usize) -> Self {
        let (empty, _) = watch::channel(true);
        Self {
            inner: Mutex::new(QueueInner::default()),
            max_pending: max_pending.max(1),
            next_id: AtomicU64::new(1),
            work: Notify::new(),
            resume: Notify::new(),
            empty,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub(crate) fn latched(&self) -> Option<SmaxError> {
        self.inner.lock().latched.clone()
    }

    fn push(&self, record: Record) {
        {
            let mut q = self.inner.lock();
            if q.records.is_empty() {
                // A new batch starts with a clean status.
                q.latched = None;
                self.empty.send_replace(false);
            }
            q.records.push_back(record);
        }
        self.work.notify_one();
    }

    fn latch(&self, e: &SmaxError) {
        let mut q = self.inner.lock();
        if q.latched.is_none() {
            q.latched = Some(e.clone());
        }
    }

    /// Remove the head data record, identified by id so a concurrent discard
    /// cannot be double-popped.
    fn pop_pull(&self, id: u64) {
        let mut q = self.inner.lock();
        if matches!(q.records.front(), Some(Record::Pull(p)) if p.id == id) {
            q.records.pop_front();
            if q.records.is_empty() {
                self.empty.send_replace(true);
            }
        }
    }

    /// Keep queued records across an outage; the consumer parks until
    /// [`PullQueue::restore`].
    pub(crate) fn stall(&self) {
        self.inner.lock().stalled = true;
    }

    /// Drop all queued records: slots are left untouched, sync points and
    /// the queue status latch to interrupted, and all waiters are released.
    pub(crate) fn discard(&self) {
        let records = {
            let mut q = self.inner.lock();
            let had = q.records.len();
            let records = std::mem::take(&mut q.records);
            if had > 0 {
                q.latched = Some(SmaxError::Interrupted);
            }
            q.stalled = false;
            records
        };

        for record in records {
            match record {
                Record::Pull(p) => p.slot.fail(SmaxError::Interrupted),
                Record::Sync(sp) => sp.complete(SyncStatus::Interrupted),
                Record::Callback(_) => {}
            }
        }

        self.empty.send_replace(true);
        // notify_one leaves a permit, so a consumer that is about to park
        // wakes even if it was not waiting yet.
        self.resume.notify_one();
        self.work.notify_one();
    }

    /// Re-issue the requests of all still-queued data records on a fresh
    /// pipeline connection, then unpark the consumer. Sync points and
    /// callbacks are left in place.
    pub(crate) fn restore(&self, smax: &Smax) {
        let conn = match smax.inner.driver.pipeline_connection() {
            Ok(c) => c,
            Err(_) => return,
        };

        let mut q = self.inner.lock();
        let mut n = 0;
        for record in q.records.iter_mut() {
            if let Record::Pull(p) = record {
                if p.rx.is_none() {
                    match smax.read_command(&p.req) {
                        Ok(cmd) => {
                            p.rx = Some(spawn_request(cmd, conn.clone()));
                            n += 1;
                        }
                        Err(e) => warn!(error = %e, "could not re-issue queued pull"),
                    }
                }
            }
        }
        q.stalled = false;
        drop(q);

        if n > 0 {
            debug!(count = n, "re-issued queued pulls after reconnect");
        }
        self.resume.notify_one();
        self.work.notify_one();
    }
}

fn spawn_request(
    cmd: redis::Cmd,
    mut conn: redis::aio::MultiplexedConnection,
) -> oneshot::Receiver<redis::RedisResult<Value>> {
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let result = cmd.query_async::<Value>(&mut conn).await;
        let _ = tx.send(result);
    });
    rx
}

enum Step {
    Idle,
    Parked,
    Pull {
        id: u64,
        req: ReadRequest,
        slot: PullSlot,
        rx: oneshot::Receiver<redis::RedisResult<Value>>,
    },
    Callback(Box<dyn FnOnce() + Send>),
}

/// Start the pipeline response consumer. It owns response dispatch: replies
/// are matched to the queue head in submission order, and whenever the head
/// becomes a sync point or callback it is fulfilled immediately.
///
/// The task holds the queue alone while idle, so dropping the last [`Smax`]
/// handle ends it.
pub(crate) fn start_consumer(smax: &Smax) {
    let weak = smax.downgrade();
    let queue = std::sync::Arc::clone(&smax.inner.queue);

    tokio::spawn(async move {
        loop {
            if weak.strong_count() == 0 {
                return;
            }

            let step = {
                let mut q = queue.inner.lock();
                if q.stalled {
                    Step::Parked
                } else {
                    match q.records.front_mut() {
                        None => Step::Idle,
                        Some(Record::Pull(p)) => match p.rx.take() {
                            Some(rx) => Step::Pull {
                                id: p.id,
                                req: p.req.clone(),
                                slot: p.slot.clone(),
                                rx,
                            },
                            None => Step::Parked,
                        },
                        Some(Record::Sync(_)) => {
                            if let Some(Record::Sync(sp)) = q.records.pop_front() {
                                sp.complete(SyncStatus::Success);
                            }
                            if q.records.is_empty() {
                                queue.empty.send_replace(true);
                            }
                            continue;
                        }
                        Some(Record::Callback(_)) => {
                            if let Some(Record::Callback(f)) = q.records.pop_front() {
                                if q.records.is_empty() {
                                    queue.empty.send_replace(true);
                                }
                                Step::Callback(f)
                            } else {
                                continue;
                            }
                        }
                    }
                }
            };

            match step {
                Step::Idle => queue.work.notified().await,
                Step::Parked => queue.resume.notified().await,
                Step::Callback(f) => f(),
                Step::Pull { id, req, slot, rx } => {
                    let outcome = rx.await;
                    let smax = match Smax::upgrade(&weak) {
                        Some(s) => s,
                        None => return,
                    };
                    match outcome {
                        Ok(Ok(reply)) => {
                            match decode_read_reply(&req, reply) {
                                Ok((value, meta)) => {
                                    let meta =
                                        if req.with_meta || req.ty == DataType::Struct {
                                            Some(meta)
                                        } else {
                                            None
                                        };
                                    slot.fill(value, meta);
                                }
                                Err(e) => {
                                    warn!(
                                        table = %req.group,
                                        key = req.key.as_deref().unwrap_or(""),
                                        error = %e,
                                        "queued pull failed"
                                    );
                                    slot.fail(e.clone());
                                    queue.latch(&e);
                                }
                            }
                            queue.pop_pull(id);
                        }
                        Ok(Err(redis_err)) => {
                            let e = SmaxError::from(redis_err);
                            if e.is_no_service() {
                                // Outage: keep the record for a possible
                                // restore; the supervisor decides whether
                                // the queue survives the reconnect.
                                queue.latch(&e);
                                smax.escalate(e);
                                queue.inner.lock().stalled = true;
                            } else {
                                slot.fail(e.clone());
                                queue.latch(&e);
                                smax.escalate(e);
                                queue.pop_pull(id);
                            }
                        }
                        Err(_) => {
                            // Request task died with the connection.
                            let e = SmaxError::no_service("pipeline request dropped");
                            queue.latch(&e);
                            smax.escalate(e);
                            queue.inner.lock().stalled = true;
                        }
                    }
                }
            }
        }
    });
}

impl Smax {
    /// Queue a pull for pipelined retrieval into `slot`.
    ///
    /// Responses to queued pulls are dispatched by a background consumer in
    /// submission order; wait on a [`SyncPoint`] or use
    /// [`Smax::queue_callback`] to learn when the data has arrived. There is
    /// no ordering guarantee between queued pulls and shares issued on the
    /// interactive channel.
    pub async fn queue(
        &self,
        table: &str,
        key: &str,
        ty: DataType,
        count: usize,
        slot: &PullSlot,
        with_meta: bool,
    ) -> Result<()> {
        let req = ReadRequest::new(table, key, ty, count, with_meta)?;

        if !self.inner.config.pipelined {
            return Err(SmaxError::no_service("pipelined reads are disabled"));
        }

        // If the queue is saturated, wait for it to drain to half capacity.
        let max = self.inner.queue.max_pending;
        if self.inner.queue.len() > max {
            let deadline = Instant::now()
                + Duration::from_millis(self.inner.config.pipe_read_timeout_ms);
            loop {
                let n = self.inner.queue.len();
                if n <= max / 2 {
                    break;
                }
                if !self.inner.driver.has_pipeline() {
                    return Err(SmaxError::no_service("pipeline channel lost"));
                }
                if Instant::now() > deadline {
                    warn!(table, key, "queued pull timed out waiting for queue space");
                    return Err(SmaxError::Timeout);
                }
                let excess = (n - max / 2) as u64;
                tokio::time::sleep(Duration::from_micros(1 + excess)).await;
            }
        }

        let conn = self
            .inner
            .driver
            .pipeline_connection()
            .map_err(|e| self.escalate(e.into()))?;
        let cmd = self.read_command(&req).map_err(|e| self.escalate(e))?;

        let record = PullRecord {
            id: self.inner.queue.next_id.fetch_add(1, Ordering::Relaxed),
            req,
            slot: slot.clone(),
            rx: Some(spawn_request(cmd, conn)),
        };
        self.inner.queue.push(Record::Pull(record));
        Ok(())
    }

    /// Create a synchronization point after the currently queued pulls.
    /// If the queue is empty the point is already complete.
    pub fn create_sync_point(&self) -> SyncPoint {
        let mut q = self.inner.queue.inner.lock();
        if q.records.is_empty() {
            SyncPoint::new(SyncStatus::Success)
        } else {
            let sp = SyncPoint::new(SyncStatus::Incomplete);
            q.records.push_back(Record::Sync(sp.clone()));
            sp
        }
    }

    /// Wait until the queue reaches `sync`, or until the timeout. `None`
    /// waits indefinitely. Returns the queue's latched error, if any pull of
    /// the batch failed.
    pub async fn sync(&self, sync: &SyncPoint, timeout: Option<Duration>) -> Result<()> {
        let mut rx = sync.tx.subscribe();
        let status = {
            let wait = rx.wait_for(|s| *s != SyncStatus::Incomplete);
            match timeout {
                Some(d) => match tokio::time::timeout(d, wait).await {
                    Ok(res) => res.map(|s| *s),
                    Err(_) => return Err(SmaxError::Timeout),
                },
                None => wait.await.map(|s| *s),
            }
        };

        match status {
            Ok(SyncStatus::Success) => match self.inner.queue.latched() {
                Some(e) => Err(e),
                None => Ok(()),
            },
            Ok(SyncStatus::Interrupted) => Err(SmaxError::Interrupted),
            Ok(SyncStatus::Incomplete) | Err(_) => Err(SmaxError::Interrupted),
        }
    }

    /// Add a callback to be invoked once all prior queued requests have been
    /// fulfilled. With an empty queue the callback runs inline.
    ///
    /// Callbacks run on the pipeline consumer and must return quickly; in
    /// particular they must not wait on the queue themselves, or the
    /// consumer deadlocks. Spawn a task for longer work.
    pub fn queue_callback(&self, f: impl FnOnce() + Send + 'static) {
        let inline = {
            let mut q = self.inner.queue.inner.lock();
            if q.records.is_empty() {
                true
            } else {
                q.records.push_back(Record::Callback(Box::new(f)));
                false
            }
        };
        if inline {
            f();
        } else {
            self.inner.queue.work.notify_one();
        }
    }

    /// Wait until all queued pulls have been dispatched, or until the
    /// timeout. `None` waits indefinitely.
    pub async fn wait_queue_complete(&self, timeout: Option<Duration>) -> Result<()> {
        let mut rx = self.inner.queue.empty.subscribe();
        let wait = rx.wait_for(|empty| *empty);
        let res = match timeout {
            Some(d) => match tokio::time::timeout(d, wait).await {
                Ok(res) => res,
                Err(_) => return Err(SmaxError::Timeout),
            },
            None => wait.await,
        };
        if res.is_err() {
            return Err(SmaxError::Interrupted);
        }
        match self.inner.queue.latched() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
