//! Time-series buffering of numerical variables.
//!
//! A buffered variable accumulates `(timestamp, values[])` entries, fed by
//! its update notifications through the pull queue. The ring holds a fixed
//! number of entries, discarding the oldest when full, and supports linear
//! interpolation plus windowed sum / average / rms / min / max.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, SmaxError};
use crate::queue::PullSlot;
use crate::types::{aggregate_id, DataType, SmaxValue};
use crate::{Smax, UPDATES_PREFIX};

struct Entry {
    t: f64,
    values: Vec<f64>,
}

struct Ring {
    capacity: usize,
    /// Number of doubles per entry.
    count: usize,
    /// Entries in time order; pushes append, overflow drops the oldest.
    entries: VecDeque<Entry>,
}

impl Ring {
    fn push(&mut self, t: f64, mut values: Vec<f64>) {
        values.resize(self.count, 0.0);
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(Entry { t, values });
    }

    /// Index of the last entry with `t <= at`, if any.
    fn floor(&self, at: f64) -> Option<usize> {
        let n = self.entries.partition_point(|e| e.t <= at);
        n.checked_sub(1)
    }

    /// Index of the first entry with `t >= at`, if any.
    fn ceil(&self, at: f64) -> Option<usize> {
        let n = self.entries.partition_point(|e| e.t < at);
        (n < self.entries.len()).then_some(n)
    }

    /// Entry range bracketing `[fromt, tot]`; `complete` is false when
    /// either boundary is not bracketed by data.
    fn window(&self, fromt: f64, tot: f64) -> (usize, usize, bool) {
        let mut complete = true;
        let from = match self.floor(fromt) {
            Some(i) => i,
            None => {
                complete = false;
                0
            }
        };
        let to = match self.ceil(tot) {
            Some(i) => i,
            None => {
                complete = false;
                self.entries.len()
            }
        };
        (from, to.max(from), complete)
    }

    fn interpolate(&self, t: f64) -> Result<Vec<f64>> {
        let i = self.floor(t).ok_or(SmaxError::Incomplete)?;
        if i + 1 >= self.entries.len() {
            return Err(SmaxError::Incomplete);
        }

        let prev = &self.entries[i];
        let next = &self.entries[i + 1];
        let span = next.t - prev.t;
        if !(span > 0.0) {
            return Ok(prev.values.clone());
        }

        let frac = (t - prev.t) / span;
        Ok(prev
            .values
            .iter()
            .zip(&next.values)
            .map(|(a, b)| a + (b - a) * frac)
            .collect())
    }

    fn sum(&self, fromt: f64, tot: f64) -> (Vec<f64>, Window) {
        let (from, to, complete) = self.window(fromt, tot);
        let mut sum = vec![0.0; self.count];
        for e in self.entries.iter().skip(from).take(to - from) {
            for (s, v) in sum.iter_mut().zip(&e.values) {
                *s += v;
            }
        }
        (
            sum,
            Window {
                n: to - from,
                complete,
            },
        )
    }

    fn average(&self, fromt: f64, tot: f64) -> (Vec<f64>, Vec<f64>, Window) {
        let (from, to, complete) = self.window(fromt, tot);
        let n = to - from;

        let mut mean = vec![f64::NAN; self.count];
        let mut rms = vec![f64::NAN; self.count];

        if n > 0 {
            let mut sum = vec![0.0; self.count];
            let mut sum2 = vec![0.0; self.count];
            for e in self.entries.iter().skip(from).take(n) {
                for k in 0..self.count {
                    sum[k] += e.values[k];
                    sum2[k] += e.values[k] * e.values[k];
                }
            }
            for k in 0..self.count {
                mean[k] = sum[k] / n as f64;
                rms[k] = (sum2[k] / n as f64).sqrt();
            }
        }
        (mean, rms, Window { n, complete })
    }

    fn range(&self, fromt: f64, tot: f64) -> (Vec<f64>, Vec<f64>, Window) {
        let (from, to, complete) = self.window(fromt, tot);
        let mut min = vec![f64::INFINITY; self.count];
        let mut max = vec![f64::NEG_INFINITY; self.count];
        for e in self.entries.iter().skip(from).take(to - from) {
            for k in 0..self.count {
                min[k] = min[k].min(e.values[k]);
                max[k] = max[k].max(e.values[k]);
            }
        }
        (
            min,
            max,
            Window {
                n: to - from,
                complete,
            },
        )
    }
}

/// One buffered variable, indexed by id and by its update channel.
pub(crate) struct TimeBuffer {
    id: u32,
    table: String,
    key: String,
    /// Each ring has its own lock, independent of the registry.
    ring: Mutex<Ring>,
}

#[derive(Default)]
struct Buffers {
    by_id: HashMap<u32, Arc<TimeBuffer>>,
    by_channel: HashMap<String, Arc<TimeBuffer>>,
    next_id: u32,
}

pub(crate) struct BufferRegistry {
    buffers: Mutex<Buffers>,
    dispatcher_installed: AtomicBool,
}

impl BufferRegistry {
    pub(crate) fn new() -> Self {
        Self {
            buffers: Mutex::new(Buffers::default()),
            dispatcher_installed: AtomicBool::new(false),
        }
    }

    fn by_id(&self, id: u32) -> Result<Arc<TimeBuffer>> {
        self.buffers
            .lock()
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| SmaxError::NameInvalid(format!("no buffer {}", id)))
    }

    fn by_channel(&self, channel: &str) -> Option<Arc<TimeBuffer>> {
        self.buffers.lock().by_channel.get(channel).cloned()
    }
}

/// Window summary returned alongside windowed statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Number of entries that contributed.
    pub n: usize,
    /// Whether the requested time range was fully bracketed by data.
    pub complete: bool,
}

impl Smax {
    /// Start buffering a numerical variable for time-window statistics.
    /// `count` is the number of elements requested per entry, `capacity`
    /// the number of entries retained. Returns the buffer id used by the
    /// query calls.
    pub async fn buffer_data(
        &self,
        table: &str,
        key: &str,
        count: usize,
        capacity: usize,
    ) -> Result<u32> {
        crate::client::check_table(table)?;
        crate::client::check_key(key)?;
        if count == 0 || capacity == 0 {
            return Err(SmaxError::SizeInvalid("zero count or capacity".into()));
        }

        // Only numerical data can be aggregated.
        let (ty, _) = self.pull_type_dimension(table, key).await?;
        if !ty.is_numeric() {
            return Err(SmaxError::TypeMismatch {
                expected: "numeric".into(),
                got: ty.wire_name(),
            });
        }

        let channel = format!("{}{}", UPDATES_PREFIX, aggregate_id(table, key));

        let existing = self.inner.buffers.by_channel(&channel);
        if let Some(buf) = existing {
            let mut ring = buf.ring.lock();
            ring.capacity = capacity.max(ring.capacity);
            if count != ring.count {
                // A different element count invalidates what is stored.
                ring.count = count;
                ring.entries.clear();
            }
            while ring.entries.len() > ring.capacity {
                ring.entries.pop_front();
            }
            return Ok(buf.id);
        }

        let buf = {
            let mut b = self.inner.buffers.buffers.lock();
            b.next_id += 1;
            let buf = Arc::new(TimeBuffer {
                id: b.next_id,
                table: table.to_string(),
                key: key.to_string(),
                ring: Mutex::new(Ring {
                    capacity,
                    count,
                    entries: VecDeque::with_capacity(capacity),
                }),
            });
            b.by_id.insert(buf.id, Arc::clone(&buf));
            b.by_channel.insert(channel, Arc::clone(&buf));
            buf
        };

        self.subscribe(table, key).await?;
        install_buffer_dispatcher(self);

        debug!(table, key, id = buf.id, capacity, "buffering started");
        Ok(buf.id)
    }

    /// Discard the contents of a buffer, keeping it active.
    pub fn flush_buffer(&self, id: u32) -> Result<()> {
        let buf = self.inner.buffers.by_id(id)?;
        buf.ring.lock().entries.clear();
        Ok(())
    }

    /// Number of entries currently buffered.
    pub fn buffer_size(&self, id: u32) -> Result<usize> {
        Ok(self.inner.buffers.by_id(id)?.ring.lock().entries.len())
    }

    /// Time span of the buffered data, or `None` while empty.
    pub fn buffered_time_range(&self, id: u32) -> Result<Option<(f64, f64)>> {
        let buf = self.inner.buffers.by_id(id)?;
        let ring = buf.ring.lock();
        Ok(match (ring.entries.front(), ring.entries.back()) {
            (Some(first), Some(last)) => Some((first.t, last.t)),
            _ => None,
        })
    }

    /// Linear interpolation at time `t`; fails with
    /// [`SmaxError::Incomplete`] unless `t` is bracketed by data.
    pub fn get_interpolated(&self, id: u32, t: f64) -> Result<Vec<f64>> {
        self.inner.buffers.by_id(id)?.ring.lock().interpolate(t)
    }

    /// Per-element sums over the `[fromt, tot]` window.
    pub fn window_sum(&self, id: u32, fromt: f64, tot: f64) -> Result<(Vec<f64>, Window)> {
        Ok(self.inner.buffers.by_id(id)?.ring.lock().sum(fromt, tot))
    }

    /// Per-element mean and rms over the `[fromt, tot]` window.
    pub fn window_average(
        &self,
        id: u32,
        fromt: f64,
        tot: f64,
    ) -> Result<(Vec<f64>, Vec<f64>, Window)> {
        Ok(self
            .inner
            .buffers
            .by_id(id)?
            .ring
            .lock()
            .average(fromt, tot))
    }

    /// Per-element minima and maxima over the `[fromt, tot]` window.
    pub fn window_range(
        &self,
        id: u32,
        fromt: f64,
        tot: f64,
    ) -> Result<(Vec<f64>, Vec<f64>, Window)> {
        Ok(self.inner.buffers.by_id(id)?.ring.lock().range(fromt, tot))
    }

    /// Stop all buffering, discarding every buffer and its subscription.
    pub async fn end_buffers(&self) -> usize {
        let buffers: Vec<Arc<TimeBuffer>> = {
            let mut b = self.inner.buffers.buffers.lock();
            b.by_channel.clear();
            b.by_id.drain().map(|(_, buf)| buf).collect()
        };

        for buf in &buffers {
            let _ = self.unsubscribe(&buf.table, &buf.key).await;
        }
        buffers.len()
    }
}

/// Register the update handler that feeds buffers through the pull queue.
fn install_buffer_dispatcher(smax: &Smax) {
    if smax
        .inner
        .buffers
        .dispatcher_installed
        .swap(true, Ordering::SeqCst)
    {
        return;
    }

    let weak = smax.downgrade();
    smax.inner.driver.add_subscriber(
        UPDATES_PREFIX,
        Arc::new(move |_pattern, channel, _payload| {
            let smax = match Smax::upgrade(&weak) {
                Some(s) => s,
                None => return,
            };
            if let Some(buf) = smax.inner.buffers.by_channel(channel) {
                tokio::spawn(ingest(smax, buf));
            }
        }),
    );
}

/// Fetch the updated values and append them, stamped with the server-side
/// write timestamp.
async fn ingest(smax: Smax, buf: Arc<TimeBuffer>) {
    let count = buf.ring.lock().count;

    if smax.inner.config.pipelined {
        let slot = PullSlot::new();
        if let Err(e) = smax
            .queue(&buf.table, &buf.key, DataType::Double, count, &slot, true)
            .await
        {
            warn!(table = %buf.table, key = %buf.key, error = %e, "buffer ingest failed");
            return;
        }
        smax.queue_callback(move || {
            if let (Some(SmaxValue::Double(values)), Some(meta)) = (slot.take(), slot.meta()) {
                buf.ring.lock().push(meta.timestamp.as_secs_f64(), values);
            }
        });
    } else {
        match smax
            .pull_with_meta(&buf.table, &buf.key, DataType::Double, count)
            .await
        {
            Ok((SmaxValue::Double(values), meta)) => {
                buf.ring.lock().push(meta.timestamp.as_secs_f64(), values);
            }
            Ok(_) => {}
            Err(e) => {
                warn!(table = %buf.table, key = %buf.key, error = %e, "buffer ingest failed")
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    fn ring(capacity: usize, count: usize) -> Ring {
        Ring {
            capacity,
            count,
            entries: VecDeque::new(),
        }
    }

    #[test]
    fn test_ring_overwrites_oldest_when_full() {
        let mut r = ring(4, 1);
        for k in 0..7 {
            r.push(k as f64, vec![k as f64]);
        }
        assert_eq!(r.entries.len(), 4);
        // After capacity + k ingests, the oldest retained is entry k.
        assert_eq!(r.entries.front().unwrap().t, 3.0);
        assert_eq!(r.entries.back().unwrap().t, 6.0);
    }

    #[test]
    fn test_ring_entry_times_nondecreasing() {
        let mut r = ring(8, 1);
        for t in [1.0, 2.0, 2.0, 5.0] {
            r.push(t, vec![0.0]);
        }
        let times: Vec<f64> = r.entries.iter().map(|e| e.t).collect();
        let mut sorted = times.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).expect("ordered"));
        assert_eq!(times, sorted);
    }

    #[test]
    fn test_floor_ceil() {
        let mut r = ring(8, 1);
        for t in [1.0, 3.0, 5.0] {
            r.push(t, vec![t]);
        }
        assert_eq!(r.floor(0.5), None);
        assert_eq!(r.floor(3.0), Some(1));
        assert_eq!(r.floor(9.0), Some(2));
        assert_eq!(r.ceil(0.5), Some(0));
        assert_eq!(r.ceil(3.5), Some(2));
        assert_eq!(r.ceil(9.0), None);
    }

    #[test]
    fn test_window_incomplete_flags() {
        let mut r = ring(8, 1);
        for t in [1.0, 2.0, 3.0] {
            r.push(t, vec![t]);
        }
        let (_, _, complete) = r.window(1.0, 2.5);
        assert!(complete);
        let (_, _, complete) = r.window(0.0, 2.5);
        assert!(!complete);
        let (_, _, complete) = r.window(1.5, 9.0);
        assert!(!complete);
    }

    #[test]
    fn test_entry_values_padded_to_count() {
        let mut r = ring(4, 3);
        r.push(1.0, vec![1.0]);
        assert_eq!(r.entries[0].values, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_interpolation() {
        let mut r = ring(8, 2);
        r.push(1.0, vec![10.0, 0.0]);
        r.push(3.0, vec![20.0, 1.0]);

        assert_eq!(r.interpolate(2.0).unwrap(), vec![15.0, 0.5]);
        assert_eq!(r.interpolate(1.0).unwrap(), vec![10.0, 0.0]);
        assert!(matches!(r.interpolate(0.5), Err(SmaxError::Incomplete)));
        assert!(matches!(r.interpolate(4.0), Err(SmaxError::Incomplete)));
    }

    #[test]
    fn test_window_sum_and_average() {
        let mut r = ring(8, 1);
        for t in [1.0, 2.0, 3.0, 4.0] {
            r.push(t, vec![t]);
        }

        let (sum, w) = r.sum(2.0, 3.5);
        // Entries at t = 2 and t = 3 fall in [floor(2.0), ceil(3.5)).
        assert_eq!(sum, vec![5.0]);
        assert_eq!(w.n, 2);
        assert!(w.complete);

        let (mean, rms, w) = r.average(1.0, 4.5);
        assert_eq!(w.n, 4);
        assert!((mean[0] - 2.5).abs() < 1e-12);
        let expected_rms = ((1.0 + 4.0 + 9.0 + 16.0) / 4.0f64).sqrt();
        assert!((rms[0] - expected_rms).abs() < 1e-12);
    }

    #[test]
    fn test_window_range() {
        let mut r = ring(8, 1);
        for t in [1.0, 2.0, 3.0] {
            r.push(t, vec![t * 10.0]);
        }
        let (min, max, w) = r.range(1.0, 3.5);
        assert_eq!(min, vec![10.0]);
        assert_eq!(max, vec![30.0]);
        assert!(!w.complete);
    }
}
