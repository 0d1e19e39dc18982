//! Lazy deletion engine
//!
//! Deleting a collection only supersedes its meta record and leaves a
//! delete-task marker `D | key | version` behind. The reclaimer turns those
//! markers into actual deletions:
//!
//! ```text
//! loop:
//!   queue empty?  -> refill with up to `reclaim_batch` persisted markers
//!   still empty?  -> wait `reclaim_poll_interval` (or until stopped)
//!   pop marker    -> decode (corrupt: log fatal, drop the task)
//!                 -> under the key lock, one unlogged batch deleting:
//!                      S|key|version*  item records
//!                      z|key|version*  score index records
//!                      M|key           only if still (version, deleted)
//!                      the marker itself
//!   yield
//! ```
//!
//! A sweep is idempotent. If a crash loses the unlogged batch the marker is
//! still there and the sweep simply runs again.

use super::iterator::RangeIterator;
use super::EngineInner;
use crate::codec::{
    encode_item_prefix, encode_meta_key, encode_zscore_prefix, prefix_end, DeleteKey, ItemKey,
    MetaValue, ZScoreKey, DELETE,
};
use crate::error::{Error, Result};
use crate::storage::{ColumnFamily, OrderedStore, ReadOptions, WriteBatch, WriteOptions};
use crate::{escape, metrics};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Stop flag the worker can sleep on.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    flag: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownInner {
                flag: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Request shutdown and wake any waiter.
    pub fn shutdown(&self) {
        let _guard = self.inner.mutex.lock();
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.condvar.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep up to `duration`; returns true if shutdown was requested.
    pub fn wait_timeout(&self, duration: Duration) -> bool {
        let mut guard = self.inner.mutex.lock();
        if self.is_shutdown() {
            return true;
        }
        self.inner.condvar.wait_for(&mut guard, duration);
        self.is_shutdown()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
pub(crate) struct ReclaimCounters {
    sweeps: AtomicU64,
    deleted_records: AtomicU64,
    failures: AtomicU64,
    corrupt_markers: AtomicU64,
    refills: AtomicU64,
}

impl ReclaimCounters {
    pub(crate) fn snapshot(&self) -> ReclaimStats {
        ReclaimStats {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            deleted_records: self.deleted_records.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            corrupt_markers: self.corrupt_markers.load(Ordering::Relaxed),
            refills: self.refills.load(Ordering::Relaxed),
        }
    }
}

/// Reclaimer counters since the engine opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimStats {
    /// Completed sweeps.
    pub sweeps: u64,
    /// Item, score and meta records removed by sweeps.
    pub deleted_records: u64,
    /// Sweeps abandoned because of a store or decode error.
    pub failures: u64,
    /// Markers dropped because they could not be decoded.
    pub corrupt_markers: u64,
    /// Queue refills from persisted markers.
    pub refills: u64,
}

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub items: u64,
    pub scores: u64,
    pub meta_removed: bool,
}

impl SweepReport {
    pub fn deleted_records(&self) -> u64 {
        self.items + self.scores + u64::from(self.meta_removed)
    }
}

/// Result of one dequeue-and-sweep step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimCycle {
    /// No marker was pending.
    Idle,
    Swept(DeleteKey, SweepReport),
    /// The task was abandoned. The marker record stays and is picked up
    /// again on a later refill.
    Abandoned,
}

/// Pending delete markers and the point the next refill resumes from.
#[derive(Debug, Default)]
pub(crate) struct ReclaimQueue {
    pending: VecDeque<Vec<u8>>,
    /// Last marker of a full refill; the next scan starts after it so
    /// markers that keep failing cannot starve the ones behind them.
    resume_after: Option<Vec<u8>>,
}

impl ReclaimQueue {
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
        self.resume_after = None;
    }
}

impl<S: OrderedStore> EngineInner<S> {
    fn load_markers(&self, queue: &mut ReclaimQueue, start: &[u8], limit: usize) -> Result<usize> {
        let end = prefix_end(&[DELETE]).unwrap_or_default();
        let cursor = self.store.cursor(ColumnFamily::Default, &ReadOptions::no_fill());
        let mut iter = RangeIterator::forward(cursor, start, &end, limit as i64);
        let mut loaded = 0;
        while iter.advance() {
            queue.pending.push_back(iter.key().to_vec());
            loaded += 1;
        }
        iter.status()?;
        Ok(loaded)
    }

    /// Queue up to `limit` persisted markers, continuing after the previous
    /// refill and wrapping around to the first marker at the end.
    fn refill_queue(&self, queue: &mut ReclaimQueue, limit: usize) -> Result<()> {
        let mut loaded = 0;
        if let Some(mut after) = queue.resume_after.take() {
            // Smallest key sorting after the last loaded marker
            after.push(0);
            loaded = self.load_markers(queue, &after, limit)?;
        }
        if loaded == 0 {
            loaded = self.load_markers(queue, &[DELETE], limit)?;
        }
        queue.resume_after = if loaded == limit {
            queue.pending.back().cloned()
        } else {
            None
        };
        self.reclaim.refills.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn run_cycle(&self) -> Result<ReclaimCycle> {
        let task = {
            let mut queue = self.queue.lock();
            if queue.pending.is_empty() {
                self.refill_queue(&mut queue, self.options.reclaim_batch)?;
            }
            let task = queue.pending.pop_front();
            metrics::record_queue_depth(queue.len());
            task
        };
        let Some(raw) = task else {
            return Ok(ReclaimCycle::Idle);
        };

        let marker = match DeleteKey::decode(&raw) {
            Ok(marker) => marker,
            Err(e) => {
                error!(
                    marker = %escape(&raw),
                    error = %e,
                    fatal = true,
                    "Undecodable delete marker, dropping task"
                );
                metrics::record_corruption("delete_marker");
                self.reclaim.corrupt_markers.fetch_add(1, Ordering::Relaxed);
                return Ok(ReclaimCycle::Abandoned);
            }
        };

        match self.sweep(&marker) {
            Ok(report) => Ok(ReclaimCycle::Swept(marker, report)),
            Err(e) => {
                error!(
                    key = %escape(&marker.key),
                    version = marker.version,
                    error = %e,
                    fatal = true,
                    "Reclaim sweep failed, marker kept for retry"
                );
                if e.is_corruption() {
                    metrics::record_corruption("item");
                }
                metrics::record_reclaim_failure();
                self.reclaim.failures.fetch_add(1, Ordering::Relaxed);
                Ok(ReclaimCycle::Abandoned)
            }
        }
    }

    /// Stage deletion of every record under `prefix` whose decoded form
    /// belongs to `marker`. Any undecodable key aborts the whole sweep.
    fn stage_prefix<F>(&self, prefix: &[u8], batch: &mut WriteBatch, belongs: F) -> Result<u64>
    where
        F: Fn(&[u8]) -> Result<bool>,
    {
        let end = prefix_end(prefix).unwrap_or_default();
        let cursor = self.store.cursor(ColumnFamily::Default, &ReadOptions::no_fill());
        let mut iter = RangeIterator::forward(cursor, prefix, &end, -1);
        let mut staged = 0;
        while iter.advance() {
            if !belongs(iter.key())? {
                break;
            }
            batch.delete(iter.key());
            staged += 1;
        }
        iter.status()?;
        Ok(staged)
    }

    /// Remove everything `marker` stands for in one unlogged batch.
    ///
    /// A marker that is no longer stored means its version was already
    /// reclaimed or wiped by `flush_all`; the key may have restarted at that
    /// version since, so nothing is touched.
    pub(crate) fn sweep(&self, marker: &DeleteKey) -> Result<SweepReport> {
        let _guard = self.locks.lock(&marker.key);
        let marker_key = marker.encode()?;
        if self
            .store
            .get(ColumnFamily::Default, &marker_key, &ReadOptions::no_fill())?
            .is_none()
        {
            debug!(
                key = %escape(&marker.key),
                version = marker.version,
                "Delete marker gone, skipping sweep"
            );
            return Ok(SweepReport::default());
        }
        let mut batch = WriteBatch::new();

        let items = self.stage_prefix(
            &encode_item_prefix(&marker.key, marker.version)?,
            &mut batch,
            |raw| {
                let item = ItemKey::decode(raw)?;
                Ok(item.key == marker.key && item.version == marker.version)
            },
        )?;
        let scores = self.stage_prefix(
            &encode_zscore_prefix(&marker.key, marker.version)?,
            &mut batch,
            |raw| {
                let entry = ZScoreKey::decode(raw)?;
                Ok(entry.key == marker.key && entry.version == marker.version)
            },
        )?;

        // A newer incarnation may own the meta record by now
        let meta_key = encode_meta_key(&marker.key)?;
        let mut meta_removed = false;
        if let Some(raw) = self.store.get(ColumnFamily::Default, &meta_key, &ReadOptions::no_fill())? {
            let meta = MetaValue::decode(&raw)?;
            if meta.deleted && meta.version == marker.version {
                batch.delete(&meta_key);
                meta_removed = true;
            }
        }

        batch.delete(&marker_key);
        self.store.write(batch, &WriteOptions::without_wal())?;

        let report = SweepReport {
            items,
            scores,
            meta_removed,
        };
        self.reclaim.sweeps.fetch_add(1, Ordering::Relaxed);
        self.reclaim
            .deleted_records
            .fetch_add(report.deleted_records(), Ordering::Relaxed);
        metrics::record_sweep(report.deleted_records());
        debug!(
            key = %escape(&marker.key),
            version = marker.version,
            items,
            scores,
            meta_removed,
            "Swept superseded version"
        );
        Ok(report)
    }

    /// Persisted markers, in key order.
    pub(crate) fn pending_markers(&self, limit: i64) -> Result<Vec<DeleteKey>> {
        let start = [DELETE];
        let end = prefix_end(&start).unwrap_or_default();
        let cursor = self.store.cursor(ColumnFamily::Default, &ReadOptions::no_fill());
        let markers = RangeIterator::forward(cursor, &start, &end, limit)
            .map(|(key, _)| {
                DeleteKey::decode(&key).inspect_err(|_| metrics::record_corruption("delete_marker"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(markers)
    }
}

/// Handle to the background reclaim thread.
pub(crate) struct ReclaimWorker {
    signal: ShutdownSignal,
    handle: Option<JoinHandle<()>>,
}

impl ReclaimWorker {
    pub(crate) fn start<S: OrderedStore>(inner: Arc<EngineInner<S>>) -> Result<Self> {
        let signal = ShutdownSignal::new();
        let worker_signal = signal.clone();
        let poll = inner.options.reclaim_poll_interval();

        let handle = thread::Builder::new()
            .name("photonkv-reclaim".into())
            .spawn(move || {
                info!(
                    batch = inner.options.reclaim_batch,
                    poll_ms = poll.as_millis() as u64,
                    "Reclaimer started"
                );
                while !worker_signal.is_shutdown() {
                    match inner.run_cycle() {
                        Ok(ReclaimCycle::Swept(..)) => thread::yield_now(),
                        // Abandoned markers come straight back on refill
                        Ok(ReclaimCycle::Idle | ReclaimCycle::Abandoned) => {
                            if worker_signal.wait_timeout(poll) {
                                break;
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to load delete markers");
                            inner.reclaim.failures.fetch_add(1, Ordering::Relaxed);
                            if worker_signal.wait_timeout(poll) {
                                break;
                            }
                        }
                    }
                }
                info!("Reclaimer stopped");
            })
            .map_err(|e| Error::Storage(format!("Failed to spawn reclaim thread: {}", e)))?;

        Ok(Self {
            signal,
            handle: Some(handle),
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the worker and wait up to `retries * interval` for it to exit.
    ///
    /// Returns false if the worker was still busy and got detached.
    pub(crate) fn stop(mut self, retries: u32, interval: Duration) -> bool {
        self.signal.shutdown();
        let Some(handle) = self.handle.take() else {
            return true;
        };

        for attempt in 0..retries {
            if handle.is_finished() {
                break;
            }
            debug!(attempt, "Waiting for reclaimer to stop");
            thread::sleep(interval);
        }

        if handle.is_finished() {
            if handle.join().is_err() {
                warn!("Reclaimer thread panicked");
            }
            true
        } else {
            warn!(
                waited_ms = (interval * retries).as_millis() as u64,
                "Reclaimer did not stop in time, detaching"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_signal_wakes_waiter() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let handle = thread::spawn(move || {
            let started = Instant::now();
            let stopped = waiter.wait_timeout(Duration::from_secs(30));
            (stopped, started.elapsed())
        });
        thread::sleep(Duration::from_millis(20));
        signal.shutdown();

        let (stopped, waited) = handle.join().expect("waiter thread");
        assert!(stopped);
        assert!(waited < Duration::from_secs(10));
    }

    #[test]
    fn test_signal_times_out() {
        let signal = ShutdownSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(5)));
        signal.shutdown();
        assert!(signal.wait_timeout(Duration::from_secs(30)));
    }

    #[test]
    fn test_report_totals() {
        let report = SweepReport {
            items: 3,
            scores: 2,
            meta_removed: true,
        };
        assert_eq!(report.deleted_records(), 6);
    }
}
