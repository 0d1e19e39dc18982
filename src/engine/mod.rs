//! Engine facade
//!
//! [`Engine`] owns the store, the per-key lock stripes, the reclaim queue
//! and the background reclaimer. Everything a caller does goes through it:
//!
//! ```text
//! Engine::open(options, dir)
//!   ├─→ <dir>/data     the ordered store
//!   ├─→ <dir>/backup   point-in-time backups (save)
//!   └─→ reclaim thread (unless start_reclaimer = false)
//! ```

pub mod collection;
pub mod iterator;
pub mod locks;
pub mod reclaim;
pub mod replication;

pub use collection::CollectionWrite;
pub use iterator::{Direction, RangeIterator};
pub use locks::KeyLocks;
pub use reclaim::{ReclaimCycle, ReclaimStats, ShutdownSignal, SweepReport};
pub use replication::{commit_batch, Context, SeqMarker};

use self::reclaim::{ReclaimCounters, ReclaimQueue, ReclaimWorker};
use crate::codec::DeleteKey;
use crate::config::Options;
use crate::error::{Error, Result};
use crate::metrics;
use crate::storage::{
    BackupInfo, ColumnFamily, DefaultStore, OrderedStore, ReadOptions, WriteBatch, WriteOptions,
};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

const DATA_DIR: &str = "data";
const BACKUP_DIR: &str = "backup";

/// State shared with the reclaim thread.
pub(crate) struct EngineInner<S: OrderedStore> {
    pub(crate) store: S,
    pub(crate) locks: KeyLocks,
    /// Pending delete markers (raw keys), refilled from the store.
    pub(crate) queue: Mutex<ReclaimQueue>,
    pub(crate) options: Options,
    pub(crate) reclaim: ReclaimCounters,
}

/// Versioned key-value engine over an [`OrderedStore`].
pub struct Engine<S: OrderedStore = DefaultStore> {
    inner: Arc<EngineInner<S>>,
    worker: Mutex<Option<ReclaimWorker>>,
    data_dir: PathBuf,
    backup_dir: PathBuf,
}

impl<S: OrderedStore> Engine<S> {
    /// Open the store under `<dir>/data` and start the reclaimer.
    ///
    /// Fails without leaving anything running if the store cannot be
    /// opened or the reclaim thread cannot be spawned.
    #[instrument(skip_all)]
    pub fn open(options: Options, dir: impl AsRef<Path>) -> Result<Self> {
        options.validate()?;
        let dir = dir.as_ref();
        let data_dir = dir.join(DATA_DIR);
        let backup_dir = dir.join(BACKUP_DIR);

        let store = S::open(&options, &data_dir).inspect_err(|e| {
            error!(path = ?data_dir, error = %e, "Failed to open store");
        })?;

        let engine = Self {
            inner: Arc::new(EngineInner {
                store,
                locks: KeyLocks::new(options.key_lock_stripes),
                queue: Mutex::new(ReclaimQueue::default()),
                options,
                reclaim: ReclaimCounters::default(),
            }),
            worker: Mutex::new(None),
            data_dir,
            backup_dir,
        };

        if engine.inner.options.start_reclaimer {
            engine.start_reclaimer()?;
        }

        info!(
            path = ?engine.data_dir,
            keys = engine.size(),
            reclaimer = engine.inner.options.start_reclaimer,
            "Engine opened"
        );
        Ok(engine)
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn options(&self) -> &Options {
        &self.inner.options
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    // Raw access

    pub fn raw_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.raw_get_cf(ColumnFamily::Default, key)
    }

    /// Raw point read. Bypasses the block cache like the scans do.
    pub fn raw_get_cf(&self, cf: ColumnFamily, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.store.get(cf, key, &ReadOptions::no_fill())
    }

    pub fn raw_set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner
            .store
            .put(ColumnFamily::Default, key, value, &WriteOptions::default())
    }

    pub fn raw_del(&self, key: &[u8]) -> Result<()> {
        self.inner
            .store
            .delete(ColumnFamily::Default, key, &WriteOptions::default())
    }

    /// Apply `batch` through the replication-aware committer.
    pub fn commit_batch(&self, ctx: &mut Context, batch: WriteBatch) -> Result<()> {
        commit_batch(&self.inner.store, ctx, batch, &WriteOptions::default())
    }

    /// Marker persisted by the last stamped replicated commit.
    pub fn last_replicated_seq(&self) -> Result<Option<SeqMarker>> {
        replication::last_replicated_seq(&self.inner.store)
    }

    // Iteration

    /// Ascending scan of `[start, end)` that does not populate the block
    /// cache. `limit`: 0 = nothing, negative = unlimited.
    pub fn iterator<'a>(
        &'a self,
        start: &[u8],
        end: &[u8],
        limit: i64,
        snapshot: Option<&'a S::Snapshot>,
    ) -> RangeIterator<S::Cursor<'a>> {
        self.iterator_with(start, end, limit, &ReadOptions::no_fill().snapshot(snapshot))
    }

    /// [`iterator`](Self::iterator) with caller-chosen read options.
    pub fn iterator_with<'a>(
        &'a self,
        start: &[u8],
        end: &[u8],
        limit: i64,
        opts: &ReadOptions<'a, S::Snapshot>,
    ) -> RangeIterator<S::Cursor<'a>> {
        let cursor = self.inner.store.cursor(ColumnFamily::Default, opts);
        RangeIterator::forward(cursor, start, end, limit)
    }

    /// Descending scan of `(end, start]`.
    pub fn rev_iterator<'a>(
        &'a self,
        start: &[u8],
        end: &[u8],
        limit: i64,
        snapshot: Option<&'a S::Snapshot>,
    ) -> RangeIterator<S::Cursor<'a>> {
        self.rev_iterator_with(start, end, limit, &ReadOptions::no_fill().snapshot(snapshot))
    }

    pub fn rev_iterator_with<'a>(
        &'a self,
        start: &[u8],
        end: &[u8],
        limit: i64,
        opts: &ReadOptions<'a, S::Snapshot>,
    ) -> RangeIterator<S::Cursor<'a>> {
        let cursor = self.inner.store.cursor(ColumnFamily::Default, opts);
        RangeIterator::backward(cursor, start, end, limit)
    }

    pub fn get_snapshot(&self) -> S::Snapshot {
        self.inner.store.snapshot()
    }

    /// Release a snapshot. Dropping it has the same effect.
    pub fn release_snapshot(&self, snapshot: S::Snapshot) {
        drop(snapshot);
    }

    // Maintenance

    pub fn flush(&self, wait: bool) -> Result<()> {
        self.inner.store.flush(wait)
    }

    /// Delete every key, `flush_batch_size` per atomic batch, then commit an
    /// empty batch so a replica still records its sequence marker.
    ///
    /// Holds every key lock for the duration and drops queued reclaim
    /// tasks. Returns the number of deleted keys.
    ///
    /// A failed deletion batch stops the loop but the final commit still
    /// runs; the deletion error is returned afterwards.
    #[instrument(skip(self, ctx))]
    pub fn flush_all(&self, ctx: &mut Context) -> Result<u64> {
        let _all = self.inner.locks.lock_all();
        {
            let mut queue = self.inner.queue.lock();
            queue.clear();
            metrics::record_queue_depth(0);
        }

        let batch_size = self.inner.options.flush_batch_size as i64;
        let mut total = 0u64;
        let mut failure = None;
        loop {
            let keys: Vec<Vec<u8>> = self
                .iterator(b"", b"", batch_size, None)
                .map(|(key, _)| key)
                .collect();
            if keys.is_empty() {
                break;
            }
            let mut batch = WriteBatch::new();
            for key in &keys {
                batch.delete(key);
            }
            if let Err(e) = self.inner.store.write(batch, &WriteOptions::default()) {
                error!(total, error = %e, "flush_all deletion batch failed, stopping");
                failure = Some(e);
                break;
            }
            total += keys.len() as u64;
        }

        let committed = self.commit_batch(ctx, WriteBatch::new());
        info!(total, "keys deleted by iteration");
        if let Some(e) = failure {
            return Err(e);
        }
        committed?;
        Ok(total)
    }

    /// Estimated number of keys.
    pub fn size(&self) -> u64 {
        self.inner.store.approximate_len(ColumnFamily::Default)
    }

    /// Store properties and reclaimer state as key/value pairs.
    pub fn info(&self) -> Vec<(String, String)> {
        let mut info = Vec::new();
        for name in self.inner.store.property_names() {
            if let Some(value) = self.inner.store.property(name) {
                info.push((name.to_string(), value));
            }
        }

        let stats = self.reclaim_stats();
        info.push(("reclaim.running".to_string(), self.reclaimer_running().to_string()));
        info.push(("reclaim.queue".to_string(), self.inner.queue.lock().len().to_string()));
        info.push(("reclaim.sweeps".to_string(), stats.sweeps.to_string()));
        info.push((
            "reclaim.deleted-records".to_string(),
            stats.deleted_records.to_string(),
        ));
        info.push(("reclaim.failures".to_string(), stats.failures.to_string()));
        info.push((
            "reclaim.corrupt-markers".to_string(),
            stats.corrupt_markers.to_string(),
        ));
        info
    }

    pub fn compact(&self) -> Result<()> {
        self.inner.store.compact_range(None, None)
    }

    /// Back up the store, keep the newest `backup_keep` backups and verify
    /// the one just written.
    #[instrument(skip(self))]
    pub fn save(&self) -> Result<BackupInfo> {
        let store = &self.inner.store;
        let info = store.create_backup(&self.backup_dir)?;
        let purged = store.purge_old_backups(&self.backup_dir, self.inner.options.backup_keep)?;
        store.verify_backup(&self.backup_dir, info.id)?;
        info!(
            id = info.id,
            size = info.size,
            timestamp = %info.timestamp,
            purged,
            "Backup saved and verified"
        );
        Ok(info)
    }

    pub fn backups(&self) -> Result<Vec<BackupInfo>> {
        self.inner.store.backup_info(&self.backup_dir)
    }

    /// Number and total size of files in the data directory.
    pub fn data_files(&self) -> Result<(u64, u64)> {
        let mut count = 0;
        let mut bytes = 0;
        for entry in fs::read_dir(&self.data_dir)? {
            let metadata = entry?.metadata()?;
            if metadata.is_file() {
                count += 1;
                bytes += metadata.len();
            }
        }
        Ok((count, bytes))
    }

    // Reclaimer

    /// Start the background reclaimer; no-op if it is already running.
    pub fn start_reclaimer(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(ReclaimWorker::is_running) {
            return Ok(());
        }
        *worker = Some(ReclaimWorker::start(Arc::clone(&self.inner))?);
        Ok(())
    }

    /// Stop the reclaimer and discard its in-memory queue.
    pub fn stop_reclaimer(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let options = &self.inner.options;
        if !worker.stop(options.stop_wait_retries, options.stop_wait_interval()) {
            warn!("Reclaimer still busy after stop timeout");
        }
        self.inner.queue.lock().clear();
        metrics::record_queue_depth(0);
    }

    pub fn reclaimer_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(ReclaimWorker::is_running)
    }

    /// One dequeue-and-sweep step, as run by the background loop.
    pub fn run_reclaim_cycle(&self) -> Result<ReclaimCycle> {
        self.inner.run_cycle()
    }

    /// Sweep a specific superseded version now.
    pub fn sweep(&self, marker: &DeleteKey) -> Result<SweepReport> {
        self.inner.sweep(marker)
    }

    /// Persisted delete markers; `limit` as for iterators.
    pub fn pending_reclaims(&self, limit: i64) -> Result<Vec<DeleteKey>> {
        self.inner.pending_markers(limit)
    }

    pub fn reclaim_stats(&self) -> ReclaimStats {
        self.inner.reclaim.snapshot()
    }

    /// Stop the reclaimer and persist everything.
    pub fn close(self) -> Result<()> {
        self.stop_reclaimer();
        self.inner.store.flush(true).map_err(|e| {
            error!(path = ?self.data_dir, error = %e, "Final flush failed");
            Error::Storage(format!("close: {}", e))
        })?;
        info!(path = ?self.data_dir, "Engine closed");
        Ok(())
    }
}

impl<S: OrderedStore> Drop for Engine<S> {
    fn drop(&mut self) {
        self.stop_reclaimer();
    }
}
