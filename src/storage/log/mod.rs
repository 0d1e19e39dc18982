//! Log-structured ordered store
//!
//! `LogStore` keeps every column family in an ordered in-memory table and
//! makes it durable with a write-ahead log plus periodic checkpoints:
//!
//! ```text
//! <dir>/
//!   CHECKPOINT   full table image, tagged with the WAL generation after it
//!   wal.log      [magic][generation] + framed WriteBatch records
//!   wal.log.next empty log of the next generation, staged by a checkpoint
//! ```
//!
//! A checkpoint stages the next log first, installs the checkpoint, then
//! renames the staged log over `wal.log`. If that last rename fails the
//! store refuses writes until a later checkpoint succeeds.
//!
//! # Write path
//!
//! 1. Take the WAL lock (serializes writers).
//! 2. Append the framed batch unless `disable_wal` (fsync if `sync`).
//! 3. Swap the batch into the tables under the write lock and invalidate
//!    cached keys. Tables are behind an `Arc`; a snapshot or cursor holding
//!    the previous image forces a copy, otherwise the update is in place.
//! 4. Checkpoint if the WAL outgrew the write buffer.
//!
//! # Recovery
//!
//! Load the checkpoint, then replay the WAL if its generation matches. A
//! torn record ends the replay; everything before it is kept. Recovered
//! state is immediately checkpointed so the log starts clean.

pub mod backup;
pub mod cache;
pub mod compression;
pub mod cursor;
pub(crate) mod record;

pub use backup::BackupInfo;
pub use cache::{BlockCache, CacheStats};
pub use cursor::LogCursor;

use self::compression::CompressionAlgorithm;
use self::record::{encode_frame, read_checkpoint, read_frame, write_checkpoint};
use super::{BatchOp, ColumnFamily, OrderedStore, ReadOptions, WriteBatch, WriteOptions};
use crate::config::Options;
use crate::error::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const WAL_FILE: &str = "wal.log";
const WAL_STAGING_FILE: &str = "wal.log.next";
const CHECKPOINT_FILE: &str = "CHECKPOINT";
const WAL_MAGIC: &[u8; 8] = b"PKVWAL\x00\x01";
const WAL_HEADER_SIZE: u64 = 16;

pub const PROP_NUM_KEYS: &str = "photonkv.estimate-num-keys";
pub const PROP_NUM_SNAPSHOTS: &str = "photonkv.num-snapshots";
pub const PROP_MEM_SIZE: &str = "photonkv.cur-size-all-mem-tables";
pub const PROP_WAL_SIZE: &str = "photonkv.wal-size";
pub const PROP_CACHE_USAGE: &str = "photonkv.block-cache-usage";
pub const PROP_CACHE_HIT_RATE: &str = "photonkv.block-cache-hit-rate";
pub const PROP_STATS: &str = "photonkv.stats";

const PROPERTIES: [&str; 7] = [
    PROP_NUM_KEYS,
    PROP_NUM_SNAPSHOTS,
    PROP_MEM_SIZE,
    PROP_WAL_SIZE,
    PROP_CACHE_USAGE,
    PROP_CACHE_HIT_RATE,
    PROP_STATS,
];

/// One ordered table per column family.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tables {
    families: [BTreeMap<Vec<u8>, Vec<u8>>; 2],
}

impl Tables {
    pub(crate) fn family(&self, cf: ColumnFamily) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        &self.families[cf.id() as usize]
    }

    pub(crate) fn apply(&mut self, op: BatchOp) {
        match op {
            BatchOp::Put { cf, key, value } => {
                self.families[cf.id() as usize].insert(key, value);
            }
            BatchOp::Delete { cf, key } => {
                self.families[cf.id() as usize].remove(&key);
            }
        }
    }

    pub(crate) fn apply_batch(&mut self, batch: WriteBatch) {
        for op in batch.into_ops() {
            self.apply(op);
        }
    }

    /// Keys across all families.
    pub(crate) fn len(&self) -> usize {
        self.families.iter().map(BTreeMap::len).sum()
    }

    pub(crate) fn size_bytes(&self) -> usize {
        self.families
            .iter()
            .flat_map(|f| f.iter())
            .map(|(k, v)| k.len() + v.len())
            .sum()
    }
}

/// Point-in-time view of the store; released on drop.
pub struct StoreSnapshot {
    tables: Arc<Tables>,
    _guard: SnapshotGuard,
}

impl StoreSnapshot {
    /// Keys visible in `cf` through this snapshot.
    pub fn len(&self, cf: ColumnFamily) -> usize {
        self.tables.family(cf).len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.len() == 0
    }
}

struct SnapshotGuard {
    live: Arc<AtomicU64>,
}

impl SnapshotGuard {
    fn new(live: Arc<AtomicU64>) -> Self {
        live.fetch_add(1, Ordering::Relaxed);
        Self { live }
    }
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Open write-ahead log file
struct Wal {
    file: File,
    generation: u64,
    size: u64,
}

impl Wal {
    /// Create (or truncate) the log for `generation`.
    fn create(path: &Path, generation: u64) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| Error::Storage(format!("Failed to create WAL: {}", e)))?;
        file.write_all(WAL_MAGIC)?;
        file.write_all(&generation.to_le_bytes())?;
        file.sync_all()?;
        Ok(Self {
            file,
            generation,
            size: WAL_HEADER_SIZE,
        })
    }

    fn append(&mut self, frame: &[u8]) -> Result<()> {
        if let Err(e) = self.file.write_all(frame) {
            // Drop the partial record so later appends stay reachable
            if let Err(trunc) = self.file.set_len(self.size) {
                warn!(error = %trunc, "Failed to truncate partial WAL record");
            }
            return Err(Error::Storage(format!("Failed to append to WAL: {}", e)));
        }
        self.size += frame.len() as u64;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| Error::Storage(format!("Failed to sync WAL: {}", e)))
    }
}

/// Outcome of replaying the log at open.
#[derive(Debug, Default)]
struct Replay {
    records: u64,
    torn: bool,
    /// Log absent, stale, or without a complete header.
    fresh: bool,
}

fn replay_wal(path: &Path, generation: u64, tables: &mut Tables) -> Result<Replay> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Ok(Replay {
                fresh: true,
                ..Replay::default()
            })
        }
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);

    let mut header = [0u8; WAL_HEADER_SIZE as usize];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
            warn!(path = ?path, "WAL header incomplete, starting a new log");
            return Ok(Replay {
                fresh: true,
                ..Replay::default()
            });
        }
        Err(e) => return Err(e.into()),
    }
    if &header[..8] != WAL_MAGIC {
        return Err(Error::Corruption(format!("bad WAL header in {}", path.display())));
    }
    let mut gen_bytes = [0u8; 8];
    gen_bytes.copy_from_slice(&header[8..]);
    let wal_generation = u64::from_le_bytes(gen_bytes);

    if wal_generation < generation {
        // Already folded into the checkpoint
        debug!(wal_generation, generation, "Discarding stale WAL");
        return Ok(Replay {
            fresh: true,
            ..Replay::default()
        });
    }
    if wal_generation > generation {
        return Err(Error::Corruption(format!(
            "WAL generation {} is ahead of checkpoint generation {}",
            wal_generation, generation
        )));
    }

    let mut replay = Replay::default();
    loop {
        match read_frame(&mut reader) {
            Ok(Some(raw)) => {
                tables.apply_batch(WriteBatch::from_bytes(&raw)?);
                replay.records += 1;
            }
            Ok(None) => break,
            Err(Error::Corruption(reason)) => {
                warn!(
                    path = ?path,
                    records = replay.records,
                    reason = %reason,
                    "Torn WAL tail, discarding the rest of the log"
                );
                replay.torn = true;
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(replay)
}

#[derive(Debug, Default)]
struct StoreStats {
    writes: AtomicU64,
    unlogged_writes: AtomicU64,
    wal_bytes: AtomicU64,
    checkpoints: AtomicU64,
}

/// Ordered store backed by a write-ahead log and checkpoints
pub struct LogStore {
    path: PathBuf,
    tables: RwLock<Arc<Tables>>,
    wal: Mutex<Wal>,
    cache: BlockCache,
    snapshots: Arc<AtomicU64>,
    /// Writes that skipped the WAL since the last checkpoint.
    unpersisted: AtomicBool,
    /// A checkpoint was installed but its WAL could not be; writes are
    /// refused until a checkpoint completes.
    failed: AtomicBool,
    algorithm: CompressionAlgorithm,
    level: i32,
    sync_writes: bool,
    checkpoint_threshold: u64,
    stats: StoreStats,
}

impl LogStore {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    #[cfg(test)]
    pub(crate) fn refuse_writes(&self) {
        self.failed.store(true, Ordering::Release);
    }

    /// Write a checkpoint and start a new WAL generation.
    pub fn checkpoint(&self) -> Result<u64> {
        let mut wal = self.wal.lock();
        self.checkpoint_locked(&mut wal)
    }

    fn checkpoint_locked(&self, wal: &mut Wal) -> Result<u64> {
        let tables = Arc::clone(&*self.tables.read());
        let next = wal.generation + 1;
        let staging_path = self.path.join(WAL_STAGING_FILE);

        // The next log exists before the checkpoint that refers to it
        let next_wal = Wal::create(&staging_path, next)?;
        let size = match write_checkpoint(
            &self.path.join(CHECKPOINT_FILE),
            next,
            &tables,
            self.algorithm,
            self.level,
        ) {
            Ok(size) => size,
            Err(e) => {
                drop(next_wal);
                if let Err(cleanup) = fs::remove_file(&staging_path) {
                    warn!(error = %cleanup, "Failed to remove staged WAL");
                }
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&staging_path, self.path.join(WAL_FILE)) {
            self.failed.store(true, Ordering::Release);
            error!(
                generation = next,
                error = %e,
                fatal = true,
                "Checkpoint installed but WAL rotation failed, refusing writes"
            );
            return Err(Error::Storage(format!("Failed to install WAL: {}", e)));
        }
        *wal = next_wal;
        self.failed.store(false, Ordering::Release);
        self.unpersisted.store(false, Ordering::Release);
        self.stats.checkpoints.fetch_add(1, Ordering::Relaxed);
        debug!(generation = next, size, keys = tables.len(), "Checkpoint written");
        Ok(size)
    }

    /// Populate the cache from a cursor, unless the tables moved on since
    /// the cursor pinned them.
    fn fill_from_cursor(&self, pinned: &Arc<Tables>, key: &[u8], value: &[u8]) {
        let current = self.tables.read();
        if Arc::ptr_eq(&*current, pinned) {
            self.cache.insert(key, value);
        }
    }

    fn render_stats(&self) -> String {
        let tables = Arc::clone(&*self.tables.read());
        let (wal_generation, wal_size) = {
            let wal = self.wal.lock();
            (wal.generation, wal.size)
        };
        let cache = self.cache.stats();
        format!(
            "keys: default={} replication={}\n\
             snapshots: {}\n\
             wal: generation={} bytes={}\n\
             writes: logged={} unlogged={} wal_bytes={}\n\
             checkpoints: {}\n\
             block cache: entries={}/{} bytes={} hits={} misses={}\n",
            tables.family(ColumnFamily::Default).len(),
            tables.family(ColumnFamily::Replication).len(),
            self.snapshots.load(Ordering::Relaxed),
            wal_generation,
            wal_size,
            self.stats.writes.load(Ordering::Relaxed),
            self.stats.unlogged_writes.load(Ordering::Relaxed),
            self.stats.wal_bytes.load(Ordering::Relaxed),
            self.stats.checkpoints.load(Ordering::Relaxed),
            cache.size,
            cache.capacity,
            cache.bytes,
            cache.hits,
            cache.misses,
        )
    }
}

impl OrderedStore for LogStore {
    type Snapshot = StoreSnapshot;
    type Cursor<'a> = LogCursor<'a>;

    fn open(options: &Options, path: &Path) -> Result<Self> {
        if !path.exists() {
            if !options.create_if_missing {
                return Err(Error::Storage(format!(
                    "{} does not exist and create_if_missing is off",
                    path.display()
                )));
            }
            fs::create_dir_all(path)?;
        }

        let (generation, mut tables) = read_checkpoint(&path.join(CHECKPOINT_FILE))?
            .unwrap_or_default();
        let wal_path = path.join(WAL_FILE);
        match fs::remove_file(path.join(WAL_STAGING_FILE)) {
            Ok(()) => debug!(path = ?path, "Removed WAL staged by an interrupted checkpoint"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let replay = replay_wal(&wal_path, generation, &mut tables)?;

        let wal = if replay.fresh {
            Wal::create(&wal_path, generation)?
        } else {
            let file = OpenOptions::new().append(true).open(&wal_path)?;
            let size = file.metadata()?.len();
            Wal {
                file,
                generation,
                size,
            }
        };

        let algorithm = if options.compression {
            CompressionAlgorithm::Zstd
        } else {
            CompressionAlgorithm::None
        };

        let store = Self {
            path: path.to_path_buf(),
            tables: RwLock::new(Arc::new(tables)),
            wal: Mutex::new(wal),
            cache: BlockCache::new(options.cache_capacity),
            snapshots: Arc::new(AtomicU64::new(0)),
            unpersisted: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            algorithm,
            level: options.compression_level,
            sync_writes: options.sync_writes,
            checkpoint_threshold: options.write_buffer_size_bytes(),
            stats: StoreStats::default(),
        };

        if replay.records > 0 || replay.torn {
            store.checkpoint()?;
        }

        info!(
            path = ?path,
            generation,
            recovered_records = replay.records,
            torn_tail = replay.torn,
            keys = store.approximate_len(ColumnFamily::Default),
            "Store opened"
        );
        Ok(store)
    }

    fn get(
        &self,
        cf: ColumnFamily,
        key: &[u8],
        opts: &ReadOptions<'_, StoreSnapshot>,
    ) -> Result<Option<Vec<u8>>> {
        if let Some(snapshot) = opts.snapshot {
            return Ok(snapshot.tables.family(cf).get(key).cloned());
        }

        let tables = self.tables.read();
        let cached = cf == ColumnFamily::Default;
        if cached {
            if let Some(value) = self.cache.get(key) {
                return Ok(Some(value));
            }
        }
        let value = tables.family(cf).get(key).cloned();
        if cached && opts.fill_cache {
            if let Some(value) = &value {
                self.cache.insert(key, value);
            }
        }
        Ok(value)
    }

    fn write(&self, batch: WriteBatch, opts: &WriteOptions) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut wal = self.wal.lock();
        if self.failed.load(Ordering::Acquire) {
            return Err(Error::Storage(
                "store refuses writes until a checkpoint succeeds".to_string(),
            ));
        }
        if opts.disable_wal {
            self.unpersisted.store(true, Ordering::Release);
            self.stats.unlogged_writes.fetch_add(1, Ordering::Relaxed);
        } else {
            let frame = encode_frame(&batch.to_bytes(), self.algorithm, self.level)?;
            wal.append(&frame)?;
            if opts.sync || self.sync_writes {
                wal.sync()?;
            }
            self.stats.writes.fetch_add(1, Ordering::Relaxed);
            self.stats
                .wal_bytes
                .fetch_add(frame.len() as u64, Ordering::Relaxed);
        }

        {
            let mut guard = self.tables.write();
            for op in batch.ops() {
                if op.cf() == ColumnFamily::Default {
                    self.cache.remove(op.key());
                }
            }
            Arc::make_mut(&mut *guard).apply_batch(batch);
        }

        if wal.size > self.checkpoint_threshold {
            // The batch itself is already durable
            if let Err(e) = self.checkpoint_locked(&mut wal) {
                warn!(error = %e, wal_size = wal.size, "Automatic checkpoint failed");
            }
        }
        Ok(())
    }

    fn cursor<'a>(&'a self, cf: ColumnFamily, opts: &ReadOptions<'a, StoreSnapshot>) -> LogCursor<'a> {
        match opts.snapshot {
            Some(snapshot) => LogCursor::new(self, Arc::clone(&snapshot.tables), cf, false),
            None => {
                let tables = Arc::clone(&*self.tables.read());
                LogCursor::new(self, tables, cf, opts.fill_cache)
            }
        }
    }

    fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            tables: Arc::clone(&*self.tables.read()),
            _guard: SnapshotGuard::new(Arc::clone(&self.snapshots)),
        }
    }

    fn approximate_len(&self, cf: ColumnFamily) -> u64 {
        self.tables.read().family(cf).len() as u64
    }

    fn property(&self, name: &str) -> Option<String> {
        let value = match name {
            PROP_NUM_KEYS => self.approximate_len(ColumnFamily::Default).to_string(),
            PROP_NUM_SNAPSHOTS => self.snapshots.load(Ordering::Relaxed).to_string(),
            PROP_MEM_SIZE => self.tables.read().size_bytes().to_string(),
            PROP_WAL_SIZE => self.wal.lock().size.to_string(),
            PROP_CACHE_USAGE => self.cache.stats().bytes.to_string(),
            PROP_CACHE_HIT_RATE => format!("{:.4}", self.cache.stats().hit_rate),
            PROP_STATS => self.render_stats(),
            _ => return None,
        };
        Some(value)
    }

    fn property_names(&self) -> Vec<&'static str> {
        PROPERTIES.to_vec()
    }

    fn flush(&self, wait: bool) -> Result<()> {
        if wait {
            self.checkpoint().map(|_| ())
        } else {
            self.wal.lock().sync()
        }
    }

    fn compact_range(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<()> {
        // Tables hold no dead versions; compaction only folds the log away.
        let size = self.checkpoint()?;
        debug!(
            bounded = start.is_some() || end.is_some(),
            checkpoint_size = size,
            "Compaction finished"
        );
        Ok(())
    }

    fn create_backup(&self, root: &Path) -> Result<BackupInfo> {
        let tables = Arc::clone(&*self.tables.read());
        backup::create(root, &tables, self.algorithm, self.level)
    }

    fn purge_old_backups(&self, root: &Path, keep: usize) -> Result<usize> {
        backup::purge(root, keep)
    }

    fn backup_info(&self, root: &Path) -> Result<Vec<BackupInfo>> {
        backup::list(root)
    }

    fn verify_backup(&self, root: &Path, id: u32) -> Result<()> {
        backup::verify(root, id)
    }
}

impl Drop for LogStore {
    fn drop(&mut self) {
        if self.unpersisted.load(Ordering::Acquire) {
            if let Err(e) = self.checkpoint() {
                warn!(path = ?self.path, error = %e, "Final checkpoint failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &Path) -> Result<LogStore> {
        LogStore::open(&Options::default(), dir)
    }

    fn put(store: &LogStore, key: &[u8], value: &[u8]) -> Result<()> {
        store.put(ColumnFamily::Default, key, value, &WriteOptions::default())
    }

    fn get(store: &LogStore, key: &[u8]) -> Result<Option<Vec<u8>>> {
        store.get(ColumnFamily::Default, key, &ReadOptions::new())
    }

    #[test]
    fn test_put_get_delete() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open(dir.path())?;

        put(&store, b"key", b"value")?;
        assert_eq!(get(&store, b"key")?, Some(b"value".to_vec()));

        store.delete(ColumnFamily::Default, b"key", &WriteOptions::default())?;
        assert_eq!(get(&store, b"key")?, None);
        Ok(())
    }

    #[test]
    fn test_column_families_are_separate() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open(dir.path())?;
        store.put(ColumnFamily::Replication, b"seq", b"1", &WriteOptions::default())?;

        assert_eq!(get(&store, b"seq")?, None);
        assert_eq!(
            store.get(ColumnFamily::Replication, b"seq", &ReadOptions::new())?,
            Some(b"1".to_vec())
        );
        assert_eq!(store.approximate_len(ColumnFamily::Default), 0);
        Ok(())
    }

    #[test]
    fn test_recovery_from_wal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let store = open(dir.path())?;
            put(&store, b"a", b"1")?;
            put(&store, b"b", b"2")?;
            store.delete(ColumnFamily::Default, b"a", &WriteOptions::default())?;
        }

        let store = open(dir.path())?;
        assert_eq!(get(&store, b"a")?, None);
        assert_eq!(get(&store, b"b")?, Some(b"2".to_vec()));
        Ok(())
    }

    #[test]
    fn test_torn_wal_tail_is_discarded() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let store = open(dir.path())?;
            put(&store, b"kept", b"1")?;
            put(&store, b"torn", b"2")?;
        }
        let wal_path = dir.path().join(WAL_FILE);
        let len = fs::metadata(&wal_path)?.len();
        OpenOptions::new().write(true).open(&wal_path)?.set_len(len - 2)?;

        let store = open(dir.path())?;
        assert_eq!(get(&store, b"kept")?, Some(b"1".to_vec()));
        assert_eq!(get(&store, b"torn")?, None);

        // The recovered state was checkpointed; new writes survive reopen
        put(&store, b"after", b"3")?;
        drop(store);
        let store = open(dir.path())?;
        assert_eq!(get(&store, b"after")?, Some(b"3".to_vec()));
        assert_eq!(get(&store, b"kept")?, Some(b"1".to_vec()));
        Ok(())
    }

    #[test]
    fn test_unlogged_writes_persist_via_checkpoint() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let store = open(dir.path())?;
            store.put(ColumnFamily::Default, b"k", b"v", &WriteOptions::without_wal())?;
            store.flush(true)?;
        }
        let store = open(dir.path())?;
        assert_eq!(get(&store, b"k")?, Some(b"v".to_vec()));
        Ok(())
    }

    #[test]
    fn test_automatic_checkpoint() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let options = Options {
            write_buffer_size_mb: 1,
            compression: false,
            ..Options::default()
        };
        let store = LogStore::open(&options, dir.path())?;
        let value = vec![7u8; 64 * 1024];
        for i in 0..20u32 {
            put(&store, &i.to_be_bytes(), &value)?;
        }
        let wal_size: u64 = store.property(PROP_WAL_SIZE).and_then(|s| s.parse().ok()).unwrap_or(0);
        assert!(wal_size < options.write_buffer_size_bytes());
        assert!(dir.path().join(CHECKPOINT_FILE).exists());
        drop(store);

        let store = LogStore::open(&options, dir.path())?;
        assert_eq!(store.approximate_len(ColumnFamily::Default), 20);
        Ok(())
    }

    #[test]
    fn test_stale_wal_after_checkpoint_is_ignored() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let store = open(dir.path())?;
            put(&store, b"k", b"old")?;
        }
        let stale_wal = fs::read(dir.path().join(WAL_FILE))?;
        {
            let store = open(dir.path())?;
            put(&store, b"k", b"new")?;
            store.flush(true)?;
        }
        // Simulate a crash between checkpoint install and WAL reset
        fs::write(dir.path().join(WAL_FILE), stale_wal)?;

        let store = open(dir.path())?;
        assert_eq!(get(&store, b"k")?, Some(b"new".to_vec()));
        Ok(())
    }

    #[test]
    fn test_failed_checkpoint_keeps_current_wal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let blocker = dir.path().join("CHECKPOINT.tmp");
        {
            let store = open(dir.path())?;
            put(&store, b"a", b"1")?;
            // The checkpoint image cannot be created over a directory
            fs::create_dir(&blocker)?;
            assert!(store.checkpoint().is_err());
            assert!(!dir.path().join(WAL_STAGING_FILE).exists());

            put(&store, b"b", b"2")?;
        }
        fs::remove_dir(&blocker)?;

        let store = open(dir.path())?;
        assert_eq!(get(&store, b"a")?, Some(b"1".to_vec()));
        assert_eq!(get(&store, b"b")?, Some(b"2".to_vec()));
        Ok(())
    }

    #[test]
    fn test_unstageable_wal_aborts_checkpoint() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let blocker = dir.path().join(WAL_STAGING_FILE);
        {
            let store = open(dir.path())?;
            put(&store, b"a", b"1")?;
            fs::create_dir(&blocker)?;
            assert!(store.checkpoint().is_err());
            assert!(!dir.path().join(CHECKPOINT_FILE).exists());

            put(&store, b"b", b"2")?;
        }
        fs::remove_dir(&blocker)?;

        let store = open(dir.path())?;
        assert_eq!(get(&store, b"a")?, Some(b"1".to_vec()));
        assert_eq!(get(&store, b"b")?, Some(b"2".to_vec()));
        Ok(())
    }

    #[test]
    fn test_writes_refused_until_checkpoint_succeeds() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open(dir.path())?;
        put(&store, b"a", b"1")?;

        // State left by a checkpoint whose WAL rename failed
        store.refuse_writes();
        assert!(put(&store, b"b", b"2").is_err());
        assert_eq!(get(&store, b"b")?, None);

        store.checkpoint()?;
        assert!(!dir.path().join(WAL_STAGING_FILE).exists());
        put(&store, b"b", b"2")?;
        drop(store);

        let store = open(dir.path())?;
        assert_eq!(get(&store, b"a")?, Some(b"1".to_vec()));
        assert_eq!(get(&store, b"b")?, Some(b"2".to_vec()));
        Ok(())
    }

    #[test]
    fn test_leftover_staged_wal_is_removed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let store = open(dir.path())?;
            put(&store, b"a", b"1")?;
        }
        fs::write(dir.path().join(WAL_STAGING_FILE), b"partial")?;

        let store = open(dir.path())?;
        assert!(!dir.path().join(WAL_STAGING_FILE).exists());
        assert_eq!(get(&store, b"a")?, Some(b"1".to_vec()));
        Ok(())
    }

    #[test]
    fn test_snapshot_isolation() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open(dir.path())?;
        put(&store, b"k", b"v1")?;

        let snapshot = store.snapshot();
        assert_eq!(store.property(PROP_NUM_SNAPSHOTS).as_deref(), Some("1"));
        put(&store, b"k", b"v2")?;
        put(&store, b"other", b"x")?;

        let at_snapshot = ReadOptions::new().snapshot(Some(&snapshot));
        assert_eq!(
            store.get(ColumnFamily::Default, b"k", &at_snapshot)?,
            Some(b"v1".to_vec())
        );
        assert_eq!(snapshot.len(ColumnFamily::Default), 1);
        assert_eq!(get(&store, b"k")?, Some(b"v2".to_vec()));

        drop(snapshot);
        assert_eq!(store.property(PROP_NUM_SNAPSHOTS).as_deref(), Some("0"));
        Ok(())
    }

    #[test]
    fn test_point_read_fill_cache() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open(dir.path())?;
        put(&store, b"k", b"v")?;

        store.get(ColumnFamily::Default, b"k", &ReadOptions::no_fill())?;
        assert!(!store.cache.contains(b"k"));

        store.get(ColumnFamily::Default, b"k", &ReadOptions::new())?;
        assert!(store.cache.contains(b"k"));

        // Writes invalidate
        put(&store, b"k", b"v2")?;
        assert!(!store.cache.contains(b"k"));
        assert_eq!(get(&store, b"k")?, Some(b"v2".to_vec()));
        Ok(())
    }

    #[test]
    fn test_missing_dir_without_create() {
        let options = Options {
            create_if_missing: false,
            ..Options::default()
        };
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(LogStore::open(&options, &dir.path().join("absent")).is_err());
    }

    #[test]
    fn test_properties() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open(dir.path())?;
        put(&store, b"k", b"v")?;
        for name in store.property_names() {
            assert!(store.property(name).is_some(), "missing {}", name);
        }
        assert_eq!(store.property(PROP_NUM_KEYS).as_deref(), Some("1"));
        assert!(store.property("photonkv.nope").is_none());
        Ok(())
    }

    #[test]
    fn test_backup_through_store() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open(&dir.path().join("data"))?;
        put(&store, b"k", b"v")?;

        let root = dir.path().join("backup");
        let info = store.create_backup(&root)?;
        store.verify_backup(&root, info.id)?;
        store.create_backup(&root)?;
        assert_eq!(store.purge_old_backups(&root, 1)?, 1);
        assert_eq!(store.backup_info(&root)?.len(), 1);
        Ok(())
    }
}
