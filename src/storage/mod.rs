//! Storage layer
//!
//! # Architecture
//!
//! PhotonKV treats the ordered byte store underneath it as a collaborator
//! reached only through [`OrderedStore`]:
//!
//! ```text
//! OrderedStore
//!   ├─→ point get (per column family, optional snapshot)
//!   ├─→ atomic WriteBatch (optional WAL, optional sync)
//!   ├─→ StoreCursor (seek / next / prev, pinned to a snapshot)
//!   ├─→ properties, approximate key count
//!   └─→ flush, compaction, backups
//! ```
//!
//! The codec, iterator, committer and reclaimer are written once against
//! this trait. [`DefaultStore`] names the implementation compiled in.
//!
//! ## Implementation
//!
//! The default implementation is [`LogStore`]:
//! - **Ordered tables** in memory, copy-on-write for snapshots
//! - **Write-ahead log** of atomic batches, zstd-compressed records
//! - **Checkpoints** replacing the log once it grows past the write buffer
//! - **LRU block cache** honoring `fill_cache`

pub mod batch;
pub mod log;

pub use batch::{BatchOp, WriteBatch};
pub use log::{BackupInfo, LogStore, StoreSnapshot};

use crate::config::Options;
use crate::error::Result;
use std::path::Path;

/// Default storage backend
pub type DefaultStore = LogStore;

/// Independent ordered keyspaces inside one store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnFamily {
    /// All typed records (meta, items, score index, delete markers).
    Default,
    /// Private family holding the replication sequence marker.
    Replication,
}

impl ColumnFamily {
    pub const ALL: [ColumnFamily; 2] = [ColumnFamily::Default, ColumnFamily::Replication];

    pub fn id(self) -> u8 {
        match self {
            ColumnFamily::Default => 0,
            ColumnFamily::Replication => 1,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(ColumnFamily::Default),
            1 => Some(ColumnFamily::Replication),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ColumnFamily::Default => "default",
            ColumnFamily::Replication => "replication",
        }
    }
}

/// Read options
///
/// `fill_cache = false` keeps large scans from evicting the hot set.
pub struct ReadOptions<'a, Snap> {
    pub fill_cache: bool,
    pub snapshot: Option<&'a Snap>,
}

impl<'a, Snap> ReadOptions<'a, Snap> {
    /// Read latest data, populating the block cache.
    pub fn new() -> Self {
        Self {
            fill_cache: true,
            snapshot: None,
        }
    }

    /// Read latest data without touching the block cache.
    pub fn no_fill() -> Self {
        Self {
            fill_cache: false,
            snapshot: None,
        }
    }

    pub fn fill_cache(mut self, fill: bool) -> Self {
        self.fill_cache = fill;
        self
    }

    pub fn snapshot(mut self, snapshot: Option<&'a Snap>) -> Self {
        self.snapshot = snapshot;
        self
    }
}

impl<'a, Snap> Default for ReadOptions<'a, Snap> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, Snap> Clone for ReadOptions<'a, Snap> {
    fn clone(&self) -> Self {
        Self {
            fill_cache: self.fill_cache,
            snapshot: self.snapshot,
        }
    }
}

/// Write options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Skip the write-ahead log; the batch is durable only after the next
    /// checkpoint.
    pub disable_wal: bool,
    /// fsync the log before returning.
    pub sync: bool,
}

impl WriteOptions {
    pub fn without_wal() -> Self {
        Self {
            disable_wal: true,
            sync: false,
        }
    }
}

/// Positioned cursor over one column family.
///
/// Mirrors the usual LSM iterator surface: position with `seek*`, check
/// `valid`, read `key`/`value`, step with `next`/`prev`. `key` and `value`
/// may only be called while `valid()` is true.
pub trait StoreCursor {
    fn valid(&self) -> bool;
    fn key(&self) -> &[u8];
    fn value(&self) -> &[u8];

    /// Position at the first key >= `target`.
    fn seek(&mut self, target: &[u8]);
    fn seek_to_first(&mut self);
    fn seek_to_last(&mut self);
    fn next(&mut self);
    fn prev(&mut self);

    /// Error that invalidated the cursor, if any.
    fn status(&self) -> Result<()>;
}

/// Storage engine trait
pub trait OrderedStore: Send + Sync + Sized + 'static {
    /// Point-in-time read view. Released when dropped.
    type Snapshot: Send + Sync;
    type Cursor<'a>: StoreCursor
    where
        Self: 'a;

    /// Open (or create) the store rooted at `path`.
    fn open(options: &Options, path: &Path) -> Result<Self>;

    fn get(
        &self,
        cf: ColumnFamily,
        key: &[u8],
        opts: &ReadOptions<'_, Self::Snapshot>,
    ) -> Result<Option<Vec<u8>>>;

    /// Apply every operation of `batch` atomically.
    fn write(&self, batch: WriteBatch, opts: &WriteOptions) -> Result<()>;

    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8], opts: &WriteOptions) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.put_cf(cf, key, value);
        self.write(batch, opts)
    }

    fn delete(&self, cf: ColumnFamily, key: &[u8], opts: &WriteOptions) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.delete_cf(cf, key);
        self.write(batch, opts)
    }

    /// Unpositioned cursor; reads come from `opts.snapshot` or, without
    /// one, from an implicit snapshot taken now.
    fn cursor<'a>(
        &'a self,
        cf: ColumnFamily,
        opts: &ReadOptions<'a, Self::Snapshot>,
    ) -> Self::Cursor<'a>;

    fn snapshot(&self) -> Self::Snapshot;

    /// Estimated number of keys in a family.
    fn approximate_len(&self, cf: ColumnFamily) -> u64;

    /// Named diagnostic property.
    fn property(&self, name: &str) -> Option<String>;

    /// Names accepted by [`OrderedStore::property`].
    fn property_names(&self) -> Vec<&'static str>;

    /// Persist buffered writes. `wait = false` may return before they are
    /// fully persisted.
    fn flush(&self, wait: bool) -> Result<()>;

    /// Compact the given range (`None` = unbounded).
    fn compact_range(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<()>;

    /// Write a point-in-time backup under `root`.
    fn create_backup(&self, root: &Path) -> Result<BackupInfo>;

    /// Delete all but the newest `keep` backups; returns how many were removed.
    fn purge_old_backups(&self, root: &Path, keep: usize) -> Result<usize>;

    /// Backups under `root`, oldest first.
    fn backup_info(&self, root: &Path) -> Result<Vec<BackupInfo>>;

    fn verify_backup(&self, root: &Path, id: u32) -> Result<()>;
}
