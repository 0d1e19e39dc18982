//! Replication context and batch committer
//!
//! Every write that must keep replication ordering goes through
//! [`commit_batch`]. For the first batch of a replicated segment the
//! committer checks that the sequence did not move backwards and stores the
//! sequence marker in the private column family inside the same atomic
//! batch, so the persisted offset can never disagree with the data.

use crate::error::{Error, Result};
use crate::metrics;
use crate::storage::{ColumnFamily, OrderedStore, ReadOptions, WriteBatch, WriteOptions};
use std::fmt;
use tracing::error;

/// Fixed key of the sequence marker in [`ColumnFamily::Replication`].
pub const SEQ_KEY: &[u8] = b"replication_seq";

const SEQ_LEN: usize = 16;

/// Position in a replication stream, ordered by (timestamp, id).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeqMarker {
    pub timestamp: u64,
    pub id: u64,
}

impl SeqMarker {
    pub fn new(timestamp: u64, id: u64) -> Self {
        Self { timestamp, id }
    }

    pub fn encode(&self) -> [u8; SEQ_LEN] {
        let mut buf = [0u8; SEQ_LEN];
        buf[..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..].copy_from_slice(&self.id.to_be_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != SEQ_LEN {
            return Err(Error::MalformedValue(format!(
                "sequence marker is {} bytes, expected {}",
                bytes.len(),
                SEQ_LEN
            )));
        }
        let mut timestamp = [0u8; 8];
        let mut id = [0u8; 8];
        timestamp.copy_from_slice(&bytes[..8]);
        id.copy_from_slice(&bytes[8..]);
        Ok(Self {
            timestamp: u64::from_be_bytes(timestamp),
            id: u64::from_be_bytes(id),
        })
    }
}

impl fmt::Display for SeqMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.timestamp, self.id)
    }
}

/// Per-connection replication state threaded through every commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    /// The connection is a replica feed.
    pub repl_link: bool,
    pub current_seq: SeqMarker,
    pub last_seq: SeqMarker,
    /// Next commit is the first of its segment.
    pub first_batch: bool,
}

impl Context {
    /// Context of an ordinary client connection.
    pub fn local() -> Self {
        Self::default()
    }

    /// Context of a replica feed that last committed `last_seq`.
    pub fn replica(last_seq: SeqMarker) -> Self {
        Self {
            repl_link: true,
            current_seq: last_seq,
            last_seq,
            first_batch: true,
        }
    }

    /// Start a new segment at `seq`; the next commit is checked and stamped.
    pub fn begin_segment(&mut self, seq: SeqMarker) {
        self.current_seq = seq;
        self.first_batch = true;
    }
}

/// Apply `batch` atomically, stamping the replication marker if due.
///
/// The context only advances after the store accepted the batch; a failed
/// write leaves it untouched so the caller can retry the whole operation.
pub fn commit_batch<S: OrderedStore>(
    store: &S,
    ctx: &mut Context,
    mut batch: WriteBatch,
    opts: &WriteOptions,
) -> Result<()> {
    let stamp = ctx.repl_link && ctx.first_batch;
    if stamp {
        if ctx.current_seq < ctx.last_seq {
            error!(
                current = %ctx.current_seq,
                last = %ctx.last_seq,
                fatal = true,
                "Replication sequence went backwards"
            );
            metrics::record_sequence_regression();
            return Err(Error::SequenceRegression {
                current: ctx.current_seq,
                last: ctx.last_seq,
            });
        }
        batch.put_cf(ColumnFamily::Replication, SEQ_KEY, &ctx.current_seq.encode());
    }

    store.write(batch, opts)?;
    metrics::record_commit(ctx.repl_link);

    if ctx.repl_link {
        ctx.last_seq = ctx.current_seq;
        ctx.first_batch = false;
    }
    Ok(())
}

/// Sequence marker persisted by the last stamped commit, if any.
pub fn last_replicated_seq<S: OrderedStore>(store: &S) -> Result<Option<SeqMarker>> {
    store
        .get(ColumnFamily::Replication, SEQ_KEY, &ReadOptions::no_fill())?
        .map(|raw| {
            SeqMarker::decode(&raw).inspect_err(|_| metrics::record_corruption("sequence"))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::storage::LogStore;

    fn open_store() -> Result<(tempfile::TempDir, LogStore)> {
        let dir = tempfile::tempdir()?;
        let store = LogStore::open(&Options::default(), dir.path())?;
        Ok((dir, store))
    }

    #[test]
    fn test_marker_ordering() {
        assert!(SeqMarker::new(1, 9) < SeqMarker::new(2, 0));
        assert!(SeqMarker::new(2, 1) < SeqMarker::new(2, 2));
        assert_eq!(SeqMarker::new(5, 6).to_string(), "5|6");
    }

    #[test]
    fn test_marker_codec() -> Result<()> {
        let marker = SeqMarker::new(1_700_000_000, 42);
        assert_eq!(SeqMarker::decode(&marker.encode())?, marker);
        assert!(SeqMarker::decode(b"short").is_err());
        Ok(())
    }

    #[test]
    fn test_local_commit_writes_no_marker() -> Result<()> {
        let (_dir, store) = open_store()?;
        let mut ctx = Context::local();
        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v");

        commit_batch(&store, &mut ctx, batch, &WriteOptions::default())?;
        assert_eq!(last_replicated_seq(&store)?, None);
        assert_eq!(ctx, Context::local());
        Ok(())
    }

    #[test]
    fn test_first_batch_stamps_marker() -> Result<()> {
        let (_dir, store) = open_store()?;
        let mut ctx = Context::replica(SeqMarker::new(1, 1));
        ctx.begin_segment(SeqMarker::new(1, 2));

        commit_batch(&store, &mut ctx, WriteBatch::new(), &WriteOptions::default())?;
        assert_eq!(last_replicated_seq(&store)?, Some(SeqMarker::new(1, 2)));
        assert_eq!(ctx.last_seq, SeqMarker::new(1, 2));
        assert!(!ctx.first_batch);

        // Later batches of the segment are not stamped again
        ctx.current_seq = SeqMarker::new(1, 3);
        commit_batch(&store, &mut ctx, WriteBatch::new(), &WriteOptions::default())?;
        assert_eq!(last_replicated_seq(&store)?, Some(SeqMarker::new(1, 2)));
        assert_eq!(ctx.last_seq, SeqMarker::new(1, 3));
        Ok(())
    }

    #[test]
    fn test_regression_rejected_without_writing() -> Result<()> {
        let (_dir, store) = open_store()?;
        let mut ctx = Context::replica(SeqMarker::new(5, 0));
        ctx.begin_segment(SeqMarker::new(4, 9));
        let mut batch = WriteBatch::new();
        batch.put(b"k", b"v");

        let err = commit_batch(&store, &mut ctx, batch, &WriteOptions::default())
            .expect_err("regression must be rejected");
        assert!(err.is_fatal());
        assert_eq!(store.get(ColumnFamily::Default, b"k", &ReadOptions::new())?, None);
        assert_eq!(last_replicated_seq(&store)?, None);
        assert!(ctx.first_batch);
        Ok(())
    }
}
