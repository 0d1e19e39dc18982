//! Versioned collection access
//!
//! These are the building blocks a type implementation (hash, set, list,
//! sorted set, string) uses to stay consistent with lazy deletion:
//!
//! - writes resolve the live version under the key lock and stage element
//!   records plus the meta record into one committed batch;
//! - reads consult the meta record first and only ever look at records of
//!   its live version, so superseded elements waiting for the reclaimer are
//!   invisible;
//! - `del` supersedes the meta record and leaves a delete marker.

use super::iterator::RangeIterator;
use super::replication::{commit_batch, Context};
use super::Engine;
use crate::codec::{
    encode_delete_key, encode_item_key, encode_item_prefix, encode_meta_key, encode_zscore_key,
    encode_zscore_prefix, prefix_end, DataType, ItemKey, MetaValue, ZScoreKey,
};
use crate::error::{Error, Result};
use crate::storage::{ColumnFamily, OrderedStore, ReadOptions, WriteBatch, WriteOptions};
use crate::{escape, metrics};
use parking_lot::MutexGuard;
use std::collections::HashMap;
use tracing::error;

fn encode_score_value(score: f64) -> [u8; 8] {
    score.to_bits().to_be_bytes()
}

fn decode_score_value(raw: &[u8]) -> Result<f64> {
    let bytes: [u8; 8] = raw.try_into().map_err(|_| {
        Error::MalformedValue(format!("score value is {} bytes, expected 8", raw.len()))
    })?;
    Ok(f64::from_bits(u64::from_be_bytes(bytes)))
}

/// Staged mutation of one collection, holding its key lock until commit.
pub struct CollectionWrite<'e, S: OrderedStore> {
    engine: &'e Engine<S>,
    _guard: MutexGuard<'e, ()>,
    key: Vec<u8>,
    data_type: DataType,
    version: u16,
    count: u64,
    /// Item key -> value after the staged operations (`None` = removed).
    staged: HashMap<Vec<u8>, Option<Vec<u8>>>,
    batch: WriteBatch,
}

impl<'e, S: OrderedStore> CollectionWrite<'e, S> {
    /// Version the staged records are written under.
    pub fn version(&self) -> u16 {
        self.version
    }

    /// Element count after the staged operations.
    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn current(&self, item_key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(staged) = self.staged.get(item_key) {
            return Ok(staged.clone());
        }
        self.engine
            .inner
            .store
            .get(ColumnFamily::Default, item_key, &ReadOptions::new())
    }

    fn stage_put(&mut self, item_key: Vec<u8>, value: &[u8]) {
        self.batch.put(&item_key, value);
        self.staged.insert(item_key, Some(value.to_vec()));
    }

    fn stage_delete(&mut self, item_key: Vec<u8>) {
        self.batch.delete(&item_key);
        self.staged.insert(item_key, None);
    }

    /// Set `field`; returns true if it is a new element.
    pub fn put_item(&mut self, field: &[u8], value: &[u8]) -> Result<bool> {
        let item_key = encode_item_key(&self.key, field, self.version)?;
        let added = self.current(&item_key)?.is_none();
        self.stage_put(item_key, value);
        if added {
            self.count += 1;
        }
        Ok(added)
    }

    /// Remove `field`; returns true if it existed.
    pub fn remove_item(&mut self, field: &[u8]) -> Result<bool> {
        let item_key = encode_item_key(&self.key, field, self.version)?;
        if self.current(&item_key)?.is_none() {
            return Ok(false);
        }
        self.stage_delete(item_key);
        self.count = self.count.saturating_sub(1);
        Ok(true)
    }

    /// Set the score of `member`, replacing its index record if the score
    /// changed. Returns true if it is a new member.
    pub fn put_scored(&mut self, member: &[u8], score: f64) -> Result<bool> {
        let item_key = encode_item_key(&self.key, member, self.version)?;
        let zscore_key = encode_zscore_key(&self.key, member, score, self.version)?;

        let previous = self.current(&item_key)?;
        if let Some(raw) = &previous {
            let old_score = decode_score_value(raw)?;
            let old_key = encode_zscore_key(&self.key, member, old_score, self.version)?;
            if old_key != zscore_key {
                self.stage_delete(old_key);
            }
        } else {
            self.count += 1;
        }

        self.stage_put(item_key, &encode_score_value(score));
        self.stage_put(zscore_key, b"");
        Ok(previous.is_none())
    }

    /// Remove `member` and its index record; returns true if it existed.
    pub fn remove_scored(&mut self, member: &[u8]) -> Result<bool> {
        let item_key = encode_item_key(&self.key, member, self.version)?;
        let Some(raw) = self.current(&item_key)? else {
            return Ok(false);
        };
        let score = decode_score_value(&raw)?;
        let zscore_key = encode_zscore_key(&self.key, member, score, self.version)?;
        self.stage_delete(zscore_key);
        self.stage_delete(item_key);
        self.count = self.count.saturating_sub(1);
        Ok(true)
    }

    /// Write the meta record and every staged record in one batch.
    ///
    /// An emptied collection keeps its version as a deleted meta record, so
    /// the next incarnation never reuses a version still awaiting reclaim.
    pub fn commit(mut self, ctx: &mut Context) -> Result<u64> {
        let meta = if self.count == 0 {
            MetaValue {
                data_type: self.data_type,
                version: self.version,
                deleted: true,
                payload: Vec::new(),
            }
        } else {
            MetaValue::collection(self.data_type, self.version, self.count)
        };
        self.batch.put(&encode_meta_key(&self.key)?, &meta.encode());

        let batch = std::mem::take(&mut self.batch);
        commit_batch(&self.engine.inner.store, ctx, batch, &WriteOptions::default())?;
        Ok(self.count)
    }
}

impl<S: OrderedStore> Engine<S> {
    /// Decoded meta record of `key`, live or not.
    pub fn get_meta(&self, key: &[u8]) -> Result<Option<MetaValue>> {
        let meta_key = encode_meta_key(key)?;
        let Some(raw) = self
            .inner
            .store
            .get(ColumnFamily::Default, &meta_key, &ReadOptions::new())?
        else {
            return Ok(None);
        };
        MetaValue::decode(&raw).map(Some).inspect_err(|e| {
            error!(key = %escape(key), error = %e, fatal = true, "Undecodable meta record");
            metrics::record_corruption("meta");
        })
    }

    /// Live meta record of `key` if it holds `data_type`.
    fn live_meta(&self, key: &[u8], data_type: DataType) -> Result<Option<MetaValue>> {
        match self.get_meta(key)? {
            Some(meta) if meta.is_live() && meta.data_type != data_type => Err(Error::WrongType),
            Some(meta) if meta.is_live() => Ok(Some(meta)),
            _ => Ok(None),
        }
    }

    /// Start a staged write of the collection at `key`.
    ///
    /// A new key starts at version 1; a deleted key continues at the
    /// version its tombstone carries.
    ///
    /// The returned writer holds the key's lock stripe until it is committed
    /// or dropped. Do not call other engine operations on other keys while
    /// holding it: a key sharing the stripe would deadlock.
    pub fn write_collection(&self, key: &[u8], data_type: DataType) -> Result<CollectionWrite<'_, S>> {
        if !data_type.is_collection() {
            return Err(Error::InvalidArgument(format!(
                "{:?} is not a collection type",
                data_type
            )));
        }
        let guard = self.inner.locks.lock(key);
        let (version, count) = match self.get_meta(key)? {
            None => (1, 0),
            Some(meta) if meta.deleted => (meta.version, 0),
            Some(meta) if meta.data_type != data_type => return Err(Error::WrongType),
            Some(meta) => (meta.version, meta.element_count()?),
        };

        Ok(CollectionWrite {
            engine: self,
            _guard: guard,
            key: key.to_vec(),
            data_type,
            version,
            count,
            staged: HashMap::new(),
            batch: WriteBatch::new(),
        })
    }

    /// Set a string value.
    pub fn put_string(&self, ctx: &mut Context, key: &[u8], value: &[u8]) -> Result<()> {
        let _guard = self.inner.locks.lock(key);
        let version = match self.get_meta(key)? {
            None => 1,
            Some(meta) if meta.deleted => meta.version,
            Some(meta) if meta.data_type != DataType::String => return Err(Error::WrongType),
            Some(meta) => meta.version,
        };
        let mut batch = WriteBatch::new();
        batch.put(&encode_meta_key(key)?, &MetaValue::string(version, value).encode());
        commit_batch(&self.inner.store, ctx, batch, &WriteOptions::default())
    }

    pub fn get_string(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .live_meta(key, DataType::String)?
            .map(|meta| meta.payload))
    }

    /// Element `field` of the live version of the collection at `key`.
    pub fn get_item(&self, key: &[u8], data_type: DataType, field: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(meta) = self.live_meta(key, data_type)? else {
            return Ok(None);
        };
        let item_key = encode_item_key(key, field, meta.version)?;
        self.inner
            .store
            .get(ColumnFamily::Default, &item_key, &ReadOptions::new())
    }

    /// Elements of the live version in field order, at most `limit`
    /// (negative = all).
    pub fn items(&self, key: &[u8], data_type: DataType, limit: i64) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let Some(meta) = self.live_meta(key, data_type)? else {
            return Ok(Vec::new());
        };
        let prefix = encode_item_prefix(key, meta.version)?;
        let end = prefix_end(&prefix).unwrap_or_default();
        let cursor = self
            .inner
            .store
            .cursor(ColumnFamily::Default, &ReadOptions::no_fill());
        let mut iter = RangeIterator::forward(cursor, &prefix, &end, limit);

        let mut items = Vec::new();
        while iter.advance() {
            let item = ItemKey::decode(iter.key()).inspect_err(|_| metrics::record_corruption("item"))?;
            items.push((item.field, iter.value().to_vec()));
        }
        iter.status()?;
        Ok(items)
    }

    /// Members of the live sorted set in (score, member) order.
    pub fn scored(&self, key: &[u8]) -> Result<Vec<(Vec<u8>, f64)>> {
        let Some(meta) = self.live_meta(key, DataType::ZSet)? else {
            return Ok(Vec::new());
        };
        let prefix = encode_zscore_prefix(key, meta.version)?;
        let end = prefix_end(&prefix).unwrap_or_default();
        let cursor = self
            .inner
            .store
            .cursor(ColumnFamily::Default, &ReadOptions::no_fill());
        let mut iter = RangeIterator::forward(cursor, &prefix, &end, -1);

        let mut members = Vec::new();
        while iter.advance() {
            let entry =
                ZScoreKey::decode(iter.key()).inspect_err(|_| metrics::record_corruption("zscore"))?;
            members.push((entry.member, entry.score));
        }
        iter.status()?;
        Ok(members)
    }

    /// Delete `key`. Returns whether a live value existed.
    ///
    /// Collections are superseded: the meta record moves to the next
    /// version with the delete flag set and a marker for the old version
    /// hands the elements to the reclaimer.
    pub fn del(&self, ctx: &mut Context, key: &[u8]) -> Result<bool> {
        let _guard = self.inner.locks.lock(key);
        let Some(meta) = self.get_meta(key)? else {
            return Ok(false);
        };
        if !meta.is_live() {
            return Ok(false);
        }

        let mut batch = WriteBatch::new();
        let meta_key = encode_meta_key(key)?;
        if meta.data_type.is_collection() {
            batch.put(&meta_key, &meta.superseded().encode());
            batch.put(&encode_delete_key(key, meta.version)?, b"");
        } else {
            // Strings own no element records; keep the version as a tombstone
            let tombstone = MetaValue {
                deleted: true,
                payload: Vec::new(),
                ..meta
            };
            batch.put(&meta_key, &tombstone.encode());
        }
        commit_batch(&self.inner.store, ctx, batch, &WriteOptions::default())?;
        Ok(true)
    }
}
