//! Cursor over a pinned table image

use super::{LogStore, Tables};
use crate::error::Result;
use crate::storage::{ColumnFamily, StoreCursor};
use std::ops::Bound;
use std::sync::Arc;

/// Cursor over one column family of a pinned [`Tables`] image.
///
/// Writes made after the cursor was created are never visible to it.
pub struct LogCursor<'a> {
    store: &'a LogStore,
    tables: Arc<Tables>,
    cf: ColumnFamily,
    fill_cache: bool,
    current: Option<(Vec<u8>, Vec<u8>)>,
}

impl<'a> LogCursor<'a> {
    pub(super) fn new(
        store: &'a LogStore,
        tables: Arc<Tables>,
        cf: ColumnFamily,
        fill_cache: bool,
    ) -> Self {
        Self {
            store,
            tables,
            cf,
            fill_cache,
            current: None,
        }
    }

    fn set(&mut self, entry: Option<(&Vec<u8>, &Vec<u8>)>) {
        self.current = entry.map(|(k, v)| (k.clone(), v.clone()));
        if self.fill_cache && self.cf == ColumnFamily::Default {
            if let Some((key, value)) = &self.current {
                self.store.fill_from_cursor(&self.tables, key, value);
            }
        }
    }
}

impl StoreCursor for LogCursor<'_> {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        self.current.as_ref().map(|(k, _)| k.as_slice()).unwrap_or_default()
    }

    fn value(&self) -> &[u8] {
        self.current.as_ref().map(|(_, v)| v.as_slice()).unwrap_or_default()
    }

    fn seek(&mut self, target: &[u8]) {
        let tables = Arc::clone(&self.tables);
        let entry = tables
            .family(self.cf)
            .range::<[u8], _>((Bound::Included(target), Bound::Unbounded))
            .next();
        self.set(entry);
    }

    fn seek_to_first(&mut self) {
        let tables = Arc::clone(&self.tables);
        self.set(tables.family(self.cf).iter().next());
    }

    fn seek_to_last(&mut self) {
        let tables = Arc::clone(&self.tables);
        self.set(tables.family(self.cf).iter().next_back());
    }

    fn next(&mut self) {
        let Some((key, _)) = self.current.take() else {
            return;
        };
        let tables = Arc::clone(&self.tables);
        let entry = tables
            .family(self.cf)
            .range::<[u8], _>((Bound::Excluded(key.as_slice()), Bound::Unbounded))
            .next();
        self.set(entry);
    }

    fn prev(&mut self) {
        let Some((key, _)) = self.current.take() else {
            return;
        };
        let tables = Arc::clone(&self.tables);
        let entry = tables
            .family(self.cf)
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key.as_slice())))
            .next_back();
        self.set(entry);
    }

    fn status(&self) -> Result<()> {
        Ok(())
    }
}
