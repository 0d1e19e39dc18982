//! Bounded range iterator
//!
//! Wraps a store cursor with an exclusive end bound, a direction and an
//! item limit. Iteration is pull-based and cannot be restarted; once the
//! bound or limit is hit, or the cursor runs off the keyspace, it stays
//! exhausted.

use crate::error::Result;
use crate::storage::StoreCursor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// Range scan over a store cursor.
///
/// Use either the explicit [`advance`](Self::advance) / [`key`](Self::key) /
/// [`value`](Self::value) protocol, or the owned-pair [`Iterator`] impl.
pub struct RangeIterator<C> {
    cursor: C,
    end: Vec<u8>,
    direction: Direction,
    /// Items left to emit; `None` = unlimited.
    remaining: Option<u64>,
    started: bool,
    exhausted: bool,
}

/// `limit <= 0`: 0 means nothing, negative means unlimited.
fn remaining_from(limit: i64) -> Option<u64> {
    if limit < 0 {
        None
    } else {
        Some(limit as u64)
    }
}

impl<C: StoreCursor> RangeIterator<C> {
    /// Ascending scan of `[start, end)`; empty `start` = first key, empty
    /// `end` = no bound.
    pub fn forward(mut cursor: C, start: &[u8], end: &[u8], limit: i64) -> Self {
        if start.is_empty() {
            cursor.seek_to_first();
        } else {
            cursor.seek(start);
        }
        Self::positioned(cursor, end, limit, Direction::Forward)
    }

    /// Descending scan of `(end, start]`; empty `start` = last key, empty
    /// `end` = no bound.
    pub fn backward(mut cursor: C, start: &[u8], end: &[u8], limit: i64) -> Self {
        if start.is_empty() {
            cursor.seek_to_last();
        } else {
            cursor.seek(start);
            if !cursor.valid() {
                cursor.seek_to_last();
            } else if cursor.key() != start {
                cursor.prev();
            }
        }
        Self::positioned(cursor, end, limit, Direction::Backward)
    }

    fn positioned(cursor: C, end: &[u8], limit: i64, direction: Direction) -> Self {
        Self {
            cursor,
            end: end.to_vec(),
            direction,
            remaining: remaining_from(limit),
            started: false,
            exhausted: false,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Move to the next item. Returns false once exhausted; `key` and
    /// `value` are only meaningful after a `true`.
    pub fn advance(&mut self) -> bool {
        if self.exhausted {
            return false;
        }
        if self.remaining == Some(0) {
            self.exhausted = true;
            return false;
        }

        if self.started {
            match self.direction {
                Direction::Forward => self.cursor.next(),
                Direction::Backward => self.cursor.prev(),
            }
        } else {
            self.started = true;
        }

        if !self.cursor.valid() || self.past_end() {
            self.exhausted = true;
            return false;
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        true
    }

    fn past_end(&self) -> bool {
        if self.end.is_empty() {
            return false;
        }
        let key = self.cursor.key();
        match self.direction {
            Direction::Forward => key >= self.end.as_slice(),
            Direction::Backward => key <= self.end.as_slice(),
        }
    }

    pub fn key(&self) -> &[u8] {
        self.cursor.key()
    }

    pub fn value(&self) -> &[u8] {
        self.cursor.value()
    }

    /// Error that ended the scan early, if any.
    pub fn status(&self) -> Result<()> {
        self.cursor.status()
    }
}

impl<C: StoreCursor> Iterator for RangeIterator<C> {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.advance() {
            Some((self.key().to_vec(), self.value().to_vec()))
        } else {
            None
        }
    }
}
