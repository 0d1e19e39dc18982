// PhotonKV - Rust Implementation
// A versioned key-value engine layered on an ordered byte store

#![warn(rust_2018_idioms)]

//! # PhotonKV
//!
//! PhotonKV layers a richer data model on top of a plain ordered byte store:
//!
//! ```text
//! Engine (facade, lifecycle)
//!   ├─→ Key Codec        meta / item / zscore / delete-marker keys
//!   ├─→ Range Iterator   bounded forward/backward scans over a cursor
//!   ├─→ Batch Committer  atomic batches + replication sequence marker
//!   └─→ Reclaimer        background sweep of superseded versions
//!        │
//!        ▼
//! OrderedStore (LogStore by default)
//! ```
//!
//! Logical keys are never stored directly. Every collection has a meta
//! record carrying a 16-bit version; element records embed the version they
//! belong to, so deleting a collection only has to bump the meta record and
//! drop a delete marker. The reclaimer removes the old elements later.

pub mod codec;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod storage;

// Re-exports for convenience
pub use config::Options;
pub use engine::{Context, Engine, RangeIterator, SeqMarker};
pub use storage::{DefaultStore, OrderedStore};

/// PhotonKV error types
pub mod error {
    use crate::engine::SeqMarker;
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Storage error: {0}")]
        Storage(String),

        #[error("IO error: {0}")]
        Io(#[from] std::io::Error),

        #[error("Malformed key: {0}")]
        MalformedKey(String),

        #[error("Malformed value: {0}")]
        MalformedValue(String),

        #[error("Corruption: {0}")]
        Corruption(String),

        #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
        WrongType,

        #[error("Key too long: {0} bytes")]
        KeyTooLong(usize),

        #[error("Replication sequence regression: current {current} < last committed {last}")]
        SequenceRegression { current: SeqMarker, last: SeqMarker },

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Backup error: {0}")]
        Backup(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),
    }

    impl Error {
        /// On-disk data could not be decoded.
        pub fn is_corruption(&self) -> bool {
            matches!(
                self,
                Error::MalformedKey(_) | Error::MalformedValue(_) | Error::Corruption(_)
            )
        }

        /// Continuing after this error risks corrupting replication order.
        pub fn is_fatal(&self) -> bool {
            matches!(self, Error::SequenceRegression { .. })
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

pub use error::{Error, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Render bytes for log output (printable ASCII kept, the rest escaped).
pub(crate) fn escape(bytes: &[u8]) -> String {
    bytes
        .iter()
        .flat_map(|b| std::ascii::escape_default(*b))
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_binary_key() {
        assert_eq!(escape(b"M\x00\x03abc"), "M\\x00\\x03abc");
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::MalformedKey("short".into()).is_corruption());
        assert!(!Error::WrongType.is_corruption());
        let err = Error::SequenceRegression {
            current: SeqMarker::new(1, 1),
            last: SeqMarker::new(2, 0),
        };
        assert!(err.is_fatal());
    }
}
