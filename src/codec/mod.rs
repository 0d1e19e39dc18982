//! Key codec
//!
//! Every record PhotonKV writes lives in one ordered keyspace. A leading
//! tag byte separates the record families:
//!
//! ```text
//! M | len | key                                  → meta record
//! S | len | key | version | field                → collection element
//! z | len | key | version | score | member       → sorted-set score index
//! D | len | key | version                        → pending reclaim marker
//! ```
//!
//! `len` is the big-endian `u16` length of the logical key and `version`
//! is a big-endian `u16`, so all records of one (key, version) pair are
//! contiguous and sort by element (or by score, then member).

pub mod keys;
pub mod meta;

pub use keys::{
    decode_meta_key, encode_delete_key, encode_item_key, encode_item_prefix, encode_meta_key,
    encode_zscore_key, encode_zscore_prefix, prefix_end, DeleteKey, ItemKey, ZScoreKey,
    MAX_KEY_LEN,
};
pub use meta::{DataType, MetaValue};

/// Tag of meta records.
pub const META: u8 = b'M';
/// Tag of collection element records.
pub const ITEM: u8 = b'S';
/// Tag of sorted-set score index records.
pub const ZSCORE: u8 = b'z';
/// Tag of delete-task markers.
pub const DELETE: u8 = b'D';
