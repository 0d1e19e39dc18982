//! Atomic write batches
//!
//! A batch is an ordered list of puts and deletes applied all-or-nothing.
//! Later operations on the same key win.
//!
//! # Serialized form
//!
//! ```text
//! [count u32] then per op:
//!   [kind u8][cf u8][key len u32][key] ([value len u32][value] for puts)
//! ```

use super::ColumnFamily;
use crate::error::{Error, Result};
use bytes::{Buf, BufMut};

const OP_PUT: u8 = 0x01;
const OP_DELETE: u8 = 0x02;

/// A single batched operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put {
        cf: ColumnFamily,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: ColumnFamily,
        key: Vec<u8>,
    },
}

impl BatchOp {
    pub fn cf(&self) -> ColumnFamily {
        match self {
            BatchOp::Put { cf, .. } | BatchOp::Delete { cf, .. } => *cf,
        }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key, .. } => key,
        }
    }
}

/// A batch of updates applied atomically
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.put_cf(ColumnFamily::Default, key, value);
    }

    pub fn put_cf(&mut self, cf: ColumnFamily, key: &[u8], value: &[u8]) {
        self.ops.push(BatchOp::Put {
            cf,
            key: key.to_vec(),
            value: value.to_vec(),
        });
    }

    pub fn delete(&mut self, key: &[u8]) {
        self.delete_cf(ColumnFamily::Default, key);
    }

    pub fn delete_cf(&mut self, cf: ColumnFamily, key: &[u8]) {
        self.ops.push(BatchOp::Delete {
            cf,
            key: key.to_vec(),
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }

    /// Approximate encoded size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.ops
            .iter()
            .map(|op| match op {
                BatchOp::Put { key, value, .. } => 10 + key.len() + 4 + value.len(),
                BatchOp::Delete { key, .. } => 6 + key.len(),
            })
            .sum::<usize>()
            + 4
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size_bytes());
        buf.put_u32(self.ops.len() as u32);
        for op in &self.ops {
            match op {
                BatchOp::Put { cf, key, value } => {
                    buf.put_u8(OP_PUT);
                    buf.put_u8(cf.id());
                    buf.put_u32(key.len() as u32);
                    buf.put_slice(key);
                    buf.put_u32(value.len() as u32);
                    buf.put_slice(value);
                }
                BatchOp::Delete { cf, key } => {
                    buf.put_u8(OP_DELETE);
                    buf.put_u8(cf.id());
                    buf.put_u32(key.len() as u32);
                    buf.put_slice(key);
                }
            }
        }
        buf
    }

    pub fn from_bytes(mut bytes: &[u8]) -> Result<Self> {
        let count = read_u32(&mut bytes)? as usize;
        // every op takes at least 6 bytes, so a huge count is corruption
        if count > bytes.len() / 6 + 1 {
            return Err(Error::Corruption(format!(
                "batch claims {} ops in {} bytes",
                count,
                bytes.len()
            )));
        }
        let mut ops = Vec::with_capacity(count);
        for _ in 0..count {
            if bytes.remaining() < 2 {
                return Err(Error::Corruption("truncated batch op header".to_string()));
            }
            let kind = bytes.get_u8();
            let cf_id = bytes.get_u8();
            let cf = ColumnFamily::from_id(cf_id)
                .ok_or_else(|| Error::Corruption(format!("unknown column family {}", cf_id)))?;
            let key = read_chunk(&mut bytes)?;
            match kind {
                OP_PUT => {
                    let value = read_chunk(&mut bytes)?;
                    ops.push(BatchOp::Put { cf, key, value });
                }
                OP_DELETE => ops.push(BatchOp::Delete { cf, key }),
                other => {
                    return Err(Error::Corruption(format!("unknown batch op {:#04x}", other)))
                }
            }
        }
        if bytes.has_remaining() {
            return Err(Error::Corruption(format!(
                "{} trailing bytes after batch",
                bytes.remaining()
            )));
        }
        Ok(Self { ops })
    }
}

fn read_u32(bytes: &mut &[u8]) -> Result<u32> {
    if bytes.remaining() < 4 {
        return Err(Error::Corruption("truncated length field".to_string()));
    }
    Ok(bytes.get_u32())
}

fn read_chunk(bytes: &mut &[u8]) -> Result<Vec<u8>> {
    let len = read_u32(bytes)? as usize;
    if bytes.remaining() < len {
        return Err(Error::Corruption(format!(
            "chunk of {} bytes, only {} left",
            len,
            bytes.remaining()
        )));
    }
    let chunk = bytes[..len].to_vec();
    bytes.advance(len);
    Ok(chunk)
}
