//! Meta record values
//!
//! ```text
//! type(1) | version(u16 BE) | flag(1) | payload
//! ```
//!
//! The flag is `D` once the version has been superseded by a delete and
//! `E` while the record is live. Collections keep their element count in
//! the payload as a big-endian `u64`; strings keep the value itself.

use crate::error::{Error, Result};
use bytes::BufMut;

/// Deletion flag of a superseded meta record.
pub const KEY_DELETE_MASK: u8 = b'D';
/// Deletion flag of a live meta record.
pub const KEY_ENABLED_MASK: u8 = b'E';

const HEADER_LEN: usize = 4;

/// Kind of value a logical key holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    String = b'k',
    Hash = b'h',
    Set = b's',
    List = b'l',
    ZSet = b'z',
}

impl DataType {
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            b'k' => Ok(DataType::String),
            b'h' => Ok(DataType::Hash),
            b's' => Ok(DataType::Set),
            b'l' => Ok(DataType::List),
            b'z' => Ok(DataType::ZSet),
            other => Err(Error::MalformedValue(format!("unknown data type {:#04x}", other))),
        }
    }

    /// Whether values of this type own element records.
    pub fn is_collection(self) -> bool {
        !matches!(self, DataType::String)
    }
}

/// Decoded meta record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaValue {
    pub data_type: DataType,
    pub version: u16,
    pub deleted: bool,
    pub payload: Vec<u8>,
}

impl MetaValue {
    /// Live collection meta with an element count.
    pub fn collection(data_type: DataType, version: u16, len: u64) -> Self {
        Self {
            data_type,
            version,
            deleted: false,
            payload: len.to_be_bytes().to_vec(),
        }
    }

    /// Live string meta holding `value` inline.
    pub fn string(version: u16, value: &[u8]) -> Self {
        Self {
            data_type: DataType::String,
            version,
            deleted: false,
            payload: value.to_vec(),
        }
    }

    pub fn is_live(&self) -> bool {
        !self.deleted
    }

    /// Tombstone left behind when this version is superseded.
    ///
    /// The version moves forward so a later incarnation never shares a
    /// version with records still waiting to be reclaimed.
    pub fn superseded(&self) -> Self {
        Self {
            data_type: self.data_type,
            version: self.version.wrapping_add(1),
            deleted: true,
            payload: Vec::new(),
        }
    }

    /// Element count of a collection meta.
    pub fn element_count(&self) -> Result<u64> {
        if self.payload.is_empty() {
            return Ok(0);
        }
        let bytes: [u8; 8] = self.payload.as_slice().try_into().map_err(|_| {
            Error::MalformedValue(format!(
                "collection length payload is {} bytes",
                self.payload.len()
            ))
        })?;
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.data_type as u8);
        buf.put_u16(self.version);
        buf.put_u8(if self.deleted {
            KEY_DELETE_MASK
        } else {
            KEY_ENABLED_MASK
        });
        buf.put_slice(&self.payload);
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::MalformedValue(format!(
                "meta value is {} bytes, header needs {}",
                bytes.len(),
                HEADER_LEN
            )));
        }
        let data_type = DataType::from_u8(bytes[0])?;
        let version = u16::from_be_bytes([bytes[1], bytes[2]]);
        let deleted = match bytes[3] {
            KEY_DELETE_MASK => true,
            KEY_ENABLED_MASK => false,
            other => {
                return Err(Error::MalformedValue(format!(
                    "unknown deletion flag {:#04x}",
                    other
                )))
            }
        };
        Ok(Self {
            data_type,
            version,
            deleted,
            payload: bytes[HEADER_LEN..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_round_trip() -> Result<()> {
        let meta = MetaValue::collection(DataType::Hash, 513, 3);
        let bytes = meta.encode();
        assert_eq!(&bytes[..4], &[b'h', 0x02, 0x01, KEY_ENABLED_MASK]);
        let decoded = MetaValue::decode(&bytes)?;
        assert_eq!(decoded, meta);
        assert_eq!(decoded.element_count()?, 3);
        Ok(())
    }

    #[test]
    fn test_superseded_bumps_version() {
        let meta = MetaValue::collection(DataType::ZSet, 1, 10);
        let tomb = meta.superseded();
        assert_eq!(tomb.version, 2);
        assert!(tomb.deleted);
        assert_eq!(tomb.data_type, DataType::ZSet);

        let wrapped = MetaValue::collection(DataType::Set, u16::MAX, 0).superseded();
        assert_eq!(wrapped.version, 0);
    }

    #[test]
    fn test_string_payload() -> Result<()> {
        let meta = MetaValue::string(1, b"hello");
        let decoded = MetaValue::decode(&meta.encode())?;
        assert_eq!(decoded.payload, b"hello");
        assert!(!decoded.data_type.is_collection());
        Ok(())
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(MetaValue::decode(b"h\x00"), Err(Error::MalformedValue(_))));
        assert!(matches!(MetaValue::decode(b"?\x00\x01E"), Err(Error::MalformedValue(_))));
        assert!(matches!(MetaValue::decode(b"h\x00\x01X"), Err(Error::MalformedValue(_))));
        let bad_len = MetaValue::decode(b"h\x00\x01E\x01\x02").unwrap();
        assert!(bad_len.element_count().is_err());
    }
}
