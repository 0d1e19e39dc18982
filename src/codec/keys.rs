//! Composite key encoding
//!
//! Encoders are pure functions of their inputs. Decoders are strict: a
//! short buffer, a foreign tag or unconsumed trailing bytes all fail with
//! [`Error::MalformedKey`]. Fields that run to the end of the key (item
//! field, zset member) cannot leave trailing bytes by construction.

use super::{DELETE, ITEM, META, ZSCORE};
use crate::error::{Error, Result};
use bytes::BufMut;

/// Longest logical key the length prefix can describe.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

const SIGN_BIT: u64 = 1 << 63;

/// Decoded element key of a hash, set or list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemKey {
    pub key: Vec<u8>,
    pub version: u16,
    pub field: Vec<u8>,
}

/// Decoded score index key of a sorted set.
#[derive(Debug, Clone, PartialEq)]
pub struct ZScoreKey {
    pub key: Vec<u8>,
    pub version: u16,
    pub score: f64,
    pub member: Vec<u8>,
}

/// Decoded delete-task marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeleteKey {
    pub key: Vec<u8>,
    pub version: u16,
}

fn key_header(tag: u8, key: &[u8], extra: usize) -> Result<Vec<u8>> {
    if key.len() > MAX_KEY_LEN {
        return Err(Error::KeyTooLong(key.len()));
    }
    let mut buf = Vec::with_capacity(3 + key.len() + extra);
    buf.put_u8(tag);
    buf.put_u16(key.len() as u16);
    buf.put_slice(key);
    Ok(buf)
}

/// `M | len | key`
pub fn encode_meta_key(key: &[u8]) -> Result<Vec<u8>> {
    key_header(META, key, 0)
}

/// Shared prefix of every element of (key, version).
pub fn encode_item_prefix(key: &[u8], version: u16) -> Result<Vec<u8>> {
    let mut buf = key_header(ITEM, key, 2)?;
    buf.put_u16(version);
    Ok(buf)
}

/// `S | len | key | version | field`
pub fn encode_item_key(key: &[u8], field: &[u8], version: u16) -> Result<Vec<u8>> {
    let mut buf = encode_item_prefix(key, version)?;
    buf.put_slice(field);
    Ok(buf)
}

/// Shared prefix of every score index record of (key, version).
pub fn encode_zscore_prefix(key: &[u8], version: u16) -> Result<Vec<u8>> {
    let mut buf = key_header(ZSCORE, key, 2)?;
    buf.put_u16(version);
    Ok(buf)
}

/// `z | len | key | version | score | member`
pub fn encode_zscore_key(key: &[u8], member: &[u8], score: f64, version: u16) -> Result<Vec<u8>> {
    let score = encode_score(score)?;
    let mut buf = encode_zscore_prefix(key, version)?;
    buf.put_u64(score);
    buf.put_slice(member);
    Ok(buf)
}

/// `D | len | key | version`
pub fn encode_delete_key(key: &[u8], version: u16) -> Result<Vec<u8>> {
    let mut buf = key_header(DELETE, key, 2)?;
    buf.put_u16(version);
    Ok(buf)
}

/// Smallest key greater than every key starting with `prefix`.
///
/// `None` when the prefix is all `0xff` (no upper bound exists).
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// Order-preserving score encoding: byte order of the result matches
/// numeric order of the input.
fn encode_score(score: f64) -> Result<u64> {
    if score.is_nan() {
        return Err(Error::InvalidArgument("score is NaN".to_string()));
    }
    // -0.0 and 0.0 must map to the same key
    let bits = if score == 0.0 { 0 } else { score.to_bits() };
    Ok(if bits & SIGN_BIT != 0 { !bits } else { bits | SIGN_BIT })
}

fn decode_score(encoded: u64) -> f64 {
    let bits = if encoded & SIGN_BIT != 0 {
        encoded & !SIGN_BIT
    } else {
        !encoded
    };
    f64::from_bits(bits)
}

/// Checked cursor over an encoded key.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], tag: u8) -> Result<Self> {
        match buf.first() {
            None => Err(Error::MalformedKey("empty key".to_string())),
            Some(&t) if t != tag => Err(Error::MalformedKey(format!(
                "expected tag {:?}, found {:?}",
                tag as char, t as char
            ))),
            Some(_) => Ok(Self { buf, pos: 1 }),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(Error::MalformedKey(format!(
                "need {} bytes at offset {}, key is {} bytes",
                n,
                self.pos,
                self.buf.len()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    fn logical_key(&mut self) -> Result<Vec<u8>> {
        let len = self.u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    fn finish(self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(Error::MalformedKey(format!(
                "{} trailing bytes",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

/// Logical key of an encoded meta key.
pub fn decode_meta_key(encoded: &[u8]) -> Result<Vec<u8>> {
    let mut r = Reader::new(encoded, META)?;
    let key = r.logical_key()?;
    r.finish()?;
    Ok(key)
}

impl ItemKey {
    pub fn decode(encoded: &[u8]) -> Result<Self> {
        let mut r = Reader::new(encoded, ITEM)?;
        let key = r.logical_key()?;
        let version = r.u16()?;
        let field = r.rest().to_vec();
        Ok(Self { key, version, field })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_item_key(&self.key, &self.field, self.version)
    }
}

impl ZScoreKey {
    pub fn decode(encoded: &[u8]) -> Result<Self> {
        let mut r = Reader::new(encoded, ZSCORE)?;
        let key = r.logical_key()?;
        let version = r.u16()?;
        let score = decode_score(r.u64()?);
        if score.is_nan() {
            return Err(Error::MalformedKey("score decodes to NaN".to_string()));
        }
        let member = r.rest().to_vec();
        Ok(Self {
            key,
            version,
            score,
            member,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_zscore_key(&self.key, &self.member, self.score, self.version)
    }
}

impl DeleteKey {
    pub fn new(key: impl Into<Vec<u8>>, version: u16) -> Self {
        Self {
            key: key.into(),
            version,
        }
    }

    pub fn decode(encoded: &[u8]) -> Result<Self> {
        let mut r = Reader::new(encoded, DELETE)?;
        let key = r.logical_key()?;
        let version = r.u16()?;
        r.finish()?;
        Ok(Self { key, version })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_delete_key(&self.key, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_kinds() -> Result<()> {
        let meta = encode_meta_key(b"user:1")?;
        assert_eq!(decode_meta_key(&meta)?, b"user:1");

        let item = ItemKey {
            key: b"user:1".to_vec(),
            version: 7,
            field: b"name".to_vec(),
        };
        assert_eq!(ItemKey::decode(&item.encode()?)?, item);

        let z = ZScoreKey {
            key: b"board".to_vec(),
            version: 65535,
            score: -12.5,
            member: b"alice".to_vec(),
        };
        assert_eq!(ZScoreKey::decode(&z.encode()?)?, z);

        let dk = DeleteKey::new(b"board".to_vec(), 3);
        assert_eq!(DeleteKey::decode(&dk.encode()?)?, dk);
        Ok(())
    }

    #[test]
    fn test_empty_field_and_member() -> Result<()> {
        let item = ItemKey::decode(&encode_item_key(b"k", b"", 1)?)?;
        assert!(item.field.is_empty());
        let z = ZScoreKey::decode(&encode_zscore_key(b"k", b"", 0.0, 1)?)?;
        assert!(z.member.is_empty());
        Ok(())
    }

    #[test]
    fn test_item_order_follows_field_order() -> Result<()> {
        let fields: [&[u8]; 5] = [b"", b"a", b"ab", b"b", b"\xff"];
        let encoded: Vec<_> = fields
            .iter()
            .map(|f| encode_item_key(b"h", f, 2))
            .collect::<Result<_>>()?;
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
        Ok(())
    }

    #[test]
    fn test_item_prefix_isolates_versions_and_keys() -> Result<()> {
        let prefix = encode_item_prefix(b"h", 2)?;
        let end = prefix_end(&prefix).unwrap();
        let inside = encode_item_key(b"h", b"\xff\xff", 2)?;
        let next_version = encode_item_key(b"h", b"", 3)?;
        let longer_key = encode_item_key(b"hh", b"", 2)?;
        assert!(inside >= prefix && inside < end);
        assert!(next_version >= end);
        assert!(!longer_key.starts_with(&prefix));
        Ok(())
    }

    #[test]
    fn test_zscore_order_by_score_then_member() -> Result<()> {
        let entries: [(f64, &[u8]); 8] = [
            (f64::NEG_INFINITY, b"a"),
            (-100.0, b"a"),
            (-1.5, b"z"),
            (-0.0, b"a"),
            (0.0, b"b"),
            (1e-300, b"a"),
            (2.0, b"a"),
            (2.0, b"b"),
        ];
        let encoded: Vec<_> = entries
            .iter()
            .map(|(s, m)| encode_zscore_key(b"z", m, *s, 1))
            .collect::<Result<_>>()?;
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
        Ok(())
    }

    #[test]
    fn test_negative_zero_normalised() -> Result<()> {
        assert_eq!(
            encode_zscore_key(b"z", b"m", -0.0, 1)?,
            encode_zscore_key(b"z", b"m", 0.0, 1)?
        );
        Ok(())
    }

    #[test]
    fn test_nan_score_rejected() {
        assert!(matches!(
            encode_zscore_key(b"z", b"m", f64::NAN, 1),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_malformed_keys() -> Result<()> {
        // too short
        assert!(matches!(DeleteKey::decode(b"D\x00"), Err(Error::MalformedKey(_))));
        assert!(matches!(DeleteKey::decode(b""), Err(Error::MalformedKey(_))));
        // tag mismatch
        let item = encode_item_key(b"k", b"f", 1)?;
        assert!(matches!(DeleteKey::decode(&item), Err(Error::MalformedKey(_))));
        // trailing bytes
        let mut dk = encode_delete_key(b"k", 1)?;
        dk.push(0);
        assert!(matches!(DeleteKey::decode(&dk), Err(Error::MalformedKey(_))));
        let mut meta = encode_meta_key(b"k")?;
        meta.push(b'x');
        assert!(matches!(decode_meta_key(&meta), Err(Error::MalformedKey(_))));
        // key length runs past the end
        assert!(matches!(ItemKey::decode(b"S\x00\x09abc"), Err(Error::MalformedKey(_))));
        Ok(())
    }

    #[test]
    fn test_key_too_long() {
        let key = vec![b'x'; MAX_KEY_LEN + 1];
        assert!(matches!(encode_meta_key(&key), Err(Error::KeyTooLong(_))));
        assert!(encode_meta_key(&key[..MAX_KEY_LEN]).is_ok());
    }

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_end(b"a\xff"), Some(b"b".to_vec()));
        assert_eq!(prefix_end(b"\xff\xff"), None);
    }
}
