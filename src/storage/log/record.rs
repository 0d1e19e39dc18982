//! Record framing for the write-ahead log and checkpoints
//!
//! ```text
//! ┌───────────┬───────────┬───────────┬──────────────────┐
//! │ Len (4B)  │ CRC (4B)  │ Codec(1B) │ Payload (Len B)  │
//! └───────────┴───────────┴───────────┴──────────────────┘
//! ```
//!
//! The CRC covers the codec byte and the payload. A short header, short
//! payload or CRC mismatch means the record was torn by a crash; readers
//! stop there and every preceding record is valid.
//!
//! A checkpoint is a header (`magic`, WAL generation) followed by frames
//! whose payloads are put-only [`WriteBatch`]es.

use super::compression::{compress, decompress, CompressionAlgorithm};
use super::Tables;
use crate::error::{Error, Result};
use crate::storage::{ColumnFamily, WriteBatch};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

const HEADER_SIZE: usize = 9;
const MAX_PAYLOAD: usize = 1 << 30;

const CHECKPOINT_MAGIC: &[u8; 8] = b"PKVCKPT\x01";
/// Entries per checkpoint frame.
const CHECKPOINT_CHUNK: usize = 4096;

fn checksum(codec: u8, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&[codec]);
    hasher.update(payload);
    hasher.finalize()
}

/// Frame `raw`, compressing the payload when asked to.
pub(crate) fn encode_frame(raw: &[u8], algorithm: CompressionAlgorithm, level: i32) -> Result<Vec<u8>> {
    let payload = compress(raw, algorithm, level)?;
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::Storage(format!(
            "record of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_PAYLOAD
        )));
    }
    let codec = algorithm.id();
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&checksum(codec, &payload).to_le_bytes());
    buf.push(codec);
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Read as many bytes as possible into `buf`; returns the count.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Next decoded frame; `Ok(None)` at a clean end of input.
pub(crate) fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut header = [0u8; HEADER_SIZE];
    match read_full(reader, &mut header)? {
        0 => return Ok(None),
        n if n < HEADER_SIZE => {
            return Err(Error::Corruption(format!("torn record header ({} bytes)", n)))
        }
        _ => {}
    }

    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let stored_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let codec = header[8];
    if len > MAX_PAYLOAD {
        return Err(Error::Corruption(format!("record length {} out of range", len)));
    }

    let mut payload = vec![0u8; len];
    let n = read_full(reader, &mut payload)?;
    if n < len {
        return Err(Error::Corruption(format!(
            "torn record payload: expected {} bytes, got {}",
            len, n
        )));
    }
    if checksum(codec, &payload) != stored_crc {
        return Err(Error::Corruption("record checksum mismatch".to_string()));
    }

    let algorithm = CompressionAlgorithm::from_id(codec)?;
    decompress(&payload, algorithm).map(Some)
}

/// Write a full image of `tables` to `path` (via a temp file + rename).
///
/// Returns the size of the written file.
pub(crate) fn write_checkpoint(
    path: &Path,
    generation: u64,
    tables: &Tables,
    algorithm: CompressionAlgorithm,
    level: i32,
) -> Result<u64> {
    let tmp_path = path.with_extension("tmp");
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| Error::Storage(format!("Failed to create checkpoint: {}", e)))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(CHECKPOINT_MAGIC)?;
    writer.write_all(&generation.to_le_bytes())?;

    for cf in ColumnFamily::ALL {
        let entries: Vec<_> = tables.family(cf).iter().collect();
        for chunk in entries.chunks(CHECKPOINT_CHUNK) {
            let mut batch = WriteBatch::new();
            for (key, value) in chunk {
                batch.put_cf(cf, key, value);
            }
            writer.write_all(&encode_frame(&batch.to_bytes(), algorithm, level)?)?;
        }
    }

    let file = writer
        .into_inner()
        .map_err(|e| Error::Storage(format!("Failed to flush checkpoint: {}", e)))?;
    file.sync_all()
        .map_err(|e| Error::Storage(format!("Failed to sync checkpoint: {}", e)))?;
    let size = file.metadata()?.len();
    drop(file);

    std::fs::rename(&tmp_path, path)
        .map_err(|e| Error::Storage(format!("Failed to install checkpoint: {}", e)))?;
    Ok(size)
}

/// Load a checkpoint image; `Ok(None)` when the file does not exist.
///
/// Unlike the log, a checkpoint is installed atomically, so any damage is
/// reported as corruption instead of being truncated away.
pub(crate) fn read_checkpoint(path: &Path) -> Result<Option<(u64, Tables)>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);

    let mut header = [0u8; 16];
    if read_full(&mut reader, &mut header)? < header.len() || &header[..8] != CHECKPOINT_MAGIC {
        return Err(Error::Corruption(format!(
            "bad checkpoint header in {}",
            path.display()
        )));
    }
    let mut gen_bytes = [0u8; 8];
    gen_bytes.copy_from_slice(&header[8..]);
    let generation = u64::from_le_bytes(gen_bytes);

    let mut tables = Tables::default();
    while let Some(raw) = read_frame(&mut reader)? {
        for op in WriteBatch::from_bytes(&raw)?.into_ops() {
            tables.apply(op);
        }
    }
    Ok(Some((generation, tables)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frame_round_trip() -> Result<()> {
        for algorithm in [CompressionAlgorithm::None, CompressionAlgorithm::Zstd] {
            let mut log = encode_frame(b"first", algorithm, 3)?;
            log.extend(encode_frame(b"second", algorithm, 3)?);
            let mut reader = Cursor::new(log);
            assert_eq!(read_frame(&mut reader)?, Some(b"first".to_vec()));
            assert_eq!(read_frame(&mut reader)?, Some(b"second".to_vec()));
            assert_eq!(read_frame(&mut reader)?, None);
        }
        Ok(())
    }

    #[test]
    fn test_torn_tail_detected() -> Result<()> {
        let mut log = encode_frame(b"complete", CompressionAlgorithm::None, 3)?;
        let torn = encode_frame(b"incomplete", CompressionAlgorithm::None, 3)?;
        log.extend_from_slice(&torn[..torn.len() - 3]);

        let mut reader = Cursor::new(log);
        assert_eq!(read_frame(&mut reader)?, Some(b"complete".to_vec()));
        assert!(matches!(read_frame(&mut reader), Err(Error::Corruption(_))));
        Ok(())
    }

    #[test]
    fn test_checksum_mismatch_detected() -> Result<()> {
        let mut frame = encode_frame(b"payload", CompressionAlgorithm::None, 3)?;
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert!(matches!(
            read_frame(&mut Cursor::new(frame)),
            Err(Error::Corruption(_))
        ));
        Ok(())
    }

    #[test]
    fn test_checkpoint_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("CHECKPOINT");

        let mut tables = Tables::default();
        for i in 0..(CHECKPOINT_CHUNK + 10) {
            let mut batch = WriteBatch::new();
            batch.put(format!("key{:06}", i).as_bytes(), b"v");
            tables.apply_batch(batch);
        }
        let mut seq = WriteBatch::new();
        seq.put_cf(ColumnFamily::Replication, b"seq", b"\x01");
        tables.apply_batch(seq);

        let size = write_checkpoint(&path, 7, &tables, CompressionAlgorithm::Zstd, 3)?;
        assert_eq!(size, std::fs::metadata(&path)?.len());
        assert!(!path.with_extension("tmp").exists());

        let (generation, loaded) = read_checkpoint(&path)?.expect("checkpoint exists");
        assert_eq!(generation, 7);
        assert_eq!(loaded.family(ColumnFamily::Default).len(), CHECKPOINT_CHUNK + 10);
        assert_eq!(
            loaded.family(ColumnFamily::Replication).get(&b"seq"[..]),
            Some(&b"\x01".to_vec())
        );
        Ok(())
    }

    #[test]
    fn test_missing_checkpoint() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(read_checkpoint(&dir.path().join("CHECKPOINT"))?.is_none());
        Ok(())
    }
}
