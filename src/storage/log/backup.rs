//! Point-in-time backups
//!
//! Each backup lives in its own numbered directory:
//!
//! ```text
//! <root>/
//!   1/CHECKPOINT   full table image
//!   1/meta.json    BackupInfo
//!   2/...
//! ```
//!
//! A backup is assembled in a hidden temp directory and renamed into place,
//! so a numbered directory is always complete.

use super::compression::CompressionAlgorithm;
use super::record::{read_checkpoint, write_checkpoint};
use super::Tables;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const IMAGE_FILE: &str = "CHECKPOINT";
const META_FILE: &str = "meta.json";

/// Description of one backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub id: u32,
    pub timestamp: DateTime<Utc>,
    /// Size of the image file in bytes.
    pub size: u64,
    /// CRC32 of the image file.
    pub crc32: u32,
    /// Keys across all column families.
    pub num_keys: u64,
}

fn backup_dir(root: &Path, id: u32) -> PathBuf {
    root.join(id.to_string())
}

fn file_crc(path: &Path) -> Result<(u64, u32)> {
    let mut file = fs::File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, hasher.finalize()))
}

/// Ids of the numbered backup directories under `root`, ascending.
fn backup_ids(root: &Path) -> Result<Vec<u32>> {
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut ids = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(id) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Write `tables` as the next backup under `root`.
pub(crate) fn create(
    root: &Path,
    tables: &Tables,
    algorithm: CompressionAlgorithm,
    level: i32,
) -> Result<BackupInfo> {
    fs::create_dir_all(root)?;
    let id = backup_ids(root)?.last().map_or(1, |last| last + 1);

    let tmp_dir = root.join(format!(".tmp-{}", id));
    if tmp_dir.exists() {
        fs::remove_dir_all(&tmp_dir)?;
    }
    fs::create_dir_all(&tmp_dir)?;

    let image = tmp_dir.join(IMAGE_FILE);
    write_checkpoint(&image, 0, tables, algorithm, level)?;
    let (size, crc32) = file_crc(&image)?;

    let info = BackupInfo {
        id,
        timestamp: Utc::now(),
        size,
        crc32,
        num_keys: tables.len() as u64,
    };
    let meta = serde_json::to_vec_pretty(&info)
        .map_err(|e| Error::Backup(format!("Failed to serialize backup info: {}", e)))?;
    fs::write(tmp_dir.join(META_FILE), meta)?;

    fs::rename(&tmp_dir, backup_dir(root, id))
        .map_err(|e| Error::Backup(format!("Failed to install backup {}: {}", id, e)))?;

    info!(id, size, num_keys = info.num_keys, root = ?root, "Backup created");
    Ok(info)
}

fn read_info(root: &Path, id: u32) -> Result<BackupInfo> {
    let path = backup_dir(root, id).join(META_FILE);
    let bytes = fs::read(&path)
        .map_err(|e| Error::Backup(format!("Backup {} has no readable metadata: {}", id, e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| Error::Backup(format!("Backup {} metadata is invalid: {}", id, e)))
}

/// All backups under `root`, oldest first.
pub(crate) fn list(root: &Path) -> Result<Vec<BackupInfo>> {
    let mut infos = Vec::new();
    for id in backup_ids(root)? {
        match read_info(root, id) {
            Ok(info) => infos.push(info),
            Err(e) => warn!(id, error = %e, "Skipping unreadable backup"),
        }
    }
    Ok(infos)
}

/// Delete all but the newest `keep` backups; returns how many were removed.
pub(crate) fn purge(root: &Path, keep: usize) -> Result<usize> {
    let ids = backup_ids(root)?;
    let excess = ids.len().saturating_sub(keep);
    for id in &ids[..excess] {
        fs::remove_dir_all(backup_dir(root, *id))?;
        debug!(id, "Purged backup");
    }
    Ok(excess)
}

/// Check that backup `id` is intact and readable.
pub(crate) fn verify(root: &Path, id: u32) -> Result<()> {
    let info = read_info(root, id)?;
    let image = backup_dir(root, id).join(IMAGE_FILE);
    if !image.exists() {
        return Err(Error::Backup(format!("Backup {} has no image", id)));
    }

    let (size, crc32) = file_crc(&image)?;
    if size != info.size {
        return Err(Error::Backup(format!(
            "Backup {} size mismatch: expected {}, found {}",
            id, info.size, size
        )));
    }
    if crc32 != info.crc32 {
        return Err(Error::Backup(format!(
            "Backup {} checksum mismatch: expected {:#010x}, found {:#010x}",
            id, info.crc32, crc32
        )));
    }

    let (_, tables) = read_checkpoint(&image)?
        .ok_or_else(|| Error::Backup(format!("Backup {} image vanished", id)))?;
    if tables.len() as u64 != info.num_keys {
        return Err(Error::Backup(format!(
            "Backup {} holds {} keys, metadata says {}",
            id,
            tables.len(),
            info.num_keys
        )));
    }
    Ok(())
}
