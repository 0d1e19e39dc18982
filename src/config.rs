//! Engine and store configuration
//!
//! Options are plain serde structs with per-field defaults so a partial
//! TOML file (or none at all) yields a usable configuration. Call
//! [`Options::validate`] after deserializing; [`Options::load`] does so.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Maximum zstd compression level.
const MAX_COMPRESSION_LEVEL: i32 = 22;

/// Minimum zstd compression level.
const MIN_COMPRESSION_LEVEL: i32 = 1;

/// Environment variable prefix for overrides (`PHOTONKV_CACHE_CAPACITY=...`).
pub const ENV_PREFIX: &str = "PHOTONKV";

/// Options for [`crate::Engine::open`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Create the data directory when it does not exist.
    pub create_if_missing: bool,
    /// Block cache capacity in entries.
    pub cache_capacity: usize,
    /// WAL size (MB) after which the store writes a checkpoint.
    pub write_buffer_size_mb: u64,
    /// Compress log records and checkpoints with zstd.
    pub compression: bool,
    /// Zstd level (1-22).
    pub compression_level: i32,
    /// fsync the WAL on every write.
    pub sync_writes: bool,

    /// Start the background reclaimer when the engine opens.
    pub start_reclaimer: bool,
    /// Markers loaded per refill of the reclaim queue.
    pub reclaim_batch: usize,
    /// Idle sleep between refill attempts (ms).
    pub reclaim_poll_interval_ms: u64,
    /// Polls of the worker state while stopping.
    pub stop_wait_retries: u32,
    /// Sleep between those polls (ms).
    pub stop_wait_interval_ms: u64,
    /// Number of per-key lock stripes (power of two).
    pub key_lock_stripes: usize,
    /// Deletions per atomic batch in `flush_all`.
    pub flush_batch_size: usize,
    /// Backups kept by `save`.
    pub backup_keep: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            cache_capacity: 4096,
            write_buffer_size_mb: 64,
            compression: true,
            compression_level: 3,
            sync_writes: false,
            start_reclaimer: true,
            reclaim_batch: 1000,
            reclaim_poll_interval_ms: 1000,
            stop_wait_retries: 100,
            stop_wait_interval_ms: 50,
            key_lock_stripes: 256,
            flush_batch_size: 100_000,
            backup_keep: 1,
        }
    }
}

impl Options {
    /// Load options from a TOML file layered with `PHOTONKV_*` variables.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        let options: Options = settings
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Invalid options in {}: {}", path.display(), e)))?;
        options.validate()?;
        Ok(options)
    }

    /// Parse options from TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let options: Options =
            toml::from_str(text).map_err(|e| Error::Config(format!("Invalid TOML: {}", e)))?;
        options.validate()?;
        Ok(options)
    }

    /// Render as TOML (used by `photonkv default-config`).
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to render options: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.compression_level < MIN_COMPRESSION_LEVEL
            || self.compression_level > MAX_COMPRESSION_LEVEL
        {
            return Err(Error::Config(format!(
                "compression_level must be {}-{}, got {}",
                MIN_COMPRESSION_LEVEL, MAX_COMPRESSION_LEVEL, self.compression_level
            )));
        }
        if self.key_lock_stripes == 0 || !self.key_lock_stripes.is_power_of_two() {
            return Err(Error::Config(format!(
                "key_lock_stripes must be a power of two, got {}",
                self.key_lock_stripes
            )));
        }
        if self.reclaim_batch == 0 {
            return Err(Error::Config("reclaim_batch must be >= 1".to_string()));
        }
        if self.flush_batch_size == 0 {
            return Err(Error::Config("flush_batch_size must be >= 1".to_string()));
        }
        if self.backup_keep == 0 {
            return Err(Error::Config("backup_keep must be >= 1".to_string()));
        }
        if self.write_buffer_size_mb == 0 {
            return Err(Error::Config("write_buffer_size_mb must be >= 1".to_string()));
        }
        Ok(())
    }

    pub fn reclaim_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_poll_interval_ms)
    }

    pub fn stop_wait_interval(&self) -> Duration {
        Duration::from_millis(self.stop_wait_interval_ms)
    }

    pub fn write_buffer_size_bytes(&self) -> u64 {
        self.write_buffer_size_mb * 1024 * 1024
    }
}
