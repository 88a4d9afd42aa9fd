//! Configuration types for the file store
//!
//! One [`Config`] is built at startup (usually from a TOML file) and handed
//! by reference to every component. Every section has defaults, so a file
//! only needs to name what it changes.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage layout configuration
    pub storage: StorageConfig,
    /// Journal configuration
    pub journal: JournalConfig,
    /// Admission control configuration
    pub throttle: ThrottleConfig,
    /// Client connection limits
    pub server: ServerConfig,
    /// Metadata cache configuration
    pub cache: CacheConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Parse a TOML document and validate it
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(s).map_err(|e| Error::configuration(format!("parse failed: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        self.journal.validate()?;
        self.throttle.validate()?;
        self.server.validate()?;
        if self.cache.metadata_entries == 0 {
            return Err(Error::configuration("cache.metadata_entries must be > 0"));
        }
        Ok(())
    }
}

/// Storage layout configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the data directory tree
    pub data_dir: PathBuf,
    /// Maximum entries in one directory of the layout
    pub max_files_per_dir: u32,
    /// Expected maximum number of ids under one FsId path
    pub max_files_per_store: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./filestore-data"),
            max_files_per_dir: 1000,
            max_files_per_store: 10_000_000,
        }
    }
}

impl StorageConfig {
    fn validate(&self) -> Result<()> {
        if self.max_files_per_dir < 2 {
            return Err(Error::configuration("storage.max_files_per_dir must be >= 2"));
        }
        if self.max_files_per_store < 1 {
            return Err(Error::configuration("storage.max_files_per_store must be >= 1"));
        }
        Ok(())
    }
}

/// Journal writer strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriterKind {
    /// One thread appends at a time; reservation and copy under one lock
    Serial,
    /// Offsets reserved under a lock, payloads copied in parallel
    #[default]
    Concurrent,
    /// Writes through a growable memory map (`mmap-journal` feature)
    Mmap,
}

/// Journal configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Writer strategy
    pub writer: WriterKind,
    /// Chunk capacities in bytes; the last one repeats
    pub chunk_schedule: Vec<u32>,
    /// fsync journals before a commit is recorded
    pub fsync_on_commit: bool,
    /// Growth step of the memory-mapped writer
    pub mmap_grow_bytes: u64,
    /// Uncommitted journals older than this are rolled back on recovery
    pub auto_rollback_secs: u64,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            writer: WriterKind::default(),
            chunk_schedule: vec![
                4 * 1024,    // 4 KB
                16 * 1024,   // 16 KB
                64 * 1024,   // 64 KB
                256 * 1024,  // 256 KB
                1024 * 1024, // 1 MB
            ],
            fsync_on_commit: true,
            mmap_grow_bytes: 4 * 1024 * 1024, // 4 MB
            auto_rollback_secs: 3600,
        }
    }
}

impl JournalConfig {
    fn validate(&self) -> Result<()> {
        if self.chunk_schedule.is_empty() {
            return Err(Error::configuration("journal.chunk_schedule must not be empty"));
        }
        if self.chunk_schedule.contains(&0) {
            return Err(Error::configuration("journal.chunk_schedule entries must be > 0"));
        }
        if self.chunk_schedule.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::configuration(
                "journal.chunk_schedule must be non-decreasing",
            ));
        }
        if self.mmap_grow_bytes == 0 {
            return Err(Error::configuration("journal.mmap_grow_bytes must be > 0"));
        }
        Ok(())
    }

    #[must_use]
    pub const fn auto_rollback(&self) -> Duration {
        Duration::from_secs(self.auto_rollback_secs)
    }
}

/// Permit-based admission control
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Size of the permit pool
    pub max_permits: u32,
    /// Permits taken by a read
    pub read_cost: u32,
    /// Permits taken by a write
    pub write_cost: u32,
    /// How long to wait for permits or an id lock
    pub lock_timeout_secs: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_permits: 64,
            read_cost: 1,
            write_cost: 4,
            lock_timeout_secs: 60,
        }
    }
}

impl ThrottleConfig {
    fn validate(&self) -> Result<()> {
        if self.read_cost == 0 {
            return Err(Error::configuration("throttle.read_cost must be > 0"));
        }
        if self.read_cost > self.write_cost {
            return Err(Error::configuration(
                "throttle.read_cost must not exceed throttle.write_cost",
            ));
        }
        if self.write_cost > self.max_permits {
            return Err(Error::configuration(
                "throttle.write_cost must not exceed throttle.max_permits",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

/// Client connection limits
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Maximum concurrently served clients
    pub max_client_threads: u32,
    /// Socket accept backlog
    pub accept_backlog: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_client_threads: 128,
            accept_backlog: 256,
        }
    }
}

impl ServerConfig {
    fn validate(&self) -> Result<()> {
        if self.max_client_threads == 0 {
            return Err(Error::configuration("server.max_client_threads must be > 0"));
        }
        if self.accept_backlog < self.max_client_threads {
            return Err(Error::configuration(
                "server.accept_backlog must be >= server.max_client_threads",
            ));
        }
        Ok(())
    }
}

/// Metadata cache configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Fixed number of cached record handles
    pub metadata_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            metadata_entries: 4096,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.journal.writer, WriterKind::Concurrent);
        assert_eq!(config.journal.chunk_schedule.last(), Some(&(1024 * 1024)));
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml_str(
            r#"
            [storage]
            data_dir = "/srv/fs"

            [journal]
            writer = "serial"
            chunk_schedule = [8, 16, 32]
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.data_dir, PathBuf::from("/srv/fs"));
        assert_eq!(config.storage.max_files_per_dir, 1000);
        assert_eq!(config.journal.writer, WriterKind::Serial);
        assert_eq!(config.journal.chunk_schedule, vec![8, 16, 32]);
        assert_eq!(config.throttle.write_cost, 4);
    }

    #[test]
    fn test_validation_failures() {
        for doc in [
            "[storage]\nmax_files_per_dir = 1",
            "[journal]\nchunk_schedule = []",
            "[journal]\nchunk_schedule = [64, 32]",
            "[throttle]\nread_cost = 8\nwrite_cost = 4",
            "[throttle]\nmax_permits = 2\nwrite_cost = 4",
            "[server]\nmax_client_threads = 10\naccept_backlog = 5",
            "[cache]\nmetadata_entries = 0",
            "[journal]\nwriter = \"turbo\"",
        ] {
            let err = Config::from_toml_str(doc).unwrap_err();
            assert!(matches!(err, Error::Configuration(_)), "{doc}: {err}");
        }
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filestore.toml");
        std::fs::write(&path, "[throttle]\nlock_timeout_secs = 3\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.throttle.lock_timeout(), Duration::from_secs(3));

        assert!(Config::load(dir.path().join("missing.toml")).is_err());
    }
}
