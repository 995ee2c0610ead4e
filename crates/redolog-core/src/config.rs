//! Configuration management for the redo log.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Redo log configuration.
    pub redolog: RedoLogConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(crate::Error::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed.
    pub fn parse(content: &str) -> crate::Result<Self> {
        toml::from_str(content).map_err(|e| crate::Error::Config(e.to_string()))
    }

    /// Load configuration from `path`, or the defaults when no path is given.
    ///
    /// # Errors
    ///
    /// Returns an error if a path is given and it cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> crate::Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::from_file)
    }
}

/// Redo log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedoLogConfig {
    /// Path of the active segment.
    pub log_path: PathBuf,
    /// Directory closed segments are moved into.
    pub archive_dir: PathBuf,
    /// Origin server id stamped on every record.
    pub server_id: String,
    /// Replay uncommitted operations on start.
    pub crash_recovery: bool,
    /// Sync policy applied after each append.
    pub sync_mode: SyncMode,
    /// Write buffer size in bytes.
    pub buffer_size: usize,
    /// Segment rollover thresholds.
    pub rollover: RolloverConfig,
    /// Sequence generator configuration.
    pub sequence: SequenceConfig,
}

impl Default for RedoLogConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("redolog/redo.log"),
            archive_dir: PathBuf::from("redolog/archive"),
            server_id: "localhost".to_string(),
            crash_recovery: true,
            sync_mode: SyncMode::Fdatasync,
            buffer_size: 64 * 1024, // 64 KiB
            rollover: RolloverConfig::default(),
            sequence: SequenceConfig::default(),
        }
    }
}

impl RedoLogConfig {
    /// Configuration rooted in `dir`: `dir/redo.log` and `dir/archive`.
    #[must_use]
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            log_path: dir.join("redo.log"),
            archive_dir: dir.join("archive"),
            ..Self::default()
        }
    }

    /// Set the origin server id.
    #[must_use]
    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = server_id.into();
        self
    }

    /// Enable or disable crash recovery on start.
    #[must_use]
    pub const fn with_crash_recovery(mut self, enabled: bool) -> Self {
        self.crash_recovery = enabled;
        self
    }

    /// Set the sync mode.
    #[must_use]
    pub const fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Set the rollover thresholds.
    #[must_use]
    pub const fn with_rollover(mut self, rollover: RolloverConfig) -> Self {
        self.rollover = rollover;
        self
    }

    /// Set the sequence generator configuration.
    #[must_use]
    pub fn with_sequence(mut self, sequence: SequenceConfig) -> Self {
        self.sequence = sequence;
        self
    }

    /// Path used to stage the next segment during rollover.
    #[must_use]
    pub fn staging_path(&self) -> PathBuf {
        let mut name = self.log_path.as_os_str().to_owned();
        name.push(".next");
        PathBuf::from(name)
    }
}

/// Sync mode for appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// No explicit sync - rely on OS flush.
    None,
    /// Use fdatasync (faster, doesn't sync file metadata).
    #[default]
    Fdatasync,
    /// Use full fsync (slower, syncs all metadata).
    Fsync,
}

/// Size and age thresholds for automatic rollover.
///
/// A segment rolls when it reaches `hard_max_bytes`, or when it reaches
/// `soft_max_bytes` and is older than `min_age_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloverConfig {
    /// Size after which an old enough segment rolls.
    pub soft_max_bytes: u64,
    /// Size after which a segment always rolls.
    pub hard_max_bytes: u64,
    /// Minimum segment age (milliseconds) for a soft rollover.
    pub min_age_ms: u64,
}

impl Default for RolloverConfig {
    fn default() -> Self {
        Self {
            soft_max_bytes: 1024 * 1024,        // 1 MiB
            hard_max_bytes: 100 * 1024 * 1024,  // 100 MiB
            min_age_ms: 30 * 60 * 1000,         // 30 minutes
        }
    }
}

impl RolloverConfig {
    /// Thresholds that never trigger an automatic rollover.
    #[must_use]
    pub const fn manual() -> Self {
        Self { soft_max_bytes: u64::MAX, hard_max_bytes: u64::MAX, min_age_ms: u64::MAX }
    }
}

/// Which sequence generator backs the log sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SequenceKind {
    /// Process-local atomic counter.
    #[default]
    Local,
    /// Counter shared through an external store.
    Distributed,
}

/// Sequence generator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceConfig {
    /// Generator kind.
    pub kind: SequenceKind,
    /// Counter key in the shared store.
    pub key: String,
    /// Upper bound on one store round trip (milliseconds).
    pub timeout_ms: u64,
    /// How many times a client may reset a wrapped counter before giving up.
    pub max_reset_attempts: u32,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            kind: SequenceKind::Local,
            key: "redolog-sequence".to_string(),
            timeout_ms: 5_000,
            max_reset_attempts: 8,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// JSON format.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,
    /// Log output format.
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: LogFormat::Pretty }
    }
}
