//! Configuration for the `chatsync` engine and CLI.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/chatsync/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use chatsync_proto::message::{ParticipantId, Timestamp};

use crate::cache::CacheConfig;
use crate::sync::SyncConfig;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

/// Top-level TOML config file structure. Every field is optional so a file
/// can override just what it needs.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    sync: SyncFileConfig,
    cache: CacheFileConfig,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    participant: Option<String>,
    page_size: Option<usize>,
    snapshot_limit: Option<usize>,
    dedup_window_ms: Option<u64>,
    event_buffer: Option<usize>,
}

/// `[cache]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct CacheFileConfig {
    dir: Option<PathBuf>,
    max_messages: Option<usize>,
    ttl_hours: Option<u64>,
    max_invalid_percent: Option<u8>,
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Local user; author of sends and reader for receipts.
    pub participant: ParticipantId,
    /// Messages per history page.
    pub page_size: usize,
    /// Depth limit requested from the snapshot stream.
    pub snapshot_limit: Option<usize>,
    /// Near-duplicate window for cache writes and optimistic matching.
    pub dedup_window: Duration,
    /// Buffer size for the sync event channel.
    pub event_buffer: usize,

    /// Directory holding the on-disk cache.
    pub cache_dir: PathBuf,
    /// Most recent messages cached per room.
    pub max_messages: usize,
    /// Age after which a cache entry is ignored.
    pub cache_ttl: Duration,
    /// Share of invalid entries (percent) above which an entry is deleted.
    pub max_invalid_percent: u8,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            participant: ParticipantId::new("local"),
            page_size: 20,
            snapshot_limit: None,
            dedup_window: Duration::from_secs(2),
            event_buffer: 64,
            cache_dir: default_cache_dir(),
            max_messages: 200,
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            max_invalid_percent: 20,
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/chatsync/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve from CLI args and a parsed config file. Priority: CLI > file > default.
    /// Environment variables arrive through `cli`, so they also beat the file.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            participant: cli
                .participant
                .clone()
                .or_else(|| file.sync.participant.clone())
                .map_or(defaults.participant, ParticipantId::new),
            page_size: cli
                .page_size
                .or(file.sync.page_size)
                .unwrap_or(defaults.page_size)
                .max(1),
            snapshot_limit: file.sync.snapshot_limit.or(defaults.snapshot_limit),
            dedup_window: file
                .sync
                .dedup_window_ms
                .map_or(defaults.dedup_window, Duration::from_millis),
            event_buffer: file.sync.event_buffer.unwrap_or(defaults.event_buffer),
            cache_dir: cli
                .cache_dir
                .clone()
                .or_else(|| file.cache.dir.clone())
                .unwrap_or(defaults.cache_dir),
            max_messages: file.cache.max_messages.unwrap_or(defaults.max_messages),
            cache_ttl: file
                .cache
                .ttl_hours
                .map_or(defaults.cache_ttl, |h| Duration::from_secs(h * 60 * 60)),
            max_invalid_percent: file
                .cache
                .max_invalid_percent
                .unwrap_or(defaults.max_invalid_percent)
                .min(100),
        }
    }

    /// Engine settings for [`SyncController`](crate::sync::SyncController).
    #[must_use]
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            participant: self.participant.clone(),
            page_size: self.page_size,
            snapshot_limit: self.snapshot_limit,
            dedup_window: self.dedup_window,
            event_buffer: self.event_buffer,
            clock: Timestamp::now,
        }
    }

    /// Settings for [`LocalCacheStore`](crate::cache::LocalCacheStore).
    #[must_use]
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_messages: self.max_messages,
            ttl: self.cache_ttl,
            max_invalid_percent: self.max_invalid_percent,
            page_size: self.page_size,
            clock: Timestamp::now,
        }
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Inspect and exercise the chat room sync cache")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Path to config file (default: `~/.config/chatsync/config.toml`).
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory of the on-disk cache.
    #[arg(long, global = true, env = "CHATSYNC_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Local participant id.
    #[arg(long, global = true, env = "CHATSYNC_PARTICIPANT")]
    pub participant: Option<String>,

    /// Messages per history page.
    #[arg(long, global = true)]
    pub page_size: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info", env = "CHATSYNC_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/chatsync.log`).
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Subcommands of the `chatsync` binary.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Validate, repair and summarise a room's cache entry.
    Inspect {
        /// Room id.
        room: String,
    },
    /// Delete one room's cache entry, or every entry.
    Clear {
        /// Room id; all rooms when omitted.
        room: Option<String>,
    },
    /// Run a session against an in-memory gateway seeded with generated
    /// history, using the on-disk cache.
    Demo {
        /// Room id.
        room: String,
        /// Message to send (repeatable).
        #[arg(short, long = "message")]
        messages: Vec<String>,
        /// Number of older pages to load after syncing.
        #[arg(long, default_value_t = 1)]
        pages: usize,
    },
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("chatsync")
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and a missing
/// file is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("chatsync").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
