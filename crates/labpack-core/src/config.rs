use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration. Lives per user, never inside a (synced) bundle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub publish: PublishConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Number of most recent snapshots always kept. Clamped to at least 1.
    #[serde(default = "default_keep_count")]
    pub keep_count: usize,
    /// Seconds between idle-timer passes of the background pruner.
    #[serde(default = "default_idle_prune_secs")]
    pub idle_prune_secs: u64,
    /// Abandoned publish temp files older than this are removed by the pruner.
    #[serde(default = "default_stale_secs")]
    pub stale_temp_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_count: default_keep_count(),
            idle_prune_secs: default_idle_prune_secs(),
            stale_temp_secs: default_stale_secs(),
        }
    }
}

impl RetentionConfig {
    #[must_use]
    pub fn effective_keep_count(&self) -> usize {
        self.keep_count.max(1)
    }

    /// Idle-pass interval, never shorter than one second.
    #[must_use]
    pub const fn idle_interval(&self) -> Duration {
        if self.idle_prune_secs == 0 {
            Duration::from_secs(1)
        } else {
            Duration::from_secs(self.idle_prune_secs)
        }
    }

    #[must_use]
    pub const fn stale_temp_after(&self) -> Duration {
        Duration::from_secs(self.stale_temp_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// A marker not refreshed for this long is treated as abandoned.
    #[serde(default = "default_stale_secs")]
    pub stale_after_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_secs(),
        }
    }
}

impl LockConfig {
    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingConfig {
    /// Directory for private staging copies. `None` resolves to the per-user
    /// cache directory.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Orphaned staging files older than this are swept on startup.
    #[serde(default = "default_stale_secs")]
    pub stale_after_secs: u64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            stale_after_secs: default_stale_secs(),
        }
    }
}

impl StagingConfig {
    /// Resolve the staging directory: explicit setting, then
    /// `<cache_dir>/labpack/staging`, then the system temp dir.
    #[must_use]
    pub fn resolved_dir(&self) -> PathBuf {
        if let Some(dir) = &self.dir {
            return dir.clone();
        }
        dirs::cache_dir().map_or_else(
            || env::temp_dir().join("labpack-staging"),
            |cache| cache.join("labpack").join("staging"),
        )
    }

    #[must_use]
    pub const fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    #[serde(default = "default_checkpoint_attempts")]
    pub checkpoint_attempts: u32,
    #[serde(default = "default_checkpoint_backoff_ms")]
    pub checkpoint_backoff_ms: u64,
    /// A `-wal` file larger than this after checkpointing counts as not drained.
    #[serde(default)]
    pub wal_threshold_bytes: u64,
    /// Run `VACUUM` on every new snapshot before it is published.
    #[serde(default)]
    pub compact: bool,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            checkpoint_attempts: default_checkpoint_attempts(),
            checkpoint_backoff_ms: default_checkpoint_backoff_ms(),
            wal_threshold_bytes: 0,
            compact: false,
        }
    }
}

impl PublishConfig {
    #[must_use]
    pub const fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.checkpoint_backoff_ms)
    }
}

const fn default_keep_count() -> usize {
    50
}

const fn default_idle_prune_secs() -> u64 {
    300
}

const fn default_stale_secs() -> u64 {
    3600
}

const fn default_checkpoint_attempts() -> u32 {
    3
}

const fn default_checkpoint_backoff_ms() -> u64 {
    50
}

/// Parse a config document.
///
/// # Errors
///
/// Returns an error if the TOML is malformed.
pub fn parse_config(content: &str) -> Result<StoreConfig> {
    toml::from_str::<StoreConfig>(content).context("Failed to parse labpack config")
}

/// Load `path` if it exists, defaults otherwise.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config_file(path: &Path) -> Result<StoreConfig> {
    if !path.exists() {
        return Ok(StoreConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<StoreConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Load the user config from `<config_dir>/labpack/config.toml`, then apply
/// environment overrides.
///
/// # Errors
///
/// Returns an error if the config file exists but is invalid, or an
/// override variable does not parse.
pub fn load_user_config() -> Result<StoreConfig> {
    let mut config = match dirs::config_dir() {
        Some(dir) => load_config_file(&dir.join("labpack/config.toml"))?,
        None => StoreConfig::default(),
    };
    let keep_count = env::var("LABPACK_KEEP_COUNT").ok();
    apply_env_overrides(&mut config, keep_count.as_deref())?;
    Ok(config)
}

fn apply_env_overrides(config: &mut StoreConfig, keep_count: Option<&str>) -> Result<()> {
    if let Some(raw) = keep_count {
        config.retention.keep_count = raw
            .trim()
            .parse()
            .with_context(|| format!("LABPACK_KEEP_COUNT is not a count: {raw:?}"))?;
    }
    Ok(())
}
