//! TOML configuration for the replexon daemon and CLI.
//!
//! Every section has compiled-in defaults matching a stock backup host, so
//! an absent or partial file is fine. Resolution order: explicit `--config`
//! path, the `REPLEXON_CONFIG` environment variable,
//! `/etc/replexon/replexon.toml`, then defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ingest::StartMode;
use crate::scheduler::{profiles, Schedule};

pub const CONFIG_ENV: &str = "REPLEXON_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/replexon/replexon.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub poller: PollerConfig,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default = "profiles::defaults")]
    pub schedules: Vec<Schedule>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            sources: SourcesConfig::default(),
            poller: PollerConfig::default(),
            trigger: TriggerConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
            schedules: profiles::defaults(),
        }
    }
}

/// How [`AppConfig::resolve`] arrived at its result. Configuration is read
/// before the tracing subscriber exists, so this is logged afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOrigin {
    /// `None` means compiled-in defaults.
    pub path: Option<PathBuf>,
    /// Candidate files that could not be loaded, with the error.
    pub skipped: Vec<(PathBuf, String)>,
}

impl ConfigOrigin {
    pub fn log(&self) {
        for (path, error) in &self.skipped {
            warn!(path = %path.display(), error = %error, "config file could not be loaded, skipped");
        }
        match &self.path {
            Some(path) => info!(path = %path.display(), "loaded configuration"),
            None => debug!("no config file found, using compiled-in defaults"),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// An explicit path must load; otherwise fall back through the
    /// environment variable, the system location and defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<(Self, ConfigOrigin)> {
        let (config, origin) = match explicit {
            Some(path) => (
                Self::load(path)?,
                ConfigOrigin {
                    path: Some(path.to_path_buf()),
                    skipped: Vec::new(),
                },
            ),
            None => Self::load_or_default(),
        };
        config.validate()?;
        Ok((config, origin))
    }

    pub fn load_or_default() -> (Self, ConfigOrigin) {
        let mut origin = ConfigOrigin::default();

        // 1. Environment variable override.
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        // 2. Standard system location.
        let system_path = Some(PathBuf::from(SYSTEM_CONFIG_PATH)).filter(|p| p.exists());

        for path in env_path.into_iter().chain(system_path) {
            match Self::load(&path) {
                Ok(cfg) => {
                    origin.path = Some(path);
                    return (cfg, origin);
                }
                Err(e) => origin.skipped.push((path, format!("{e:#}"))),
            }
        }

        // 3. Defaults.
        (Self::default(), origin)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poller.interval_secs == 0 {
            bail!("poller.interval_secs must be at least 1");
        }
        if self.sources.max_excerpt_bytes < 1024 {
            bail!("sources.max_excerpt_bytes must be at least 1024");
        }
        if self.trigger.shell.trim().is_empty() {
            bail!("trigger.shell must not be empty");
        }
        for schedule in &self.schedules {
            cron::Schedule::from_str(&schedule.cron_expr).with_context(|| {
                format!(
                    "schedule '{}' has invalid cron expression '{}'",
                    schedule.name, schedule.cron_expr
                )
            })?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port for the query API.
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:9847".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/replexon/replexon.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// The two files written by the backup script.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    /// Main log with start/end markers and rsync statistics.
    pub backup_log: PathBuf,
    /// `YYYY-MM-DD:status` feed, one line per daily run.
    pub tracking_feed: PathBuf,
    /// Where to begin a file that has no stored cursor.
    pub start_mode: StartMode,
    /// Cap on the excerpt kept per run.
    pub max_excerpt_bytes: usize,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            backup_log: PathBuf::from("/var/log/plex-backup.log"),
            tracking_feed: PathBuf::from("/var/log/plex-backup-tracking.log"),
            start_mode: StartMode::Beginning,
            max_excerpt_bytes: crate::ingest::parser::DEFAULT_EXCERPT_CAP,
        }
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    pub interval_secs: u64,
    /// Age after which a manual placeholder with no log evidence is given up.
    pub placeholder_timeout_secs: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            placeholder_timeout_secs: 6 * 60 * 60,
        }
    }
}

impl PollerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn placeholder_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.placeholder_timeout_secs.min(i64::MAX as u64) as i64)
    }
}

// ---------------------------------------------------------------------------
// Trigger
// ---------------------------------------------------------------------------

/// Manual backup launching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    pub script_path: PathBuf,
    /// Interpreter the script is handed to.
    pub shell: String,
    /// Minimum seconds between two admitted triggers.
    pub cooldown_secs: u64,
    /// Extra environment for the launched process.
    pub env: BTreeMap<String, String>,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            script_path: PathBuf::from("/usr/local/bin/backup-plex.sh"),
            shell: "bash".to_string(),
            cooldown_secs: 300,
            env: BTreeMap::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub cache_ttl_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { cache_ttl_secs: 30 }
    }
}

impl MetricsConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
