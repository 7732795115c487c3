//! CLI configuration, parsed from TOML file + environment variable overrides.
//!
//! Priority: environment variables > config file > defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use trikey_core::AccountId;
use trikey_watch::WatchConfig;

/// Name of the local recovery record inside the data directory
pub const STATE_FILE: &str = "recovery_state.json";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub server: ServerSection,

    /// Account this device belongs to
    pub account: AccountSection,

    #[serde(default)]
    pub watch: WatchSection,
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Data directory (local recovery record)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSection {
    pub id: String,
}

/// Trust anchor polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchSection {
    /// Poll interval in seconds (default: 10 minutes)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

impl Default for WatchSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_data_dir() -> PathBuf {
    PathBuf::from("/data")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_interval() -> u64 {
    WatchConfig::default().poll_interval_secs
}

// ============================================================================
// Loading & environment override
// ============================================================================

impl CliConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: CliConfig =
            toml::from_str(&contents).with_context(|| "Failed to parse TOML config")?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Supported env vars:
    /// - `TRIKEY_DATA_DIR`
    /// - `TRIKEY_LOG_LEVEL`
    /// - `TRIKEY_ACCOUNT_ID`
    /// - `TRIKEY_POLL_INTERVAL`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("TRIKEY_DATA_DIR") {
            self.server.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("TRIKEY_LOG_LEVEL") {
            self.server.log_level = v;
        }
        if let Ok(v) = std::env::var("TRIKEY_ACCOUNT_ID") {
            self.account.id = v;
        }
        if let Ok(v) = std::env::var("TRIKEY_POLL_INTERVAL") {
            if let Ok(secs) = v.parse::<u64>() {
                self.watch.poll_interval_secs = secs;
            }
        }
    }

    pub fn account_id(&self) -> AccountId {
        AccountId::new(self.account.id.clone())
    }

    pub fn state_path(&self) -> PathBuf {
        self.server.data_dir.join(STATE_FILE)
    }

    /// Oracle polling settings for this account
    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig {
            state_path: self.state_path(),
            poll_interval_secs: self.watch.poll_interval_secs,
            ..WatchConfig::default()
        }
    }

    /// Validate that the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.account.id.trim().is_empty(),
            "account.id must not be empty"
        );

        let min = WatchConfig::default().min_poll_interval_secs;
        anyhow::ensure!(
            self.watch.poll_interval_secs >= min,
            "watch.poll_interval_secs must be >= {}",
            min
        );

        anyhow::ensure!(
            matches!(
                self.server.log_level.as_str(),
                "error" | "warn" | "info" | "debug" | "trace"
            ),
            "server.log_level must be one of error/warn/info/debug/trace"
        );

        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
