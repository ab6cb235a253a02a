use crate::global;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const API_KEY_ENV: &str = "NOTETAKER_BOT_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Overrides the default database location under the data directory.
    pub database_path: Option<PathBuf>,
    pub automations: Vec<AutomationConfig>,
    pub bot_directory: BotDirectoryConfig,
    pub schedule: ScheduleConfig,
    pub calendar: CalendarConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotDirectoryConfig {
    pub base_url: String,
    pub api_key: String,
    /// Applied to every call against the bot directory.
    pub timeout_seconds: u64,
    /// Display name the bot uses when it joins a call.
    pub bot_name: String,
    pub transcript_provider: String,
    /// Use the in-memory directory instead of the hosted service.
    pub dry_run: bool,
}

impl Default for BotDirectoryConfig {
    fn default() -> Self {
        Self {
            base_url: "https://us-west-2.recall.ai".to_string(),
            api_key: String::new(),
            timeout_seconds: 30,
            bot_name: "Notetaker".to_string(),
            transcript_provider: "recallai_streaming".to_string(),
            dry_run: false,
        }
    }
}

impl BotDirectoryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub bot_poll_seconds: u64,
    pub calendar_refresh_seconds: u64,
    pub transcript_sweep_seconds: u64,
    pub dispatch_seconds: u64,
    pub discovery_seconds: u64,
    pub discovery_enabled: bool,
    /// How far back discovery looks for events still missing a bot.
    pub discovery_lookback_hours: i64,
    /// Minutes before an event's start at which its bot is dispatched.
    pub lead_time_minutes: i64,
    /// Upper bound on items processed concurrently within one tick.
    pub max_concurrency: usize,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            bot_poll_seconds: 120,
            calendar_refresh_seconds: 1800,
            transcript_sweep_seconds: 300,
            dispatch_seconds: 60,
            discovery_seconds: 900,
            discovery_enabled: true,
            discovery_lookback_hours: 24,
            lead_time_minutes: 10,
            max_concurrency: 8,
        }
    }
}

impl ScheduleConfig {
    pub fn lead_time(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.lead_time_minutes.max(0))
    }

    pub fn discovery_lookback(&self) -> chrono::Duration {
        chrono::Duration::hours(self.discovery_lookback_hours.max(0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    /// Shell command that prints the account's events as JSON on stdout.
    /// Receives NOTETAKER_ACCOUNT_ID in its environment.
    pub command: String,
    pub timeout_seconds: u64,
    /// Accounts to register on startup.
    pub accounts: Vec<String>,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            timeout_seconds: 120,
            accounts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub name: String,
    /// Shell command run once a transcript is ready. Receives the
    /// transcript text via stdin.
    pub command: String,
    pub enabled: bool,
    pub timeout_seconds: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            command: String::new(),
            enabled: true,
            timeout_seconds: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 3747,
        }
    }
}

impl Config {
    /// Load from `path`, or from the default location when `path` is `None`.
    /// A missing default file is created with default values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(&config_path).context("Failed to read config file")?;
            let config: Self = toml::from_str(&content).context("Failed to parse config file")?;
            info!("Loaded config from {:?}", config_path);
            config
        } else {
            info!(
                "Config file not found, creating default at {:?}",
                config_path
            );
            let config = Self::default();
            config.save_to(&config_path)?;
            config
        };

        config.apply_env();
        Ok(config)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(config_path, content).context("Failed to write config file")?;

        Ok(())
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => global::db_file(),
        }
    }

    pub fn enabled_automations(&self) -> impl Iterator<Item = &AutomationConfig> {
        self.automations
            .iter()
            .filter(|a| a.enabled && !a.command.trim().is_empty())
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                self.bot_directory.api_key = key;
            }
        }
    }

    fn config_path() -> Result<PathBuf> {
        global::config_file()
    }
}
