use std::{
    collections::BTreeSet,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use super::{
    counter::{CounterStrategy, DEFAULT_SCAN_LIMIT},
    error::{ReadHistoryError, Result},
    projection::IndexKind,
    query::{DEFAULT_LIMIT, DEFAULT_MAX_LIMIT},
};

pub const DEFAULT_EMAIL_DELAY_SECS: u64 = 15 * 60;
pub const DEFAULT_SMS_DELAY_SECS: u64 = 60 * 60;
pub const DEFAULT_CHECK_DELAY_SECS: u64 = 30;
pub const DEFAULT_GENERATE_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_indexes")]
    pub indexes: Vec<IndexKind>,
    #[serde(default)]
    pub counters: CounterConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            indexes: default_indexes(),
            counters: CounterConfig::default(),
            query: QueryConfig::default(),
            notifications: NotificationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterConfig {
    #[serde(default)]
    pub strategy: CounterStrategy,
    #[serde(default = "default_scan_limit")]
    pub scan_limit: usize,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            strategy: CounterStrategy::default(),
            scan_limit: default_scan_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_query_limit")]
    pub default_limit: usize,
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_limit: default_query_limit(),
            max_limit: default_max_limit(),
        }
    }
}

/// Timing for one reminder channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Target types that get reminders on this channel.
    #[serde(default)]
    pub enabled_types: BTreeSet<String>,
    pub delay_secs: u64,
    #[serde(default = "default_check_delay_secs")]
    pub check_delay_secs: u64,
}

impl ChannelConfig {
    fn with_delay(delay_secs: u64) -> Self {
        Self {
            enabled_types: BTreeSet::new(),
            delay_secs,
            check_delay_secs: default_check_delay_secs(),
        }
    }

    pub fn is_enabled_for(&self, target_type: &str) -> bool {
        self.enabled_types.contains(target_type)
    }

    /// Time from delivery until the state check fires.
    pub fn check_after(&self) -> Duration {
        Duration::from_secs(self.delay_secs.saturating_add(self.check_delay_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "default_email_channel")]
    pub email: ChannelConfig,
    #[serde(default = "default_sms_channel")]
    pub sms: ChannelConfig,
    #[serde(default = "default_generate_timeout_ms")]
    pub generate_timeout_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            email: default_email_channel(),
            sms: default_sms_channel(),
            generate_timeout_ms: default_generate_timeout_ms(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
        }
    }
}

impl NotificationConfig {
    pub fn generate_timeout(&self) -> Duration {
        Duration::from_millis(self.generate_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_base_ms.saturating_mul(1u64 << exponent))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for daily log files. Logs go to stdout only when unset.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    let mut path = default_config_root()?;
    path.push("config.toml");
    Ok(path)
}

/// Reads the config file, writing the defaults first when it is missing.
pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let config_path = if let Some(path) = path {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        path
    } else {
        default_config_path()?
    };

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let cfg: Config = toml::from_str(&contents)?;
        cfg.validate()?;
        Ok((cfg, config_path))
    } else {
        let cfg = Config::default();
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        cfg.save(&config_path)?;
        Ok((cfg, config_path))
    }
}

impl Config {
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn ensure_data_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store")
    }

    pub fn validate(&self) -> Result<()> {
        if self.indexes.is_empty() {
            return Err(ReadHistoryError::Config(
                "at least one index must be enabled".into(),
            ));
        }
        for required in self.counters.strategy.required_indexes() {
            if !self.indexes.contains(required) {
                return Err(ReadHistoryError::Config(format!(
                    "counter strategy `{}` needs index `{}`",
                    self.counters.strategy, required
                )));
            }
        }
        if self.counters.scan_limit == 0 {
            return Err(ReadHistoryError::Config(
                "counters.scan_limit must be greater than zero".into(),
            ));
        }
        if self.query.default_limit == 0 || self.query.max_limit == 0 {
            return Err(ReadHistoryError::Config(
                "query limits must be greater than zero".into(),
            ));
        }
        if self.query.default_limit > self.query.max_limit {
            return Err(ReadHistoryError::Config(
                "query.default_limit must not exceed query.max_limit".into(),
            ));
        }
        if self.notifications.max_attempts == 0 {
            return Err(ReadHistoryError::Config(
                "notifications.max_attempts must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_config_root() -> Result<PathBuf> {
    if let Some(home) = dirs::home_dir() {
        Ok(home.join(".readdbx"))
    } else {
        env::current_dir()
            .map(|dir| dir.join(".readdbx"))
            .map_err(|err| ReadHistoryError::Config(err.to_string()))
    }
}

fn default_data_dir() -> PathBuf {
    default_config_root()
        .map(|root| root.join("data"))
        .unwrap_or_else(|_| PathBuf::from("./data"))
}

fn default_indexes() -> Vec<IndexKind> {
    IndexKind::ALL.to_vec()
}

fn default_scan_limit() -> usize {
    DEFAULT_SCAN_LIMIT
}

fn default_query_limit() -> usize {
    DEFAULT_LIMIT
}

fn default_max_limit() -> usize {
    DEFAULT_MAX_LIMIT
}

fn default_check_delay_secs() -> u64 {
    DEFAULT_CHECK_DELAY_SECS
}

fn default_email_channel() -> ChannelConfig {
    ChannelConfig::with_delay(DEFAULT_EMAIL_DELAY_SECS)
}

fn default_sms_channel() -> ChannelConfig {
    ChannelConfig::with_delay(DEFAULT_SMS_DELAY_SECS)
}

fn default_generate_timeout_ms() -> u64 {
    DEFAULT_GENERATE_TIMEOUT_MS
}

fn default_max_attempts() -> u32 {
    5
}

fn default_retry_base_ms() -> u64 {
    1_000
}

fn default_log_level() -> String {
    "info".to_string()
}
