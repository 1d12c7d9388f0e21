//! Ledger configuration.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

/// Configuration for the ledger service and its reaper jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Path to `RocksDB` data directory (default: "/data/credit-ledger").
    pub data_dir: String,

    /// Attempts per operation before a CAS conflict is surfaced (default: 8).
    pub max_retries: u32,

    /// Backoff after the first conflict; doubles per attempt (default: 2ms).
    pub retry_backoff_base: Duration,

    /// Upper bound for a single backoff (default: 50ms).
    pub retry_backoff_max: Duration,

    /// Entries returned with an account snapshot (default: 20).
    pub history_limit: usize,

    /// Deadline applied to each cancellation issued by the reaper (default: 5s).
    pub call_timeout: Duration,

    /// Reaper schedule.
    pub reaper: ReaperConfig,
}

/// Schedule and thresholds of the two reaper jobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaperConfig {
    /// Locked entries fetched per page (default: 100).
    pub page_size: usize,

    /// Age after which the timeout sweep cancels a reservation (default: 10 minutes).
    pub timeout_threshold: Duration,

    /// How often the timeout sweep runs (default: 1 minute).
    pub timeout_interval: Duration,

    /// Age after which the expired sweep cancels a reservation (default: 24 hours).
    pub expired_threshold: Duration,

    /// How often the expired sweep runs (default: 1 hour).
    pub expired_interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            timeout_threshold: Duration::from_secs(10 * 60),
            timeout_interval: Duration::from_secs(60),
            expired_threshold: Duration::from_secs(24 * 60 * 60),
            expired_interval: Duration::from_secs(60 * 60),
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            data_dir: "/data/credit-ledger".into(),
            max_retries: 8,
            retry_backoff_base: Duration::from_millis(2),
            retry_backoff_max: Duration::from_millis(50),
            history_limit: 20,
            call_timeout: Duration::from_secs(5),
            reaper: ReaperConfig::default(),
        }
    }
}

/// Errors raised while loading a configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid configuration JSON.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Configuration file structure. Every field is optional and overrides the default.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    data_dir: Option<String>,
    max_retries: Option<u32>,
    retry_backoff_base_ms: Option<u64>,
    retry_backoff_max_ms: Option<u64>,
    history_limit: Option<usize>,
    call_timeout_ms: Option<u64>,
    #[serde(default)]
    reaper: ReaperFile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReaperFile {
    page_size: Option<usize>,
    timeout_threshold_secs: Option<u64>,
    timeout_interval_secs: Option<u64>,
    expired_threshold_secs: Option<u64>,
    expired_interval_secs: Option<u64>,
}

impl LedgerConfig {
    /// Load configuration from an optional JSON file and environment variables.
    ///
    /// The file is taken from `LEDGER_CONFIG_FILE`, falling back to
    /// `.config/ledger.json`. Environment variables override file values.
    #[must_use]
    pub fn from_env() -> Self {
        let path = std::env::var("LEDGER_CONFIG_FILE").unwrap_or_else(|_| ".config/ledger.json".into());

        let config = if Path::new(&path).exists() {
            match Self::from_file(&path) {
                Ok(config) => {
                    tracing::info!(path = %path, "Loaded ledger config from file");
                    config
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Ignoring unreadable config file");
                    Self::default()
                }
            }
        } else {
            tracing::debug!(path = %path, "Config file not found, using defaults");
            Self::default()
        };

        config.with_env_overrides()
    }

    /// Load configuration from a JSON file on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Parse configuration JSON on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or has unknown fields.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_json::from_str(json)?;
        let mut config = Self::default();

        if let Some(data_dir) = file.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(max_retries) = file.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(ms) = file.retry_backoff_base_ms {
            config.retry_backoff_base = Duration::from_millis(ms);
        }
        if let Some(ms) = file.retry_backoff_max_ms {
            config.retry_backoff_max = Duration::from_millis(ms);
        }
        if let Some(limit) = file.history_limit {
            config.history_limit = limit;
        }
        if let Some(ms) = file.call_timeout_ms {
            config.call_timeout = Duration::from_millis(ms);
        }

        let reaper = &mut config.reaper;
        if let Some(page_size) = file.reaper.page_size {
            reaper.page_size = page_size;
        }
        if let Some(secs) = file.reaper.timeout_threshold_secs {
            reaper.timeout_threshold = Duration::from_secs(secs);
        }
        if let Some(secs) = file.reaper.timeout_interval_secs {
            reaper.timeout_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = file.reaper.expired_threshold_secs {
            reaper.expired_threshold = Duration::from_secs(secs);
        }
        if let Some(secs) = file.reaper.expired_interval_secs {
            reaper.expired_interval = Duration::from_secs(secs);
        }

        Ok(config)
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(data_dir) = std::env::var("DATA_DIR") {
            self.data_dir = data_dir;
        }
        if let Some(v) = env_parse("LEDGER_MAX_RETRIES") {
            self.max_retries = v;
        }
        if let Some(ms) = env_parse("LEDGER_RETRY_BACKOFF_MS") {
            self.retry_backoff_base = Duration::from_millis(ms);
        }
        if let Some(v) = env_parse("LEDGER_HISTORY_LIMIT") {
            self.history_limit = v;
        }
        if let Some(ms) = env_parse("LEDGER_CALL_TIMEOUT_MS") {
            self.call_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = env_parse("REAPER_PAGE_SIZE") {
            self.reaper.page_size = v;
        }
        if let Some(secs) = env_parse("REAPER_TIMEOUT_SECS") {
            self.reaper.timeout_threshold = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("REAPER_TIMEOUT_INTERVAL_SECS") {
            self.reaper.timeout_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("REAPER_EXPIRED_SECS") {
            self.reaper.expired_threshold = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("REAPER_EXPIRED_INTERVAL_SECS") {
            self.reaper.expired_interval = Duration::from_secs(secs);
        }
        self
    }

    /// Set the data directory.
    #[must_use]
    pub fn with_data_dir(mut self, data_dir: impl Into<String>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    /// Set the retry budget for CAS conflicts.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the number of entries returned with an account snapshot.
    #[must_use]
    pub const fn with_history_limit(mut self, history_limit: usize) -> Self {
        self.history_limit = history_limit;
        self
    }

    /// Set the reaper schedule.
    #[must_use]
    pub fn with_reaper(mut self, reaper: ReaperConfig) -> Self {
        self.reaper = reaper;
        self
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = %name, value = %raw, "Ignoring unparsable environment variable");
            None
        }
    }
}
