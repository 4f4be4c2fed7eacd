/*!
 * Configuration for the Storm AQI service
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use storm_core_resilience::{BulkIndexerConfig, ConnectivityConfig, PoolConfig};

use crate::error::{Result, StormError};

/// Environment variable overriding `elastic.username`
pub const ENV_ES_USERNAME: &str = "STORM_ES_USERNAME";
/// Environment variable overriding `elastic.password`
pub const ENV_ES_PASSWORD: &str = "STORM_ES_PASSWORD";
/// Environment variable overriding `elastic.uri` (comma separated)
pub const ENV_ES_URI: &str = "STORM_ES_URI";

/// Top-level service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Port of the HTTP front end
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    #[serde(default)]
    pub aqi: AqiConfig,

    #[serde(default)]
    pub elastic: ElasticConfig,

    #[serde(default)]
    pub bulk: BulkConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub log: LogConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            aqi: AqiConfig::default(),
            elastic: ElasticConfig::default(),
            bulk: BulkConfig::default(),
            monitor: MonitorConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Upstream AQI feed and index names
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AqiConfig {
    /// Upstream AQI API base URL
    #[serde(default)]
    pub server: String,

    /// Upstream API token
    #[serde(default)]
    pub token: String,

    /// Station metadata index
    #[serde(default = "default_station_index")]
    pub station_index: String,

    /// Historical readings index template; `$` is replaced by the year
    #[serde(default = "default_his_index")]
    pub his_index: String,

    /// Real-time readings index
    #[serde(default = "default_realtime_index")]
    pub realtime_index: String,
}

impl Default for AqiConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            token: String::new(),
            station_index: default_station_index(),
            his_index: default_his_index(),
            realtime_index: default_realtime_index(),
        }
    }
}

/// Search store connection and client pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElasticConfig {
    /// Store endpoints, used round-robin
    #[serde(default = "default_uri")]
    pub uri: Vec<String>,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Log every store request and response at debug level
    #[serde(default)]
    pub enable_debug_logger: bool,

    /// Retries on transport errors and 502/503/504
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Scroll context keep-alive in seconds
    #[serde(default = "default_scroll_keep_alive")]
    pub scroll_keep_alive_secs: u64,

    #[serde(default = "default_true")]
    pub lifo: bool,

    #[serde(default = "default_max_total")]
    pub max_total: usize,

    #[serde(default = "default_max_total")]
    pub max_idle: usize,

    #[serde(default)]
    pub min_idle: usize,

    #[serde(default)]
    pub test_on_create: bool,

    #[serde(default)]
    pub test_on_borrow: bool,

    #[serde(default)]
    pub test_on_return: bool,

    #[serde(default)]
    pub test_while_idle: bool,

    #[serde(default = "default_true")]
    pub block_when_exhausted: bool,

    /// Upper bound on a blocking borrow in milliseconds (unset waits forever)
    #[serde(default)]
    pub max_wait_millis: Option<u64>,

    /// Evictor interval in seconds (0 disables the evictor)
    #[serde(default)]
    pub time_between_eviction_runs: u64,

    /// Idle clients examined per eviction run (0 examines all)
    #[serde(default = "default_tests_per_eviction_run")]
    pub num_tests_per_eviction_run: usize,

    /// Idle seconds before an idle client is evicted
    #[serde(default = "default_min_evictable_idle")]
    pub min_evictable_idle_time: u64,

    #[serde(default)]
    pub remove_abandoned_on_borrow: bool,

    #[serde(default)]
    pub remove_abandoned_on_maintenance: bool,

    /// Seconds after which a borrowed client counts as abandoned
    #[serde(default = "default_remove_abandoned_timeout")]
    pub remove_abandoned_timeout: u64,
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            username: String::new(),
            password: String::new(),
            enable_debug_logger: false,
            max_retries: default_max_retries(),
            request_timeout_secs: default_request_timeout(),
            scroll_keep_alive_secs: default_scroll_keep_alive(),
            lifo: true,
            max_total: default_max_total(),
            max_idle: default_max_total(),
            min_idle: 0,
            test_on_create: false,
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: false,
            block_when_exhausted: true,
            max_wait_millis: None,
            time_between_eviction_runs: 0,
            num_tests_per_eviction_run: default_tests_per_eviction_run(),
            min_evictable_idle_time: default_min_evictable_idle(),
            remove_abandoned_on_borrow: false,
            remove_abandoned_on_maintenance: false,
            remove_abandoned_timeout: default_remove_abandoned_timeout(),
        }
    }
}

impl ElasticConfig {
    /// Map pool settings into the core pool configuration
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_total: self.max_total,
            max_idle: self.max_idle,
            min_idle: self.min_idle,
            lifo: self.lifo,
            test_on_create: self.test_on_create,
            test_on_borrow: self.test_on_borrow,
            test_on_return: self.test_on_return,
            test_while_idle: self.test_while_idle,
            block_when_exhausted: self.block_when_exhausted,
            max_wait: self.max_wait_millis.map(Duration::from_millis),
            time_between_eviction_runs: secs_or_none(self.time_between_eviction_runs),
            num_tests_per_eviction_run: self.num_tests_per_eviction_run,
            min_evictable_idle_time: secs_or_none(self.min_evictable_idle_time),
            remove_abandoned_on_borrow: self.remove_abandoned_on_borrow,
            remove_abandoned_on_maintenance: self.remove_abandoned_on_maintenance,
            remove_abandoned_timeout: Duration::from_secs(self.remove_abandoned_timeout),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn scroll_keep_alive(&self) -> Duration {
        Duration::from_secs(self.scroll_keep_alive_secs)
    }

    /// Credentials, if a username is configured
    pub fn credentials(&self) -> Option<(&str, &str)> {
        if self.username.is_empty() {
            None
        } else {
            Some((self.username.as_str(), self.password.as_str()))
        }
    }
}

/// Bulk indexer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkConfig {
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    #[serde(default = "default_flush_bytes")]
    pub flush_bytes: usize,

    #[serde(default)]
    pub flush_items: Option<usize>,

    /// Bound on one bulk request in seconds
    #[serde(default = "default_bulk_timeout")]
    pub timeout_secs: u64,

    /// Failed items kept for retry (unset keeps everything)
    #[serde(default)]
    pub failure_queue_capacity: Option<usize>,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            flush_interval_secs: default_flush_interval(),
            flush_bytes: default_flush_bytes(),
            flush_items: None,
            timeout_secs: default_bulk_timeout(),
            failure_queue_capacity: None,
        }
    }
}

impl BulkConfig {
    pub fn indexer_config(&self) -> BulkIndexerConfig {
        BulkIndexerConfig {
            num_workers: self.num_workers,
            flush_interval: Duration::from_secs(self.flush_interval_secs),
            flush_bytes: self.flush_bytes,
            flush_items: self.flush_items,
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

/// Connectivity heartbeat settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
        }
    }
}

impl MonitorConfig {
    pub fn connectivity_config(&self) -> ConnectivityConfig {
        ConnectivityConfig {
            check_interval: Duration::from_secs(self.check_interval_secs),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LogConfig {
    #[serde(default)]
    pub level: LogLevel,

    /// Write JSON logs to this file instead of stdout
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// Log level for diagnostic output
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_http_port() -> u16 {
    8080
}

fn default_station_index() -> String {
    "aqi-station".to_string()
}

fn default_his_index() -> String {
    "aqi-history-$".to_string()
}

fn default_realtime_index() -> String {
    "aqi-realtime".to_string()
}

fn default_uri() -> Vec<String> {
    vec!["http://127.0.0.1:9200".to_string()]
}

fn default_max_retries() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    20
}

fn default_scroll_keep_alive() -> u64 {
    20
}

fn default_max_total() -> usize {
    8
}

fn default_tests_per_eviction_run() -> usize {
    3
}

fn default_min_evictable_idle() -> u64 {
    30 * 60
}

fn default_remove_abandoned_timeout() -> u64 {
    300
}

fn default_num_workers() -> usize {
    8
}

fn default_flush_interval() -> u64 {
    5
}

fn default_flush_bytes() -> usize {
    5 * 1024 * 1024 // 5 MB
}

fn default_bulk_timeout() -> u64 {
    60
}

fn default_check_interval() -> u64 {
    3
}

fn secs_or_none(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| StormError::Config(format!("Failed to serialize configuration: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply `STORM_ES_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply credential and endpoint overrides from `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(username) = lookup(ENV_ES_USERNAME) {
            self.elastic.username = username;
        }
        if let Some(password) = lookup(ENV_ES_PASSWORD) {
            self.elastic.password = password;
        }
        if let Some(uri) = lookup(ENV_ES_URI) {
            let uris: Vec<String> = uri
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect();
            if !uris.is_empty() {
                self.elastic.uri = uris;
            }
        }
    }

    /// Check the configuration for values the service cannot run with
    pub fn validate(&self) -> Result<()> {
        let es = &self.elastic;
        if es.uri.iter().all(|u| u.trim().is_empty()) {
            return Err(StormError::Config(
                "elastic.uri must list at least one endpoint".to_string(),
            ));
        }
        if es.max_total == 0 {
            return Err(StormError::Config(
                "elastic.max_total must be greater than 0".to_string(),
            ));
        }
        if es.max_idle > es.max_total {
            return Err(StormError::Config(format!(
                "elastic.max_idle ({}) exceeds elastic.max_total ({})",
                es.max_idle, es.max_total
            )));
        }
        if es.min_idle > es.max_total {
            return Err(StormError::Config(format!(
                "elastic.min_idle ({}) exceeds elastic.max_total ({})",
                es.min_idle, es.max_total
            )));
        }
        if self.bulk.num_workers == 0 {
            return Err(StormError::Config(
                "bulk.num_workers must be greater than 0".to_string(),
            ));
        }
        if self.bulk.flush_interval_secs == 0 {
            return Err(StormError::Config(
                "bulk.flush_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.monitor.check_interval_secs == 0 {
            return Err(StormError::Config(
                "monitor.check_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.elastic.max_total, 8);
        assert!(config.elastic.block_when_exhausted);
        assert_eq!(config.bulk.num_workers, 8);
        assert_eq!(config.bulk.flush_interval_secs, 5);
        assert_eq!(config.monitor.check_interval_secs, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
http_port = 9000

[elastic]
uri = ["http://es-1:9200", "http://es-2:9200"]
username = "elastic"
password = "changeme"
max_total = 16
max_idle = 4
test_on_borrow = true
time_between_eviction_runs = 30

[bulk]
flush_items = 500
"#
        )
        .unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.http_port, 9000);
        assert_eq!(config.elastic.uri.len(), 2);
        assert_eq!(config.elastic.credentials(), Some(("elastic", "changeme")));
        assert_eq!(config.bulk.flush_items, Some(500));
        assert_eq!(config.bulk.flush_interval_secs, 5);
        assert_eq!(config.log.level, LogLevel::Info);

        let pool = config.elastic.pool_config();
        assert_eq!(pool.max_total, 16);
        assert_eq!(pool.max_idle, 4);
        assert!(pool.test_on_borrow);
        assert_eq!(pool.time_between_eviction_runs, Some(Duration::from_secs(30)));
        assert_eq!(pool.max_wait, None);
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "http_port = \"not a number\"").unwrap();
        let result = AppConfig::from_file(file.path());
        assert!(matches!(result, Err(StormError::ConfigParse(_))));
    }

    #[test]
    fn test_file_round_trip() {
        let file = NamedTempFile::new().unwrap();
        let mut config = AppConfig::default();
        config.bulk.failure_queue_capacity = Some(10_000);
        config.to_file(file.path()).unwrap();

        let loaded = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_ES_USERNAME, "svc"),
            (ENV_ES_PASSWORD, "secret"),
            (ENV_ES_URI, "http://a:9200, http://b:9200,"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.elastic.username, "svc");
        assert_eq!(config.elastic.password, "secret");
        assert_eq!(config.elastic.uri, vec!["http://a:9200", "http://b:9200"]);
    }

    #[test]
    fn test_validation_rejects_bad_pool_sizes() {
        let mut config = AppConfig::default();
        config.elastic.max_total = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.elastic.max_idle = 20;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.elastic.uri = vec![" ".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_check_interval() {
        let mut config = AppConfig::default();
        config.monitor.check_interval_secs = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: monitor.check_interval_secs must be greater than 0"
        );

        config.monitor.check_interval_secs = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_eviction_interval_disables_evictor() {
        let config = ElasticConfig::default();
        assert_eq!(config.pool_config().time_between_eviction_runs, None);
        assert_eq!(config.credentials(), None);
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_tracing_level(), tracing::Level::ERROR);
        assert_eq!(LogLevel::Warn.to_tracing_level(), tracing::Level::WARN);
        assert_eq!(LogLevel::Info.to_tracing_level(), tracing::Level::INFO);
        assert_eq!(LogLevel::Debug.to_tracing_level(), tracing::Level::DEBUG);
        assert_eq!(LogLevel::Trace.to_tracing_level(), tracing::Level::TRACE);
    }
}
