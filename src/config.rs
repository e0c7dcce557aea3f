use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub scheduler: SchedulerConfig,
    pub classifier: ClassifierConfig,
    pub llm: LlmConfig,
    pub gpu: GpuPowerConfig,
    pub workers: WorkersConfig,
    pub housekeeping: HousekeepingConfig,
    pub leader: LeaderConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

/// Fetch scheduler configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often due channels are checked (default: 60s)
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub tick_secs: u64,
    /// Concurrent connector fetches (default: 4)
    pub max_parallel_fetches: usize,
}

/// External classifier service configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub base_url: String,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub timeout_secs: u64,
    /// Cosine threshold for embedding-based duplicate lookups
    pub duplicate_threshold: f64,
    /// Only re-check duplicates for items fetched in the last N days (0 = no limit)
    pub duplicate_check_days: i64,
    /// Daily sync check: tolerated |DB - vector store| delta before an error is logged
    pub sync_delta_threshold: i64,
    /// Classifier worker batch size
    pub batch_size: i64,
    /// Classifier worker idle sleep (default: 60s)
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub idle_sleep_secs: u64,
    /// Prefixes stripped from title/content before embedding operations
    pub boilerplate_prefixes: Vec<String>,
}

/// LLM provider chain + LLM worker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Master switch; overridable at runtime via the `llm_enabled` setting
    pub enabled: bool,
    pub ollama_base_url: String,
    pub ollama_model: String,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub ollama_timeout_secs: u64,
    pub openrouter_api_key: Option<String>,
    pub openrouter_model: String,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub openrouter_timeout_secs: u64,
    /// Fresh items drained per batch
    pub batch_size: usize,
    /// Backlog items fetched per query
    pub backlog_batch_size: i64,
    /// LLM worker idle sleep (default: 30s)
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub idle_sleep_secs: u64,
    /// Fresh queue capacity; overflow drops newest (backlog scan recovers them)
    pub fresh_queue_capacity: usize,
}

/// GPU host power management (Wake-on-LAN + SSH shutdown).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GpuPowerConfig {
    pub wol_enabled: bool,
    /// MAC address for WoL packets (format: xx:xx:xx:xx:xx:xx)
    pub mac_address: String,
    /// Broadcast address for WoL packets
    pub broadcast: String,
    pub ssh_host: String,
    pub ssh_user: String,
    pub ssh_key_path: String,
    pub auto_shutdown: bool,
    /// Seconds idle before auto-shutdown (default: 300)
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub idle_timeout_secs: u64,
    /// Max seconds to wait for the LLM endpoint after WoL (default: 120)
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub wake_timeout_secs: u64,
    /// Availability probe timeout (default: 5s)
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub health_timeout_secs: u64,
    /// Hour (0-23) when waking the host becomes allowed
    pub active_hours_start: u32,
    /// Hour (0-23) when waking the host stops being allowed
    pub active_hours_end: u32,
    /// Only wake on weekdays (Mon-Fri)
    pub active_weekdays_only: bool,
}

/// Background worker toggles and the command-poll cadence.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub scheduler_enabled: bool,
    pub classifier_enabled: bool,
    pub llm_enabled: bool,
    /// Command/stats poll interval (default: 5s); overridable at runtime
    /// via the `worker_poll_interval` setting
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub poll_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HousekeepingConfig {
    pub enabled: bool,
    /// Events/processing logs older than this are pruned (default: 90 days)
    #[serde(deserialize_with = "deserialize_days_i64")]
    pub retention_days: i64,
    /// NONE-priority items older than this are archived (default: 30 days)
    #[serde(deserialize_with = "deserialize_days_i64")]
    pub archive_none_after_days: i64,
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LeaderConfig {
    /// Well-known lock file path; existence = leadership held
    pub lock_path: String,
}

/// Command line arguments for configuration overrides
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "newsroom")]
#[command(version, about = "Newsroom - News ingestion and triage pipeline")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Server host (overrides config file)
    #[arg(long, value_name = "HOST")]
    pub server_host: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(long, value_name = "URL")]
    pub database_url: Option<String>,

    /// Logging level (overrides config file, e.g., "info,news_aggregator=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Classifier service base URL (overrides config file)
    #[arg(long, value_name = "URL")]
    pub classifier_url: Option<String>,

    /// Ollama base URL for the primary LLM provider (overrides config file)
    #[arg(long, value_name = "URL")]
    pub ollama_url: Option<String>,

    /// Leader lock file path (overrides config file)
    #[arg(long, value_name = "PATH")]
    pub leader_lock_path: Option<String>,

    /// Enable/disable the fetch scheduler (overrides config file)
    #[arg(long, value_name = "BOOL")]
    pub scheduler_enabled: Option<bool>,

    /// Enable/disable the classifier worker (overrides config file)
    #[arg(long, value_name = "BOOL")]
    pub classifier_worker_enabled: Option<bool>,

    /// Enable/disable the LLM worker (overrides config file)
    #[arg(long, value_name = "BOOL")]
    pub llm_worker_enabled: Option<bool>,
}

impl Config {
    /// Load configuration with command line, environment variable, and file support
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables (prefixed with APP_)
    /// 3. Configuration file (config.toml)
    /// 4. Default values
    pub fn load() -> Result<Self, anyhow::Error> {
        let cli_args = CommandLineArgs::parse();
        Self::load_with_args(&cli_args)
    }

    /// Same as `load` but with pre-parsed arguments.
    pub fn load_with_args(cli_args: &CommandLineArgs) -> Result<Self, anyhow::Error> {
        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(cli_args);
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - APP_SERVER_HOST / APP_SERVER_PORT
    /// - APP_DATABASE_URL
    /// - APP_LOG_LEVEL
    /// - APP_CLASSIFIER_URL
    /// - APP_OLLAMA_BASE_URL / APP_OLLAMA_MODEL
    /// - APP_OPENROUTER_API_KEY
    /// - APP_GPU_WOL_ENABLED / APP_GPU_MAC_ADDRESS / APP_GPU_BROADCAST
    /// - APP_SCHEDULER_ENABLED / APP_CLASSIFIER_WORKER_ENABLED / APP_LLM_WORKER_ENABLED
    /// - APP_LEADER_LOCK_PATH
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("APP_SERVER_HOST") {
            self.server.host = host;
            tracing::info!("Override server.host from env: {}", self.server.host);
        }

        if let Ok(port) = std::env::var("APP_SERVER_PORT")
            && let Ok(port) = port.parse()
        {
            self.server.port = port;
            tracing::info!("Override server.port from env: {}", self.server.port);
        }

        if let Ok(db_url) = std::env::var("APP_DATABASE_URL") {
            self.database.url = db_url;
            tracing::info!("Override database.url from env");
        }

        if let Ok(level) = std::env::var("APP_LOG_LEVEL") {
            self.logging.level = level;
            tracing::info!("Override logging.level from env: {}", self.logging.level);
        }

        if let Ok(url) = std::env::var("APP_CLASSIFIER_URL") {
            self.classifier.base_url = url;
            tracing::info!("Override classifier.base_url from env");
        }

        if let Ok(url) = std::env::var("APP_OLLAMA_BASE_URL") {
            self.llm.ollama_base_url = url;
            tracing::info!("Override llm.ollama_base_url from env");
        }

        if let Ok(model) = std::env::var("APP_OLLAMA_MODEL") {
            self.llm.ollama_model = model;
            tracing::info!("Override llm.ollama_model from env: {}", self.llm.ollama_model);
        }

        if let Ok(key) = std::env::var("APP_OPENROUTER_API_KEY") {
            self.llm.openrouter_api_key = Some(key);
            tracing::info!("Override llm.openrouter_api_key from env");
        }

        if let Ok(enabled) = std::env::var("APP_GPU_WOL_ENABLED")
            && let Ok(val) = enabled.parse()
        {
            self.gpu.wol_enabled = val;
            tracing::info!("Override gpu.wol_enabled from env: {}", self.gpu.wol_enabled);
        }

        if let Ok(mac) = std::env::var("APP_GPU_MAC_ADDRESS") {
            self.gpu.mac_address = mac;
            tracing::info!("Override gpu.mac_address from env");
        }

        if let Ok(broadcast) = std::env::var("APP_GPU_BROADCAST") {
            self.gpu.broadcast = broadcast;
            tracing::info!("Override gpu.broadcast from env: {}", self.gpu.broadcast);
        }

        if let Ok(enabled) = std::env::var("APP_SCHEDULER_ENABLED")
            && let Ok(val) = enabled.parse()
        {
            self.workers.scheduler_enabled = val;
            tracing::info!("Override workers.scheduler_enabled from env: {}", val);
        }

        if let Ok(enabled) = std::env::var("APP_CLASSIFIER_WORKER_ENABLED")
            && let Ok(val) = enabled.parse()
        {
            self.workers.classifier_enabled = val;
            tracing::info!("Override workers.classifier_enabled from env: {}", val);
        }

        if let Ok(enabled) = std::env::var("APP_LLM_WORKER_ENABLED")
            && let Ok(val) = enabled.parse()
        {
            self.workers.llm_enabled = val;
            tracing::info!("Override workers.llm_enabled from env: {}", val);
        }

        if let Ok(path) = std::env::var("APP_LEADER_LOCK_PATH") {
            self.leader.lock_path = path;
            tracing::info!("Override leader.lock_path from env: {}", self.leader.lock_path);
        }
    }

    /// Apply command line argument overrides (highest priority)
    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(host) = &args.server_host {
            self.server.host = host.clone();
            tracing::info!("Override server.host from CLI: {}", self.server.host);
        }

        if let Some(port) = args.server_port {
            self.server.port = port;
            tracing::info!("Override server.port from CLI: {}", self.server.port);
        }

        if let Some(db_url) = &args.database_url {
            self.database.url = db_url.clone();
            tracing::info!("Override database.url from CLI");
        }

        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
            tracing::info!("Override logging.level from CLI: {}", self.logging.level);
        }

        if let Some(url) = &args.classifier_url {
            self.classifier.base_url = url.clone();
            tracing::info!("Override classifier.base_url from CLI");
        }

        if let Some(url) = &args.ollama_url {
            self.llm.ollama_base_url = url.clone();
            tracing::info!("Override llm.ollama_base_url from CLI");
        }

        if let Some(path) = &args.leader_lock_path {
            self.leader.lock_path = path.clone();
            tracing::info!("Override leader.lock_path from CLI: {}", self.leader.lock_path);
        }

        if let Some(enabled) = args.scheduler_enabled {
            self.workers.scheduler_enabled = enabled;
            tracing::info!("Override workers.scheduler_enabled from CLI: {}", enabled);
        }

        if let Some(enabled) = args.classifier_worker_enabled {
            self.workers.classifier_enabled = enabled;
            tracing::info!("Override workers.classifier_enabled from CLI: {}", enabled);
        }

        if let Some(enabled) = args.llm_worker_enabled {
            self.workers.llm_enabled = enabled;
            tracing::info!("Override workers.llm_enabled from CLI: {}", enabled);
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.scheduler.tick_secs == 0 {
            anyhow::bail!("scheduler.tick_secs must be > 0");
        }
        if self.scheduler.max_parallel_fetches == 0 {
            anyhow::bail!("scheduler.max_parallel_fetches must be > 0");
        }

        if !(0.0..=1.0).contains(&self.classifier.duplicate_threshold) {
            anyhow::bail!("classifier.duplicate_threshold must be within [0, 1]");
        }

        if self.gpu.active_hours_start > 23 || self.gpu.active_hours_end > 23 {
            anyhow::bail!("gpu.active_hours_* must be hours in 0-23");
        }

        if self.gpu.wol_enabled && self.gpu.mac_address.is_empty() {
            anyhow::bail!("gpu.mac_address is required when gpu.wol_enabled is true");
        }

        if self.workers.poll_interval_secs == 0 {
            anyhow::bail!("workers.poll_interval_secs must be > 0");
        }

        if self.llm.fresh_queue_capacity == 0 {
            anyhow::bail!("llm.fresh_queue_capacity must be > 0");
        }

        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths =
            ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080 }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: "sqlite://data/newsroom.db".to_string() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,news_aggregator=debug".to_string(),
            file: Some("logs/newsroom.log".to_string()),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_secs: 60, max_parallel_fetches: 4 }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8001".to_string(),
            timeout_secs: 30,
            duplicate_threshold: 0.75,
            duplicate_check_days: 7,
            sync_delta_threshold: 50,
            batch_size: 50,
            idle_sleep_secs: 60,
            boilerplate_prefixes: vec![
                "Pressemitteilung:".to_string(),
                "PM:".to_string(),
                "+++".to_string(),
            ],
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ollama_base_url: "http://gpu1:11434".to_string(),
            ollama_model: "qwen2.5:32b".to_string(),
            ollama_timeout_secs: 300,
            openrouter_api_key: None,
            openrouter_model: "meta-llama/llama-3.3-70b-instruct".to_string(),
            openrouter_timeout_secs: 120,
            batch_size: 10,
            backlog_batch_size: 50,
            idle_sleep_secs: 30,
            fresh_queue_capacity: 1024,
        }
    }
}

impl Default for GpuPowerConfig {
    fn default() -> Self {
        Self {
            wol_enabled: false,
            mac_address: String::new(),
            broadcast: "255.255.255.255".to_string(),
            ssh_host: "192.168.0.141".to_string(),
            ssh_user: "newsroom".to_string(),
            ssh_key_path: "/app/ssh/id_ed25519".to_string(),
            auto_shutdown: true,
            idle_timeout_secs: 300,
            wake_timeout_secs: 120,
            health_timeout_secs: 5,
            active_hours_start: 7,
            active_hours_end: 16,
            active_weekdays_only: true,
        }
    }
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            scheduler_enabled: true,
            classifier_enabled: true,
            llm_enabled: true,
            poll_interval_secs: 5,
        }
    }
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 90,
            archive_none_after_days: 30,
            interval_secs: 86400,
        }
    }
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self { lock_path: "/tmp/newsroom-worker-leader".to_string() }
    }
}

// =========================
// Helpers for parsing values
// =========================

fn parse_duration_to_secs(input: &str) -> Result<u64, String> {
    // Accept plain numbers (treated as seconds)
    if let Ok(val) = input.parse::<u64>() {
        return Ok(val);
    }

    let s = input.trim().to_lowercase();
    let (num_str, unit) = s.split_at(s.chars().take_while(|c| c.is_ascii_digit()).count());
    if num_str.is_empty() || unit.is_empty() {
        return Err("missing number or unit".into());
    }
    let n: u64 = num_str.parse().map_err(|_| "invalid number".to_string())?;
    match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => Ok(n),
        "m" | "min" | "mins" | "minute" | "minutes" => Ok(n * 60),
        "h" | "hr" | "hour" | "hours" => Ok(n * 60 * 60),
        "d" | "day" | "days" => Ok(n * 60 * 60 * 24),
        _ => Err(format!("unsupported unit: {}", unit)),
    }
}

fn parse_days_to_i64(input: &str) -> Result<i64, String> {
    // Accept plain numbers (treated as days)
    if let Ok(val) = input.parse::<i64>() {
        return Ok(val);
    }

    let s = input.trim().to_lowercase();
    let (num_str, unit) = s.split_at(s.chars().take_while(|c| c.is_ascii_digit()).count());
    if num_str.is_empty() || unit.is_empty() {
        return Err("missing number or unit".into());
    }
    let n: i64 = num_str.parse().map_err(|_| "invalid number".to_string())?;
    match unit {
        "d" | "day" | "days" => Ok(n),
        "w" | "week" | "weeks" => Ok(n * 7),
        _ => Err(format!("unsupported unit: {}", unit)),
    }
}

// Custom serde deserializers to support numeric or human-friendly string values
fn deserialize_duration_secs<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct Visitor;
    impl<'de> serde::de::Visitor<'de> for Visitor {
        type Value = u64;
        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "a number of seconds or a string like '30s', '5m', '1h'")
        }
        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v)
        }
        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if v >= 0 { Ok(v as u64) } else { Err(E::custom("negative not allowed")) }
        }
        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_duration_to_secs(v).map_err(E::custom)
        }
        fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_duration_to_secs(&v).map_err(E::custom)
        }
    }
    deserializer.deserialize_any(Visitor)
}

fn deserialize_days_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct Visitor;
    impl<'de> serde::de::Visitor<'de> for Visitor {
        type Value = i64;
        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "a number of days or a string like '7d' or '2w'")
        }
        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
            Ok(v)
        }
        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v as i64)
        }
        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_days_to_i64(v).map_err(E::custom)
        }
        fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_days_to_i64(&v).map_err(E::custom)
        }
    }
    deserializer.deserialize_any(Visitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_strings() {
        assert_eq!(parse_duration_to_secs("30").unwrap(), 30);
        assert_eq!(parse_duration_to_secs("5m").unwrap(), 300);
        assert_eq!(parse_duration_to_secs("2h").unwrap(), 7200);
        assert!(parse_duration_to_secs("fortnight").is_err());
    }

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_wol_requires_mac() {
        let mut config = Config::default();
        config.gpu.wol_enabled = true;
        assert!(config.validate().is_err());
        config.gpu.mac_address = "aa:bb:cc:dd:ee:ff".to_string();
        assert!(config.validate().is_ok());
    }
}
