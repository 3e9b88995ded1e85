//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and `TRELLIS_*` environment variable overrides.
//! Every option has a default, so an empty environment still yields a usable
//! configuration; problems that should not abort startup are collected by
//! [`Config::warnings`] and left for the caller to log.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::lifecycle::BootFailurePolicy;
use crate::pubsub::{BackpressurePolicy, BusConfig};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub email: EmailConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub bus: BusSettings,

    #[serde(default)]
    pub websocket: WebSocketSettings,

    #[serde(default)]
    pub lifecycle: LifecycleSettings,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Module-specific config blobs, keyed by module name (`[modules.<name>]`)
    #[serde(default)]
    pub modules: HashMap<String, toml::Value>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,

    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub session_secret: Option<String>,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_shutdown_timeout() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            base_url: default_base_url(),
            session_secret: None,
            shutdown_timeout_secs: default_shutdown_timeout(),
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Deadline applied to the whole shutdown sequence
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Database connection settings
///
/// The runtime never talks to the database itself; modules read these
/// settings to build their own driver.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_db_namespace")]
    pub namespace: String,

    #[serde(default = "default_db_name")]
    pub database: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_query_timeout")]
    pub query_timeout_ms: u64,

    #[serde(default = "default_execute_timeout")]
    pub execute_timeout_ms: u64,
}

fn default_db_namespace() -> String {
    "trellis".to_string()
}

fn default_db_name() -> String {
    "app".to_string()
}

fn default_query_timeout() -> u64 {
    5_000
}

fn default_execute_timeout() -> u64 {
    10_000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            namespace: default_db_namespace(),
            database: default_db_name(),
            username: None,
            password: None,
            query_timeout_ms: default_query_timeout(),
            execute_timeout_ms: default_execute_timeout(),
        }
    }
}

impl DatabaseConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn execute_timeout(&self) -> Duration {
        Duration::from_millis(self.execute_timeout_ms)
    }
}

/// Email delivery provider selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmailProvider {
    /// Write messages to the log instead of sending them
    #[default]
    Log,
    Sendgrid,
    Ses,
}

impl EmailProvider {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "log" => Some(Self::Log),
            "sendgrid" => Some(Self::Sendgrid),
            "ses" => Some(Self::Ses),
            _ => None,
        }
    }
}

/// Email delivery configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub provider: EmailProvider,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_email_from")]
    pub from: String,
}

fn default_email_from() -> String {
    "noreply@localhost".to_string()
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            provider: EmailProvider::default(),
            api_key: None,
            from: default_email_from(),
        }
    }
}

/// File storage backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Local,
    S3,
}

impl StorageBackend {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "local" => Some(Self::Local),
            "s3" => Some(Self::S3),
            _ => None,
        }
    }
}

/// Upload storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default = "default_storage_path")]
    pub path: String,

    #[serde(default = "default_max_upload")]
    pub max_upload_bytes: usize,

    #[serde(default = "default_allowed_mime_types")]
    pub allowed_mime_types: Vec<String>,
}

fn default_storage_path() -> String {
    "./uploads".to_string()
}

fn default_max_upload() -> usize {
    10 * 1024 * 1024 // 10 MiB
}

fn default_allowed_mime_types() -> Vec<String> {
    [
        "image/jpeg",
        "image/png",
        "image/gif",
        "image/webp",
        "application/pdf",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
            max_upload_bytes: default_max_upload(),
            allowed_mime_types: default_allowed_mime_types(),
        }
    }
}

impl StorageConfig {
    /// Check a MIME type against the allow-list (parameters are ignored)
    pub fn is_mime_allowed(&self, mime: &str) -> bool {
        let essence = mime.split(';').next().unwrap_or("").trim();
        self.allowed_mime_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(essence))
    }
}

/// Pub/sub bus tuning
#[derive(Debug, Clone, Deserialize)]
pub struct BusSettings {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_bus_policy")]
    pub policy: String,

    #[serde(default = "default_block_timeout")]
    pub block_timeout_ms: u64,

    #[serde(default = "default_handler_grace")]
    pub handler_grace_ms: u64,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_bus_policy() -> String {
    "block_bounded".to_string()
}

fn default_block_timeout() -> u64 {
    50
}

fn default_handler_grace() -> u64 {
    2_000
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            policy: default_bus_policy(),
            block_timeout_ms: default_block_timeout(),
            handler_grace_ms: default_handler_grace(),
        }
    }
}

impl BusSettings {
    fn parsed_policy(&self) -> Option<BackpressurePolicy> {
        match self.policy.to_ascii_lowercase().as_str() {
            "block_bounded" => Some(BackpressurePolicy::BlockBounded(Duration::from_millis(
                self.block_timeout_ms,
            ))),
            "drop_oldest" => Some(BackpressurePolicy::DropOldest),
            "evict_subscriber" => Some(BackpressurePolicy::EvictSubscriber),
            _ => None,
        }
    }

    /// Build the bus configuration, falling back to the default policy when
    /// the configured name is unknown
    pub fn to_bus_config(&self) -> BusConfig {
        let policy = self.parsed_policy().unwrap_or(BackpressurePolicy::BlockBounded(
            Duration::from_millis(self.block_timeout_ms),
        ));
        BusConfig {
            queue_capacity: self.queue_capacity.max(1),
            policy,
            handler_grace: Duration::from_millis(self.handler_grace_ms),
        }
    }
}

/// WebSocket bridge tuning shared by every channel
#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketSettings {
    /// One bridge is started per channel
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,

    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    #[serde(default = "default_max_message")]
    pub max_message_bytes: usize,
}

fn default_channels() -> Vec<String> {
    vec!["html".to_string(), "data".to_string()]
}

fn default_outbound_capacity() -> usize {
    256
}

fn default_max_connections() -> usize {
    10_000
}

fn default_write_timeout() -> u64 {
    10
}

fn default_pong_timeout() -> u64 {
    60
}

fn default_ping_interval() -> u64 {
    54 // 9/10 of the pong timeout
}

fn default_max_message() -> usize {
    64 * 1024
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            outbound_capacity: default_outbound_capacity(),
            max_connections: default_max_connections(),
            write_timeout_secs: default_write_timeout(),
            pong_timeout_secs: default_pong_timeout(),
            ping_interval_secs: default_ping_interval(),
            max_message_bytes: default_max_message(),
        }
    }
}

/// Module lifecycle settings
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleSettings {
    #[serde(default = "default_boot_failure")]
    pub boot_failure: String,
}

fn default_boot_failure() -> String {
    "abort".to_string()
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            boot_failure: default_boot_failure(),
        }
    }
}

impl LifecycleSettings {
    fn parsed_policy(&self) -> Option<BootFailurePolicy> {
        match self.boot_failure.to_ascii_lowercase().as_str() {
            "abort" => Some(BootFailurePolicy::Abort),
            "continue" => Some(BootFailurePolicy::Continue),
            _ => None,
        }
    }

    pub fn boot_failure_policy(&self) -> BootFailurePolicy {
        self.parsed_policy().unwrap_or(BootFailurePolicy::Abort)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            error: e.to_string(),
        })
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("trellis").join("config.toml")),
            Some(PathBuf::from("/etc/trellis/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path in config_paths.iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (the environment in production,
    /// a map in tests)
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // Server
        if let Some(addr) = lookup("TRELLIS_SERVER_ADDR") {
            self.server.addr = addr;
        }
        if let Some(url) = lookup("TRELLIS_BASE_URL") {
            self.server.base_url = url;
        }
        if let Some(secret) = lookup("TRELLIS_SESSION_SECRET") {
            self.server.session_secret = non_empty(secret);
        }

        // Database
        if let Some(url) = lookup("TRELLIS_DB_URL") {
            self.database.url = non_empty(url);
        }
        if let Some(ns) = lookup("TRELLIS_DB_NAMESPACE") {
            self.database.namespace = ns;
        }
        if let Some(db) = lookup("TRELLIS_DB_NAME") {
            self.database.database = db;
        }
        if let Some(user) = lookup("TRELLIS_DB_USER") {
            self.database.username = non_empty(user);
        }
        if let Some(pass) = lookup("TRELLIS_DB_PASS") {
            self.database.password = non_empty(pass);
        }
        if let Some(ms) = lookup("TRELLIS_DB_QUERY_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.database.query_timeout_ms = ms;
        }
        if let Some(ms) = lookup("TRELLIS_DB_EXEC_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.database.execute_timeout_ms = ms;
        }

        // Email
        if let Some(provider) = lookup("TRELLIS_EMAIL_PROVIDER") {
            match EmailProvider::parse(&provider) {
                Some(p) => self.email.provider = p,
                None => tracing::warn!(provider = %provider, "Unknown email provider, keeping {:?}", self.email.provider),
            }
        }
        if let Some(key) = lookup("TRELLIS_EMAIL_API_KEY") {
            self.email.api_key = non_empty(key);
        }
        if let Some(from) = lookup("TRELLIS_EMAIL_FROM") {
            self.email.from = from;
        }

        // Storage
        if let Some(backend) = lookup("TRELLIS_STORAGE_BACKEND") {
            match StorageBackend::parse(&backend) {
                Some(b) => self.storage.backend = b,
                None => tracing::warn!(backend = %backend, "Unknown storage backend, keeping {:?}", self.storage.backend),
            }
        }
        if let Some(path) = lookup("TRELLIS_STORAGE_PATH") {
            self.storage.path = path;
        }
        if let Some(max) = lookup("TRELLIS_MAX_UPLOAD_BYTES").and_then(|v| v.parse().ok()) {
            self.storage.max_upload_bytes = max;
        }
        if let Some(list) = lookup("TRELLIS_ALLOWED_MIME_TYPES") {
            self.storage.allowed_mime_types = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        // Logging
        if let Some(level) = lookup("TRELLIS_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("TRELLIS_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Non-fatal configuration problems
    ///
    /// Missing database and session settings are reported here rather than
    /// failing the load; the caller decides whether they are fatal.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.database.url.is_none() {
            warnings.push("database url is not set (TRELLIS_DB_URL)".to_string());
        }
        if self.server.session_secret.is_none() {
            warnings.push("session secret is not set (TRELLIS_SESSION_SECRET)".to_string());
        }
        if self.email.provider != EmailProvider::Log && self.email.api_key.is_none() {
            warnings.push(format!(
                "email provider {:?} selected without an api key",
                self.email.provider
            ));
        }
        if self.bus.parsed_policy().is_none() {
            warnings.push(format!(
                "unknown bus policy '{}', using block_bounded",
                self.bus.policy
            ));
        }
        if self.websocket.channels.is_empty() {
            warnings.push("no websocket channels configured, browsers cannot connect".to_string());
        }
        if self.lifecycle.parsed_policy().is_none() {
            warnings.push(format!(
                "unknown boot failure policy '{}', using abort",
                self.lifecycle.boot_failure
            ));
        }

        warnings
    }

    /// Deserialize the config blob registered for `module`
    ///
    /// Returns `T::default()` when the module has no `[modules.<name>]` table.
    pub fn module<T>(&self, module: &str) -> Result<T, ConfigError>
    where
        T: DeserializeOwned + Default,
    {
        match self.modules.get(module) {
            None => Ok(T::default()),
            Some(value) => value.clone().try_into().map_err(|e: toml::de::Error| {
                ConfigError::Module {
                    module: module.to_string(),
                    error: e.to_string(),
                }
            }),
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid config for module '{module}': {error}")]
    Module { module: String, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Trellis Configuration
#
# Environment variables override these settings:
# - TRELLIS_SERVER_ADDR, TRELLIS_BASE_URL, TRELLIS_SESSION_SECRET
# - TRELLIS_DB_URL, TRELLIS_DB_NAMESPACE, TRELLIS_DB_NAME, TRELLIS_DB_USER, TRELLIS_DB_PASS
# - TRELLIS_DB_QUERY_TIMEOUT_MS, TRELLIS_DB_EXEC_TIMEOUT_MS
# - TRELLIS_EMAIL_PROVIDER, TRELLIS_EMAIL_API_KEY, TRELLIS_EMAIL_FROM
# - TRELLIS_STORAGE_BACKEND, TRELLIS_STORAGE_PATH, TRELLIS_MAX_UPLOAD_BYTES, TRELLIS_ALLOWED_MIME_TYPES
# - TRELLIS_LOG_LEVEL, TRELLIS_LOG_FORMAT

[server]
addr = "0.0.0.0:8080"
base_url = "http://localhost:8080"
# session_secret = "change-me"
shutdown_timeout_secs = 5

[database]
# url = "ws://localhost:8000"
namespace = "trellis"
database = "app"
query_timeout_ms = 5000
execute_timeout_ms = 10000

[email]
# log, sendgrid or ses
provider = "log"
from = "noreply@localhost"

[storage]
# local or s3
backend = "local"
path = "./uploads"
max_upload_bytes = 10485760
allowed_mime_types = ["image/jpeg", "image/png", "image/gif", "image/webp", "application/pdf"]

[bus]
queue_capacity = 256
# block_bounded, drop_oldest or evict_subscriber
policy = "block_bounded"
block_timeout_ms = 50
handler_grace_ms = 2000

[websocket]
channels = ["html", "data"]
outbound_capacity = 256
max_connections = 10000
write_timeout_secs = 10
pong_timeout_secs = 60
ping_interval_secs = 54
max_message_bytes = 65536

[lifecycle]
# abort or continue
boot_failure = "abort"

[logging]
# trace, debug, info, warn, error
level = "info"
# pretty (for development) or json (for production)
format = "pretty"

# Module-specific settings live under [modules.<name>]
[modules.presence]
welcome = true
"#
    .to_string()
}
