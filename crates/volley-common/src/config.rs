//! Configuration for Volley

use serde::{Deserialize, Serialize};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server identity
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Outbound SMTP configuration
    #[serde(default)]
    pub smtp: SmtpConfig,

    /// Tracking and unsubscribe URL/signing configuration
    pub tracking: TrackingConfig,

    /// Delivery engine tuning
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Hostname used in Message-IDs
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
        }
    }
}

fn default_hostname() -> String {
    "localhost".to_string()
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    5
}

/// Outbound SMTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    /// Relay host
    #[serde(default = "default_smtp_host")]
    pub host: String,

    /// Relay port
    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// Optional credentials
    pub username: Option<String>,
    pub password: Option<String>,

    /// Use implicit TLS
    #[serde(default)]
    pub use_tls: bool,

    /// Use STARTTLS
    #[serde(default = "default_use_starttls")]
    pub use_starttls: bool,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            username: None,
            password: None,
            use_tls: false,
            use_starttls: default_use_starttls(),
        }
    }
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_use_starttls() -> bool {
    true
}

/// Tracking configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Secret key for tracking/unsubscribe token signing
    pub secret: String,

    /// Base URL of the tracking endpoints (open pixel, click redirect)
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Base URL of the public unsubscribe endpoint
    #[serde(default = "default_unsubscribe_base_url")]
    pub unsubscribe_base_url: String,
}

fn default_api_base_url() -> String {
    "http://localhost:8080/v1".to_string()
}

fn default_unsubscribe_base_url() -> String {
    "http://localhost:8080/unsubscribe".to_string()
}

/// Delivery engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Maximum concurrent sends within one campaign batch
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Seconds between dispatcher passes while retries are pending
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Per-send transport timeout in seconds
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    /// Scheduler tick interval in seconds
    #[serde(default = "default_scheduler_interval")]
    pub scheduler_interval_secs: u64,

    /// Webhook delivery timeout in seconds
    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_secs: default_poll_interval(),
            send_timeout_secs: default_send_timeout(),
            scheduler_interval_secs: default_scheduler_interval(),
            webhook_timeout_secs: default_webhook_timeout(),
        }
    }
}

fn default_concurrency() -> usize {
    10
}

fn default_poll_interval() -> u64 {
    5
}

fn default_send_timeout() -> u64 {
    30
}

fn default_scheduler_interval() -> u64 {
    60
}

fn default_webhook_timeout() -> u64 {
    10
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default tracing filter when RUST_LOG is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info,volley=debug".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default locations
    pub fn load() -> crate::Result<Self> {
        let paths = [
            std::path::PathBuf::from("./volley.toml"),
            std::path::PathBuf::from("/etc/volley/volley.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Err(crate::Error::Config(
            "No configuration file found".to_string(),
        ))
    }

    fn validate(&self) -> crate::Result<()> {
        if self.tracking.secret.is_empty() {
            return Err(crate::Error::Config(
                "tracking.secret must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
