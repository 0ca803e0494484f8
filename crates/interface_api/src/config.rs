//! API configuration

use serde::Deserialize;

/// Process-level settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Log level
    pub log_level: String,
    /// Seconds between outbox dispatch passes
    pub outbox_dispatch_interval_secs: u64,
    /// Delivery attempts before a notification is dropped
    pub outbox_max_attempts: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            log_level: "info".to_string(),
            outbox_dispatch_interval_secs: 5,
            outbox_max_attempts: 5,
        }
    }
}

impl ApiConfig {
    /// Loads configuration from `API_*` environment variables; unset keys
    /// keep their defaults
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::Environment::with_prefix("API"))
            .build()?
            .try_deserialize()
    }

    /// Returns the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
