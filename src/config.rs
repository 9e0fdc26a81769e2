use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Serialize, Default)]
pub struct AppConfig {
    pub broker: BrokerServerConfig,
    pub session: SessionConfig,
    pub auth: AuthConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct BrokerServerConfig {
    pub host: String,
    pub port: u16,
    /// Seconds a session collects offers before flipping to offers_ready.
    pub collection_window_secs: i64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct SessionConfig {
    pub poll_interval_ms: u64,
    pub poll_ceiling: u32,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct AuthConfig {
    /// Maximum accepted clock drift for signed request timestamps.
    pub replay_window_secs: i64,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
}

impl Default for BrokerServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8400,
            collection_window_secs: 30,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            poll_ceiling: 20,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            replay_window_secs: crate::auth::DEFAULT_REPLAY_WINDOW_SECS,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://accord.db".to_string(),
            max_connections: Some(10),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Some("json".to_string()),
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            crate::error::AccordError::Config(format!("Failed to read config file: {}", e))
        })?;
        let config: AppConfig = toml::from_str(&raw).map_err(|e| {
            crate::error::AccordError::Config(format!("Failed to parse config file: {}", e))
        })?;
        Ok(config)
    }

    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;

        if let Ok(url) = std::env::var("ACCORD_DATABASE_URL") {
            config.database.url = url;
        }
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            config.logging.level = log_level;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker.port == 0 {
            return Err(crate::error::AccordError::Config(
                "Broker port cannot be 0".to_string(),
            ));
        }
        if self.broker.collection_window_secs <= 0 {
            return Err(crate::error::AccordError::Config(
                "Collection window must be positive".to_string(),
            ));
        }
        if self.session.poll_ceiling == 0 {
            return Err(crate::error::AccordError::Config(
                "Poll ceiling must be at least 1".to_string(),
            ));
        }
        if self.auth.replay_window_secs <= 0 {
            return Err(crate::error::AccordError::Config(
                "Replay window must be positive".to_string(),
            ));
        }
        if self.database.url.is_empty() {
            return Err(crate::error::AccordError::Config(
                "Database URL cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.broker.host, self.broker.port)
    }

    pub fn collection_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.broker.collection_window_secs)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.session.poll_interval_ms)
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let default_config = AppConfig::default();
    let toml_str = toml::to_string_pretty(&default_config).map_err(|e| {
        crate::error::AccordError::Config(format!("Failed to serialize default config: {}", e))
    })?;
    std::fs::write(path, toml_str).map_err(|e| {
        crate::error::AccordError::Config(format!("Failed to write default config file: {}", e))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.broker.port, 8400);
        assert_eq!(config.broker.collection_window_secs, 30);
        assert_eq!(config.auth.replay_window_secs, 300);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());

        config.broker.port = 0;
        assert!(config.validate().is_err());

        config.broker.port = 8400;
        config.session.poll_ceiling = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_round_trip() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        create_default_config_file(path).unwrap();
        let loaded = AppConfig::load(path).unwrap();
        assert_eq!(loaded.broker.port, 8400);
        assert_eq!(loaded.database.url, "sqlite://accord.db");
    }
}
