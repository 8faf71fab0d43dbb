use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub http_bind_addr: String,
    pub http_body_limit_bytes: usize,
    pub log_level: String,

    pub mqtt_client_prefix: String,
    pub mqtt_keep_alive_secs: u64,
    pub mqtt_reconnect_interval_ms: u64,

    pub sweep_interval_secs: u64,
    pub default_ttl_minutes: i64,
    pub reading_retention_days: i64,
    pub retention_sweep_interval_secs: u64,

    pub fanout_capacity: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: "agro_telemetry.db".to_string(),
            http_bind_addr: "0.0.0.0:8080".to_string(),
            http_body_limit_bytes: 64 * 1024,
            log_level: "info".to_string(),
            mqtt_client_prefix: "agro-telemetry".to_string(),
            mqtt_keep_alive_secs: 30,
            mqtt_reconnect_interval_ms: 5000,
            sweep_interval_secs: 300,
            default_ttl_minutes: 5,
            reading_retention_days: 365,
            retention_sweep_interval_secs: 86_400,
            fanout_capacity: 1024,
        }
    }
}

/// Reads `key` from the environment, falling back to `default` when unset.
fn env_or<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::ParsingError(format!("{} has an invalid value: {}", key, raw))),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => Err(ConfigError::MissingOrInvalid(key.to_string())),
    }
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate_timeouts(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.mqtt_reconnect_interval_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RECONNECT_INTERVAL_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }
        if self.sweep_interval_secs == 0 {
            return Err(ConfigError::ParsingError(
                "SWEEP_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }
        if self.retention_sweep_interval_secs == 0 {
            return Err(ConfigError::ParsingError(
                "RETENTION_SWEEP_INTERVAL_SECS must be greater than zero".to_string(),
            ));
        }
        if self.default_ttl_minutes <= 0 {
            return Err(ConfigError::ParsingError(
                "DEFAULT_TTL_MINUTES must be greater than zero".to_string(),
            ));
        }
        if self.reading_retention_days <= 0 {
            return Err(ConfigError::ParsingError(
                "READING_RETENTION_DAYS must be greater than zero".to_string(),
            ));
        }
        if self.fanout_capacity == 0 {
            return Err(ConfigError::ParsingError(
                "FANOUT_CAPACITY must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        let defaults = Self::default();
        let config = Self {
            database_path: env_or("DATABASE_PATH", defaults.database_path)?,
            http_bind_addr: env_or("HTTP_BIND_ADDR", defaults.http_bind_addr)?,
            http_body_limit_bytes: env_or("HTTP_BODY_LIMIT_BYTES", defaults.http_body_limit_bytes)?,
            log_level: env_or("LOG_LEVEL", defaults.log_level)?,

            mqtt_client_prefix: env_or("MQTT_CLIENT_PREFIX", defaults.mqtt_client_prefix)?,
            mqtt_keep_alive_secs: env_or("MQTT_KEEP_ALIVE_SECS", defaults.mqtt_keep_alive_secs)?,
            mqtt_reconnect_interval_ms: env_or(
                "MQTT_RECONNECT_INTERVAL_MS",
                defaults.mqtt_reconnect_interval_ms,
            )?,

            sweep_interval_secs: env_or("SWEEP_INTERVAL_SECS", defaults.sweep_interval_secs)?,
            default_ttl_minutes: env_or("DEFAULT_TTL_MINUTES", defaults.default_ttl_minutes)?,
            reading_retention_days: env_or("READING_RETENTION_DAYS", defaults.reading_retention_days)?,
            retention_sweep_interval_secs: env_or(
                "RETENTION_SWEEP_INTERVAL_SECS",
                defaults.retention_sweep_interval_secs,
            )?,

            fanout_capacity: env_or("FANOUT_CAPACITY", defaults.fanout_capacity)?,
        };

        // Validate timeouts after constructing the configuration
        config.validate_timeouts()?;

        Ok(config)
    }

    pub fn log_level(&self) -> tracing::Level {
        tracing::Level::from_str(&self.log_level).unwrap_or(tracing::Level::INFO)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.mqtt_reconnect_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn retention_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention_sweep_interval_secs)
    }

    pub fn retention_horizon(&self) -> time::Duration {
        time::Duration::days(self.reading_retention_days)
    }
}
