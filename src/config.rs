use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use tracing::{info, warn};

/// Server settings, read from `SALON_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction before the compactor rewrites it.
    pub compact_threshold: u64,
    /// How far ahead of an appointment its reminder is recorded.
    pub reminder_lead_minutes: i64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
}

#[derive(Debug)]
pub struct ConfigError {
    key: &'static str,
    message: String,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid {}: {}", self.key, self.message)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self {
            port: try_load("SALON_PORT", "5433")?,
            bind: try_load("SALON_BIND", "0.0.0.0")?,
            data_dir: try_load("SALON_DATA_DIR", "./data")?,
            password: env::var("SALON_PASSWORD").unwrap_or_else(|_| {
                warn!("SALON_PASSWORD not set, using the default password");
                "salonbook".into()
            }),
            max_connections: try_load("SALON_MAX_CONNECTIONS", "256")?,
            compact_threshold: try_load("SALON_COMPACT_THRESHOLD", "1000")?,
            reminder_lead_minutes: try_load("SALON_REMINDER_LEAD_MINUTES", "1440")?,
            tls_cert: env::var("SALON_TLS_CERT").ok(),
            tls_key: env::var("SALON_TLS_KEY").ok(),
            metrics_port: optional("SALON_METRICS_PORT")?,
        };
        if config.max_connections == 0 {
            return Err(ConfigError {
                key: "SALON_MAX_CONNECTIONS",
                message: "must be at least 1".into(),
            });
        }
        Ok(config)
    }
}

fn try_load<T: FromStr>(key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T::Err: Display,
{
    let raw = env::var(key).unwrap_or_else(|_| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });
    raw.trim().parse().map_err(|e: T::Err| ConfigError {
        key,
        message: format!("{raw:?}: {e}"),
    })
}

fn optional<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map(Some).map_err(|e: T::Err| ConfigError {
            key,
            message: format!("{raw:?}: {e}"),
        }),
        Err(_) => Ok(None),
    }
}
