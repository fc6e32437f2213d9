use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::{BlockingPolicy, EngineSettings};
use crate::model::{MINUTE_MS, Ms};

#[derive(Debug)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    /// TLS needs a certificate and a key.
    TlsIncomplete,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "{var} has an invalid value: '{value}'"),
            ConfigError::TlsIncomplete => write!(
                f,
                "both ROOMDESK_TLS_CERT and ROOMDESK_TLS_KEY must be set, or neither"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub policy: BlockingPolicy,
    pub default_buffer_minutes: u32,
    pub reaper_interval: Duration,
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Build from any variable source; unset variables take their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind = lookup("ROOMDESK_BIND").unwrap_or_else(|| "0.0.0.0".into());
        let port = parsed(&lookup, "ROOMDESK_PORT", 5433)?;
        let data_dir = PathBuf::from(lookup("ROOMDESK_DATA_DIR").unwrap_or_else(|| "./data".into()));
        let password = lookup("ROOMDESK_PASSWORD").unwrap_or_else(|| "roomdesk".into());
        let max_connections = parsed(&lookup, "ROOMDESK_MAX_CONNECTIONS", 256usize)?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                var: "ROOMDESK_MAX_CONNECTIONS",
                value: "0".into(),
            });
        }
        let compact_threshold = parsed(&lookup, "ROOMDESK_COMPACT_THRESHOLD", 1000u64)?;
        let metrics_port = match lookup("ROOMDESK_METRICS_PORT") {
            None => None,
            Some(value) => Some(value.trim().parse().map_err(|_| ConfigError::Invalid {
                var: "ROOMDESK_METRICS_PORT",
                value,
            })?),
        };

        let tls_cert = lookup("ROOMDESK_TLS_CERT");
        let tls_key = lookup("ROOMDESK_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::TlsIncomplete);
        }

        let policy = match lookup("ROOMDESK_BLOCKING_POLICY") {
            None => BlockingPolicy::default(),
            Some(value) => BlockingPolicy::parse(value.trim()).ok_or(ConfigError::Invalid {
                var: "ROOMDESK_BLOCKING_POLICY",
                value,
            })?,
        };
        let default_buffer_minutes = parsed(&lookup, "ROOMDESK_DEFAULT_BUFFER_MINUTES", 30u32)?;
        let reaper_secs = parsed(&lookup, "ROOMDESK_REAPER_INTERVAL_SECS", 60u64)?;
        if reaper_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "ROOMDESK_REAPER_INTERVAL_SECS",
                value: "0".into(),
            });
        }

        Ok(Self {
            bind,
            port,
            data_dir,
            password,
            max_connections,
            compact_threshold,
            metrics_port,
            tls_cert,
            tls_key,
            policy,
            default_buffer_minutes,
            reaper_interval: Duration::from_secs(reaper_secs),
        })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            policy: self.policy,
            default_buffer: self.default_buffer_minutes as Ms * MINUTE_MS,
        }
    }
}
