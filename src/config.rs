use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::EngineConfig;

/// Everything the server reads from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends per tenant before the compactor rewrites the log.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub lock_timeout: Duration,
    pub reject_past_dates: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "slotbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            lock_timeout: Duration::from_millis(2000),
            reject_past_dates: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.var, self.value)
    }
}

impl std::error::Error for ConfigError {}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError { var, value: raw }),
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, var: &'static str, default: bool) -> Result<bool, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError { var, value: raw }),
        },
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from any key/value source. Unset keys take their default;
    /// set but unparseable keys are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let metrics_port = match lookup("SLOTBOOK_METRICS_PORT") {
            None => None,
            Some(raw) => Some(raw.trim().parse().map_err(|_| ConfigError {
                var: "SLOTBOOK_METRICS_PORT",
                value: raw,
            })?),
        };
        let max_connections = parsed(&lookup, "SLOTBOOK_MAX_CONNECTIONS", d.max_connections)?;
        if max_connections == 0 {
            return Err(ConfigError { var: "SLOTBOOK_MAX_CONNECTIONS", value: "0".into() });
        }

        Ok(Self {
            port: parsed(&lookup, "SLOTBOOK_PORT", d.port)?,
            bind: lookup("SLOTBOOK_BIND").unwrap_or(d.bind),
            data_dir: lookup("SLOTBOOK_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("SLOTBOOK_PASSWORD").unwrap_or(d.password),
            max_connections,
            compact_threshold: parsed(&lookup, "SLOTBOOK_COMPACT_THRESHOLD", d.compact_threshold)?,
            metrics_port,
            tls_cert: lookup("SLOTBOOK_TLS_CERT"),
            tls_key: lookup("SLOTBOOK_TLS_KEY"),
            lock_timeout: Duration::from_millis(parsed(
                &lookup,
                "SLOTBOOK_LOCK_TIMEOUT_MS",
                d.lock_timeout.as_millis() as u64,
            )?),
            reject_past_dates: flag(&lookup, "SLOTBOOK_REJECT_PAST_DATES", d.reject_past_dates)?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            lock_timeout: self.lock_timeout,
            reject_past_dates: self.reject_past_dates,
        }
    }
}
