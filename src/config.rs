//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `VELO_IOT_ENDPOINT`, `VELO_REGION`,
//!    `VELO_TOPIC`, `VELO_ACCESS_KEY_ID`, `VELO_SECRET_ACCESS_KEY`,
//!    `VELO_SESSION_TOKEN`, `VELO_DEMO`
//! 2. **Config file** — path via `--config <path>`, or `velo.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [broker]
//! host = "xxxxxxxx-ats.iot.us-east-1.amazonaws.com"
//! region = "us-east-1"
//! topic = "vehicles/#"
//! client_id_prefix = "VeloApp-"
//! reconnect_period_ms = 2000
//! keep_alive_secs = 30
//!
//! [credentials]
//! access_key_id = "AKIA..."
//! secret_access_key = "..."
//! # session_token = "..."                 # only for temporary credentials
//!
//! [demo]
//! enabled = false                          # true = simulated fleet, no broker
//! interval_ms = 2000
//!
//! [logging]
//! level = "info"
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::sigv4::{Credential, SignError, Signer};
use crate::store::StoreSettings;

/// File consulted when no `--config` path is given.
pub const DEFAULT_CONFIG_FILE: &str = "velo.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub demo: DemoConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker endpoint and connection behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// IoT data endpoint, bare hostname. Override with `VELO_IOT_ENDPOINT`.
    #[serde(default)]
    pub host: String,
    /// Region the endpoint and credentials belong to (default `us-east-1`).
    #[serde(default = "default_region")]
    pub region: String,
    /// Wildcard filter covering every vehicle (default `vehicles/#`).
    #[serde(default = "default_topic")]
    pub topic: String,
    /// MQTT client id prefix; 8 random hex chars are appended (default `VeloApp-`).
    #[serde(default = "default_client_id_prefix")]
    pub client_id_prefix: String,
    /// Milliseconds between reconnect attempts (default 2000).
    #[serde(default = "default_reconnect_period_ms")]
    pub reconnect_period_ms: u64,
    /// MQTT keep-alive in seconds (default 30).
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

/// Access key pair. Prefer the environment variables over the file.
#[derive(Clone, Default, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

impl fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.to_credential(), f)
    }
}

impl CredentialsConfig {
    pub fn to_credential(&self) -> Credential {
        Credential {
            access_key_id: self.access_key_id.clone(),
            secret_access_key: self.secret_access_key.clone(),
            session_token: self.session_token.clone().filter(|t| !t.is_empty()),
        }
    }
}

/// Simulated fleet settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DemoConfig {
    /// Replace the broker with the built-in simulator (default false).
    #[serde(default)]
    pub enabled: bool,
    /// Milliseconds between simulated position batches (default 2000).
    #[serde(default = "default_demo_interval_ms")]
    pub interval_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}
fn default_topic() -> String {
    "vehicles/#".to_string()
}
fn default_client_id_prefix() -> String {
    "VeloApp-".to_string()
}
fn default_reconnect_period_ms() -> u64 {
    2000
}
fn default_keep_alive_secs() -> u64 {
    30
}
fn default_demo_interval_ms() -> u64 {
    2000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            region: default_region(),
            topic: default_topic(),
            client_id_prefix: default_client_id_prefix(),
            reconnect_period_ms: default_reconnect_period_ms(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: default_demo_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `velo.toml` in the
    /// current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Self::default(),
        };
        config.apply_env(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply overrides from `lookup` (the process environment in production).
    pub fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = lookup("VELO_IOT_ENDPOINT") {
            self.broker.host = host;
        }
        if let Some(region) = lookup("VELO_REGION") {
            self.broker.region = region;
        }
        if let Some(topic) = lookup("VELO_TOPIC") {
            self.broker.topic = topic;
        }
        if let Some(key) = lookup("VELO_ACCESS_KEY_ID") {
            self.credentials.access_key_id = key;
        }
        if let Some(secret) = lookup("VELO_SECRET_ACCESS_KEY") {
            self.credentials.secret_access_key = secret;
        }
        if let Some(token) = lookup("VELO_SESSION_TOKEN") {
            self.credentials.session_token = Some(token);
        }
        if let Some(demo) = lookup("VELO_DEMO") {
            self.demo.enabled = match demo.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    return Err(ConfigError::Env {
                        var: "VELO_DEMO",
                        value: demo,
                    })
                }
            };
        }
        Ok(())
    }

    /// Validated signer for the configured endpoint and credentials.
    pub fn signer(&self) -> Result<Signer, SignError> {
        Signer::new(
            self.broker.host.clone(),
            self.broker.region.clone(),
            self.credentials.to_credential(),
        )
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            topic: self.broker.topic.clone(),
            client_id_prefix: self.broker.client_id_prefix.clone(),
            reconnect_period: Duration::from_millis(self.broker.reconnect_period_ms),
        }
    }
}
