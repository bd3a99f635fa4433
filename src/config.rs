//! TOML configuration parsing and validation.
//!
//! Only `[db]` is required; every other section falls back to defaults that
//! match a local RabbitMQ install and the processing cadence the worker
//! reports progress at.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

/// Which queue transport carries processing messages.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// RabbitMQ (or any AMQP 0.9.1 broker).
    Amqp,
    /// In-process channel; the worker must run in the same process as the API.
    Local,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_kind")]
    pub kind: BrokerKind,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_guest")]
    pub username: String,
    #[serde(default = "default_guest")]
    pub password: String,
    #[serde(default = "default_virtual_host")]
    pub virtual_host: String,
    #[serde(default = "default_queue")]
    pub queue: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    #[serde(default = "default_routing_key")]
    pub routing_key: String,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u16,
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: default_broker_kind(),
            host: default_host(),
            port: default_port(),
            username: default_guest(),
            password: default_guest(),
            virtual_host: default_virtual_host(),
            queue: default_queue(),
            exchange: default_exchange(),
            routing_key: default_routing_key(),
            heartbeat_secs: default_heartbeat_secs(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
        }
    }
}

fn default_broker_kind() -> BrokerKind {
    BrokerKind::Amqp
}
fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    5672
}
fn default_guest() -> String {
    "guest".to_string()
}
fn default_virtual_host() -> String {
    "/".to_string()
}
fn default_queue() -> String {
    "csv-processing-queue".to_string()
}
fn default_exchange() -> String {
    "csv-processing-exchange".to_string()
}
fn default_routing_key() -> String {
    "csv.process".to_string()
}
fn default_heartbeat_secs() -> u16 {
    60
}
fn default_reconnect_interval_secs() -> u64 {
    10
}

impl BrokerConfig {
    /// AMQP connection URI. Credentials and virtual host are percent-encoded,
    /// so the default `/` vhost becomes `%2F`.
    pub fn amqp_uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}?heartbeat={}",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.virtual_host),
            self.heartbeat_secs
        )
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessingConfig {
    /// Emit a progress snapshot every N processed rows (and on the last row).
    #[serde(default = "default_progress_every_rows")]
    pub progress_every_rows: u64,
    /// Pause the row loop every N rows.
    #[serde(default = "default_yield_every_rows")]
    pub yield_every_rows: u64,
    /// Length of that pause; `0` only yields to the scheduler.
    #[serde(default = "default_yield_delay_ms")]
    pub yield_delay_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            progress_every_rows: default_progress_every_rows(),
            yield_every_rows: default_yield_every_rows(),
            yield_delay_ms: default_yield_delay_ms(),
        }
    }
}

fn default_progress_every_rows() -> u64 {
    10
}
fn default_yield_every_rows() -> u64 {
    50
}
fn default_yield_delay_ms() -> u64 {
    10
}

impl Config {
    /// All-defaults configuration with a database in the working directory.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/ingest.sqlite"),
            },
            server: ServerConfig::default(),
            broker: BrokerConfig::default(),
            processing: ProcessingConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;

    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.processing.progress_every_rows == 0 {
        bail!("processing.progress_every_rows must be > 0");
    }
    if config.processing.yield_every_rows == 0 {
        bail!("processing.yield_every_rows must be > 0");
    }

    let broker = &config.broker;
    if broker.queue.trim().is_empty() {
        bail!("broker.queue must not be empty");
    }
    if broker.exchange.trim().is_empty() {
        bail!("broker.exchange must not be empty");
    }
    if broker.routing_key.trim().is_empty() {
        bail!("broker.routing_key must not be empty");
    }
    if broker.reconnect_interval_secs == 0 {
        bail!("broker.reconnect_interval_secs must be > 0");
    }

    Ok(())
}
