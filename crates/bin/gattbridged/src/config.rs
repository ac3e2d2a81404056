//! Configuration loading — TOML file with environment variable overrides.
//!
//! Looks for `config/gattbridged.toml` in the working directory unless a
//! path is given as the first command-line argument. Every field has a
//! sensible default so the file is optional. Environment variables take
//! precedence over file values.

use std::time::Duration;

use serde::Deserialize;
use uuid::Uuid;

use gattbridge_app::bridge::BridgeConfig;
use gattbridge_app::devices::DeviceSpec;
use gattbridge_domain::addr::PeerAddr;
use gattbridge_domain::cluster::{AttributeId, ClusterId};
use gattbridge_domain::filter::DeviceFilter;
use gattbridge_domain::mapping::AttributeMap;

/// Where the configuration lives when no path argument is given.
pub const DEFAULT_PATH: &str = "config/gattbridged.toml";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging settings.
    pub logging: LoggingConfig,
    /// HTTP API listener settings.
    pub http: HttpConfig,
    /// Out-of-band exchange listener settings.
    pub oob: OobConfig,
    /// BLE central settings.
    pub ble: BleConfig,
    /// Data-model server settings.
    pub data_model: DataModelConfig,
    /// Bridged BLE peripherals.
    #[serde(rename = "device")]
    pub devices: Vec<DeviceTable>,
    /// Locally computed endpoints.
    #[serde(rename = "computed")]
    pub computed: Vec<ComputedTable>,
}

/// Logging configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive (`RUST_LOG` syntax).
    pub filter: String,
}

/// HTTP listener configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Address to bind the JSON API to.
    pub bind: String,
}

/// Out-of-band exchange listener configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OobConfig {
    /// Address to bind the line channel to. Secrets cross this socket in
    /// the clear, so the default stays on loopback.
    pub bind: String,
}

/// BLE central configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Connection slots; one bridged peripheral each.
    pub max_connections: usize,
    /// First-connect scan window, milliseconds.
    pub scan_timeout_ms: u64,
    /// Pause between losing a link and starting recovery, milliseconds.
    pub recovery_delay_ms: u64,
    /// Recovery scan window, milliseconds.
    pub recovery_scan_timeout_ms: u64,
    /// Peers to treat as bonded, tried by address before scanning.
    pub known_peers: Vec<PeerAddr>,
}

/// Data-model server configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DataModelConfig {
    /// Dynamic endpoint capacity.
    pub max_dynamic_endpoints: usize,
}

/// One `[[device]]` table — a BLE peripheral to bridge.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceTable {
    /// Display name, published as the endpoint's node label.
    pub name: String,
    /// Primary GATT service to mirror; also the default scan filter.
    pub service_uuid: Uuid,
    /// Fixed peer address. When set, admission matches the address instead
    /// of the advertised service.
    #[serde(default)]
    pub address: Option<PeerAddr>,
    /// Characteristic-to-attribute rows.
    #[serde(rename = "attribute", default)]
    pub attributes: Vec<AttributeMap>,
}

impl DeviceTable {
    fn into_spec(self) -> DeviceSpec {
        DeviceSpec::Peripheral {
            name: self.name,
            service: self.service_uuid,
            filter: self.address.map(DeviceFilter::Address),
            mapping: self.attributes,
        }
    }
}

/// One `[[computed]]` table — an endpoint derived without a radio.
#[derive(Debug, Clone, Deserialize)]
pub struct ComputedTable {
    /// Display name, published as the endpoint's node label.
    pub name: String,
    /// Cluster the derived value is served under.
    pub cluster: ClusterId,
    /// Attribute the derived value is served under.
    pub attribute: AttributeId,
    /// Refresh cadence, seconds.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// RFC 3339 deadlines; the soonest future one drives the level.
    #[serde(default)]
    pub deadlines: Vec<chrono::DateTime<chrono::Utc>>,
}

fn default_interval_secs() -> u64 {
    60
}

impl ComputedTable {
    fn into_spec(self) -> DeviceSpec {
        DeviceSpec::Computed {
            name: self.name,
            cluster: self.cluster,
            attribute: self.attribute,
            refresh_secs: self.interval_secs,
            deadlines: self.deadlines,
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from [`DEFAULT_PATH`] (optional)
    /// when no path is given, then apply environment-variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error when an explicitly given file cannot be read, when
    /// the TOML is malformed, or when validation fails.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                toml::from_str(&content)?
            }
            None => Self::from_default_file()?,
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn from_default_file() -> Result<Self, ConfigError> {
        match std::fs::read_to_string(DEFAULT_PATH) {
            Ok(content) => toml::from_str(&content).map_err(ConfigError::Parse),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("GATTBRIDGE_HTTP_BIND") {
            self.http.bind = val;
        }
        if let Ok(val) = std::env::var("GATTBRIDGE_OOB_BIND") {
            self.oob.bind = val;
        }
        if let Ok(val) = std::env::var("RUST_LOG") {
            self.logging.filter = val;
        }
        // GATTBRIDGE_LOG outranks RUST_LOG.
        if let Ok(val) = std::env::var("GATTBRIDGE_LOG") {
            self.logging.filter = val;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ble.max_connections == 0 {
            return Err(ConfigError::Validation(
                "ble.max_connections must be non-zero".to_string(),
            ));
        }
        if self.data_model.max_dynamic_endpoints == 0 {
            return Err(ConfigError::Validation(
                "data_model.max_dynamic_endpoints must be non-zero".to_string(),
            ));
        }
        let mut names: Vec<&str> = self
            .devices
            .iter()
            .map(|d| d.name.as_str())
            .chain(self.computed.iter().map(|c| c.name.as_str()))
            .collect();
        names.sort_unstable();
        if let Some(dup) = names.windows(2).find(|w| w[0] == w[1]) {
            return Err(ConfigError::Validation(format!(
                "duplicate device name {:?}",
                dup[0]
            )));
        }
        Ok(())
    }

    /// Bridge loop tuning derived from the `[ble]` and `[data_model]`
    /// sections.
    #[must_use]
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            max_connections: self.ble.max_connections,
            max_dynamic_endpoints: self.data_model.max_dynamic_endpoints,
            scan_timeout: Duration::from_millis(self.ble.scan_timeout_ms),
            recovery_delay: Duration::from_millis(self.ble.recovery_delay_ms),
            recovery_scan_timeout: Duration::from_millis(self.ble.recovery_scan_timeout_ms),
        }
    }

    /// All configured devices in declaration order, peripherals first.
    #[must_use]
    pub fn device_specs(&self) -> Vec<DeviceSpec> {
        self.devices
            .iter()
            .cloned()
            .map(DeviceTable::into_spec)
            .chain(self.computed.iter().cloned().map(ComputedTable::into_spec))
            .collect()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "gattbridged=info,gattbridge_app=info,tower_http=debug".to_string(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:3000".to_string(),
        }
    }
}

impl Default for OobConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3580".to_string(),
        }
    }
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            scan_timeout_ms: 10_000,
            recovery_delay_ms: 15_000,
            recovery_scan_timeout_ms: 30_000,
            known_peers: Vec::new(),
        }
    }
}

impl Default for DataModelConfig {
    fn default() -> Self {
        Self {
            max_dynamic_endpoints: 16,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parse failure.
    #[error("failed to parse config file")]
    Parse(#[from] toml::de::Error),
    /// File I/O failure.
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    /// Semantic validation failure.
    #[error("invalid configuration: {0}")]
    Validation(String),
}
