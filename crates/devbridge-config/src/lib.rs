//! Configuration for devbridge.
//!
//! One TOML file per bridge instance, layered as defaults, then the file,
//! then `DEVBRIDGE_` environment variables (`__` separates nesting, so
//! `DEVBRIDGE_BROKER__HOST` overrides `[broker] host`). [`Config::to_runtime`]
//! validates everything and produces the runtime configs consumed by
//! `devbridge-broker` and `devbridge-core`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use devbridge_broker::{
    BrokerConfig, DeviceId, ExtensionPath, InstanceId, ReconnectConfig, TopicScheme,
};
use devbridge_core::{
    BridgeConfig, CapabilityModel, DeviceDescriptor, DiscoveryConfig, ParasiteTarget,
};

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "DEVBRIDGE_";

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config file not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("environment variable {var} (password_env) is not set")]
    MissingSecret { var: String },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

fn invalid(field: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level configuration of one bridge instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Topic segment identifying this instance.
    pub instance_id: String,

    /// Connector family, reported to the dashboard as the device model.
    #[serde(default = "default_connector_type")]
    pub connector_type: String,

    /// Leading topic segments before the `v1` API root. May be empty.
    #[serde(default)]
    pub base_topic: String,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_command_workers")]
    pub command_workers: usize,

    /// Queue depth per worker before commands are refused as overloaded.
    #[serde(default = "default_command_queue")]
    pub command_queue: usize,

    /// Seconds a parasite may wait for its owner's state.
    #[serde(default = "default_parasite_timeout")]
    pub parasite_timeout_secs: u64,

    #[serde(default)]
    pub broker: BrokerSection,

    #[serde(default)]
    pub discovery: DiscoverySection,

    #[serde(default)]
    pub devices: Vec<DeviceEntry>,

    #[serde(default)]
    pub parasites: Vec<ParasiteEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_id: "devbridge".into(),
            connector_type: default_connector_type(),
            base_topic: String::new(),
            poll_interval_secs: default_poll_interval(),
            command_workers: default_command_workers(),
            command_queue: default_command_queue(),
            parasite_timeout_secs: default_parasite_timeout(),
            broker: BrokerSection::default(),
            discovery: DiscoverySection::default(),
            devices: Vec::new(),
            parasites: Vec::new(),
        }
    }
}

fn default_connector_type() -> String {
    "simulated".into()
}
fn default_poll_interval() -> u64 {
    30
}
fn default_command_workers() -> usize {
    4
}
fn default_command_queue() -> usize {
    64
}
fn default_parasite_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerSection {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Defaults to `devbridge-<instance_id>`.
    pub client_id: Option<String>,

    pub username: Option<String>,

    /// Password (plaintext; prefer `password_env`).
    pub password: Option<String>,

    /// Environment variable holding the password. Wins over `password`.
    pub password_env: Option<String>,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// Give up connecting after this many failed attempts. Unset retries
    /// forever.
    pub max_connect_attempts: Option<u32>,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            client_id: None,
            username: None,
            password: None,
            password_env: None,
            keep_alive_secs: default_keep_alive(),
            backoff_initial_ms: default_backoff_initial(),
            backoff_max_ms: default_backoff_max(),
            max_connect_attempts: None,
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

fn default_host() -> String {
    "localhost".into()
}
fn default_port() -> u16 {
    1883
}
fn default_keep_alive() -> u64 {
    30
}
fn default_backoff_initial() -> u64 {
    500
}
fn default_backoff_max() -> u64 {
    30_000
}
fn default_sweep_interval() -> u64 {
    1_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DiscoverySection {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_discovery_prefix")]
    pub prefix: String,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: default_discovery_prefix(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_discovery_prefix() -> String {
    devbridge_core::discovery::DEFAULT_PREFIX.into()
}

/// A `[[devices]]` entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceEntry {
    pub id: String,

    /// Display name. Defaults to the id.
    pub name: Option<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Field name → spec, in declaration order.
    #[serde(default)]
    pub fields: CapabilityModel,

    /// Starting values for connectors that simulate devices.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub initial: Map<String, Value>,
}

/// A `[[parasites]]` entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ParasiteEntry {
    pub device: String,
    pub owning_instance: String,
    pub owning_device: String,
    pub mqtt_path: String,
    pub extracted_fields: Vec<String>,
    #[serde(default, rename = "static", skip_serializing_if = "Map::is_empty")]
    pub static_values: Map<String, Value>,
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("io", "devbridge", "devbridge").map_or_else(
        || {
            let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
            p.push(".config");
            p.push("devbridge");
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

// ── Config loading ──────────────────────────────────────────────────

fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
}

/// Load the config from `path` (which must exist) or, when `None`, from
/// the platform config path (which may be absent). Environment
/// overrides apply either way.
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = match path {
        Some(p) if !p.exists() => {
            return Err(ConfigError::NotFound {
                path: p.to_path_buf(),
            });
        }
        Some(p) => p.to_path_buf(),
        None => config_path(),
    };
    Ok(figment(&path).extract()?)
}

/// Serialize config to TOML and write it to `path`.
pub fn save_config(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(cfg)?)?;
    Ok(())
}

// ── Translation ─────────────────────────────────────────────────────

/// Validated runtime settings for one instance.
#[derive(Debug, Clone)]
pub struct Runtime {
    pub bridge: BridgeConfig,
    pub broker: BrokerConfig,
}

impl Config {
    pub fn instance(&self) -> Result<InstanceId, ConfigError> {
        InstanceId::new(&self.instance_id).map_err(|e| invalid("instance_id", e.to_string()))
    }

    pub fn scheme(&self) -> Result<TopicScheme, ConfigError> {
        TopicScheme::new(&self.base_topic).map_err(|e| invalid("base_topic", e.to_string()))
    }

    /// Check everything without resolving secrets.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bridge_config().map(|_| ())
    }

    /// Validate and build the runtime configs, resolving `password_env`.
    pub fn to_runtime(&self) -> Result<Runtime, ConfigError> {
        let bridge = self.bridge_config()?;
        let broker = self.broker_config(bridge.instance.clone())?;
        Ok(Runtime { bridge, broker })
    }

    /// The validated device runtime config alone. Resolves no secrets.
    pub fn bridge_config(&self) -> Result<BridgeConfig, ConfigError> {
        let instance = self.instance()?;
        self.scheme()?;

        if self.poll_interval_secs == 0 {
            return Err(invalid("poll_interval_secs", "must be greater than zero"));
        }
        if self.parasite_timeout_secs == 0 {
            return Err(invalid("parasite_timeout_secs", "must be greater than zero"));
        }

        let mut bridge = BridgeConfig::new(instance, &self.connector_type);
        bridge.poll_interval = Duration::from_secs(self.poll_interval_secs);
        bridge.command_workers = self.command_workers;
        bridge.command_queue = self.command_queue;
        bridge.parasite_resolve_timeout = Duration::from_secs(self.parasite_timeout_secs);
        bridge.discovery = DiscoveryConfig {
            enabled: self.discovery.enabled,
            prefix: self.discovery.prefix.clone(),
        };

        let mut seen = HashSet::new();
        for (i, entry) in self.devices.iter().enumerate() {
            let field = |name: &str| format!("devices[{i}].{name}");
            let id = DeviceId::new(&entry.id).map_err(|e| invalid(field("id"), e.to_string()))?;
            if !seen.insert(entry.id.as_str()) {
                return Err(invalid(field("id"), format!("duplicate device '{}'", entry.id)));
            }
            for (name, spec) in entry.fields.iter() {
                if let Some(defect) = spec.defect() {
                    return Err(invalid(field(&format!("fields.{name}")), defect));
                }
            }
            let mut descriptor = DeviceDescriptor::new(
                id,
                entry.name.clone().unwrap_or_else(|| entry.id.clone()),
                entry.fields.clone(),
            );
            descriptor.enabled = entry.enabled;
            bridge.devices.push(descriptor);
        }

        for (i, entry) in self.parasites.iter().enumerate() {
            let field = |name: &str| format!("parasites[{i}].{name}");
            bridge.parasites.push(ParasiteTarget {
                device: DeviceId::new(&entry.device)
                    .map_err(|e| invalid(field("device"), e.to_string()))?,
                owning_instance: InstanceId::new(&entry.owning_instance)
                    .map_err(|e| invalid(field("owning_instance"), e.to_string()))?,
                owning_device: DeviceId::new(&entry.owning_device)
                    .map_err(|e| invalid(field("owning_device"), e.to_string()))?,
                mqtt_path: ExtensionPath::new(&entry.mqtt_path)
                    .map_err(|e| invalid(field("mqtt_path"), e.to_string()))?,
                extracted_fields: entry.extracted_fields.clone(),
                static_values: entry.static_values.clone(),
            });
        }

        bridge.validate().map_err(|e| invalid("bridge", e.to_string()))?;
        Ok(bridge)
    }

    fn broker_config(&self, instance: InstanceId) -> Result<BrokerConfig, ConfigError> {
        let section = &self.broker;
        if section.host.trim().is_empty() {
            return Err(invalid("broker.host", "must not be empty"));
        }
        if section.port == 0 {
            return Err(invalid("broker.port", "must not be zero"));
        }
        if section.backoff_initial_ms > section.backoff_max_ms {
            return Err(invalid(
                "broker.backoff_initial_ms",
                "must not exceed backoff_max_ms",
            ));
        }
        if section.max_connect_attempts == Some(0) {
            return Err(invalid("broker.max_connect_attempts", "must be at least 1"));
        }

        let mut broker = BrokerConfig::new(&section.host, section.port, self.scheme()?, instance);
        if let Some(client_id) = &section.client_id {
            broker.client_id.clone_from(client_id);
        }
        broker.username.clone_from(&section.username);
        broker.password = resolve_password(section)?;
        broker.keep_alive = Duration::from_secs(section.keep_alive_secs);
        broker.reconnect = ReconnectConfig {
            initial_delay: Duration::from_millis(section.backoff_initial_ms),
            max_delay: Duration::from_millis(section.backoff_max_ms),
            max_attempts: section.max_connect_attempts,
        };
        broker.sweep_interval = Duration::from_millis(section.sweep_interval_ms.max(1));
        Ok(broker)
    }
}

/// `password_env` first, then the plaintext `password`.
fn resolve_password(section: &BrokerSection) -> Result<Option<SecretString>, ConfigError> {
    if let Some(var) = &section.password_env {
        return std::env::var(var)
            .map(|pw| Some(SecretString::from(pw)))
            .map_err(|_| ConfigError::MissingSecret { var: var.clone() });
    }
    Ok(section.password.clone().map(SecretString::from))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(toml: &str) -> Config {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::string(toml))
            .extract()
            .unwrap()
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg = parse(r#"instance_id = "hue""#);
        assert_eq!(cfg.broker.port, 1883);
        assert_eq!(cfg.discovery.prefix, "homeassistant");
        assert!(cfg.devices.is_empty());

        let runtime = cfg.to_runtime().unwrap();
        assert_eq!(runtime.broker.client_id, "devbridge-hue");
        assert_eq!(runtime.broker.scheme.root(), "v1");
        assert_eq!(runtime.bridge.poll_interval, Duration::from_secs(30));
    }

    #[test]
    fn devices_keep_field_order() {
        let cfg = parse(
            r#"
            instance_id = "hue"

            [[devices]]
            id = "lamp"

            [devices.fields.power]
            type = "bool"
            writable = true

            [devices.fields.brightness]
            type = "int"
            writable = true
            min = 0
            max = 100
            "#,
        );
        let bridge = cfg.to_runtime().unwrap().bridge;
        let lamp = &bridge.devices[0];
        assert_eq!(lamp.name, "lamp");
        let names: Vec<&str> = lamp.capabilities.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["power", "brightness"]);
    }

    #[test]
    fn rejects_invalid_identifiers() {
        for bad in [r#"instance_id = "a/b""#, r#"instance_id = """#] {
            let err = parse(bad).validate().unwrap_err();
            assert!(
                matches!(&err, ConfigError::Validation { field, .. } if field == "instance_id"),
                "{err}"
            );
        }

        let err = parse(
            r#"
            instance_id = "hue"
            [[devices]]
            id = "lamp+1"
            "#,
        )
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("devices[0].id"), "{err}");
    }

    #[test]
    fn rejects_duplicate_devices() {
        let err = parse(
            r#"
            instance_id = "hue"
            [[devices]]
            id = "lamp"
            [[devices]]
            id = "lamp"
            "#,
        )
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("duplicate device"), "{err}");
    }

    #[test]
    fn rejects_parasite_on_unknown_device() {
        let err = parse(
            r#"
            instance_id = "hue"
            [[parasites]]
            device = "ghost"
            owning_instance = "zigbee"
            owning_device = "door"
            mqtt_path = "hue"
            extracted_fields = ["ip"]
            "#,
        )
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("undeclared device"), "{err}");
    }

    #[test]
    fn rejects_bad_backoff() {
        let mut cfg = parse(r#"instance_id = "hue""#);
        cfg.broker.backoff_initial_ms = 60_000;
        assert!(cfg.to_runtime().is_err());
    }

    #[test]
    fn missing_password_env_is_reported() {
        let mut cfg = parse(r#"instance_id = "hue""#);
        cfg.broker.username = Some("bridge".into());
        cfg.broker.password_env = Some("DEVBRIDGE_TEST_PASSWORD_THAT_IS_NEVER_SET".into());
        assert!(cfg.validate().is_ok());
        let err = cfg.to_runtime().unwrap_err();
        assert!(matches!(err, ConfigError::MissingSecret { .. }), "{err}");
    }
}
