//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Broker credentials may additionally be overridden from `RELAY_*`
//! environment variables so they stay out of the file.

use crate::domain::error::ConfigError;
use crate::domain::message::QosLevel;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_address: default_bind_address(), port: default_server_port() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker URL, e.g. tcp://localhost:1883 or ssl://broker:8883
    pub broker_url: String,
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Default publish topic
    pub topic: String,
    #[serde(default = "default_qos")]
    pub qos: QosLevel,
    #[serde(default)]
    pub retained: bool,
    /// Default JSON payload
    pub message_json: String,
    #[serde(default)]
    pub delay_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_qos() -> QosLevel {
    QosLevel::AtLeastOnce
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_keep_alive_secs() -> u64 {
    60
}

impl MqttConfig {
    pub fn username(&self) -> Option<&str> {
        non_blank(self.username.as_deref())
    }

    pub fn password(&self) -> Option<&str> {
        non_blank(self.password.as_deref())
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn broker_endpoint(&self) -> Result<BrokerEndpoint, ConfigError> {
        BrokerEndpoint::parse(&self.broker_url)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JmsConfig {
    #[serde(default = "default_jms_topic")]
    pub topic: String,
    pub message_json: String,
    #[serde(default)]
    pub delay_ms: u64,
}

fn default_jms_topic() -> String {
    "poc/hkjc/updates/demo".to_string()
}

impl JmsConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolaceConfig {
    /// AMQP 1.0 listener, e.g. amqp://localhost:5672 or amqps://broker:5671
    pub host: String,
    pub msg_vpn: String,
    pub username: String,
    pub password: String,
    /// Direct (non-persistent) delivery instead of guaranteed messaging
    #[serde(default)]
    pub direct_transport: bool,
    #[serde(default = "default_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl SolaceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub mqtt: MqttConfig,
    pub jms: JmsConfig,
    pub solace: SolaceConfig,
}

/// Host, port and transport security parsed from the MQTT broker URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerEndpoint {
    /// Accepts `tcp://`, `mqtt://`, `ssl://` and `mqtts://` URLs. The port
    /// defaults to 1883 (plain) or 8883 (TLS).
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid { field: "mqtt.broker_url", reason };

        let (scheme, rest) =
            url.trim().split_once("://").ok_or_else(|| invalid(format!("no scheme in {url:?}")))?;
        let tls = match scheme {
            "tcp" | "mqtt" => false,
            "ssl" | "mqtts" => true,
            other => return Err(invalid(format!("unsupported scheme {other:?}"))),
        };

        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| invalid(format!("bad port: {e}")))?;
                (host, port)
            }
            None => (authority, if tls { 8883 } else { 1883 }),
        };

        if host.is_empty() {
            return Err(invalid(format!("no host in {url:?}")));
        }

        Ok(Self { host: host.to_string(), port, tls })
    }
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    server: ServerConfig,
    mqtt: MqttConfig,
    jms: JmsConfig,
    solace: SolaceConfig,
    config_file: String,
}

impl Config {
    /// Load and validate configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;

        Self::from_toml(toml_config, path.display().to_string())
    }

    /// Build from an already-parsed TOML document
    pub fn from_toml(toml_config: TomlConfig, config_file: String) -> Result<Self, ConfigError> {
        let config = Self {
            server: toml_config.server,
            mqtt: toml_config.mqtt,
            jms: toml_config.jms,
            solace: toml_config.solace,
            config_file,
        };
        config.validate()?;
        Ok(config)
    }

    /// Overlay credentials from `RELAY_*` environment variables
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| env::var(key).ok())
    }

    /// Overlay credentials using an arbitrary lookup (env in production)
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("RELAY_MQTT_USERNAME") {
            self.mqtt.username = Some(v);
        }
        if let Some(v) = lookup("RELAY_MQTT_PASSWORD") {
            self.mqtt.password = Some(v);
        }
        if let Some(v) = lookup("RELAY_SOLACE_USERNAME") {
            self.solace.username = v;
        }
        if let Some(v) = lookup("RELAY_SOLACE_PASSWORD") {
            self.solace.password = v;
        }
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        require("mqtt.broker_url", &self.mqtt.broker_url)?;
        require("mqtt.client_id", &self.mqtt.client_id)?;
        require("mqtt.topic", &self.mqtt.topic)?;
        require("mqtt.message_json", &self.mqtt.message_json)?;
        require("jms.topic", &self.jms.topic)?;
        require("jms.message_json", &self.jms.message_json)?;
        require("solace.host", &self.solace.host)?;
        require("solace.msg_vpn", &self.solace.msg_vpn)?;
        require("solace.username", &self.solace.username)?;

        self.mqtt.broker_endpoint()?;

        let host = self.solace.host.trim();
        if !(host.starts_with("amqp://") || host.starts_with("amqps://")) {
            return Err(ConfigError::Invalid {
                field: "solace.host",
                reason: format!("expected an amqp(s) listener URL, got {host:?}"),
            });
        }

        if self.mqtt.ack_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "mqtt.ack_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    pub fn server(&self) -> &ServerConfig {
        &self.server
    }

    pub fn mqtt(&self) -> &MqttConfig {
        &self.mqtt
    }

    pub fn jms(&self) -> &JmsConfig {
        &self.jms
    }

    pub fn solace(&self) -> &SolaceConfig {
        &self.solace
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }
}

fn require(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::Missing(field))
    } else {
        Ok(())
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
