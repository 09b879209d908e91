//! Outbound message model
//!
//! An `OutboundMessage` carries the JSON body twice: once as the payload and
//! once as the `json` property, for consumers that only read metadata.

use bytes::Bytes;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Property holding a copy of the body text
pub const JSON_PROPERTY: &str = "json";
pub const TRACEPARENT_PROPERTY: &str = "traceparent";
pub const TRACESTATE_PROPERTY: &str = "tracestate";

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u8")]
pub enum QosLevel {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QosLevel {
    pub fn as_u8(self) -> u8 {
        match self {
            QosLevel::AtMostOnce => 0,
            QosLevel::AtLeastOnce => 1,
            QosLevel::ExactlyOnce => 2,
        }
    }
}

impl TryFrom<u8> for QosLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QosLevel::AtMostOnce),
            1 => Ok(QosLevel::AtLeastOnce),
            2 => Ok(QosLevel::ExactlyOnce),
            other => Err(format!("qos must be 0, 1 or 2, got {other}")),
        }
    }
}

impl fmt::Display for QosLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Where and when to publish
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishRequest {
    destination: Option<String>,
    delay: Duration,
}

impl PublishRequest {
    pub fn new(destination: Option<String>) -> Self {
        Self { destination, delay: Duration::ZERO }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Requested destination, or `default` when absent or blank
    pub fn resolve_destination<'a>(&'a self, default: &'a str) -> &'a str {
        match self.destination.as_deref() {
            Some(dest) if !dest.trim().is_empty() => dest,
            _ => default,
        }
    }
}

/// A single message ready to hand to a transport
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    destination: String,
    body: Bytes,
    content_type: &'static str,
    properties: BTreeMap<String, String>,
    qos: QosLevel,
    retained: bool,
}

impl OutboundMessage {
    /// Build a JSON message. The body text is mirrored into the `json` property.
    pub fn json(destination: impl Into<String>, json: &str) -> Self {
        let mut properties = BTreeMap::new();
        properties.insert(JSON_PROPERTY.to_string(), json.to_string());
        Self {
            destination: destination.into(),
            body: Bytes::copy_from_slice(json.as_bytes()),
            content_type: CONTENT_TYPE_JSON,
            properties,
            qos: QosLevel::AtMostOnce,
            retained: false,
        }
    }

    /// MQTT-only delivery options; other transports ignore them.
    pub fn with_delivery(mut self, qos: QosLevel, retained: bool) -> Self {
        self.qos = qos;
        self.retained = retained;
        self
    }

    /// Add a string property. The `json` property is fixed at construction,
    /// so attempts to overwrite it are refused and return `false`.
    pub fn insert_property(&mut self, key: impl Into<String>, value: impl Into<String>) -> bool {
        let key = key.into();
        if key == JSON_PROPERTY {
            return false;
        }
        self.properties.insert(key, value.into());
        true
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Body as text. Always valid UTF-8 since it was built from a `&str`.
    pub fn body_text(&self) -> &str {
        self.properties.get(JSON_PROPERTY).map(String::as_str).unwrap_or_default()
    }

    pub fn content_type(&self) -> &'static str {
        self.content_type
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn qos(&self) -> QosLevel {
        self.qos
    }

    pub fn retained(&self) -> bool {
        self.retained
    }
}
