//! Error taxonomy shared by the gateways, transports and config loader

use std::path::PathBuf;
use std::time::Duration;

/// Configuration problems. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Reasons a single publish did not reach the broker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("transport failure: {0}")]
    Transport(String),

    #[error("broker rejected message: {0}")]
    Rejected(String),

    #[error("no broker acknowledgment within {0:?}")]
    Timeout(Duration),
}

/// Top-level error returned by publish operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl RelayError {
    /// Short label used as a structured log field
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Configuration(_) => "configuration",
            RelayError::Connection(_) => "connection",
            RelayError::Delivery(_) => "delivery",
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_error_converts() {
        let err: RelayError = DeliveryError::Timeout(Duration::from_millis(250)).into();
        assert_eq!(err.kind(), "delivery");
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn test_config_error_message() {
        let err: RelayError = ConfigError::Missing("mqtt.broker_url").into();
        assert_eq!(err.kind(), "configuration");
        assert_eq!(err.to_string(), "missing required setting `mqtt.broker_url`");
    }
}
