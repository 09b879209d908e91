//! Infrastructure - configuration and telemetry
//!
//! This module contains infrastructure concerns:
//! - `config` - Application configuration (TOML loading, defaults, validation)
//! - `telemetry` - Logging setup and W3C trace-context propagation

pub mod config;
pub mod telemetry;

// Re-export commonly used types
pub use config::{BrokerEndpoint, Config};
pub use telemetry::Telemetry;
