//! IO modules - external system interfaces
//!
//! - `http` - HTTP façade exposing the publish routes
//! - `mqtt` - Shared MQTT v5 client with acknowledgment tracking
//! - `solace` - Solace AMQP 1.0 sessions backing the JMS-style route

pub mod http;
pub mod mqtt;
pub mod solace;

// Re-export commonly used types
pub use http::{start_http_server, HttpState};
pub use mqtt::MqttConnection;
pub use solace::{SolaceSession, SolaceSessionFactory};
