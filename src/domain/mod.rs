//! Domain models - outbound messages and the error taxonomy
//!
//! - `OutboundMessage` - a JSON message with its property map
//! - `PublishRequest` - destination override and pre-send delay
//! - `RelayError` - configuration, connection and delivery failures

pub mod error;
pub mod message;

// Re-export commonly used types at module level
pub use error::{ConfigError, DeliveryError, RelayError};
pub use message::{OutboundMessage, PublishRequest, QosLevel};
