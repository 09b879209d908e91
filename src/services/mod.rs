//! Services - publish logic
//!
//! - `gateway` - Publish gateway (delay, message build, trace injection, span)
//! - `per_call` - Transport that opens a fresh broker session per publish

pub mod gateway;
pub mod per_call;

// Re-export commonly used types
pub use gateway::{GatewaySettings, PublishGateway, Transport, TransportKind};
pub use per_call::{PerCallTransport, Session, SessionFactory};
