//! Publish gateway
//!
//! Turns `(destination, json)` into exactly one delivered `OutboundMessage`.
//! The gateway owns no connection state itself; it is generic over a
//! `Transport` that is handed in at construction.

use crate::domain::error::{RelayError, Result};
use crate::domain::message::{OutboundMessage, PublishRequest, QosLevel};
use crate::infra::telemetry::inject_into_message;
use async_trait::async_trait;
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::SdkTracer;
use std::time::Duration;
use tracing::{debug, error, info};

/// Which broker family a transport speaks. Drives span and attribute names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Mqtt,
    Jms,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Mqtt => "mqtt",
            TransportKind::Jms => "jms",
        }
    }

    pub fn tracer_name(self) -> &'static str {
        match self {
            TransportKind::Mqtt => "publish-relay.mqtt",
            TransportKind::Jms => "publish-relay.jms",
        }
    }

    pub fn span_name(self) -> &'static str {
        match self {
            TransportKind::Mqtt => "mqtt.publish",
            TransportKind::Jms => "jms.publish",
        }
    }

    fn destination_attribute(self) -> &'static str {
        match self {
            TransportKind::Mqtt => "mqtt.topic",
            TransportKind::Jms => "jms.destination",
        }
    }

    fn delay_attribute(self) -> &'static str {
        match self {
            TransportKind::Mqtt => "mqtt.delay",
            TransportKind::Jms => "jms.delay",
        }
    }
}

/// Hands a fully built message to a broker and waits for acknowledgment
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn deliver(&self, message: OutboundMessage) -> Result<()>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn kind(&self) -> TransportKind {
        (**self).kind()
    }

    async fn deliver(&self, message: OutboundMessage) -> Result<()> {
        (**self).deliver(message).await
    }
}

/// Per-gateway defaults taken from configuration
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub default_destination: String,
    pub default_payload: String,
    pub delay: Duration,
    /// MQTT only
    pub qos: QosLevel,
    /// MQTT only
    pub retained: bool,
}

pub struct PublishGateway<T> {
    transport: T,
    settings: GatewaySettings,
    tracer: SdkTracer,
}

impl<T: Transport> PublishGateway<T> {
    pub fn new(transport: T, settings: GatewaySettings, tracer: SdkTracer) -> Self {
        Self { transport, settings, tracer }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Publish the configured default payload to the default destination
    pub async fn publish_default(&self, parent: &Context) -> Result<()> {
        let request = PublishRequest::new(None).with_delay(self.settings.delay);
        self.publish(parent, request, &self.settings.default_payload).await
    }

    /// Publish `json` as one message, traced as a child of `parent`
    pub async fn publish(&self, parent: &Context, request: PublishRequest, json: &str) -> Result<()> {
        let kind = self.transport.kind();
        let destination = request.resolve_destination(&self.settings.default_destination);
        let delay = request.delay();

        let span = self
            .tracer
            .span_builder(kind.span_name())
            .with_kind(SpanKind::Producer)
            .with_attributes(vec![
                KeyValue::new(kind.destination_attribute(), destination.to_string()),
                KeyValue::new(kind.delay_attribute(), delay.as_millis() as i64),
            ])
            .start_with_context(&self.tracer, parent);
        let cx = parent.with_span(span);
        let trace_id = cx.span().span_context().trace_id().to_string();

        info!(
            transport = kind.as_str(),
            destination = %destination,
            trace_id = %trace_id,
            "publish_started"
        );
        debug!(payload = %json, trace_id = %trace_id, "publish_payload");

        let result = self.send(&cx, destination, delay, json, &trace_id).await;

        let span = cx.span();
        match &result {
            Ok(()) => {
                span.set_status(Status::Ok);
                info!(
                    transport = kind.as_str(),
                    destination = %destination,
                    trace_id = %trace_id,
                    "publish_succeeded"
                );
            }
            Err(e) => {
                span.record_error(e);
                span.set_status(Status::error(e.to_string()));
                error!(
                    transport = kind.as_str(),
                    destination = %destination,
                    error_kind = e.kind(),
                    error = %e,
                    trace_id = %trace_id,
                    "publish_failed"
                );
            }
        }
        span.end();

        result
    }

    async fn send(
        &self,
        cx: &Context,
        destination: &str,
        delay: Duration,
        json: &str,
        trace_id: &str,
    ) -> std::result::Result<(), RelayError> {
        if !delay.is_zero() {
            debug!(delay_ms = delay.as_millis() as u64, trace_id = %trace_id, "publish_delay");
            tokio::time::sleep(delay).await;
        }

        let mut message = OutboundMessage::json(destination, json)
            .with_delivery(self.settings.qos, self.settings.retained);
        inject_into_message(cx, &mut message);

        debug!(
            content_type = message.content_type(),
            qos = %message.qos(),
            retained = message.retained(),
            properties = ?message.properties().keys().collect::<Vec<_>>(),
            trace_id = %trace_id,
            "publish_message_built"
        );

        self.transport.deliver(message).await
    }
}
