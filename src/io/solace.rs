//! Solace AMQP 1.0 session
//!
//! Each session opens its own AMQP connection and session against the
//! broker's AMQP listener, attaches one sender link per publish and tears
//! everything down again on close. Message properties travel as AMQP
//! application properties, so any UTF-8 string (including the raw JSON body)
//! is carried unchanged.

use crate::domain::error::{DeliveryError, RelayError, Result};
use crate::domain::message::OutboundMessage;
use crate::infra::config::SolaceConfig;
use crate::services::per_call::{Session, SessionFactory};
use async_trait::async_trait;
use fe2o3_amqp::connection::ConnectionHandle;
use fe2o3_amqp::sasl_profile::SaslProfile;
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::types::messaging::{
    ApplicationProperties, Data, Header, Message, Outcome, Properties,
};
use fe2o3_amqp::types::primitives::Binary;
use fe2o3_amqp::{Connection, Sender};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Extra string property mirroring the content type for property-only readers
const CONTENT_TYPE_PROPERTY: &str = "contentType";

/// Solace maps AMQP addresses with this prefix onto topics
const TOPIC_ADDRESS_PREFIX: &str = "topic://";

#[derive(Debug)]
struct Endpoint {
    url: String,
    msg_vpn: String,
    username: String,
    password: String,
    direct: bool,
    timeout: Duration,
}

/// Opens one AMQP connection per publish
pub struct SolaceSessionFactory {
    endpoint: Arc<Endpoint>,
}

impl SolaceSessionFactory {
    pub fn new(config: &SolaceConfig) -> Self {
        Self {
            endpoint: Arc::new(Endpoint {
                url: config.host.trim().trim_end_matches('/').to_string(),
                msg_vpn: config.msg_vpn.clone(),
                username: config.username.clone(),
                password: config.password.clone(),
                direct: config.direct_transport,
                timeout: config.request_timeout(),
            }),
        }
    }
}

/// Run one broker round trip bounded by the request timeout
async fn bounded<T, E, F>(timeout: Duration, step: &str, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(RelayError::Connection(format!("{step}: {e}"))),
        Err(_) => Err(DeliveryError::Timeout(timeout).into()),
    }
}

#[async_trait]
impl SessionFactory for SolaceSessionFactory {
    type Session = SolaceSession;

    async fn open(&self) -> Result<SolaceSession> {
        let endpoint = &self.endpoint;
        let container_id = format!("publish-relay-{}", std::process::id());

        let open = async {
            let builder = Connection::builder().container_id(container_id);
            if endpoint.username.trim().is_empty() {
                builder.open(endpoint.url.as_str()).await
            } else {
                builder
                    .sasl_profile(SaslProfile::Plain {
                        username: endpoint.username.clone(),
                        password: endpoint.password.clone(),
                    })
                    .open(endpoint.url.as_str())
                    .await
            }
        };
        let mut connection = bounded(endpoint.timeout, "open connection", open).await?;

        let session = match bounded(
            endpoint.timeout,
            "begin session",
            fe2o3_amqp::Session::begin(&mut connection),
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                let _ = connection.close().await;
                return Err(e);
            }
        };

        debug!(url = %endpoint.url, vpn = %endpoint.msg_vpn, "solace_session_open");

        Ok(SolaceSession {
            connection: Some(connection),
            session: Some(session),
            sender: None,
            endpoint: endpoint.clone(),
        })
    }
}

pub struct SolaceSession {
    connection: Option<ConnectionHandle<()>>,
    session: Option<SessionHandle<()>>,
    sender: Option<Sender>,
    endpoint: Arc<Endpoint>,
}

/// AMQP message for `message`: JSON body as a single data section, content
/// type in the properties section and every message property (plus
/// `contentType`) as an application property.
fn amqp_message(message: &OutboundMessage, direct: bool) -> Message<Data> {
    let application_properties = message
        .properties()
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .chain(std::iter::once((CONTENT_TYPE_PROPERTY, message.content_type())))
        .fold(ApplicationProperties::builder(), |builder, (k, v)| {
            builder.insert(k.to_string(), v.to_string())
        })
        .build();

    Message::builder()
        .header(Header { durable: !direct, ..Default::default() })
        .properties(Properties::builder().content_type(message.content_type()).build())
        .application_properties(application_properties)
        .data(Binary::from(message.body().to_vec()))
        .build()
}

fn topic_address(destination: &str) -> String {
    format!("{TOPIC_ADDRESS_PREFIX}{}", destination.trim_start_matches('/'))
}

#[async_trait]
impl Session for SolaceSession {
    async fn send(&mut self, message: &OutboundMessage) -> Result<()> {
        let timeout = self.endpoint.timeout;
        let Some(session) = self.session.as_mut() else {
            return Err(RelayError::Connection("session already closed".to_string()));
        };

        let address = topic_address(message.destination());
        let sender = bounded(
            timeout,
            "attach sender",
            Sender::attach(session, "publish-relay-sender", address.as_str()),
        )
        .await?;
        let sender = self.sender.insert(sender);

        debug!(address = %address, direct = self.endpoint.direct, "solace_send");

        let outcome = match tokio::time::timeout(
            timeout,
            sender.send(amqp_message(message, self.endpoint.direct)),
        )
        .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return Err(DeliveryError::Transport(e.to_string()).into()),
            Err(_) => return Err(DeliveryError::Timeout(timeout).into()),
        };

        match outcome {
            Outcome::Accepted(_) => {
                info!(destination = %message.destination(), "solace_sent");
                Ok(())
            }
            other => Err(DeliveryError::Rejected(format!("{other:?}")).into()),
        }
    }

    async fn close(&mut self) -> Result<()> {
        let timeout = self.endpoint.timeout;
        let mut first_error = None;

        if let Some(sender) = self.sender.take() {
            if let Err(e) = bounded(timeout, "detach sender", sender.close()).await {
                first_error.get_or_insert(e);
            }
        }
        if let Some(mut session) = self.session.take() {
            if let Err(e) = bounded(timeout, "end session", session.end()).await {
                first_error.get_or_insert(e);
            }
        }
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = bounded(timeout, "close connection", connection.close()).await {
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => {
                warn!(error = %e, "solace_session_close_incomplete");
                Err(e)
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::{JSON_PROPERTY, TRACEPARENT_PROPERTY};
    use crate::services::gateway::Transport;
    use crate::services::per_call::PerCallTransport;
    use fe2o3_amqp::acceptor::{ConnectionAcceptor, LinkAcceptor, LinkEndpoint, SessionAcceptor};
    use fe2o3_amqp::types::primitives::SimpleValue;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    fn config(host: &str, direct: bool) -> SolaceConfig {
        SolaceConfig {
            host: host.to_string(),
            msg_vpn: "default".to_string(),
            username: String::new(),
            password: String::new(),
            direct_transport: direct,
            request_timeout_ms: 2000,
        }
    }

    fn string_property<'a>(message: &'a Message<Data>, key: &str) -> Option<&'a str> {
        match message.application_properties.as_ref()?.0.get(key)? {
            SimpleValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    struct Received {
        body: Vec<u8>,
        json: Option<String>,
        content_type: Option<String>,
        durable: bool,
    }

    /// Accepts one connection with one sender link, accepts one delivery and
    /// reports what arrived
    async fn one_shot_broker() -> (String, oneshot::Receiver<Received>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut connection =
                ConnectionAcceptor::new("test-broker").accept(stream).await.unwrap();
            let mut session = SessionAcceptor::new().accept(&mut connection).await.unwrap();
            let LinkEndpoint::Receiver(mut receiver) =
                LinkAcceptor::new().accept(&mut session).await.unwrap()
            else {
                panic!("expected a sender link from the client");
            };

            let delivery = receiver.recv::<Data>().await.unwrap();
            receiver.accept(&delivery).await.unwrap();

            let message = delivery.message();
            let json = string_property(message, JSON_PROPERTY).map(str::to_string);
            let received = Received {
                body: delivery.body().0.to_vec(),
                json,
                content_type: message
                    .properties
                    .as_ref()
                    .and_then(|p| p.content_type.as_ref())
                    .map(|s| s.0.clone()),
                durable: message.header.as_ref().map(|h| h.durable).unwrap_or(false),
            };
            let _ = tx.send(received);

            let _ = receiver.close().await;
            // keep the session and connection alive while the client closes
            tokio::time::sleep(Duration::from_millis(500)).await;
            drop(session);
            drop(connection);
        });

        (format!("amqp://{addr}"), rx)
    }

    #[test]
    fn test_message_carries_properties() {
        let mut msg = OutboundMessage::json("poc/demo", r#"{"status":"ok"}"#);
        msg.insert_property(TRACEPARENT_PROPERTY, "00-aa-bb-01");

        let amqp = amqp_message(&msg, false);
        assert_eq!(string_property(&amqp, JSON_PROPERTY), Some(r#"{"status":"ok"}"#));
        assert_eq!(string_property(&amqp, TRACEPARENT_PROPERTY), Some("00-aa-bb-01"));
        assert_eq!(string_property(&amqp, CONTENT_TYPE_PROPERTY), Some("application/json"));
        assert_eq!(
            amqp.properties.as_ref().and_then(|p| p.content_type.as_ref()).map(|s| s.0.clone()),
            Some("application/json".to_string())
        );
        assert_eq!(&amqp.body.0[..], br#"{"status":"ok"}"#);
        assert!(amqp.header.as_ref().unwrap().durable);
    }

    #[test]
    fn test_direct_transport_is_not_durable() {
        let amqp = amqp_message(&OutboundMessage::json("t", "{}"), true);
        assert!(!amqp.header.as_ref().unwrap().durable);
    }

    #[test]
    fn test_multiline_and_non_ascii_json_kept_verbatim() {
        for json in ["{\n  \"status\": \"ok\"\n}", r#"{"name":"José","note":"✓ 完了"}"#] {
            let amqp = amqp_message(&OutboundMessage::json("t", json), false);
            assert_eq!(string_property(&amqp, JSON_PROPERTY), Some(json));
            assert_eq!(&amqp.body.0[..], json.as_bytes());
        }
    }

    #[test]
    fn test_topic_address() {
        assert_eq!(topic_address("poc/hkjc/updates/demo"), "topic://poc/hkjc/updates/demo");
        assert_eq!(topic_address("/leading"), "topic://leading");
    }

    #[tokio::test]
    async fn test_pretty_printed_json_delivered_through_per_call_transport() {
        let pretty = "{\n  \"status\": \"ok\",\n  \"name\": \"José\"\n}";
        let (url, received) = one_shot_broker().await;
        let transport = PerCallTransport::new(SolaceSessionFactory::new(&config(&url, false)));

        transport.deliver(OutboundMessage::json("poc/demo", pretty)).await.unwrap();

        let received = received.await.unwrap();
        assert_eq!(received.body, pretty.as_bytes());
        assert_eq!(received.json.as_deref(), Some(pretty));
        assert_eq!(received.content_type.as_deref(), Some("application/json"));
        assert!(received.durable);
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_connection_error() {
        let factory = SolaceSessionFactory::new(&config("amqp://127.0.0.1:1", false));
        let err = factory.open().await.err().unwrap();
        assert!(matches!(err, RelayError::Connection(_)));
    }
}
