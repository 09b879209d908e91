//! MQTT v5 publisher
//!
//! One long-lived client, connected at startup and shared by every publish.
//! The rumqttc event loop runs on its own task and reconnects on error.
//!
//! rumqttc does not hand back a packet id from `publish`, so acknowledgments
//! are matched in submission order: a waiter is queued before the request is
//! enqueued, the `Outgoing::Publish(pkid)` event pops it and binds it to the
//! packet id, and PUBACK/PUBCOMP (or the write itself, for QoS 0) resolves it.

use crate::domain::error::{DeliveryError, RelayError, Result};
use crate::domain::message::{OutboundMessage, QosLevel};
use crate::infra::config::MqttConfig;
use crate::services::gateway::{Transport, TransportKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::v5::mqttbytes::v5::{
    Packet, PubAckReason, PubCompReason, PubRecReason, PublishProperties,
};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions};
use rumqttc::{Outgoing, Transport as NetTransport};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Capacity of the rumqttc request channel
const REQUEST_CAPACITY: usize = 100;

/// Pause between reconnect attempts after an event loop error
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// MQTT v5 "UTF-8 encoded character data" payload format indicator
const PAYLOAD_FORMAT_UTF8: u8 = 1;

type AckResult = std::result::Result<(), DeliveryError>;

struct PendingAck {
    qos: QosLevel,
    tx: oneshot::Sender<AckResult>,
}

#[derive(Default)]
struct AckState {
    /// Submitted, not yet written to the socket
    queued: VecDeque<PendingAck>,
    /// Written with QoS > 0, waiting for PUBACK/PUBCOMP
    inflight: HashMap<u16, oneshot::Sender<AckResult>>,
    /// Packet ids whose waiters were failed on connection loss; rumqttc may
    /// still retransmit them after reconnecting
    abandoned: HashSet<u16>,
}

/// Matches broker acknowledgments to waiting publish calls
#[derive(Default)]
pub(crate) struct AckTracker {
    state: Mutex<AckState>,
}

impl AckTracker {
    /// Queue a waiter for the next publish request
    pub(crate) fn register(&self, qos: QosLevel) -> oneshot::Receiver<AckResult> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().queued.push_back(PendingAck { qos, tx });
        rx
    }

    /// Drop the most recently queued waiter (its request never got enqueued)
    pub(crate) fn cancel_last(&self) {
        self.state.lock().queued.pop_back();
    }

    pub(crate) fn on_outgoing_publish(&self, pkid: u16) {
        let mut state = self.state.lock();

        // retransmit after reconnect
        if pkid != 0 && (state.inflight.contains_key(&pkid) || state.abandoned.contains(&pkid)) {
            debug!(pkid, "mqtt_publish_retransmitted");
            return;
        }

        let Some(pending) = state.queued.pop_front() else {
            return;
        };

        match pending.qos {
            QosLevel::AtMostOnce => {
                let _ = pending.tx.send(Ok(()));
            }
            QosLevel::AtLeastOnce | QosLevel::ExactlyOnce => {
                state.inflight.insert(pkid, pending.tx);
            }
        }
    }

    pub(crate) fn resolve(&self, pkid: u16, result: AckResult) {
        let mut state = self.state.lock();
        state.abandoned.remove(&pkid);
        if let Some(tx) = state.inflight.remove(&pkid) {
            let _ = tx.send(result);
        }
    }

    /// Fail waiters whose packets were on the wire when the connection dropped
    pub(crate) fn on_connection_lost(&self, reason: &str) {
        let mut state = self.state.lock();
        let lost: Vec<_> = state.inflight.drain().collect();
        for (pkid, tx) in lost {
            state.abandoned.insert(pkid);
            let _ = tx.send(Err(DeliveryError::Transport(reason.to_string())));
        }
    }

    /// Fail every waiter; used once the event loop has stopped for good
    pub(crate) fn fail_all(&self, reason: &str) {
        let mut state = self.state.lock();
        for pending in state.queued.drain(..) {
            let _ = pending.tx.send(Err(DeliveryError::Transport(reason.to_string())));
        }
        for (_, tx) in state.inflight.drain() {
            let _ = tx.send(Err(DeliveryError::Transport(reason.to_string())));
        }
        state.abandoned.clear();
    }

    #[cfg(test)]
    fn counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (state.queued.len(), state.inflight.len(), state.abandoned.len())
    }
}

/// Shared, pre-connected MQTT v5 client
pub struct MqttConnection {
    client: AsyncClient,
    acks: Arc<AckTracker>,
    /// Keeps waiter registration and request enqueueing in the same order
    submit: tokio::sync::Mutex<()>,
    ack_timeout: Duration,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttConnection {
    /// Connect to the configured broker and wait for CONNACK.
    ///
    /// Fails with `RelayError::Connection` if the broker is unreachable or
    /// refuses the connection within the connect timeout.
    pub async fn connect(config: &MqttConfig) -> Result<Self> {
        let endpoint = config.broker_endpoint()?;
        let client_id = format!("{}-v5", config.client_id);

        let mut options = MqttOptions::new(client_id.clone(), endpoint.host.clone(), endpoint.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));
        options.set_clean_start(true);
        options.set_connection_timeout(config.connect_timeout_secs);

        // Set credentials if configured
        if let Some(username) = config.username() {
            options.set_credentials(username, config.password().unwrap_or_default());
        }

        if endpoint.tls {
            options.set_transport(NetTransport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        let connect_timeout = Duration::from_secs(config.connect_timeout_secs.max(1));
        if let Err(reason) = wait_for_connack(&mut eventloop, connect_timeout).await {
            error!(broker = %config.broker_url, error = %reason, "mqtt_connect_failed");
            return Err(RelayError::Connection(format!("{}: {reason}", config.broker_url)));
        }

        info!(
            broker = %config.broker_url,
            client_id = %client_id,
            tls = endpoint.tls,
            "mqtt_connected"
        );

        let acks = Arc::new(AckTracker::default());
        let driver = tokio::spawn(drive_event_loop(eventloop, acks.clone()));

        Ok(Self {
            client,
            acks,
            submit: tokio::sync::Mutex::new(()),
            ack_timeout: config.ack_timeout(),
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Send DISCONNECT and wait for the event loop task to finish
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "mqtt_disconnect_request_failed");
        }

        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            if tokio::time::timeout(Duration::from_secs(2), driver).await.is_err() {
                warn!("mqtt_event_loop_stop_timeout");
            }
        }
    }
}

#[async_trait]
impl Transport for MqttConnection {
    fn kind(&self) -> TransportKind {
        TransportKind::Mqtt
    }

    async fn deliver(&self, message: OutboundMessage) -> Result<()> {
        let qos = to_qos(message.qos());
        let properties = publish_properties(&message);

        debug!(
            topic = %message.destination(),
            qos = %message.qos(),
            retained = message.retained(),
            "mqtt_publish_submitting"
        );

        let ack = {
            let _submit = self.submit.lock().await;
            let ack = self.acks.register(message.qos());
            if let Err(e) = self
                .client
                .publish_with_properties(
                    message.destination().to_string(),
                    qos,
                    message.retained(),
                    message.body().clone(),
                    properties,
                )
                .await
            {
                self.acks.cancel_last();
                return Err(DeliveryError::Transport(e.to_string()).into());
            }
            ack
        };

        match tokio::time::timeout(self.ack_timeout, ack).await {
            Ok(Ok(result)) => result.map_err(RelayError::from),
            Ok(Err(_)) => Err(DeliveryError::Transport(
                "event loop stopped before acknowledgment".to_string(),
            )
            .into()),
            Err(_) => Err(DeliveryError::Timeout(self.ack_timeout).into()),
        }
    }
}

async fn wait_for_connack(
    eventloop: &mut EventLoop,
    timeout: Duration,
) -> std::result::Result<(), String> {
    let handshake = async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(e.to_string()),
            }
        }
    };

    match tokio::time::timeout(timeout, handshake).await {
        Ok(result) => result,
        Err(_) => Err(format!("no CONNACK within {timeout:?}")),
    }
}

/// Poll the event loop until the client disconnects, feeding acknowledgments
/// to the tracker. Errors are followed by an automatic reconnect.
async fn drive_event_loop(mut eventloop: EventLoop, acks: Arc<AckTracker>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt_reconnected");
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                acks.on_outgoing_publish(pkid);
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                debug!(pkid = ack.pkid, reason = ?ack.reason, "mqtt_puback");
                acks.resolve(ack.pkid, puback_result(&ack.reason));
            }
            Ok(Event::Incoming(Packet::PubRec(rec))) => {
                debug!(pkid = rec.pkid, reason = ?rec.reason, "mqtt_pubrec");
                if let Err(e) = pubrec_result(&rec.reason) {
                    acks.resolve(rec.pkid, Err(e));
                }
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                debug!(pkid = comp.pkid, reason = ?comp.reason, "mqtt_pubcomp");
                acks.resolve(comp.pkid, pubcomp_result(&comp.reason));
            }
            Ok(Event::Incoming(Packet::Disconnect(disconnect))) => {
                warn!(packet = ?disconnect, "mqtt_broker_disconnect");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("mqtt_disconnected");
                break;
            }
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => {
                info!("mqtt_client_dropped");
                break;
            }
            Err(e) => {
                warn!(error = %e, "mqtt_connection_error");
                acks.on_connection_lost(&e.to_string());
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }

    acks.fail_all("mqtt client disconnected");
}

fn to_qos(level: QosLevel) -> QoS {
    match level {
        QosLevel::AtMostOnce => QoS::AtMostOnce,
        QosLevel::AtLeastOnce => QoS::AtLeastOnce,
        QosLevel::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Content type plus every message property as a v5 user property
fn publish_properties(message: &OutboundMessage) -> PublishProperties {
    PublishProperties {
        payload_format_indicator: Some(PAYLOAD_FORMAT_UTF8),
        content_type: Some(message.content_type().to_string()),
        user_properties: message
            .properties()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        ..Default::default()
    }
}

fn puback_result(reason: &PubAckReason) -> AckResult {
    match reason {
        PubAckReason::Success | PubAckReason::NoMatchingSubscribers => Ok(()),
        other => Err(DeliveryError::Rejected(format!("PUBACK {other:?}"))),
    }
}

fn pubrec_result(reason: &PubRecReason) -> AckResult {
    match reason {
        PubRecReason::Success | PubRecReason::NoMatchingSubscribers => Ok(()),
        other => Err(DeliveryError::Rejected(format!("PUBREC {other:?}"))),
    }
}

fn pubcomp_result(reason: &PubCompReason) -> AckResult {
    match reason {
        PubCompReason::Success => Ok(()),
        other => Err(DeliveryError::Rejected(format!("PUBCOMP {other:?}"))),
    }
}
