//! End-to-end MQTT v5 publishing against an embedded rumqttd broker

use publish_relay::domain::message::{JSON_PROPERTY, TRACEPARENT_PROPERTY};
use publish_relay::domain::{OutboundMessage, QosLevel};
use publish_relay::infra::config::MqttConfig;
use publish_relay::io::MqttConnection;
use publish_relay::services::Transport;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, Event, MqttOptions};
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;

const TOPIC: &str = "relay/it/demo";

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

/// Start a v5-only broker on `port` and wait until it accepts connections
async fn start_broker(port: u16) {
    let listen: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();

    let mut servers = HashMap::new();
    servers.insert(
        "v5".to_string(),
        ServerSettings {
            name: "v5".to_string(),
            listen,
            tls: None,
            next_connection_delay_ms: 1,
            connections: ConnectionSettings {
                connection_timeout_ms: 5000,
                max_payload_size: 262144,
                max_inflight_count: 200,
                auth: None,
                dynamic_filters: false,
                external_auth: None,
            },
        },
    );

    let config = Config {
        id: 0,
        router: RouterConfig {
            max_segment_size: 104857600,
            max_segment_count: 10,
            max_connections: 100,
            max_outgoing_packet_count: 200,
            initialized_filters: None,
            ..Default::default()
        },
        v4: None,
        v5: Some(servers),
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    };

    thread::spawn(move || {
        let mut broker = Broker::new(config);
        let _ = broker.start();
    });

    for _ in 0..100 {
        if tokio::net::TcpStream::connect(listen).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("embedded broker did not start on {listen}");
}

/// Subscribe to `TOPIC` and forward every received publish
async fn subscribe(port: u16) -> mpsc::UnboundedReceiver<Publish> {
    let options = MqttOptions::new("relay-it-subscriber", "127.0.0.1", port);
    let (client, mut eventloop) = AsyncClient::new(options, 10);
    client.subscribe(TOPIC, QoS::AtLeastOnce).await.unwrap();

    loop {
        match eventloop.poll().await.unwrap() {
            Event::Incoming(Packet::SubAck(_)) => break,
            _ => continue,
        }
    }

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        // keep the client alive for as long as the event loop runs
        let _client = client;
        while let Ok(event) = eventloop.poll().await {
            if let Event::Incoming(Packet::Publish(publish)) = event {
                let _ = tx.send(publish);
            }
        }
    });
    rx
}

fn mqtt_config(port: u16) -> MqttConfig {
    toml::from_str(&format!(
        r#"
broker_url = "tcp://127.0.0.1:{port}"
client_id = "relay-it"
topic = "{TOPIC}"
message_json = "{{}}"
ack_timeout_ms = 5000
connect_timeout_secs = 5
"#
    ))
    .unwrap()
}

#[tokio::test]
async fn test_publish_reaches_subscriber_with_user_properties() {
    let port = free_port();
    start_broker(port).await;
    let mut received = subscribe(port).await;

    let connection = MqttConnection::connect(&mqtt_config(port)).await.unwrap();

    let json = "{\n  \"status\": \"ok\",\n  \"name\": \"José\"\n}";
    let traceparent = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";
    let mut message = OutboundMessage::json(TOPIC, json).with_delivery(QosLevel::AtLeastOnce, false);
    message.insert_property(TRACEPARENT_PROPERTY, traceparent);

    // returns only once the broker's PUBACK has been matched to this publish
    connection.deliver(message).await.unwrap();

    let publish = tokio::time::timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("no message forwarded by the broker")
        .unwrap();

    assert_eq!(&publish.topic[..], TOPIC.as_bytes());
    assert_eq!(&publish.payload[..], json.as_bytes());
    assert_eq!(publish.qos, QoS::AtLeastOnce);

    let properties = publish.properties.expect("publish without v5 properties");
    assert_eq!(properties.content_type.as_deref(), Some("application/json"));
    assert_eq!(properties.payload_format_indicator, Some(1));
    assert!(properties
        .user_properties
        .contains(&(JSON_PROPERTY.to_string(), json.to_string())));
    assert!(properties
        .user_properties
        .contains(&(TRACEPARENT_PROPERTY.to_string(), traceparent.to_string())));

    connection.disconnect().await;
}

#[tokio::test]
async fn test_consecutive_publishes_each_acknowledged() {
    let port = free_port();
    start_broker(port).await;
    let mut received = subscribe(port).await;

    let connection = MqttConnection::connect(&mqtt_config(port)).await.unwrap();

    for (i, qos) in [QosLevel::AtMostOnce, QosLevel::AtLeastOnce, QosLevel::ExactlyOnce]
        .into_iter()
        .enumerate()
    {
        let json = format!(r#"{{"seq":{i}}}"#);
        connection
            .deliver(OutboundMessage::json(TOPIC, &json).with_delivery(qos, false))
            .await
            .unwrap();

        let publish = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .expect("no message forwarded by the broker")
            .unwrap();
        assert_eq!(&publish.payload[..], json.as_bytes());
    }

    connection.disconnect().await;
}
