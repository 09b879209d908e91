//! Publish relay - HTTP-triggered publishing to MQTT v5 and Solace
//!
//! Each GET on `/publishmqtt` or `/publishjms` publishes the configured JSON
//! payload once, with the payload mirrored into a `json` message property and
//! the W3C trace context attached.
//!
//! Module structure:
//! - `domain/` - Outbound message model and error taxonomy
//! - `io/` - External interfaces (HTTP, MQTT, Solace AMQP)
//! - `services/` - Publish gateway and per-call session transport
//! - `infra/` - Infrastructure (Config, Telemetry)

use anyhow::Context as _;
use clap::Parser;
use publish_relay::infra::telemetry::init_logging;
use publish_relay::infra::{Config, Telemetry};
use publish_relay::io::{start_http_server, HttpState, MqttConnection, SolaceSessionFactory};
use publish_relay::domain::QosLevel;
use publish_relay::services::{GatewaySettings, PerCallTransport, PublishGateway, TransportKind};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Publish relay - MQTT v5 and JMS-style publish endpoints
#[derive(Parser, Debug)]
#[command(name = "publish-relay", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    info!(version = env!("GIT_HASH"), "publish-relay starting");

    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config))?
        .with_env_overrides();

    info!(
        config_file = %config.config_file(),
        bind = %config.server().bind_address,
        port = config.server().port,
        mqtt_broker = %config.mqtt().broker_url,
        mqtt_topic = %config.mqtt().topic,
        mqtt_qos = %config.mqtt().qos,
        jms_topic = %config.jms().topic,
        solace_host = %config.solace().host,
        solace_vpn = %config.solace().msg_vpn,
        direct_transport = config.solace().direct_transport,
        "config_loaded"
    );

    let telemetry = Telemetry::new();

    // The MQTT connection is established once and shared by every request
    let mqtt = Arc::new(
        MqttConnection::connect(config.mqtt()).await.context("connecting to MQTT broker")?,
    );

    let mqtt_gateway = PublishGateway::new(
        mqtt.clone(),
        GatewaySettings {
            default_destination: config.mqtt().topic.clone(),
            default_payload: config.mqtt().message_json.clone(),
            delay: config.mqtt().delay(),
            qos: config.mqtt().qos,
            retained: config.mqtt().retained,
        },
        telemetry.tracer(TransportKind::Mqtt.tracer_name()),
    );

    let jms_gateway = PublishGateway::new(
        PerCallTransport::new(SolaceSessionFactory::new(config.solace())),
        GatewaySettings {
            default_destination: config.jms().topic.clone(),
            default_payload: config.jms().message_json.clone(),
            delay: config.jms().delay(),
            qos: QosLevel::AtMostOnce,
            retained: false,
        },
        telemetry.tracer(TransportKind::Jms.tracer_name()),
    );

    let state = Arc::new(HttpState { mqtt: mqtt_gateway, jms: jms_gateway });

    let bind_addr = format!("{}:{}", config.server().bind_address, config.server().port);
    let listener =
        TcpListener::bind(&bind_addr).await.with_context(|| format!("binding {bind_addr}"))?;

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = tokio::spawn(async move {
        if let Err(e) = start_http_server(listener, state, shutdown_rx).await {
            error!(error = %e, "http server error");
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    if let Err(e) = server.await {
        error!(error = %e, "http server task failed");
    }

    mqtt.disconnect().await;
    telemetry.shutdown();

    info!("publish-relay shutdown complete");
    Ok(())
}
