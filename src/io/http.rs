//! HTTP façade
//!
//! Two GET routes, each triggering one publish of the configured default
//! payload. Uses hyper for the HTTP server.
//!
//! - GET /publishmqtt - publish through the shared MQTT connection
//! - GET /publishjms  - publish through a per-call Solace session
//! - GET /health      - liveness

use crate::infra::telemetry::extract_from_headers;
use crate::services::gateway::{PublishGateway, Transport};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

pub const MQTT_CONFIRMATION: &str = "Published JSON to MQTT with v5 user property 'json'.";
pub const JMS_CONFIRMATION: &str = "Published JSON to JMS with custom properties.";

/// Gateways served by the HTTP routes
pub struct HttpState<M, J> {
    pub mqtt: PublishGateway<M>,
    pub jms: PublishGateway<J>,
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(body.into()))
        .expect("static response should not fail")
}

/// Run one publish and turn its outcome into a response
async fn publish_route<T: Transport>(
    gateway: &PublishGateway<T>,
    parent: &opentelemetry::Context,
    confirmation: &'static str,
) -> Response<Full<Bytes>> {
    match gateway.publish_default(parent).await {
        Ok(()) => text_response(StatusCode::OK, confirmation),
        Err(e) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to publish message: {e}"),
        ),
    }
}

/// Handle HTTP requests
pub async fn handle_request<M, J, B>(
    req: Request<B>,
    state: Arc<HttpState<M, J>>,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    M: Transport,
    J: Transport,
{
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/publishmqtt") => {
            info!("publish_request_mqtt");
            let parent = extract_from_headers(req.headers());
            Ok(publish_route(&state.mqtt, &parent, MQTT_CONFIRMATION).await)
        }
        (&Method::GET, "/publishjms") => {
            info!("publish_request_jms");
            let parent = extract_from_headers(req.headers());
            Ok(publish_route(&state.jms, &parent, JMS_CONFIRMATION).await)
        }
        (&Method::GET, "/health") => Ok(text_response(StatusCode::OK, "ok")),
        _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found")),
    }
}

/// Serve HTTP on an already bound listener until shutdown is signalled
pub async fn start_http_server<M, J>(
    listener: TcpListener,
    state: Arc<HttpState<M, J>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    M: Transport + 'static,
    J: Transport + 'static,
{
    let addr = listener.local_addr()?;
    info!(addr = %addr, "http_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("http_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
