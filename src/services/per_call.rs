//! Per-call session transport
//!
//! Opens a dedicated broker session for every publish, sends one message and
//! tears the session down again. Nothing is shared between calls, so there
//! is no contention, at the price of connection setup on every request.

use crate::domain::error::Result;
use crate::domain::message::OutboundMessage;
use crate::services::gateway::{Transport, TransportKind};
use async_trait::async_trait;
use tracing::{debug, warn};

/// One open connection + producer
#[async_trait]
pub trait Session: Send {
    async fn send(&mut self, message: &OutboundMessage) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Creates sessions on demand
#[async_trait]
pub trait SessionFactory: Send + Sync {
    type Session: Session;

    async fn open(&self) -> Result<Self::Session>;
}

pub struct PerCallTransport<F> {
    factory: F,
}

impl<F: SessionFactory> PerCallTransport<F> {
    pub fn new(factory: F) -> Self {
        Self { factory }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }
}

#[async_trait]
impl<F: SessionFactory> Transport for PerCallTransport<F> {
    fn kind(&self) -> TransportKind {
        TransportKind::Jms
    }

    async fn deliver(&self, message: OutboundMessage) -> Result<()> {
        let mut session = self.factory.open().await?;
        debug!(destination = %message.destination(), "jms_session_opened");

        let result = session.send(&message).await;

        // close regardless of the send outcome; a close failure never masks it
        if let Err(e) = session.close().await {
            warn!(error = %e, "jms_session_close_failed");
        }
        debug!(destination = %message.destination(), "jms_session_closed");

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::{DeliveryError, RelayError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counters {
        opened: AtomicUsize,
        sent: AtomicUsize,
        closed: AtomicUsize,
    }

    struct MockSession {
        counters: Arc<Counters>,
        fail_send: bool,
        fail_close: bool,
    }

    #[async_trait]
    impl Session for MockSession {
        async fn send(&mut self, _message: &OutboundMessage) -> Result<()> {
            self.counters.sent.fetch_add(1, Ordering::SeqCst);
            if self.fail_send {
                return Err(DeliveryError::Rejected("403 Forbidden".to_string()).into());
            }
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
            if self.fail_close {
                return Err(RelayError::Connection("reset by peer".to_string()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockFactory {
        counters: Arc<Counters>,
        fail_open: bool,
        fail_send: bool,
        fail_close: bool,
    }

    #[async_trait]
    impl SessionFactory for MockFactory {
        type Session = MockSession;

        async fn open(&self) -> Result<MockSession> {
            if self.fail_open {
                return Err(RelayError::Connection("connection refused".to_string()));
            }
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(MockSession {
                counters: self.counters.clone(),
                fail_send: self.fail_send,
                fail_close: self.fail_close,
            })
        }
    }

    fn counts(c: &Counters) -> (usize, usize, usize) {
        (
            c.opened.load(Ordering::SeqCst),
            c.sent.load(Ordering::SeqCst),
            c.closed.load(Ordering::SeqCst),
        )
    }

    #[tokio::test]
    async fn test_session_per_call() {
        let transport = PerCallTransport::new(MockFactory::default());

        for _ in 0..3 {
            transport.deliver(OutboundMessage::json("t", "{}")).await.unwrap();
        }

        assert_eq!(counts(&transport.factory().counters), (3, 3, 3));
        assert_eq!(transport.kind(), TransportKind::Jms);
    }

    #[tokio::test]
    async fn test_session_closed_after_send_failure() {
        let transport =
            PerCallTransport::new(MockFactory { fail_send: true, ..Default::default() });

        let err = transport.deliver(OutboundMessage::json("t", "{}")).await.unwrap_err();
        assert!(matches!(err, RelayError::Delivery(DeliveryError::Rejected(_))));
        assert_eq!(counts(&transport.factory().counters), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_close_failure_does_not_fail_delivery() {
        let transport =
            PerCallTransport::new(MockFactory { fail_close: true, ..Default::default() });

        transport.deliver(OutboundMessage::json("t", "{}")).await.unwrap();
        assert_eq!(counts(&transport.factory().counters), (1, 1, 1));
    }

    #[tokio::test]
    async fn test_open_failure_skips_send() {
        let transport =
            PerCallTransport::new(MockFactory { fail_open: true, ..Default::default() });

        let err = transport.deliver(OutboundMessage::json("t", "{}")).await.unwrap_err();
        assert!(matches!(err, RelayError::Connection(_)));
        assert_eq!(counts(&transport.factory().counters), (0, 0, 0));
    }
}
