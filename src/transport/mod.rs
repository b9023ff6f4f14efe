//! Publish/subscribe transport seam.
//!
//! The store only needs three things from a broker client: open a connection
//! to a signed URL, subscribe to a topic filter, and yield events. Two
//! implementations ship with the crate:
//!
//! - [`mqtt::MqttTransport`] — MQTT 3.1.1 over secure WebSocket (`rumqttc`)
//! - [`demo::DemoTransport`] — in-process simulator driving fake vehicles

pub mod demo;
pub mod mqtt;

use async_trait::async_trait;
use thiserror::Error;

use crate::sigv4::SignedUrl;

/// An event reported by an open connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The broker accepted the session (CONNACK).
    Connected,
    /// A publish arrived on `topic`.
    Message { topic: String, payload: Vec<u8> },
    /// The connection failed; it will not yield further events.
    Error(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("connection closed")]
    Closed,
}

/// Factory for broker connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(
        &self,
        url: &SignedUrl,
        client_id: &str,
    ) -> Result<Box<dyn Connection>, TransportError>;
}

/// One live broker connection, owned by a single task.
#[async_trait]
pub trait Connection: Send {
    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    /// Next event, or `None` once the connection has shut down.
    async fn next_event(&mut self) -> Option<TransportEvent>;

    async fn close(&mut self);
}
