//! The session's duplex connection to the remote service.
//!
//! A [`Connector`] opens a link; the link is an outbound [`Transport`] handle
//! plus a single ordered stream of [`InboundEvent`]s. Sends never block and
//! never fail loudly once the link is up: delivery problems come back as
//! `InboundEvent::SendFailed` on the same stream.

use crate::protocol::{AudioDefaults, OutboundMessage, ProtocolError};
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod websocket;

pub use crate::protocol::{InboundEvent, OutboundKind};
pub use websocket::WebSocketConnector;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Connection closed")]
    Closed,

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Timed out after {0:?} waiting for the session to open")]
    Timeout(std::time::Duration),

    #[error("Remote error: {0}")]
    Remote(String),
}

/// Outbound half of an open link.
pub trait Transport: Send {
    /// Queue a message for delivery. Only fails when the link is already
    /// closed; later delivery failures surface as `SendFailed` events.
    fn send(&self, message: OutboundMessage) -> Result<(), TransportError>;

    /// Close the link. Safe to call more than once.
    fn close(&mut self);
}

pub struct TransportLink {
    pub transport: Box<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<InboundEvent>,
}

#[async_trait]
pub trait Connector: Send {
    /// Open a link. Inbound audio without its own rate or layout is tagged
    /// with `audio`.
    async fn connect(&mut self, audio: AudioDefaults) -> Result<TransportLink, TransportError>;
}
