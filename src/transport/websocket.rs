use super::{Connector, InboundEvent, Transport, TransportError, TransportLink};
use crate::config::ApiConfig;
use crate::protocol::{self, AudioDefaults, OutboundMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tokio_util::sync::CancellationToken;

/// Opens JSON-over-WebSocket links to the live service.
pub struct WebSocketConnector {
    config: ApiConfig,
}

impl WebSocketConnector {
    pub fn new(config: ApiConfig) -> Self {
        Self { config }
    }
}

/// Outbound handle: messages are queued to a writer task that owns the sink.
pub struct WebSocketTransport {
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    cancel: CancellationToken,
}

impl Transport for WebSocketTransport {
    fn send(&self, message: OutboundMessage) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.outbound
            .send(message)
            .map_err(|_| TransportError::Closed)
    }

    fn close(&mut self) {
        if !self.cancel.is_cancelled() {
            log::info!("WebSocket: closing");
            self.cancel.cancel();
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Decode one frame and forward its events. Returns false when the reader
/// should stop.
fn forward_frame(
    raw: &[u8],
    audio: AudioDefaults,
    events: &mpsc::UnboundedSender<InboundEvent>,
) -> bool {
    match protocol::parse_server_message(raw, audio) {
        Ok(parsed) => {
            for event in parsed {
                if events.send(event).is_err() {
                    return false;
                }
            }
            true
        }
        Err(e) => {
            log::error!("WebSocket: unparseable frame ({} bytes): {}", raw.len(), e);
            let _ = events.send(InboundEvent::Error(
                TransportError::Protocol(e).to_string(),
            ));
            false
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&mut self, audio: AudioDefaults) -> Result<TransportLink, TransportError> {
        let mut url = self.config.endpoint().clone();
        url.query_pairs_mut()
            .append_pair("key", self.config.api_key());

        log::info!(
            "WebSocket: connecting to {}",
            self.config.endpoint().host_str().unwrap_or("?")
        );
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<OutboundMessage>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        // Writer: owns the sink, reports failed sends without stopping
        let writer_cancel = cancel.clone();
        let writer_events = events_tx.clone();
        tokio::spawn(async move {
            let mut sent = 0u64;
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    message = outbound_rx.recv() => {
                        let Some(message) = message else { break };
                        let kind = message.kind();
                        let text = message.to_json().to_string();
                        match write.send(Message::Text(text.into())).await {
                            Ok(()) => sent += 1,
                            Err(e) => {
                                log::warn!("WebSocket: failed to send {}: {}", kind, e);
                                let _ = writer_events.send(InboundEvent::SendFailed {
                                    kind,
                                    reason: e.to_string(),
                                });
                            }
                        }
                    }
                }
            }
            log::debug!("WebSocket: writer exiting after {} messages", sent);
            let _ = write.close().await;
        });

        // Reader: turns frames into events until the socket or the token ends it
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    frame = read.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if !forward_frame(text.as_bytes(), audio, &events_tx) {
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(data))) => {
                            if !forward_frame(&data[..], audio, &events_tx) {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            log::info!("WebSocket: server closed connection: {:?}", frame);
                            let _ = events_tx.send(InboundEvent::Closed {
                                reason: frame.map(|f| f.reason.to_string()),
                            });
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::error!("WebSocket: read error: {}", e);
                            let _ = events_tx.send(InboundEvent::Error(e.to_string()));
                            break;
                        }
                        None => {
                            let _ = events_tx.send(InboundEvent::Closed { reason: None });
                            break;
                        }
                    }
                }
            }
            // The writer has nothing left to do once inbound is gone
            reader_cancel.cancel();
            log::debug!("WebSocket: reader exiting");
        });

        Ok(TransportLink {
            transport: Box::new(WebSocketTransport {
                outbound: outbound_tx,
                cancel,
            }),
            events: events_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::Sender;

    fn defaults() -> AudioDefaults {
        AudioDefaults {
            sample_rate_hz: 24000,
            channels: 1,
        }
    }

    #[test]
    fn test_forward_frame_emits_events_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let raw = br#"{"serverContent":{"outputTranscription":{"text":"Hi"},"turnComplete":true}}"#;

        assert!(forward_frame(raw, defaults(), &tx));
        assert_eq!(
            rx.try_recv().unwrap(),
            InboundEvent::PartialTranscript {
                sender: Sender::Remote,
                text: "Hi".into()
            }
        );
        assert_eq!(rx.try_recv().unwrap(), InboundEvent::TurnComplete);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_forward_frame_reports_protocol_violation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(!forward_frame(b"not json", defaults(), &tx));
        match rx.try_recv().unwrap() {
            InboundEvent::Error(message) => assert!(message.starts_with("Protocol violation")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_closed_transport_rejects_sends() {
        let (outbound, _rx) = mpsc::unbounded_channel();
        let mut transport = WebSocketTransport {
            outbound,
            cancel: CancellationToken::new(),
        };
        assert!(transport
            .send(OutboundMessage::Greeting("hello".into()))
            .is_ok());

        transport.close();
        transport.close();
        assert_eq!(
            transport.send(OutboundMessage::Greeting("again".into())),
            Err(TransportError::Closed)
        );
    }
}
