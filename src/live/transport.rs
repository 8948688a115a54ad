//! Duplex transport to the live endpoint
//!
//! The engine only sees [`Connector`], [`TransportSink`] and
//! [`TransportSource`]; [`WebSocketConnector`] is the production binding.

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::protocol::{self, InboundMessage, OutboundMessage, SessionSetup};
use crate::config::LiveConfig;
use crate::{Error, Result};

/// Write half of an open live channel
#[async_trait]
pub trait TransportSink: Send {
    /// Send one message
    async fn send(&mut self, message: OutboundMessage) -> Result<()>;

    /// Close the channel gracefully
    async fn close(&mut self) -> Result<()>;
}

/// Read half of an open live channel
#[async_trait]
pub trait TransportSource: Send {
    /// Next message; `None` once the channel has ended
    async fn recv(&mut self) -> Option<Result<InboundMessage>>;
}

/// Both halves of an established channel
pub struct Transport {
    pub sink: Box<dyn TransportSink>,
    pub source: Box<dyn TransportSource>,
}

/// Establishes live channels
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and complete the session handshake
    ///
    /// # Errors
    ///
    /// Returns `Connection` if the endpoint is unreachable or rejects the handshake
    async fn connect(&self, config: &LiveConfig) -> Result<Transport>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to the live endpoint over a WebSocket
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Build the endpoint URL with the API key as a query parameter
///
/// # Errors
///
/// Returns `Config` if the endpoint is not a valid URL
pub fn endpoint_url(config: &LiveConfig) -> Result<url::Url> {
    let mut url = url::Url::parse(&config.endpoint)
        .map_err(|e| Error::Config(format!("invalid live endpoint {}: {e}", config.endpoint)))?;

    if let Some(key) = &config.api_key {
        url.query_pairs_mut().append_pair("key", key);
    }
    Ok(url)
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, config: &LiveConfig) -> Result<Transport> {
        let url = endpoint_url(config)?;

        tracing::debug!(host = url.host_str().unwrap_or_default(), "connecting to live endpoint");

        let (ws, response) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::Connection(e.to_string()))?;

        tracing::debug!(status = %response.status(), "live websocket established");

        let (write, read) = ws.split();
        let mut sink = WebSocketSink { write };
        let mut source = WebSocketSource {
            read,
            pending: VecDeque::new(),
            default_rate: config.output_sample_rate,
        };

        let setup = SessionSetup {
            model: config.model.clone(),
            voice: config.voice.clone(),
            system_instruction: config.system_instruction.clone(),
        };
        sink.write
            .send(Message::Text(protocol::encode_setup(&setup)?))
            .await
            .map_err(|e| Error::Connection(format!("setup failed: {e}")))?;

        match source.recv().await {
            Some(Ok(InboundMessage::SetupComplete)) => {
                tracing::info!(model = %config.model, "live session established");
            }
            Some(Ok(InboundMessage::Close { reason })) => {
                return Err(Error::Connection(format!(
                    "handshake rejected: {}",
                    reason.unwrap_or_else(|| "no reason given".to_string())
                )));
            }
            Some(Ok(other)) => {
                return Err(Error::Connection(format!(
                    "unexpected handshake reply: {other:?}"
                )));
            }
            Some(Err(e)) => return Err(Error::Connection(format!("handshake failed: {e}"))),
            None => return Err(Error::Connection("closed during handshake".to_string())),
        }

        Ok(Transport {
            sink: Box::new(sink),
            source: Box::new(source),
        })
    }
}

struct WebSocketSink {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl TransportSink for WebSocketSink {
    async fn send(&mut self, message: OutboundMessage) -> Result<()> {
        let json = protocol::encode_outbound(&message)?;
        self.write.send(Message::Text(json)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.write.close().await?;
        Ok(())
    }
}

struct WebSocketSource {
    read: SplitStream<WsStream>,
    pending: VecDeque<InboundMessage>,
    default_rate: u32,
}

impl WebSocketSource {
    fn decode(&mut self, text: &str) {
        match protocol::decode_inbound(text, self.default_rate) {
            Ok(messages) => self.pending.extend(messages),
            Err(e) => tracing::warn!(error = %e, "ignoring undecodable live frame"),
        }
    }
}

#[async_trait]
impl TransportSource for WebSocketSource {
    async fn recv(&mut self) -> Option<Result<InboundMessage>> {
        loop {
            if let Some(message) = self.pending.pop_front() {
                return Some(Ok(message));
            }

            match self.read.next().await? {
                Ok(Message::Text(text)) => self.decode(&text),
                // Some endpoints send JSON in binary frames
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => self.decode(&text),
                    Err(_) => tracing::warn!("ignoring non-UTF-8 binary frame"),
                },
                Ok(Message::Close(frame)) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty());
                    return Some(Ok(InboundMessage::Close { reason }));
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                Err(e) => return Some(Err(Error::WebSocket(e))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url_appends_key() {
        let config = LiveConfig {
            endpoint: "wss://example.com/ws/live".to_string(),
            api_key: Some("secret key".to_string()),
            ..LiveConfig::default()
        };
        let url = endpoint_url(&config).unwrap();
        assert_eq!(url.as_str(), "wss://example.com/ws/live?key=secret+key");
    }

    #[test]
    fn test_endpoint_url_rejects_garbage() {
        let config = LiveConfig {
            endpoint: "not a url".to_string(),
            ..LiveConfig::default()
        };
        assert!(matches!(endpoint_url(&config), Err(Error::Config(_))));
    }
}
