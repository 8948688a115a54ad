//! Error types for the kiosk voice engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio payload violates the PCM frame invariant or cannot be decoded
    #[error("malformed audio chunk: {0}")]
    MalformedChunk(String),

    /// Microphone or speaker unavailable
    #[error("audio device error: {0}")]
    Device(String),

    /// Live endpoint unreachable or handshake rejected
    #[error("connection error: {0}")]
    Connection(String),

    /// Outbound queue bound exceeded
    #[error("outbound queue full ({limit} messages pending)")]
    Backpressure {
        /// Configured queue bound
        limit: usize,
    },

    /// Text generation call failed
    #[error("generation error: {0}")]
    Generation(String),

    /// Text-to-speech call failed
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// A live session is already open
    #[error("a live session is already open")]
    AlreadyOpen,

    /// A text turn is already in progress
    #[error("engine busy: {0}")]
    Busy(String),

    /// The engine or session has shut down
    #[error("closed: {0}")]
    Closed(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
