//! Live session controller
//!
//! A live session streams microphone frames to the remote endpoint and
//! receives synthesized audio back over one duplex channel.

pub mod outbound;
pub mod protocol;
mod session;
pub mod transport;

pub use outbound::{Admission, OutboundQueue};
pub use protocol::{InboundMessage, OutboundMessage, SessionSetup};
pub use session::{LiveSession, SessionId};
pub use transport::{Connector, Transport, TransportSink, TransportSource, WebSocketConnector};
