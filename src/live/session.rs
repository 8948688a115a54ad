//! One open live connection and the tasks that service it

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::outbound::OutboundQueue;
use super::protocol::InboundMessage;
use super::transport::{Transport, TransportSink, TransportSource};
use crate::audio::{CapturePipeline, CaptureStream, SegmentId};
use crate::engine::EngineEvent;

/// Identifier of one live connection; events from older ids are stale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resources held by an open live session
///
/// Only the engine task touches this; the reader and writer tasks
/// communicate back exclusively through [`EngineEvent`]s.
pub struct LiveSession {
    id: SessionId,
    outbound: OutboundQueue,
    pipeline: Option<CapturePipeline>,
    capture: Option<Box<dyn CaptureStream>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    close_grace: Duration,
    interruptible: Option<SegmentId>,
    backpressured: bool,
    closed: bool,
}

impl LiveSession {
    /// Start the reader and writer tasks over an established transport
    ///
    /// After [`close`](Self::close) the writer has `close_grace` to flush
    /// before it is aborted and the transport dropped.
    #[must_use]
    pub fn start(
        id: SessionId,
        transport: Transport,
        outbound_limit: usize,
        close_grace: Duration,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        let outbound = OutboundQueue::new(outbound_limit);
        let Transport { sink, source } = transport;

        let writer = tokio::spawn(write_loop(id, outbound.clone(), sink, events.clone()));
        let reader = tokio::spawn(read_loop(id, source, events));

        Self {
            id,
            outbound,
            pipeline: None,
            capture: None,
            reader: Some(reader),
            writer: Some(writer),
            close_grace,
            interruptible: None,
            backpressured: false,
            closed: false,
        }
    }

    /// Take ownership of the running capture
    pub fn attach_capture(&mut self, pipeline: CapturePipeline, stream: Box<dyn CaptureStream>) {
        self.pipeline = Some(pipeline);
        self.capture = Some(stream);
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub const fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    /// Most recently scheduled segment, cleared on interruption
    #[must_use]
    pub const fn interruptible(&self) -> Option<SegmentId> {
        self.interruptible
    }

    pub fn set_interruptible(&mut self, segment: Option<SegmentId>) {
        self.interruptible = segment;
    }

    /// Record a backpressure report; returns true if this starts a new episode
    pub fn enter_backpressure(&mut self) -> bool {
        !std::mem::replace(&mut self.backpressured, true)
    }

    /// Record that pushes are accepted again; returns true if an episode ended
    pub fn leave_backpressure(&mut self) -> bool {
        std::mem::replace(&mut self.backpressured, false)
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release everything the session holds
    ///
    /// Capture stops before anything else so no frame is produced after this
    /// returns. Queued outbound messages are still flushed by the writer,
    /// which then closes the sink, unless that takes longer than the close
    /// grace. Returns `false` if already closed.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;

        if let Some(pipeline) = self.pipeline.take() {
            pipeline.stop();
        }
        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }

        self.outbound.close();

        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(writer) = self.writer.take() {
            bound_flush(self.id, writer, self.close_grace);
        }

        tracing::info!(session = %self.id, "live session closed");
        true
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Abort `writer` unless it finishes within `grace`
fn bound_flush(id: SessionId, mut writer: JoinHandle<()>, grace: Duration) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        writer.abort();
        return;
    };

    runtime.spawn(async move {
        if tokio::time::timeout(grace, &mut writer).await.is_err() {
            tracing::warn!(session = %id, ?grace, "outbound flush timed out, dropping transport");
            writer.abort();
        }
    });
}

async fn write_loop(
    id: SessionId,
    queue: OutboundQueue,
    mut sink: Box<dyn TransportSink>,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    while let Some(message) = queue.pop().await {
        let kind = message.kind();
        if let Err(e) = sink.send(message).await {
            tracing::warn!(session = %id, kind, error = %e, "live send failed");
            queue.close();
            let _ = events.send(EngineEvent::TransportFailed {
                session: id,
                error: e.to_string(),
            });
            return;
        }
    }

    if let Err(e) = sink.close().await {
        tracing::debug!(session = %id, error = %e, "live sink close failed");
    }
}

async fn read_loop(
    id: SessionId,
    mut source: Box<dyn TransportSource>,
    events: mpsc::UnboundedSender<EngineEvent>,
) {
    loop {
        let event = match source.recv().await {
            Some(Ok(message)) => {
                let last = matches!(message, InboundMessage::Close { .. });
                let event = EngineEvent::Inbound {
                    session: id,
                    message,
                };
                if last {
                    let _ = events.send(event);
                    return;
                }
                event
            }
            Some(Err(e)) => {
                tracing::warn!(session = %id, error = %e, "live receive failed");
                let _ = events.send(EngineEvent::TransportFailed {
                    session: id,
                    error: e.to_string(),
                });
                return;
            }
            None => {
                let _ = events.send(EngineEvent::TransportClosed {
                    session: id,
                    reason: None,
                });
                return;
            }
        };

        if events.send(event).is_err() {
            return;
        }
    }
}
