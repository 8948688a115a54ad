//! Bounded FIFO between capture and the transport writer
//!
//! Pushes never block. Once the bound is hit the queue reports
//! [`Error::Backpressure`] and refuses new messages until it has fully
//! drained; nothing already queued is dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

use super::protocol::OutboundMessage;
use crate::{Error, Result};

/// Default outbound bound (about eight seconds of 4096-sample frames at 16kHz)
pub const DEFAULT_QUEUE_LIMIT: usize = 32;

/// Outcome of a successful push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Queued normally
    Queued,
    /// Queued, and this push ended a backpressure episode
    Resumed,
}

struct QueueState {
    items: VecDeque<OutboundMessage>,
    limit: usize,
    throttled: bool,
    was_throttled: bool,
    closed: bool,
}

/// Shared handle to the outbound queue
#[derive(Clone)]
pub struct OutboundQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl OutboundQueue {
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                items: VecDeque::new(),
                limit: limit.max(1),
                throttled: false,
                was_throttled: false,
                closed: false,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message without blocking
    ///
    /// # Errors
    ///
    /// Returns `Backpressure` when the bound is exceeded or a previous
    /// overflow has not drained yet, and `Closed` after [`Self::close`]
    pub fn push(&self, message: OutboundMessage) -> Result<Admission> {
        let admission = {
            let mut state = self.lock();
            if state.closed {
                return Err(Error::Closed("outbound queue closed".to_string()));
            }
            if state.throttled || state.items.len() >= state.limit {
                if !state.throttled {
                    tracing::warn!(limit = state.limit, "outbound queue full, throttling");
                }
                state.throttled = true;
                state.was_throttled = true;
                return Err(Error::Backpressure { limit: state.limit });
            }

            state.items.push_back(message);
            if state.was_throttled {
                state.was_throttled = false;
                Admission::Resumed
            } else {
                Admission::Queued
            }
        };

        self.notify.notify_one();
        Ok(admission)
    }

    /// Take the oldest message, waiting until one is available
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<OutboundMessage> {
        loop {
            {
                let mut state = self.lock();
                if let Some(message) = state.items.pop_front() {
                    if state.throttled && state.items.is_empty() {
                        state.throttled = false;
                        tracing::debug!("outbound queue drained");
                    }
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Refuse further pushes; already queued messages can still be popped
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Whether pushes are currently refused for backpressure
    #[must_use]
    pub fn is_throttled(&self) -> bool {
        self.lock().throttled
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.lock().limit
    }
}
