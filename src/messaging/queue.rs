//! # Message Queue Contract
//!
//! The queue is the engine's only coordination substrate. The contract
//! is at-least-once with a visibility timeout: a polled message is
//! hidden from other consumers until acked or the timeout lapses, after
//! which it is redelivered verbatim. Handlers are written to tolerate
//! that redelivery.
//!
//! [`InMemoryQueue`] is the reference implementation used by the test
//! suite and by embedders that do not need a durable transport.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::message::Message;
use crate::clock::Clock;

/// Opaque handle tying an ack or nack back to a specific delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AckToken(u64);

/// A polled message plus its ack token
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub token: AckToken,
    /// How many times this message has been delivered, this poll included
    pub read_count: u32,
}

/// Errors surfaced by queue transports
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue transport unavailable: {message}")]
    Unavailable { message: String },

    #[error("Message serialization failed: {message}")]
    Serialization { message: String },
}

/// Reliable at-least-once message queue
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Enqueue a message for immediate delivery
    async fn push(&self, message: Message) -> Result<(), QueueError>;

    /// Enqueue a message that becomes visible only after the delay
    async fn push_delayed(&self, message: Message, delay: Duration) -> Result<(), QueueError>;

    /// Poll one message. The delivery stays invisible to other
    /// consumers until acked, nacked, or the visibility timeout lapses.
    async fn poll(&self) -> Result<Option<Delivery>, QueueError>;

    /// Permanently remove a delivered message
    async fn ack(&self, token: AckToken) -> Result<(), QueueError>;

    /// Return a delivered message to the queue immediately
    async fn nack(&self, token: AckToken) -> Result<(), QueueError>;
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    message: Message,
    read_count: u32,
}

#[derive(Debug)]
struct InFlight {
    queued: QueuedMessage,
    deadline: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    next_token: u64,
    ready: VecDeque<QueuedMessage>,
    delayed: Vec<(DateTime<Utc>, QueuedMessage)>,
    in_flight: HashMap<u64, InFlight>,
}

/// Point-in-time queue depth, mainly for tests and diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDepth {
    pub ready: usize,
    pub delayed: usize,
    pub in_flight: usize,
}

/// In-process queue with delayed delivery and visibility timeouts.
///
/// Time is read through the injected clock, so visibility and delay
/// behavior is fully deterministic under test.
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    clock: Arc<dyn Clock>,
    visibility_timeout: Duration,
}

impl InMemoryQueue {
    pub fn new(clock: Arc<dyn Clock>, visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            clock,
            visibility_timeout,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // a poisoned queue mutex means a panicking test thread; the
        // state itself is still consistent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Promote due delayed messages and reclaim expired deliveries
    fn settle(state: &mut QueueState, now: DateTime<Utc>) {
        let mut due = Vec::new();
        state.delayed.retain(|(visible_at, queued)| {
            if *visible_at <= now {
                due.push(queued.clone());
                false
            } else {
                true
            }
        });
        for queued in due {
            state.ready.push_back(queued);
        }

        let expired: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, inflight)| inflight.deadline <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            if let Some(inflight) = state.in_flight.remove(&token) {
                debug!(read_count = inflight.queued.read_count, "visibility timeout lapsed, redelivering");
                state.ready.push_back(inflight.queued);
            }
        }
    }

    /// Current queue depth across ready, delayed, and in-flight buckets
    pub fn depth(&self) -> QueueDepth {
        let state = self.lock();
        QueueDepth {
            ready: state.ready.len(),
            delayed: state.delayed.len(),
            in_flight: state.in_flight.len(),
        }
    }

    /// Snapshot of messages awaiting delivery (ready then delayed),
    /// used by tests to assert on enqueued work
    pub fn pending_messages(&self) -> Vec<Message> {
        let state = self.lock();
        state
            .ready
            .iter()
            .map(|q| q.message.clone())
            .chain(state.delayed.iter().map(|(_, q)| q.message.clone()))
            .collect()
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn push(&self, message: Message) -> Result<(), QueueError> {
        debug!(message_type = message.message_type(), execution_id = message.execution_id(), "push");
        let mut state = self.lock();
        state.ready.push_back(QueuedMessage {
            message,
            read_count: 0,
        });
        Ok(())
    }

    async fn push_delayed(&self, message: Message, delay: Duration) -> Result<(), QueueError> {
        debug!(
            message_type = message.message_type(),
            execution_id = message.execution_id(),
            delay_ms = delay.as_millis() as u64,
            "push delayed"
        );
        let visible_at = self.clock.now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let mut state = self.lock();
        state.delayed.push((
            visible_at,
            QueuedMessage {
                message,
                read_count: 0,
            },
        ));
        Ok(())
    }

    async fn poll(&self) -> Result<Option<Delivery>, QueueError> {
        let now = self.clock.now();
        let mut state = self.lock();
        Self::settle(&mut state, now);

        let Some(mut queued) = state.ready.pop_front() else {
            return Ok(None);
        };
        queued.read_count += 1;

        let token = state.next_token;
        state.next_token += 1;
        let deadline = now
            + chrono::Duration::from_std(self.visibility_timeout)
                .unwrap_or_else(|_| chrono::Duration::zero());
        let delivery = Delivery {
            message: queued.message.clone(),
            token: AckToken(token),
            read_count: queued.read_count,
        };
        state.in_flight.insert(token, InFlight { queued, deadline });
        Ok(Some(delivery))
    }

    async fn ack(&self, token: AckToken) -> Result<(), QueueError> {
        let mut state = self.lock();
        if state.in_flight.remove(&token.0).is_none() {
            // already reclaimed by a lapsed visibility timeout; the
            // redelivered copy will be handled idempotently
            debug!(?token, "ack for unknown token ignored");
        }
        Ok(())
    }

    async fn nack(&self, token: AckToken) -> Result<(), QueueError> {
        let mut state = self.lock();
        if let Some(inflight) = state.in_flight.remove(&token.0) {
            state.ready.push_front(inflight.queued);
        }
        Ok(())
    }
}
