//! # Messaging Module
//!
//! Queue-based message passing for the execution engine. The queue is
//! the only coordination substrate between workers; there is no
//! in-process scheduler state.

pub mod message;
pub mod queue;

pub use message::Message;
pub use queue::{AckToken, Delivery, InMemoryQueue, MessageQueue, QueueDepth, QueueError};
