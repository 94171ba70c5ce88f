//! Message Data Structures
//!
//! This module defines the [`Message`] record and the write-side batch
//! vocabulary: [`Operation`], [`MessageMatcher`] and [`Precondition`].
//!
//! ## Structure
//! Each message contains:
//! - **id**: 128-bit GUID; optional because some storage layouts do not
//!   persist it and return `None` on read
//! - **from**: the publishing client id
//! - **topic**: slash-delimited topic the message was published to
//! - **timestamp_us**: microseconds since epoch; the storage shard may
//!   rewrite it to keep timestamps unique within a shard
//! - **payload**: the actual data (arbitrary bytes)

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::topic::Topic;

/// A single published message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Unique 128-bit message id.
    pub id: Option<Uuid>,

    /// Client id of the publisher.
    pub from: String,

    /// Topic the message was published to.
    pub topic: Topic,

    /// Timestamp in microseconds since epoch.
    pub timestamp_us: u64,

    /// Payload bytes.
    pub payload: Bytes,
}

impl Message {
    pub fn new(from: impl Into<String>, topic: impl Into<Topic>, timestamp_us: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            id: Some(Uuid::new_v4()),
            from: from.into(),
            topic: topic.into(),
            timestamp_us,
            payload: payload.into(),
        }
    }

    /// Estimate the size of this message in bytes.
    pub fn estimated_size(&self) -> usize {
        16 + // id
        8 + // timestamp
        self.from.len() +
        self.topic.as_str().len() +
        self.payload.len()
    }
}

/// Selects payloads when matching messages for deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadSelector {
    /// Match any payload.
    Any,
    /// Match only this exact payload.
    Exact(Bytes),
}

impl PayloadSelector {
    pub fn matches(&self, payload: &Bytes) -> bool {
        match self {
            PayloadSelector::Any => true,
            PayloadSelector::Exact(expected) => expected == payload,
        }
    }
}

/// Selects a stored message by exact topic and timestamp, optionally
/// constrained to an exact payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMatcher {
    pub topic: Topic,
    pub timestamp_us: u64,
    pub payload: PayloadSelector,
}

impl MessageMatcher {
    pub fn new(topic: impl Into<Topic>, timestamp_us: u64, payload: PayloadSelector) -> Self {
        Self {
            topic: topic.into(),
            timestamp_us,
            payload,
        }
    }

    /// True if the matcher selects the given message.
    pub fn matches(&self, message: &Message) -> bool {
        self.topic == message.topic
            && self.timestamp_us == message.timestamp_us
            && self.payload.matches(&message.payload)
    }
}

/// One write-side operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Store a message.
    Store(Message),
    /// Delete every stored message the matcher selects.
    Delete(MessageMatcher),
}

/// A precondition evaluated before a batch is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precondition {
    /// The batch applies only if a matching message exists.
    IfExists(MessageMatcher),
    /// The batch applies only if no matching message exists.
    UnlessExists(MessageMatcher),
}

/// An ordered sequence of operations plus optional preconditions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub operations: Vec<Operation>,
    pub preconditions: Vec<Precondition>,
}

impl Batch {
    pub fn new(operations: Vec<Operation>) -> Self {
        Self {
            operations,
            preconditions: Vec::new(),
        }
    }

    pub fn with_preconditions(mut self, preconditions: Vec<Precondition>) -> Self {
        self.preconditions = preconditions;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }
}

impl From<Vec<Message>> for Batch {
    fn from(messages: Vec<Message>) -> Self {
        Self::new(messages.into_iter().map(Operation::Store).collect())
    }
}
