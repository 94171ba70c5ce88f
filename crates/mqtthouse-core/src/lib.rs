//! MqttHouse Core Data Model
//!
//! This crate defines the types shared by every MqttHouse component: the
//! [`Message`] record, [`Topic`] names and [`TopicFilter`] wildcard
//! subscriptions, and the [`Batch`] of operations handed to the storage
//! engine.
//!
//! ## What is a Message?
//!
//! A message is a single published MQTT payload, similar to:
//! - A Kafka record
//! - A log entry
//! - An event in an event stream
//!
//! Messages are immutable once stored. They carry a 128-bit GUID, the
//! publishing client id, a slash-delimited topic, a microsecond timestamp
//! and an opaque payload.
//!
//! ## Design Decisions
//! - Uses `bytes::Bytes` for payloads (no allocations when slicing)
//! - Timestamps are microseconds since epoch; the storage shard may rewrite
//!   them to enforce per-shard uniqueness
//! - The message id is optional because some storage layouts do not persist
//!   it and synthesise `None` on read

pub mod error;
pub mod message;
pub mod topic;

pub use error::{Error, Result};
pub use message::{Batch, Message, MessageMatcher, Operation, PayloadSelector, Precondition};
pub use topic::{FilterLevel, Topic, TopicFilter};
