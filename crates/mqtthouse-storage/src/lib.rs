//! MqttHouse Storage Engine
//!
//! This crate implements the durable storage engine for MQTT messages: a
//! sharded, log-structured store that ingests ordered streams of published
//! messages and serves topic-filter subscriptions by replaying matching
//! messages from a caller-chosen start time.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────┐
//! │  Publishers │
//! └──────┬──────┘
//!        │ store_batch
//!        ▼
//! ┌─────────────────┐
//! │    Ds Facade    │  routes by client-id or topic
//! └────────┬────────┘
//!          │ per-shard batches
//!          ▼
//! ┌─────────────────┐
//! │  Shard Buffer   │  timestamps, watermark, single writer
//! └────────┬────────┘
//!          │ prepare / commit
//!          ▼
//! ┌─────────────────┐
//! │ StorageLayout   │  reference | skipstream-LTS
//! │  - LTS trie     │
//! │  - skip index   │
//! └────────┬────────┘
//!          │ one atomic write batch
//!          ▼
//! ┌─────────────────┐
//! │    RocksDB      │  column families per generation
//! └─────────────────┘
//! ```
//!
//! ## Main Components
//!
//! ### Ds
//! The facade: a registry of named databases, each split into shards.
//! Writes route by `phash(client-id | topic) mod n_shards`; reads fan out
//! and come back as ranked streams.
//!
//! ### Shard
//! Owns one RocksDB instance, the generation list, and the watermark
//! `t_max`: the safe read horizon that readers never cross. Writers are
//! serialised; readers are lock-free against them.
//!
//! ### Generations
//! Time-bounded containers enabling schema evolution and retention: new
//! data goes to the newest generation, old generations are dropped whole.
//! The skipstream layout inherits its learned topic trie across
//! generations.
//!
//! ### Layouts
//! [`layout::StorageLayout`] is the pluggable physical scheme. The
//! reference layout is a plain timestamp-keyed log used for
//! cross-checking; the skipstream-LTS layout compresses topics through the
//! [`lts`] trie and maintains a multi-level skip index so that wildcard
//! subscriptions scan sub-linearly.
//!
//! ## Usage Example
//!
//! ```ignore
//! use mqtthouse_storage::{Ds, DbConfig, BatchOptions};
//! use mqtthouse_core::{Batch, Message, TopicFilter};
//!
//! let ds = Ds::new("/var/lib/mqtthouse");
//! ds.open_db("messages", DbConfig::default()).await?;
//!
//! // Write
//! let batch = Batch::from(vec![
//!     Message::new("client-1", "sensors/kitchen/temp", now_us, payload),
//! ]);
//! ds.store_batch("messages", batch, BatchOptions::default()).await?;
//!
//! // Replay
//! let filter = TopicFilter::parse("sensors/#")?;
//! for (_rank, stream) in ds.get_streams("messages", &filter, 0).await? {
//!     let mut iter = ds.make_iterator("messages", &stream, &filter, 0).await?;
//!     loop {
//!         match ds.next("messages", &iter, 100).await? {
//!             Next::Messages { iterator, messages } => { /* consume */ }
//!             Next::EndOfStream => break,
//!         }
//!     }
//! }
//! ```
//!
//! ## Guarantees
//!
//! - Every logical write is one atomic RocksDB batch: a crash either
//!   applies all of a batch (messages, index entries, trie edges) or none.
//! - Within one stream, `next` yields messages in non-decreasing timestamp
//!   order.
//! - End-of-stream is decided by the layout, never inferred from an empty
//!   batch: a stream over the open generation simply has "no more right
//!   now".
//! - Iterators are plain serialisable values; persist them and resume
//!   after a restart.

pub mod config;
pub mod ds;
pub mod error;
pub mod generation;
pub mod kv;
pub mod layout;
pub mod lts;
pub mod metrics;
pub mod shard;

pub use config::{Backend, BatchOptions, DbConfig, LayoutConfig, LayoutKind, SerializeBy,
    SkipstreamConfig};
pub use ds::{DeleteIterator, DeleteNext, Ds, GenerationLifetime, Next, Rank, ReplayIterator,
    Stream};
pub use error::{Error, ErrorClass, Result};
pub use generation::GenId;
pub use layout::{MessageKey, StorageLayout};
