//! Storage Layouts
//!
//! A *layout* owns the physical storage and index scheme of one generation.
//! The [`StorageLayout`] capability trait covers the whole lifecycle: batch
//! cooking and commit, stream discovery, iterator materialisation, replay,
//! deletion, and point lookup.
//!
//! Two implementations exist:
//!
//! - [`reference::ReferenceLayout`]: one entry per timestamp, full scan.
//!   No indexing; exists for cross-checking and integration testing.
//! - [`skipstream::SkipstreamLayout`]: the production layout, LTS topic
//!   compression plus a multi-level skip index.
//!
//! Streams and iterators are sum types carrying the layout-specific
//! payload. Handing an iterator to a layout of a different kind is a schema
//! mismatch, which is unrecoverable by definition.

pub mod reference;
pub mod skipstream;

use async_trait::async_trait;
use mqtthouse_core::{Message, MessageMatcher, Operation, TopicFilter};
use serde::{Deserialize, Serialize};

use crate::config::BatchOptions;
use crate::error::{Error, Result};
use crate::lts::StagedTrie;

/// Opaque position of a stored message inside its stream. Callers persist
/// it to resume iterators via `update_iterator`.
pub type MessageKey = Vec<u8>;

/// Caller-supplied predicate deciding which candidate messages a delete
/// iterator removes.
pub type DeleteSelector = dyn Fn(&Message) -> bool + Send + Sync;

/// One KV mutation inside a cooked batch.
#[derive(Debug, Clone)]
pub enum KvOp {
    Put {
        cf: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: String,
        key: Vec<u8>,
    },
}

/// A batch cooked by `prepare_batch`, ready for one atomic commit. The ops
/// are ordered; a store followed by a delete of the same key nets out to a
/// delete, exactly as the caller wrote the batch.
#[derive(Debug, Default)]
pub struct CookedBatch {
    pub ops: Vec<KvOp>,
    /// Trie structure learned while cooking; applied to the in-memory
    /// mirror after the commit succeeds.
    pub staged_trie: Option<StagedTrie>,
}

impl CookedBatch {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Layout-specific stream payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayoutStream {
    Reference(reference::ReferenceStream),
    Skipstream(skipstream::SkipstreamStream),
}

/// Layout-specific iterator payload. Serialisable; callers may persist it
/// and resume replay across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayoutIterator {
    Reference(reference::ReferenceIterator),
    Skipstream(skipstream::SkipstreamIterator),
}

/// Result of one `next` call.
#[derive(Debug)]
pub enum NextBatch {
    /// Messages found so far, plus the iterator to continue with. An empty
    /// batch does not terminate the stream; the safe horizon may simply not
    /// have advanced yet.
    Messages {
        iterator: LayoutIterator,
        messages: Vec<(MessageKey, Message)>,
    },
    /// The stream is exhausted and will never yield again.
    EndOfStream,
}

/// Result of one `delete_next` call.
#[derive(Debug)]
pub enum DeleteBatch {
    Deleted {
        iterator: LayoutIterator,
        deleted: usize,
    },
    EndOfStream,
}

/// The capability object owning one generation's physical storage.
#[async_trait]
pub trait StorageLayout: Send + Sync {
    /// Cook a batch of operations into KV puts/deletes. Does not write.
    async fn prepare_batch(&self, operations: &[Operation]) -> Result<CookedBatch>;

    /// Commit a cooked batch in one atomic KV write, then publish any
    /// learned trie structure to the in-memory mirror.
    async fn commit_batch(&self, cooked: CookedBatch, options: &BatchOptions) -> Result<()>;

    /// Streams a subscriber must replay for this filter.
    async fn get_streams(&self, filter: &TopicFilter, start_time_us: u64)
        -> Result<Vec<LayoutStream>>;

    /// Materialise an iterator over one stream starting at `start_time_us`.
    async fn make_iterator(
        &self,
        stream: &LayoutStream,
        filter: &TopicFilter,
        start_time_us: u64,
    ) -> Result<LayoutIterator>;

    /// Fetch up to `batch_size` messages with timestamps at or below
    /// `t_max`. `current` tells the layout whether its generation is still
    /// open for writes: only a closed generation may report end-of-stream.
    async fn next(
        &self,
        iterator: &LayoutIterator,
        batch_size: usize,
        t_max: u64,
        current: bool,
    ) -> Result<NextBatch>;

    /// Streams to walk when deleting by filter. Mirrors `get_streams`.
    async fn get_delete_streams(
        &self,
        filter: &TopicFilter,
        start_time_us: u64,
    ) -> Result<Vec<LayoutStream>> {
        self.get_streams(filter, start_time_us).await
    }

    /// Materialise a delete iterator. Mirrors `make_iterator`.
    async fn make_delete_iterator(
        &self,
        stream: &LayoutStream,
        filter: &TopicFilter,
        start_time_us: u64,
    ) -> Result<LayoutIterator> {
        self.make_iterator(stream, filter, start_time_us).await
    }

    /// Walk up to `batch_size` candidates, removing those the selector
    /// accepts. Removal covers every index level of a matched message.
    async fn delete_next(
        &self,
        iterator: &LayoutIterator,
        selector: &DeleteSelector,
        batch_size: usize,
        t_max: u64,
        current: bool,
    ) -> Result<DeleteBatch>;

    /// Point lookup by exact topic and timestamp, used to evaluate batch
    /// preconditions. Returns `None` when nothing is stored there.
    async fn lookup_message(&self, matcher: &MessageMatcher) -> Result<Option<Message>>;

    /// Rebind a persisted message key as the iterator's position. The key
    /// must belong to the iterator's stream.
    async fn update_iterator(
        &self,
        iterator: &LayoutIterator,
        key: &MessageKey,
    ) -> Result<LayoutIterator>;

    /// Serialised trie for inheritance into a successor generation, or
    /// `None` for layouts without a trie.
    async fn dump_trie(&self) -> Result<Option<Vec<(Vec<u8>, Vec<u8>)>>>;
}

pub(crate) fn schema_mismatch(expected: &str) -> Error {
    Error::SchemaMismatch(format!("handle does not belong to a {expected} layout"))
}
