//! Reference Layout
//!
//! The simplest possible layout: one data column family keyed by the
//! message timestamp, no indexing, no trie. Every topic filter maps to a
//! single stream whose replay is a full forward scan filtered in memory.
//!
//! It is deliberately slow. Its job is to cross-check the skipstream layout
//! in tests: both must return the same messages for the same inputs.
//!
//! One entry per timestamp: the layout relies on the shard keeping
//! timestamps unique (`force_monotonic_timestamps`).

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mqtthouse_core::{Message, MessageMatcher, Operation, Topic, TopicFilter};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::BatchOptions;
use crate::error::{Error, Result};
use crate::kv::{bounded_read_options, cf_handle, write_options, KvStore};
use crate::layout::{
    schema_mismatch, CookedBatch, DeleteBatch, DeleteSelector, KvOp, LayoutIterator, LayoutStream,
    MessageKey, NextBatch, StorageLayout,
};
use crate::metrics;

/// The single stream of a reference generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceStream;

/// Cursor over the reference data column family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceIterator {
    pub filter: TopicFilter,
    /// Timestamp the next scan starts from.
    pub next_ts: u64,
}

/// On-disk value: everything but the timestamp, which lives in the key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    id: Option<Uuid>,
    from: String,
    topic: String,
    payload: Bytes,
}

impl StoredMessage {
    fn from_message(msg: &Message) -> Self {
        Self {
            id: msg.id,
            from: msg.from.clone(),
            topic: msg.topic.as_str().to_string(),
            payload: msg.payload.clone(),
        }
    }

    fn into_message(self, timestamp_us: u64) -> Message {
        Message {
            id: self.id,
            from: self.from,
            topic: Topic::new(self.topic),
            timestamp_us,
            payload: self.payload,
        }
    }
}

pub struct ReferenceLayout {
    kv: Arc<KvStore>,
    data_cf: String,
}

impl ReferenceLayout {
    pub fn new(kv: Arc<KvStore>, data_cf: String) -> Self {
        Self { kv, data_cf }
    }

    fn decode(&self, key: &[u8], value: &[u8]) -> Result<Message> {
        let ts = parse_ts(key)?;
        let stored: StoredMessage = bincode::deserialize(value)?;
        Ok(stored.into_message(ts))
    }
}

#[async_trait]
impl StorageLayout for ReferenceLayout {
    async fn prepare_batch(&self, operations: &[Operation]) -> Result<CookedBatch> {
        let db = self.kv.read().await;
        let cf = cf_handle(&db, &self.data_cf)?;
        let mut cooked = CookedBatch::default();
        // Stores earlier in this batch are visible to later deletes.
        let mut pending: std::collections::HashMap<u64, StoredMessage> =
            std::collections::HashMap::new();

        for op in operations {
            match op {
                Operation::Store(msg) => {
                    let stored = StoredMessage::from_message(msg);
                    cooked.ops.push(KvOp::Put {
                        cf: self.data_cf.clone(),
                        key: ts_key(msg.timestamp_us).to_vec(),
                        value: bincode::serialize(&stored)?,
                    });
                    pending.insert(msg.timestamp_us, stored);
                }
                Operation::Delete(matcher) => {
                    let existing = match pending.get(&matcher.timestamp_us) {
                        Some(stored) => Some(stored.clone()),
                        None => db
                            .get_cf(cf, ts_key(matcher.timestamp_us))?
                            .map(|raw| bincode::deserialize::<StoredMessage>(&raw))
                            .transpose()?,
                    };
                    let Some(stored) = existing else {
                        continue;
                    };
                    if stored.topic == matcher.topic.as_str()
                        && matcher.payload.matches(&stored.payload)
                    {
                        pending.remove(&matcher.timestamp_us);
                        cooked.ops.push(KvOp::Delete {
                            cf: self.data_cf.clone(),
                            key: ts_key(matcher.timestamp_us).to_vec(),
                        });
                    }
                }
            }
        }
        Ok(cooked)
    }

    async fn commit_batch(&self, cooked: CookedBatch, options: &BatchOptions) -> Result<()> {
        let db = self.kv.read().await;
        let mut batch = rocksdb::WriteBatch::default();
        for op in &cooked.ops {
            match op {
                KvOp::Put { cf, key, value } => batch.put_cf(cf_handle(&db, cf)?, key, value),
                KvOp::Delete { cf, key } => batch.delete_cf(cf_handle(&db, cf)?, key),
            }
        }
        db.write_opt(batch, &write_options(options.sync, !options.durable))?;
        Ok(())
    }

    async fn get_streams(
        &self,
        _filter: &TopicFilter,
        _start_time_us: u64,
    ) -> Result<Vec<LayoutStream>> {
        Ok(vec![LayoutStream::Reference(ReferenceStream)])
    }

    async fn make_iterator(
        &self,
        stream: &LayoutStream,
        filter: &TopicFilter,
        start_time_us: u64,
    ) -> Result<LayoutIterator> {
        let LayoutStream::Reference(_) = stream else {
            return Err(schema_mismatch("reference"));
        };
        Ok(LayoutIterator::Reference(ReferenceIterator {
            filter: filter.clone(),
            next_ts: start_time_us,
        }))
    }

    async fn next(
        &self,
        iterator: &LayoutIterator,
        batch_size: usize,
        t_max: u64,
        current: bool,
    ) -> Result<NextBatch> {
        let LayoutIterator::Reference(it) = iterator else {
            return Err(schema_mismatch("reference"));
        };
        metrics::NEXT_TOTAL.inc();
        let timer = metrics::NEXT_LATENCY.start_timer();

        let db = self.kv.read().await;
        let cf = cf_handle(&db, &self.data_cf)?;
        let lower = ts_key(it.next_ts);
        let mut cursor = db.raw_iterator_cf_opt(cf, bounded_read_options(&lower, None));
        cursor.seek(lower);

        let mut messages: Vec<(MessageKey, Message)> = Vec::new();
        let mut next_ts = it.next_ts;
        let mut exhausted = false;
        loop {
            if !cursor.valid() {
                cursor.status()?;
                exhausted = true;
                break;
            }
            let key = cursor.key().unwrap_or_default().to_vec();
            let ts = parse_ts(&key)?;
            if ts > t_max {
                metrics::FUTURE_TOTAL.inc();
                break;
            }
            let value = cursor.value().unwrap_or_default();
            let msg = self.decode(&key, value)?;
            next_ts = ts.saturating_add(1);
            if it.filter.matches(&msg.topic) {
                metrics::HITS_TOTAL.inc();
                messages.push((key, msg));
                if messages.len() >= batch_size {
                    break;
                }
            }
            cursor.next();
        }
        timer.observe_duration();

        if exhausted && !current && messages.is_empty() {
            metrics::EOS_TOTAL.inc();
            return Ok(NextBatch::EndOfStream);
        }
        Ok(NextBatch::Messages {
            iterator: LayoutIterator::Reference(ReferenceIterator {
                filter: it.filter.clone(),
                next_ts,
            }),
            messages,
        })
    }

    async fn delete_next(
        &self,
        iterator: &LayoutIterator,
        selector: &DeleteSelector,
        batch_size: usize,
        t_max: u64,
        current: bool,
    ) -> Result<DeleteBatch> {
        let LayoutIterator::Reference(it) = iterator else {
            return Err(schema_mismatch("reference"));
        };
        let db = self.kv.read().await;
        let cf = cf_handle(&db, &self.data_cf)?;
        let lower = ts_key(it.next_ts);
        let mut cursor = db.raw_iterator_cf_opt(cf, bounded_read_options(&lower, None));
        cursor.seek(lower);

        let mut doomed: Vec<Vec<u8>> = Vec::new();
        let mut candidates = 0usize;
        let mut next_ts = it.next_ts;
        let mut exhausted = false;
        loop {
            if !cursor.valid() {
                cursor.status()?;
                exhausted = true;
                break;
            }
            let key = cursor.key().unwrap_or_default().to_vec();
            let ts = parse_ts(&key)?;
            if ts > t_max {
                break;
            }
            let msg = self.decode(&key, cursor.value().unwrap_or_default())?;
            next_ts = ts.saturating_add(1);
            if it.filter.matches(&msg.topic) {
                candidates += 1;
                if selector(&msg) {
                    doomed.push(key);
                }
                if candidates >= batch_size {
                    break;
                }
            }
            cursor.next();
        }

        let deleted = doomed.len();
        if deleted > 0 {
            let mut batch = rocksdb::WriteBatch::default();
            for key in doomed {
                batch.delete_cf(cf, key);
            }
            db.write_opt(batch, &write_options(false, false))?;
        }

        if exhausted && !current && candidates == 0 {
            return Ok(DeleteBatch::EndOfStream);
        }
        Ok(DeleteBatch::Deleted {
            iterator: LayoutIterator::Reference(ReferenceIterator {
                filter: it.filter.clone(),
                next_ts,
            }),
            deleted,
        })
    }

    async fn lookup_message(&self, matcher: &MessageMatcher) -> Result<Option<Message>> {
        let db = self.kv.read().await;
        let cf = cf_handle(&db, &self.data_cf)?;
        let Some(raw) = db.get_cf(cf, ts_key(matcher.timestamp_us))? else {
            return Ok(None);
        };
        let stored: StoredMessage = bincode::deserialize(&raw)?;
        if stored.topic != matcher.topic.as_str() || !matcher.payload.matches(&stored.payload) {
            return Ok(None);
        }
        Ok(Some(stored.into_message(matcher.timestamp_us)))
    }

    async fn update_iterator(
        &self,
        iterator: &LayoutIterator,
        key: &MessageKey,
    ) -> Result<LayoutIterator> {
        let LayoutIterator::Reference(it) = iterator else {
            return Err(schema_mismatch("reference"));
        };
        let ts = parse_ts(key)?;
        Ok(LayoutIterator::Reference(ReferenceIterator {
            filter: it.filter.clone(),
            next_ts: ts.saturating_add(1),
        }))
    }

    async fn dump_trie(&self) -> Result<Option<Vec<(Vec<u8>, Vec<u8>)>>> {
        Ok(None)
    }
}

fn ts_key(ts: u64) -> [u8; 8] {
    ts.to_be_bytes()
}

fn parse_ts(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| Error::CorruptKey(format!("expected 8-byte timestamp key, got {}", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}
