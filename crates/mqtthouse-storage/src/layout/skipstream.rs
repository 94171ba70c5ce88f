//! Skipstream-LTS Layout
//!
//! The production layout. Topics are compressed through the LTS trie into a
//! fixed-width static key plus varying tokens, and every KV entry is keyed
//!
//! ```text
//! static_key ∥ level:u16 ∥ hash_bytes* ∥ timestamp:u64      (big-endian)
//! ```
//!
//! Level 0 is the *data stream*: the value carries the serialised message
//! with its varying tokens. Level `i ≥ 1` is the *index stream* for the
//! i-th varying token: an empty-valued entry at
//! `(static, i, hash(token), ts)` asserts that a message exists at this
//! shape and timestamp whose i-th varying token hashes to that value.
//!
//! Replay holds one cursor per index level the filter constrains, plus one
//! on the data stream. All cursors share the key prefix, so a single seek
//! per cursor both locates candidates and skips past non-matching ranges:
//! whenever one cursor is ahead, every other cursor seeks forward to its
//! timestamp. Hashes are truncated MD5; collisions are rejected by
//! comparing the stored varying tokens, at the cost of one extra seek.
//!
//! The layout owns the end-of-stream decision: a stream over the shard's
//! open generation never terminates (an empty batch means "no more right
//! now"), while a closed or dropped generation terminates once its range is
//! drained.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mqtthouse_core::{Message, MessageMatcher, Operation, TopicFilter};
use rocksdb::{ColumnFamily, DB};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{BatchOptions, SkipstreamConfig};
use crate::error::{Error, Result};
use crate::kv::{bounded_read_options, cf_handle, prefix_successor, write_options, KvStore};
use crate::layout::{
    schema_mismatch, CookedBatch, DeleteBatch, DeleteSelector, KvOp, LayoutIterator, LayoutStream,
    MessageKey, NextBatch, StorageLayout,
};
use crate::lts::{
    compress_topic_filter, constraints_match, decompress_topic, LtsTrie, TplSegment, TrieSession,
    VaryingConstraint,
};
use crate::metrics;
use tokio::sync::RwLock;

/// One learned topic shape of a skipstream generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipstreamStream {
    pub static_key: Vec<u8>,
}

/// Cursor over one shape. Carries the filter compressed against the
/// stream's trie, so resuming needs no re-matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipstreamIterator {
    pub static_key: Vec<u8>,
    pub constraints: Vec<VaryingConstraint>,
    /// Timestamp the next scan starts from.
    pub next_ts: u64,
}

/// On-disk data-stream value. The topic is stored as its varying tokens
/// only; the shape template restores the full topic on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    id: Option<Uuid>,
    from: String,
    varying: Vec<String>,
    payload: Bytes,
}

pub struct SkipstreamLayout {
    kv: Arc<KvStore>,
    data_cf: String,
    trie_cf: String,
    config: SkipstreamConfig,
    trie: RwLock<LtsTrie>,
}

impl SkipstreamLayout {
    /// Open the layout over existing column families, restoring the trie
    /// from its column family (empty for a fresh generation, pre-seeded
    /// when inherited).
    pub async fn open(
        kv: Arc<KvStore>,
        data_cf: String,
        trie_cf: String,
        config: SkipstreamConfig,
    ) -> Result<Self> {
        let pairs = {
            let db = kv.read().await;
            let cf = cf_handle(&db, &trie_cf)?;
            let mut pairs = Vec::new();
            let mut cursor = db.raw_iterator_cf(cf);
            cursor.seek_to_first();
            while cursor.valid() {
                pairs.push((
                    cursor.key().unwrap_or_default().to_vec(),
                    cursor.value().unwrap_or_default().to_vec(),
                ));
                cursor.next();
            }
            cursor.status()?;
            pairs
        };
        let trie = LtsTrie::restore(
            config.static_key_bytes,
            config.wildcard_thresholds.clone(),
            &pairs,
        )?;
        Ok(Self {
            kv,
            data_cf,
            trie_cf,
            config,
            trie: RwLock::new(trie),
        })
    }

    fn data_key(&self, static_key: &[u8], ts: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(static_key.len() + 2 + 8);
        key.extend_from_slice(static_key);
        key.extend_from_slice(&0u16.to_be_bytes());
        key.extend_from_slice(&ts.to_be_bytes());
        key
    }

    fn index_key(&self, static_key: &[u8], level: u16, token: &str, ts: u64) -> Vec<u8> {
        let hash = self.token_hash(token);
        let mut key = Vec::with_capacity(static_key.len() + 2 + hash.len() + 8);
        key.extend_from_slice(static_key);
        key.extend_from_slice(&level.to_be_bytes());
        key.extend_from_slice(&hash);
        key.extend_from_slice(&ts.to_be_bytes());
        key
    }

    fn token_hash(&self, token: &str) -> Vec<u8> {
        let digest = md5::compute(token.as_bytes());
        digest[..self.config.hash_bytes.min(16)].to_vec()
    }

    fn entry_ops(&self, static_key: &[u8], ts: u64, entry: &StoredEntry, delete: bool) -> Result<Vec<KvOp>> {
        let mut ops = Vec::with_capacity(1 + entry.varying.len());
        let data_key = self.data_key(static_key, ts);
        if delete {
            ops.push(KvOp::Delete {
                cf: self.data_cf.clone(),
                key: data_key,
            });
        } else {
            ops.push(KvOp::Put {
                cf: self.data_cf.clone(),
                key: data_key,
                value: bincode::serialize(entry)?,
            });
        }
        for (slot, token) in entry.varying.iter().enumerate() {
            let key = self.index_key(static_key, (slot + 1) as u16, token, ts);
            ops.push(if delete {
                KvOp::Delete {
                    cf: self.data_cf.clone(),
                    key,
                }
            } else {
                KvOp::Put {
                    cf: self.data_cf.clone(),
                    key,
                    value: Vec::new(),
                }
            });
        }
        Ok(ops)
    }
}

/// Per-level cursor state of one skip-scan.
struct Cursor<'a> {
    iter: rocksdb::DBRawIteratorWithThreadMode<'a, DB>,
    prefix: Vec<u8>,
    ts: Option<u64>,
}

impl Cursor<'_> {
    /// Position the cursor at the first key of its range with timestamp at
    /// least `ts`; returns that timestamp, or `None` when the range is
    /// drained.
    fn seek_at_least(&mut self, ts: u64) -> Result<Option<u64>> {
        if let Some(current) = self.ts {
            if current >= ts {
                return Ok(Some(current));
            }
        }
        let mut key = self.prefix.clone();
        key.extend_from_slice(&ts.to_be_bytes());
        self.iter.seek(&key);
        metrics::SEEKS_TOTAL.inc();
        if self.iter.valid() {
            let found = parse_key_ts(self.iter.key().unwrap_or_default())?;
            self.ts = Some(found);
            Ok(Some(found))
        } else {
            self.iter.status()?;
            self.ts = None;
            Ok(None)
        }
    }
}

struct ScanOutcome {
    /// Verified candidates: `(data key, entry, timestamp)`.
    candidates: Vec<(Vec<u8>, StoredEntry, u64)>,
    next_ts: u64,
    exhausted: bool,
}

/// The multi-cursor skip-scan at the core of the layout.
fn skip_scan(
    db: &DB,
    cf: &ColumnFamily,
    static_key: &[u8],
    constraints: &[VaryingConstraint],
    hash_width: usize,
    start_ts: u64,
    t_max: u64,
    batch_size: usize,
) -> Result<ScanOutcome> {
    let mut prefixes: Vec<Vec<u8>> = Vec::with_capacity(1 + constraints.len());
    let mut data_prefix = static_key.to_vec();
    data_prefix.extend_from_slice(&0u16.to_be_bytes());
    prefixes.push(data_prefix);
    for (slot, constraint) in constraints.iter().enumerate() {
        if let VaryingConstraint::Exact(token) = constraint {
            let digest = md5::compute(token.as_bytes());
            let mut prefix = static_key.to_vec();
            prefix.extend_from_slice(&((slot + 1) as u16).to_be_bytes());
            prefix.extend_from_slice(&digest[..hash_width.min(16)]);
            prefixes.push(prefix);
        }
    }

    let mut cursors: Vec<Cursor<'_>> = prefixes
        .into_iter()
        .map(|prefix| {
            let upper = prefix_successor(&prefix);
            let ro = bounded_read_options(&prefix, upper.as_deref());
            Cursor {
                iter: db.raw_iterator_cf_opt(cf, ro),
                prefix,
                ts: None,
            }
        })
        .collect();

    let mut candidates = Vec::new();
    let mut target = start_ts;
    loop {
        // Align every cursor at one timestamp, skipping forward to the
        // furthest cursor whenever they disagree.
        let mut max_ts = target;
        loop {
            let mut aligned = true;
            for cursor in &mut cursors {
                match cursor.seek_at_least(max_ts)? {
                    None => {
                        return Ok(ScanOutcome {
                            candidates,
                            next_ts: max_ts,
                            exhausted: true,
                        });
                    }
                    Some(ts) => {
                        if ts > max_ts {
                            max_ts = ts;
                            aligned = false;
                        }
                    }
                }
            }
            if aligned {
                break;
            }
            metrics::MISSES_TOTAL.inc();
        }

        if max_ts > t_max {
            metrics::FUTURE_TOTAL.inc();
            return Ok(ScanOutcome {
                candidates,
                next_ts: max_ts,
                exhausted: false,
            });
        }

        // All cursors agree: read the data entry and verify the actual
        // tokens, rejecting truncated-hash collisions.
        let data = &cursors[0];
        let key = data.iter.key().unwrap_or_default().to_vec();
        let entry: StoredEntry = bincode::deserialize(data.iter.value().unwrap_or_default())?;
        if constraints_match(constraints, &entry.varying) {
            metrics::HITS_TOTAL.inc();
            candidates.push((key, entry, max_ts));
        } else {
            metrics::COLLISIONS_TOTAL.inc();
        }

        let Some(next) = max_ts.checked_add(1) else {
            return Ok(ScanOutcome {
                candidates,
                next_ts: u64::MAX,
                exhausted: false,
            });
        };
        target = next;
        if candidates.len() >= batch_size {
            return Ok(ScanOutcome {
                candidates,
                next_ts: target,
                exhausted: false,
            });
        }
    }
}

#[async_trait]
impl StorageLayout for SkipstreamLayout {
    async fn prepare_batch(&self, operations: &[Operation]) -> Result<CookedBatch> {
        let trie = self.trie.read().await;
        let mut session = TrieSession::new(&trie);
        let db = self.kv.read().await;
        let cf = cf_handle(&db, &self.data_cf)?;

        let mut cooked = CookedBatch::default();
        // Stores earlier in this batch are visible to later deletes.
        let mut pending: HashMap<Vec<u8>, StoredEntry> = HashMap::new();

        for op in operations {
            match op {
                Operation::Store(msg) => {
                    let tokens: Vec<&str> = msg.topic.levels().collect();
                    let (static_key, varying) = session.topic_key(&tokens)?;
                    let entry = StoredEntry {
                        id: msg.id,
                        from: msg.from.clone(),
                        varying,
                        payload: msg.payload.clone(),
                    };
                    cooked
                        .ops
                        .extend(self.entry_ops(&static_key, msg.timestamp_us, &entry, false)?);
                    pending.insert(self.data_key(&static_key, msg.timestamp_us), entry);
                }
                Operation::Delete(matcher) => {
                    let tokens: Vec<&str> = matcher.topic.levels().collect();
                    let Some((static_key, varying)) = session.lookup_topic_key(&tokens) else {
                        // Unlearned shape: nothing can be stored there.
                        continue;
                    };
                    let data_key = self.data_key(&static_key, matcher.timestamp_us);
                    let existing = match pending.get(&data_key) {
                        Some(entry) => Some(entry.clone()),
                        None => db
                            .get_cf(cf, &data_key)?
                            .map(|raw| bincode::deserialize::<StoredEntry>(&raw))
                            .transpose()?,
                    };
                    let Some(entry) = existing else {
                        continue;
                    };
                    if entry.varying != varying || !matcher.payload.matches(&entry.payload) {
                        continue;
                    }
                    pending.remove(&data_key);
                    cooked
                        .ops
                        .extend(self.entry_ops(&static_key, matcher.timestamp_us, &entry, true)?);
                }
            }
        }

        let staged = session.into_staged();
        for (key, value) in &staged.ops {
            cooked.ops.push(KvOp::Put {
                cf: self.trie_cf.clone(),
                key: key.clone(),
                value: value.clone(),
            });
        }
        cooked.staged_trie = Some(staged);
        Ok(cooked)
    }

    async fn commit_batch(&self, cooked: CookedBatch, options: &BatchOptions) -> Result<()> {
        {
            let db = self.kv.read().await;
            let mut batch = rocksdb::WriteBatch::default();
            for op in &cooked.ops {
                match op {
                    KvOp::Put { cf, key, value } => batch.put_cf(cf_handle(&db, cf)?, key, value),
                    KvOp::Delete { cf, key } => batch.delete_cf(cf_handle(&db, cf)?, key),
                }
            }
            db.write_opt(batch, &write_options(options.sync, !options.durable))?;
        }
        // The commit is durable; only now may readers learn the new shapes.
        if let Some(staged) = cooked.staged_trie {
            if !staged.is_empty() {
                self.trie.write().await.apply(staged);
            }
        }
        Ok(())
    }

    async fn get_streams(
        &self,
        filter: &TopicFilter,
        _start_time_us: u64,
    ) -> Result<Vec<LayoutStream>> {
        let trie = self.trie.read().await;
        Ok(trie
            .match_topics(filter)
            .into_iter()
            .map(|m| {
                LayoutStream::Skipstream(SkipstreamStream {
                    static_key: m.static_key,
                })
            })
            .collect())
    }

    async fn make_iterator(
        &self,
        stream: &LayoutStream,
        filter: &TopicFilter,
        start_time_us: u64,
    ) -> Result<LayoutIterator> {
        let LayoutStream::Skipstream(stream) = stream else {
            return Err(schema_mismatch("skipstream"));
        };
        let trie = self.trie.read().await;
        let template = trie.reverse_lookup(&stream.static_key)?;
        let constraints =
            compress_topic_filter(template, filter.levels()).ok_or(Error::FilterMismatch)?;
        Ok(LayoutIterator::Skipstream(SkipstreamIterator {
            static_key: stream.static_key.clone(),
            constraints,
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
        let LayoutIterator::Skipstream(it) = iterator else {
            return Err(schema_mismatch("skipstream"));
        };
        metrics::NEXT_TOTAL.inc();
        let timer = metrics::NEXT_LATENCY.start_timer();

        let template: Vec<TplSegment> = {
            let trie = self.trie.read().await;
            trie.reverse_lookup(&it.static_key)?.to_vec()
        };
        let outcome = {
            let db = self.kv.read().await;
            let cf = cf_handle(&db, &self.data_cf)?;
            skip_scan(
                &db,
                cf,
                &it.static_key,
                &it.constraints,
                self.config.hash_bytes,
                it.next_ts,
                t_max,
                batch_size,
            )?
        };
        timer.observe_duration();

        if outcome.exhausted && !current && outcome.candidates.is_empty() {
            metrics::EOS_TOTAL.inc();
            return Ok(NextBatch::EndOfStream);
        }

        let mut messages: Vec<(MessageKey, Message)> = Vec::with_capacity(outcome.candidates.len());
        for (key, entry, ts) in outcome.candidates {
            let topic = decompress_topic(&template, &entry.varying)?;
            messages.push((
                key,
                Message {
                    id: entry.id,
                    from: entry.from,
                    topic,
                    timestamp_us: ts,
                    payload: entry.payload,
                },
            ));
        }
        Ok(NextBatch::Messages {
            iterator: LayoutIterator::Skipstream(SkipstreamIterator {
                static_key: it.static_key.clone(),
                constraints: it.constraints.clone(),
                next_ts: outcome.next_ts,
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
        let LayoutIterator::Skipstream(it) = iterator else {
            return Err(schema_mismatch("skipstream"));
        };
        let template: Vec<TplSegment> = {
            let trie = self.trie.read().await;
            trie.reverse_lookup(&it.static_key)?.to_vec()
        };

        let db = self.kv.read().await;
        let cf = cf_handle(&db, &self.data_cf)?;
        let outcome = skip_scan(
            &db,
            cf,
            &it.static_key,
            &it.constraints,
            self.config.hash_bytes,
            it.next_ts,
            t_max,
            batch_size,
        )?;

        let had_candidates = !outcome.candidates.is_empty();
        let mut batch = rocksdb::WriteBatch::default();
        let mut deleted = 0usize;
        for (_key, entry, ts) in outcome.candidates {
            let topic = decompress_topic(&template, &entry.varying)?;
            let message = Message {
                id: entry.id,
                from: entry.from.clone(),
                topic,
                timestamp_us: ts,
                payload: entry.payload.clone(),
            };
            if !selector(&message) {
                continue;
            }
            // Remove every level of this (static, timestamp).
            for op in self.entry_ops(&it.static_key, ts, &entry, true)? {
                if let KvOp::Delete { cf: op_cf, key } = op {
                    batch.delete_cf(cf_handle(&db, &op_cf)?, key);
                }
            }
            deleted += 1;
        }
        if deleted > 0 {
            db.write_opt(batch, &write_options(false, false))?;
        }

        if outcome.exhausted && !current && !had_candidates {
            return Ok(DeleteBatch::EndOfStream);
        }
        Ok(DeleteBatch::Deleted {
            iterator: LayoutIterator::Skipstream(SkipstreamIterator {
                static_key: it.static_key.clone(),
                constraints: it.constraints.clone(),
                next_ts: outcome.next_ts,
            }),
            deleted,
        })
    }

    async fn lookup_message(&self, matcher: &MessageMatcher) -> Result<Option<Message>> {
        let tokens: Vec<&str> = matcher.topic.levels().collect();
        let resolved = {
            let trie = self.trie.read().await;
            trie.lookup_topic_key(&tokens)
        };
        let Some((static_key, varying)) = resolved else {
            return Ok(None);
        };
        let db = self.kv.read().await;
        let cf = cf_handle(&db, &self.data_cf)?;
        let Some(raw) = db.get_cf(cf, self.data_key(&static_key, matcher.timestamp_us))? else {
            return Ok(None);
        };
        let entry: StoredEntry = bincode::deserialize(&raw)?;
        if entry.varying != varying || !matcher.payload.matches(&entry.payload) {
            return Ok(None);
        }
        Ok(Some(Message {
            id: entry.id,
            from: entry.from,
            topic: matcher.topic.clone(),
            timestamp_us: matcher.timestamp_us,
            payload: entry.payload,
        }))
    }

    async fn update_iterator(
        &self,
        iterator: &LayoutIterator,
        key: &MessageKey,
    ) -> Result<LayoutIterator> {
        let LayoutIterator::Skipstream(it) = iterator else {
            return Err(schema_mismatch("skipstream"));
        };
        let expected_len = it.static_key.len() + 2 + 8;
        if key.len() != expected_len {
            return Err(Error::CorruptKey(format!(
                "expected {expected_len}-byte data key, got {}",
                key.len()
            )));
        }
        if !key.starts_with(&it.static_key)
            || key[it.static_key.len()..it.static_key.len() + 2] != 0u16.to_be_bytes()
        {
            return Err(Error::SchemaMismatch(
                "message key does not belong to this stream".to_string(),
            ));
        }
        let ts = parse_key_ts(key)?;
        Ok(LayoutIterator::Skipstream(SkipstreamIterator {
            static_key: it.static_key.clone(),
            constraints: it.constraints.clone(),
            next_ts: ts.saturating_add(1),
        }))
    }

    async fn dump_trie(&self) -> Result<Option<Vec<(Vec<u8>, Vec<u8>)>>> {
        let trie = self.trie.read().await;
        Ok(Some(trie.dump()?))
    }
}

fn parse_key_ts(key: &[u8]) -> Result<u64> {
    if key.len() < 8 {
        return Err(Error::CorruptKey(format!(
            "key too short for a timestamp: {} bytes",
            key.len()
        )));
    }
    let bytes: [u8; 8] = key[key.len() - 8..]
        .try_into()
        .expect("slice is 8 bytes");
    Ok(u64::from_be_bytes(bytes))
}
