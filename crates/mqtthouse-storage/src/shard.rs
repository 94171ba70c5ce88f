//! Shard Buffer and Watermark
//!
//! A shard owns one RocksDB instance, its generation list, and the
//! *watermark* `t_max`: the safe read horizon. Writers are serialised by an
//! ingest mutex; readers never take it. The watermark advances only after a
//! batch has committed, so a reader that stops at `t_max` can never miss a
//! message that is still in flight.
//!
//! With `force_monotonic_timestamps`, every stored message gets
//! `max(msg_ts, watermark + 1)`, which makes timestamps unique per shard;
//! otherwise timestamps pass through and the watermark just tracks their
//! maximum. Delete operations pass through unchanged either way.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use mqtthouse_core::{Batch, Operation, Precondition, TopicFilter};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::config::{BatchOptions, DbConfig};
use crate::error::{Error, Result};
use crate::generation::{GenId, GenerationManager, GenerationMeta};
use crate::kv::KvStore;
use crate::layout::{
    DeleteBatch, DeleteSelector, LayoutIterator, LayoutStream, MessageKey, NextBatch,
};

/// Current wall-clock time in microseconds.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// One partition of a database.
pub struct Shard {
    id: u16,
    config: DbConfig,
    generations: RwLock<GenerationManager>,
    /// The watermark: every committed message has a timestamp at or below
    /// this value.
    latest: AtomicU64,
    /// Serialises writers. Readers never take this.
    ingest: Mutex<()>,
}

impl Shard {
    pub async fn open(path: &Path, id: u16, config: &DbConfig) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let kv = Arc::new(KvStore::open(path)?);
        let now = now_us();
        let generations = GenerationManager::open(kv, config.storage.clone(), now).await?;
        Ok(Self {
            id,
            config: config.clone(),
            generations: RwLock::new(generations),
            latest: AtomicU64::new(now),
            ingest: Mutex::new(()),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// The safe read horizon `t_max`.
    pub fn watermark(&self) -> u64 {
        self.latest.load(Ordering::Acquire)
    }

    /// Buffer, timestamp, and commit one batch into the current generation.
    pub async fn store_batch(&self, batch: &Batch, options: &BatchOptions) -> Result<()> {
        let _ingest = self.ingest.lock().await;
        let generations = self.generations.read().await;
        let current = generations.current()?;

        for precondition in &batch.preconditions {
            match precondition {
                Precondition::IfExists(matcher) => {
                    if current.layout.lookup_message(matcher).await?.is_none() {
                        return Err(Error::PreconditionFailed(format!(
                            "no message at {} ts={}",
                            matcher.topic, matcher.timestamp_us
                        )));
                    }
                }
                Precondition::UnlessExists(matcher) => {
                    if current.layout.lookup_message(matcher).await?.is_some() {
                        return Err(Error::PreconditionFailed(format!(
                            "message exists at {} ts={}",
                            matcher.topic, matcher.timestamp_us
                        )));
                    }
                }
            }
        }

        let mut latest = self.latest.load(Ordering::Acquire);
        let mut operations = Vec::with_capacity(batch.operations.len());
        for op in &batch.operations {
            match op {
                Operation::Store(msg) => {
                    let mut msg = msg.clone();
                    if self.config.force_monotonic_timestamps {
                        msg.timestamp_us = msg.timestamp_us.max(latest.saturating_add(1));
                        latest = msg.timestamp_us;
                    } else {
                        latest = latest.max(msg.timestamp_us);
                    }
                    operations.push(Operation::Store(msg));
                }
                Operation::Delete(matcher) => operations.push(Operation::Delete(matcher.clone())),
            }
        }

        let cooked = current.layout.prepare_batch(&operations).await?;
        current.layout.commit_batch(cooked, options).await?;
        // Only a successful commit moves the horizon.
        self.latest.store(latest, Ordering::Release);
        debug!(
            shard = self.id,
            operations = operations.len(),
            watermark = latest,
            "committed batch"
        );
        Ok(())
    }

    /// Streams across all generations that can still contain messages at or
    /// after `start_time_us`, in generation order.
    pub async fn get_streams(
        &self,
        filter: &TopicFilter,
        start_time_us: u64,
    ) -> Result<Vec<(GenId, LayoutStream)>> {
        let generations = self.generations.read().await;
        let mut out = Vec::new();
        for (id, generation) in generations.iter() {
            if let Some(until) = generation.meta.until_us {
                // A closed generation only holds timestamps up to `until`.
                if until < start_time_us {
                    continue;
                }
            }
            for stream in generation.layout.get_streams(filter, start_time_us).await? {
                out.push((*id, stream));
            }
        }
        Ok(out)
    }

    pub async fn get_delete_streams(
        &self,
        filter: &TopicFilter,
        start_time_us: u64,
    ) -> Result<Vec<(GenId, LayoutStream)>> {
        self.get_streams(filter, start_time_us).await
    }

    pub async fn make_iterator(
        &self,
        generation: GenId,
        stream: &LayoutStream,
        filter: &TopicFilter,
        start_time_us: u64,
    ) -> Result<LayoutIterator> {
        let generations = self.generations.read().await;
        let gen = generations
            .get(generation)
            .ok_or(Error::GenerationNotFound(generation))?;
        gen.layout.make_iterator(stream, filter, start_time_us).await
    }

    /// Fetch the next batch. A dropped generation yields end-of-stream.
    pub async fn next(
        &self,
        generation: GenId,
        iterator: &LayoutIterator,
        batch_size: usize,
    ) -> Result<NextBatch> {
        let generations = self.generations.read().await;
        let Some(gen) = generations.get(generation) else {
            return Ok(NextBatch::EndOfStream);
        };
        let current = gen.meta.until_us.is_none();
        gen.layout
            .next(iterator, batch_size, self.watermark(), current)
            .await
    }

    pub async fn delete_next(
        &self,
        generation: GenId,
        iterator: &LayoutIterator,
        selector: &DeleteSelector,
        batch_size: usize,
    ) -> Result<DeleteBatch> {
        let generations = self.generations.read().await;
        let Some(gen) = generations.get(generation) else {
            return Ok(DeleteBatch::EndOfStream);
        };
        let current = gen.meta.until_us.is_none();
        gen.layout
            .delete_next(iterator, selector, batch_size, self.watermark(), current)
            .await
    }

    pub async fn update_iterator(
        &self,
        generation: GenId,
        iterator: &LayoutIterator,
        key: &MessageKey,
    ) -> Result<LayoutIterator> {
        let generations = self.generations.read().await;
        let gen = generations
            .get(generation)
            .ok_or(Error::GenerationNotFound(generation))?;
        gen.layout.update_iterator(iterator, key).await
    }

    /// Rotate to a fresh generation. Pauses ingest for the duration.
    pub async fn add_generation(&self) -> Result<GenId> {
        let _ingest = self.ingest.lock().await;
        let mut generations = self.generations.write().await;
        let since = now_us().max(self.watermark());
        let id = generations.add_generation(since).await?;
        // Monotonic timestamps assigned from here on must fall inside the
        // new generation's window.
        self.latest.fetch_max(since, Ordering::AcqRel);
        Ok(id)
    }

    pub async fn drop_generation(&self, generation: GenId) -> Result<()> {
        let mut generations = self.generations.write().await;
        generations.drop_generation(generation).await
    }

    pub async fn list_generations(&self) -> BTreeMap<GenId, GenerationMeta> {
        self.generations.read().await.list()
    }
}
