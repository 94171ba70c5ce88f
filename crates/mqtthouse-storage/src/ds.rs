//! DS Facade
//!
//! The front door of the engine. [`Ds`] is a registry of named databases;
//! each database is a fixed set of shards. The facade routes writes to
//! shards by a configurable key (client id or topic), fans reads out across
//! shards, and wraps layout streams and iterators in opaque handles that
//! remember their shard and generation.
//!
//! ## Ranks
//!
//! Every stream carries a [`Rank`] `(shard, generation)`. Streams with
//! distinct shards are independent and may be consumed in parallel; within
//! one shard, a lower generation must be fully drained (end-of-stream)
//! before moving to the next, which preserves per-shard timestamp order
//! across generation boundaries.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use mqtthouse_core::{Batch, Message, Operation, TopicFilter};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::{BatchOptions, DbConfig, SerializeBy};
use crate::error::{Error, Result};
use crate::generation::GenId;
use crate::layout::{
    DeleteBatch, DeleteSelector, LayoutIterator, LayoutStream, MessageKey, NextBatch,
};
use crate::metrics;
use crate::shard::Shard;

/// Position of a stream or generation within a database: `(X, Y)` where X
/// is the shard and Y the generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rank {
    pub shard: u16,
    pub generation: GenId,
}

/// An opaque replay unit: a subset of messages that must be consumed in
/// timestamp order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    shard: u16,
    generation: GenId,
    inner: LayoutStream,
}

impl Stream {
    pub fn rank(&self) -> Rank {
        Rank {
            shard: self.shard,
            generation: self.generation,
        }
    }
}

/// A resumable cursor over one stream. Serialisable; callers may persist it
/// and continue replay across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayIterator {
    shard: u16,
    generation: GenId,
    inner: LayoutIterator,
}

/// A cursor over one stream used for selective deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteIterator {
    shard: u16,
    generation: GenId,
    inner: LayoutIterator,
}

/// Result of [`Ds::next`].
#[derive(Debug)]
pub enum Next {
    /// Messages in timestamp order plus the iterator to continue with. An
    /// empty batch on the current generation means "no more right now".
    Messages {
        iterator: ReplayIterator,
        messages: Vec<(MessageKey, Message)>,
    },
    EndOfStream,
}

/// Result of [`Ds::delete_next`].
#[derive(Debug)]
pub enum DeleteNext {
    Deleted {
        iterator: DeleteIterator,
        deleted: usize,
    },
    EndOfStream,
}

/// Lifetime of one generation, as reported by
/// [`Ds::list_generations_with_lifetimes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationLifetime {
    pub since_us: u64,
    pub until_us: Option<u64>,
    pub created_at_ms: i64,
}

struct Db {
    config: DbConfig,
    shards: Vec<Arc<Shard>>,
}

/// The durable storage engine: a registry of named, sharded databases.
pub struct Ds {
    base_dir: PathBuf,
    dbs: RwLock<HashMap<String, Arc<Db>>>,
}

impl Ds {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        metrics::init();
        Self {
            base_dir: base_dir.into(),
            dbs: RwLock::new(HashMap::new()),
        }
    }

    /// Open (or create) a database. Opening an already-open database is a
    /// no-op; the original configuration stays in effect.
    pub async fn open_db(&self, name: &str, config: DbConfig) -> Result<()> {
        let mut dbs = self.dbs.write().await;
        if dbs.contains_key(name) {
            return Ok(());
        }
        let mut shards = Vec::with_capacity(config.n_shards as usize);
        for shard_id in 0..config.n_shards {
            let path = self.shard_path(name, shard_id);
            shards.push(Arc::new(Shard::open(&path, shard_id, &config).await?));
        }
        info!(db = name, shards = config.n_shards, "opened database");
        dbs.insert(name.to_string(), Arc::new(Db { config, shards }));
        Ok(())
    }

    /// Close a database, releasing its backend handles.
    pub async fn close_db(&self, name: &str) -> Result<()> {
        let mut dbs = self.dbs.write().await;
        dbs.remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::DatabaseNotFound(name.to_string()))
    }

    /// Close a database and delete its on-disk state.
    pub async fn drop_db(&self, name: &str) -> Result<()> {
        self.close_db(name).await?;
        let path = self.base_dir.join(name);
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        info!(db = name, "dropped database");
        Ok(())
    }

    /// Store a batch, routing each operation to its shard. `atomic` applies
    /// within each shard; the engine gives no cross-shard guarantees.
    pub async fn store_batch(
        &self,
        name: &str,
        batch: Batch,
        options: BatchOptions,
    ) -> Result<()> {
        let db = self.db(name).await?;

        let mut per_shard: BTreeMap<u16, Batch> = BTreeMap::new();
        for op in batch.operations {
            match &op {
                Operation::Store(msg) => {
                    let shard = shard_of_message(&db.config, msg);
                    per_shard.entry(shard).or_default().operations.push(op);
                }
                Operation::Delete(matcher) => match db.config.serialize_by {
                    // Topic routing pins a topic to one shard.
                    SerializeBy::Topic => {
                        let shard = shard_of_key(matcher.topic.as_str(), db.config.n_shards);
                        per_shard.entry(shard).or_default().operations.push(op);
                    }
                    // Client routing cannot place a matcher; fan out.
                    SerializeBy::ClientId => {
                        for shard in 0..db.config.n_shards {
                            per_shard
                                .entry(shard)
                                .or_default()
                                .operations
                                .push(op.clone());
                        }
                    }
                },
            }
        }

        let atomic = options.atomic || db.config.atomic_batches;
        if atomic && per_shard.len() > 1 {
            return Err(Error::Unsupported(
                "atomic batch spans multiple shards".to_string(),
            ));
        }

        if !batch.preconditions.is_empty() {
            if per_shard.len() > 1 {
                return Err(Error::Unsupported(
                    "preconditions on a batch spanning multiple shards".to_string(),
                ));
            }
            let Some((_, shard_batch)) = per_shard.iter_mut().next() else {
                return Err(Error::Unsupported(
                    "preconditions on an empty batch".to_string(),
                ));
            };
            shard_batch.preconditions = batch.preconditions;
        }

        for (shard_id, shard_batch) in per_shard {
            let shard = db
                .shards
                .get(shard_id as usize)
                .ok_or_else(|| Error::Backend(format!("no shard {shard_id}")))?;
            shard.store_batch(&shard_batch, &options).await?;
        }
        Ok(())
    }

    /// All streams matching a topic filter, across every shard, ordered by
    /// rank.
    pub async fn get_streams(
        &self,
        name: &str,
        filter: &TopicFilter,
        start_time_us: u64,
    ) -> Result<Vec<(Rank, Stream)>> {
        let db = self.db(name).await?;
        let mut out = Vec::new();
        for shard in &db.shards {
            for (generation, inner) in shard.get_streams(filter, start_time_us).await? {
                let stream = Stream {
                    shard: shard.id(),
                    generation,
                    inner,
                };
                out.push((stream.rank(), stream));
            }
        }
        out.sort_by_key(|(rank, _)| *rank);
        Ok(out)
    }

    pub async fn make_iterator(
        &self,
        name: &str,
        stream: &Stream,
        filter: &TopicFilter,
        start_time_us: u64,
    ) -> Result<ReplayIterator> {
        let db = self.db(name).await?;
        let shard = self.shard(&db, stream.shard)?;
        let inner = shard
            .make_iterator(stream.generation, &stream.inner, filter, start_time_us)
            .await?;
        Ok(ReplayIterator {
            shard: stream.shard,
            generation: stream.generation,
            inner,
        })
    }

    /// Fetch up to `batch_size` messages. An iterator whose generation was
    /// dropped yields `EndOfStream` rather than an error.
    pub async fn next(
        &self,
        name: &str,
        iterator: &ReplayIterator,
        batch_size: usize,
    ) -> Result<Next> {
        let db = self.db(name).await?;
        let shard = self.shard(&db, iterator.shard)?;
        match shard
            .next(iterator.generation, &iterator.inner, batch_size)
            .await?
        {
            NextBatch::Messages {
                iterator: inner,
                messages,
            } => Ok(Next::Messages {
                iterator: ReplayIterator {
                    shard: iterator.shard,
                    generation: iterator.generation,
                    inner,
                },
                messages,
            }),
            NextBatch::EndOfStream => Ok(Next::EndOfStream),
        }
    }

    /// Rebind a persisted message key as the iterator position; replay
    /// continues after that message.
    pub async fn update_iterator(
        &self,
        name: &str,
        iterator: &ReplayIterator,
        key: &MessageKey,
    ) -> Result<ReplayIterator> {
        let db = self.db(name).await?;
        let shard = self.shard(&db, iterator.shard)?;
        let inner = shard
            .update_iterator(iterator.generation, &iterator.inner, key)
            .await?;
        Ok(ReplayIterator {
            shard: iterator.shard,
            generation: iterator.generation,
            inner,
        })
    }

    pub async fn get_delete_streams(
        &self,
        name: &str,
        filter: &TopicFilter,
        start_time_us: u64,
    ) -> Result<Vec<(Rank, Stream)>> {
        self.get_streams(name, filter, start_time_us).await
    }

    pub async fn make_delete_iterator(
        &self,
        name: &str,
        stream: &Stream,
        filter: &TopicFilter,
        start_time_us: u64,
    ) -> Result<DeleteIterator> {
        let iterator = self.make_iterator(name, stream, filter, start_time_us).await?;
        Ok(DeleteIterator {
            shard: iterator.shard,
            generation: iterator.generation,
            inner: iterator.inner,
        })
    }

    /// Walk the stream, deleting candidates the selector accepts.
    pub async fn delete_next(
        &self,
        name: &str,
        iterator: &DeleteIterator,
        selector: &DeleteSelector,
        batch_size: usize,
    ) -> Result<DeleteNext> {
        let db = self.db(name).await?;
        let shard = self.shard(&db, iterator.shard)?;
        match shard
            .delete_next(iterator.generation, &iterator.inner, selector, batch_size)
            .await?
        {
            DeleteBatch::Deleted {
                iterator: inner,
                deleted,
            } => Ok(DeleteNext::Deleted {
                iterator: DeleteIterator {
                    shard: iterator.shard,
                    generation: iterator.generation,
                    inner,
                },
                deleted,
            }),
            DeleteBatch::EndOfStream => Ok(DeleteNext::EndOfStream),
        }
    }

    /// Rotate every shard of the database to a fresh generation.
    pub async fn add_generation(&self, name: &str) -> Result<()> {
        let db = self.db(name).await?;
        for shard in &db.shards {
            shard.add_generation().await?;
        }
        Ok(())
    }

    pub async fn list_generations_with_lifetimes(
        &self,
        name: &str,
    ) -> Result<BTreeMap<Rank, GenerationLifetime>> {
        let db = self.db(name).await?;
        let mut out = BTreeMap::new();
        for shard in &db.shards {
            for (generation, meta) in shard.list_generations().await {
                out.insert(
                    Rank {
                        shard: shard.id(),
                        generation,
                    },
                    GenerationLifetime {
                        since_us: meta.since_us,
                        until_us: meta.until_us,
                        created_at_ms: meta.created_at_ms,
                    },
                );
            }
        }
        Ok(out)
    }

    /// Drop one generation. `GenerationNotFound` means it was already
    /// dropped; callers replaying administrative logs treat that as
    /// success.
    pub async fn drop_generation(&self, name: &str, rank: Rank) -> Result<()> {
        let db = self.db(name).await?;
        let shard = self.shard(&db, rank.shard)?;
        match shard.drop_generation(rank.generation).await {
            Err(err) if err.is_not_found() => {
                warn!(db = name, ?rank, "generation already dropped");
                Err(err)
            }
            other => other,
        }
    }

    /// The shard a message routes to. Exposed for tests and shard-aware
    /// callers.
    pub async fn shard_of(&self, name: &str, message: &Message) -> Result<u16> {
        let db = self.db(name).await?;
        Ok(shard_of_message(&db.config, message))
    }

    async fn db(&self, name: &str) -> Result<Arc<Db>> {
        let dbs = self.dbs.read().await;
        dbs.get(name)
            .cloned()
            .ok_or_else(|| Error::DatabaseNotFound(name.to_string()))
    }

    fn shard<'a>(&self, db: &'a Db, shard: u16) -> Result<&'a Arc<Shard>> {
        db.shards
            .get(shard as usize)
            .ok_or_else(|| Error::Backend(format!("no shard {shard}")))
    }

    fn shard_path(&self, name: &str, shard: u16) -> PathBuf {
        self.base_dir.join(name).join(shard.to_string())
    }
}

fn shard_of_message(config: &DbConfig, message: &Message) -> u16 {
    let key = match config.serialize_by {
        SerializeBy::ClientId => message.from.as_str(),
        SerializeBy::Topic => message.topic.as_str(),
    };
    shard_of_key(key, config.n_shards)
}

/// Stable hash routing: the shard assignment of a key must survive process
/// restarts and crate upgrades, so this never uses `std`'s hasher.
fn shard_of_key(key: &str, n_shards: u16) -> u16 {
    let digest = md5::compute(key.as_bytes());
    let hash = u64::from_be_bytes(digest[..8].try_into().expect("slice is 8 bytes"));
    (hash % n_shards.max(1) as u64) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqtthouse_core::Message;
    use tempfile::TempDir;

    fn test_config() -> DbConfig {
        DbConfig {
            n_shards: 2,
            force_monotonic_timestamps: false,
            ..Default::default()
        }
    }

    fn message(from: &str, topic: &str, ts: u64, payload: &str) -> Message {
        Message::new(from, topic, ts, payload.as_bytes().to_vec())
    }

    // -- registry --

    #[tokio::test]
    async fn test_open_db_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let ds = Ds::new(dir.path());
        ds.open_db("db", test_config()).await.unwrap();
        ds.open_db("db", test_config()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_db_is_not_found() {
        let dir = TempDir::new().unwrap();
        let ds = Ds::new(dir.path());
        let err = ds
            .get_streams("nope", &TopicFilter::parse("#").unwrap(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DatabaseNotFound(_)));
    }

    #[tokio::test]
    async fn test_drop_db_removes_state() {
        let dir = TempDir::new().unwrap();
        let ds = Ds::new(dir.path());
        ds.open_db("db", test_config()).await.unwrap();
        ds.store_batch(
            "db",
            Batch::from(vec![message("c1", "t/1", 100, "x")]),
            BatchOptions::default(),
        )
        .await
        .unwrap();
        ds.drop_db("db").await.unwrap();
        assert!(!dir.path().join("db").exists());

        // A re-created database starts empty.
        ds.open_db("db", test_config()).await.unwrap();
        let streams = ds
            .get_streams("db", &TopicFilter::parse("#").unwrap(), 0)
            .await
            .unwrap();
        assert!(streams.is_empty());
    }

    // -- routing --

    #[tokio::test]
    async fn test_routing_is_stable_per_client() {
        let dir = TempDir::new().unwrap();
        let ds = Ds::new(dir.path());
        ds.open_db("db", test_config()).await.unwrap();
        let m1 = message("client-a", "t/1", 100, "x");
        let m2 = message("client-a", "t/2", 200, "y");
        let s1 = ds.shard_of("db", &m1).await.unwrap();
        let s2 = ds.shard_of("db", &m2).await.unwrap();
        assert_eq!(s1, s2);
        assert!(s1 < 2);
    }

    #[tokio::test]
    async fn test_topic_routing_follows_topic() {
        let dir = TempDir::new().unwrap();
        let ds = Ds::new(dir.path());
        let config = DbConfig {
            serialize_by: SerializeBy::Topic,
            ..test_config()
        };
        ds.open_db("db", config).await.unwrap();
        let m1 = message("a", "same/topic", 100, "x");
        let m2 = message("b", "same/topic", 200, "y");
        assert_eq!(
            ds.shard_of("db", &m1).await.unwrap(),
            ds.shard_of("db", &m2).await.unwrap()
        );
    }

    // -- rank ordering --

    #[tokio::test]
    async fn test_stream_ranks_are_ordered() {
        let dir = TempDir::new().unwrap();
        let ds = Ds::new(dir.path());
        ds.open_db("db", test_config()).await.unwrap();
        ds.store_batch(
            "db",
            Batch::from(vec![
                message("c1", "t/1", 100, "x"),
                message("c2", "t/2", 200, "y"),
            ]),
            BatchOptions::default(),
        )
        .await
        .unwrap();
        ds.add_generation("db").await.unwrap();
        ds.store_batch(
            "db",
            Batch::from(vec![message("c1", "t/1", 5_000_000_000_000_000, "z")]),
            BatchOptions::default(),
        )
        .await
        .unwrap();

        let streams = ds
            .get_streams("db", &TopicFilter::parse("t/#").unwrap(), 0)
            .await
            .unwrap();
        let ranks: Vec<Rank> = streams.iter().map(|(r, _)| *r).collect();
        let mut sorted = ranks.clone();
        sorted.sort();
        assert_eq!(ranks, sorted);
    }
}
