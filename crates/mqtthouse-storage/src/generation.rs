//! Generation Lifecycle
//!
//! A shard is a monotonic sequence of *generations*: time-bounded
//! containers, each owned by one layout instance and backed by its own
//! column families (`data_<id>`, plus `trie_<id>` for skipstream). Exactly
//! one generation per shard is open for writes: the one with the largest
//! id and no `until`.
//!
//! Adding a generation closes the predecessor at `until := since` and, when
//! both run the skipstream layout, bulk-loads the predecessor's trie into
//! the successor so learned topic shapes are inherited. Dropping a
//! generation removes its column families and metadata entry; dropping an
//! unknown id reports not-found, which callers replaying administrative
//! logs treat as success.
//!
//! The ordered generation list lives in a shared `meta` column family.
//! Column families are created before their metadata entry commits, so a
//! crash in between leaves orphans; they are reclaimed on the next open.

use std::collections::BTreeMap;
use std::sync::Arc;

use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{LayoutConfig, LayoutKind};
use crate::error::{Error, Result};
use crate::kv::{cf_handle, write_options, KvStore};
use crate::layout::{reference::ReferenceLayout, skipstream::SkipstreamLayout, StorageLayout};

pub type GenId = u64;

const META_CF: &str = "meta";
const GENERATION_KEY_PREFIX: &[u8] = b"generation/";

/// Persisted description of one generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationMeta {
    pub id: GenId,
    /// Start of the generation's time window, microseconds.
    pub since_us: u64,
    /// End of the window; set when the generation is superseded.
    pub until_us: Option<u64>,
    /// Wall-clock creation time, milliseconds.
    pub created_at_ms: i64,
    /// Layout schema this generation was created with.
    pub layout: LayoutConfig,
}

/// An open generation: its metadata plus the layout instance owning its
/// column families.
pub struct Generation {
    pub meta: GenerationMeta,
    pub layout: Arc<dyn StorageLayout>,
}

/// The ordered generation list of one shard.
pub struct GenerationManager {
    kv: Arc<KvStore>,
    storage: LayoutConfig,
    generations: BTreeMap<GenId, Generation>,
}

impl GenerationManager {
    /// Load the generation list, bootstrapping generation 0 on first open
    /// and reclaiming column families whose metadata never committed.
    pub async fn open(kv: Arc<KvStore>, storage: LayoutConfig, now_us: u64) -> Result<Self> {
        kv.create_cf(META_CF).await?;
        let mut manager = Self {
            kv,
            storage,
            generations: BTreeMap::new(),
        };

        let metas = manager.load_metas().await?;
        if metas.is_empty() {
            manager.create_generation(0, now_us, None).await?;
            return Ok(manager);
        }

        manager.reclaim_orphan_cfs(&metas).await?;
        for meta in metas {
            let layout = manager.instantiate(&meta).await?;
            manager.generations.insert(meta.id, Generation { meta, layout });
        }
        Ok(manager)
    }

    pub fn get(&self, id: GenId) -> Option<&Generation> {
        self.generations.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&GenId, &Generation)> {
        self.generations.iter()
    }

    /// The generation currently open for writes.
    pub fn current(&self) -> Result<&Generation> {
        self.generations
            .values()
            .last()
            .ok_or_else(|| Error::Backend("shard has no open generation".to_string()))
    }

    pub fn list(&self) -> BTreeMap<GenId, GenerationMeta> {
        self.generations
            .iter()
            .map(|(id, gen)| (*id, gen.meta.clone()))
            .collect()
    }

    /// Close the current generation at `since_us` and open its successor.
    /// Returns the new generation id.
    pub async fn add_generation(&mut self, since_us: u64) -> Result<GenId> {
        let (prev_id, mut prev_meta, inherited) = {
            let current = self.current()?;
            let inherit = current.meta.layout.kind() == LayoutKind::SkipstreamLts
                && self.storage.kind() == LayoutKind::SkipstreamLts;
            let pairs = if inherit {
                current.layout.dump_trie().await?.unwrap_or_default()
            } else {
                Vec::new()
            };
            (current.meta.id, current.meta.clone(), pairs)
        };
        prev_meta.until_us = Some(since_us);

        let new_id = prev_id + 1;
        self.create_generation(new_id, since_us, Some((prev_meta, inherited)))
            .await?;
        info!(generation = new_id, since_us, "opened generation");
        Ok(new_id)
    }

    /// Drop a closed generation: its column families and metadata entry.
    pub async fn drop_generation(&mut self, id: GenId) -> Result<()> {
        let generation = self
            .generations
            .get(&id)
            .ok_or(Error::GenerationNotFound(id))?;
        if generation.meta.until_us.is_none() {
            return Err(Error::GenerationNotClosed(id));
        }

        {
            let db = self.kv.read().await;
            let meta_cf = cf_handle(&db, META_CF)?;
            let mut batch = WriteBatch::default();
            batch.delete_cf(meta_cf, generation_key(id));
            db.write_opt(batch, &write_options(true, false))?;
        }
        self.kv.drop_cf(&data_cf(id)).await?;
        self.kv.drop_cf(&trie_cf(id)).await?;
        self.generations.remove(&id);
        info!(generation = id, "dropped generation");
        Ok(())
    }

    async fn load_metas(&self) -> Result<Vec<GenerationMeta>> {
        let db = self.kv.read().await;
        let cf = cf_handle(&db, META_CF)?;
        let mut metas = Vec::new();
        let mut cursor = db.raw_iterator_cf(cf);
        cursor.seek(GENERATION_KEY_PREFIX);
        while cursor.valid() {
            let key = cursor.key().unwrap_or_default();
            if !key.starts_with(GENERATION_KEY_PREFIX) {
                break;
            }
            let meta: GenerationMeta = bincode::deserialize(cursor.value().unwrap_or_default())?;
            metas.push(meta);
            cursor.next();
        }
        cursor.status()?;
        metas.sort_by_key(|m| m.id);
        Ok(metas)
    }

    /// Create column families and the metadata entry for a new generation.
    /// `closing` carries the predecessor's updated metadata and the trie
    /// pairs to inherit; everything commits in one batch.
    async fn create_generation(
        &mut self,
        id: GenId,
        since_us: u64,
        closing: Option<(GenerationMeta, Vec<(Vec<u8>, Vec<u8>)>)>,
    ) -> Result<()> {
        let meta = GenerationMeta {
            id,
            since_us,
            until_us: None,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
            layout: self.storage.clone(),
        };

        self.kv.create_cf(&data_cf(id)).await?;
        if meta.layout.kind() == LayoutKind::SkipstreamLts {
            self.kv.create_cf(&trie_cf(id)).await?;
        }

        {
            let db = self.kv.read().await;
            let meta_cf = cf_handle(&db, META_CF)?;
            let mut batch = WriteBatch::default();
            if let Some((prev_meta, inherited)) = &closing {
                batch.put_cf(
                    meta_cf,
                    generation_key(prev_meta.id),
                    bincode::serialize(prev_meta)?,
                );
                if !inherited.is_empty() {
                    let trie = cf_handle(&db, &trie_cf(id))?;
                    for (key, value) in inherited {
                        batch.put_cf(trie, key, value);
                    }
                    debug!(generation = id, edges = inherited.len(), "inherited trie");
                }
            }
            batch.put_cf(meta_cf, generation_key(id), bincode::serialize(&meta)?);
            db.write_opt(batch, &write_options(true, false))?;
        }

        if let Some((prev_meta, _)) = closing {
            if let Some(prev) = self.generations.get_mut(&prev_meta.id) {
                prev.meta = prev_meta;
            }
        }
        let layout = self.instantiate(&meta).await?;
        self.generations.insert(id, Generation { meta, layout });
        Ok(())
    }

    async fn instantiate(&self, meta: &GenerationMeta) -> Result<Arc<dyn StorageLayout>> {
        // Open with the layout the generation was created with, not the
        // currently configured one; that is what makes schema evolution via
        // add_generation safe.
        match &meta.layout {
            LayoutConfig::Reference => Ok(Arc::new(ReferenceLayout::new(
                self.kv.clone(),
                data_cf(meta.id),
            ))),
            LayoutConfig::SkipstreamLts(config) => Ok(Arc::new(
                SkipstreamLayout::open(
                    self.kv.clone(),
                    data_cf(meta.id),
                    trie_cf(meta.id),
                    config.clone(),
                )
                .await?,
            )),
        }
    }

    async fn reclaim_orphan_cfs(&self, metas: &[GenerationMeta]) -> Result<()> {
        let known: std::collections::BTreeSet<GenId> = metas.iter().map(|m| m.id).collect();
        for name in self.kv.cf_names() {
            let Some(id) = generation_of_cf(&name) else {
                continue;
            };
            if !known.contains(&id) {
                warn!(cf = %name, "reclaiming column family without metadata");
                self.kv.drop_cf(&name).await?;
            }
        }
        Ok(())
    }
}

pub fn data_cf(id: GenId) -> String {
    format!("data_{id}")
}

pub fn trie_cf(id: GenId) -> String {
    format!("trie_{id}")
}

fn generation_key(id: GenId) -> Vec<u8> {
    let mut key = GENERATION_KEY_PREFIX.to_vec();
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn generation_of_cf(name: &str) -> Option<GenId> {
    name.strip_prefix("data_")
        .or_else(|| name.strip_prefix("trie_"))
        .and_then(|suffix| suffix.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SkipstreamConfig;
    use mqtthouse_core::{Message, Operation, TopicFilter};
    use tempfile::TempDir;

    async fn open_manager(dir: &TempDir) -> GenerationManager {
        let kv = Arc::new(KvStore::open(dir.path()).unwrap());
        GenerationManager::open(kv, LayoutConfig::default(), 1_000)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_creates_generation_zero() {
        let dir = TempDir::new().unwrap();
        let manager = open_manager(&dir).await;
        let current = manager.current().unwrap();
        assert_eq!(current.meta.id, 0);
        assert_eq!(current.meta.since_us, 1_000);
        assert!(current.meta.until_us.is_none());
    }

    #[tokio::test]
    async fn test_add_generation_closes_predecessor() {
        let dir = TempDir::new().unwrap();
        let mut manager = open_manager(&dir).await;
        let id = manager.add_generation(5_000).await.unwrap();
        assert_eq!(id, 1);

        let list = manager.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[&0].until_us, Some(5_000));
        assert!(list[&1].until_us.is_none());
        assert_eq!(manager.current().unwrap().meta.id, 1);
    }

    #[tokio::test]
    async fn test_generations_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut manager = open_manager(&dir).await;
            manager.add_generation(5_000).await.unwrap();
        }
        let manager = open_manager(&dir).await;
        let list = manager.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[&0].until_us, Some(5_000));
        assert_eq!(manager.current().unwrap().meta.id, 1);
    }

    #[tokio::test]
    async fn test_drop_generation() {
        let dir = TempDir::new().unwrap();
        let mut manager = open_manager(&dir).await;
        manager.add_generation(5_000).await.unwrap();
        manager.drop_generation(0).await.unwrap();
        assert!(manager.get(0).is_none());
        assert_eq!(manager.list().len(), 1);
    }

    #[tokio::test]
    async fn test_drop_unknown_generation_is_not_found() {
        let dir = TempDir::new().unwrap();
        let mut manager = open_manager(&dir).await;
        manager.add_generation(5_000).await.unwrap();
        manager.drop_generation(0).await.unwrap();
        let err = manager.drop_generation(0).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_cannot_drop_open_generation() {
        let dir = TempDir::new().unwrap();
        let mut manager = open_manager(&dir).await;
        assert!(matches!(
            manager.drop_generation(0).await,
            Err(Error::GenerationNotClosed(0))
        ));
    }

    #[tokio::test]
    async fn test_trie_inheritance_on_add_generation() {
        let dir = TempDir::new().unwrap();
        let kv = Arc::new(KvStore::open(dir.path()).unwrap());
        let storage = LayoutConfig::SkipstreamLts(SkipstreamConfig {
            wildcard_thresholds: vec![100, 0, 100],
            ..Default::default()
        });
        let mut manager = GenerationManager::open(kv, storage, 1_000).await.unwrap();

        // Teach generation 0 a wildcard shape.
        let ops: Vec<Operation> = (0..20u64)
            .map(|i| {
                Operation::Store(Message::new(
                    "client",
                    format!("dev/{i}/temp"),
                    1_000 + i,
                    b"t".to_vec(),
                ))
            })
            .collect();
        {
            let layout = &manager.current().unwrap().layout;
            let cooked = layout.prepare_batch(&ops).await.unwrap();
            layout
                .commit_batch(cooked, &crate::config::BatchOptions::default())
                .await
                .unwrap();
        }

        manager.add_generation(10_000).await.unwrap();
        // The successor starts with the learned structure: one stream, no
        // re-learning.
        let filter = TopicFilter::parse("dev/#").unwrap();
        let streams = manager
            .current()
            .unwrap()
            .layout
            .get_streams(&filter, 0)
            .await
            .unwrap();
        assert_eq!(streams.len(), 1);
    }

    #[tokio::test]
    async fn test_layout_kind_recorded_per_generation() {
        let dir = TempDir::new().unwrap();
        let kv = Arc::new(KvStore::open(dir.path()).unwrap());
        let mut manager = GenerationManager::open(kv, LayoutConfig::Reference, 1_000)
            .await
            .unwrap();
        assert_eq!(
            manager.current().unwrap().meta.layout.kind(),
            LayoutKind::Reference
        );
        // Reconfigure to skipstream; the new generation uses it, the old
        // keeps its recorded layout.
        manager.storage = LayoutConfig::default();
        manager.add_generation(5_000).await.unwrap();
        assert_eq!(manager.get(0).unwrap().meta.layout.kind(), LayoutKind::Reference);
        assert_eq!(
            manager.current().unwrap().meta.layout.kind(),
            LayoutKind::SkipstreamLts
        );
    }
}
