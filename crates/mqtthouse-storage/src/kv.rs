//! Key-Value Backend Adapter
//!
//! A thin wrapper over RocksDB exposing exactly what the storage layouts
//! need: column-family lifecycle, atomic write batches with per-batch
//! sync/WAL control, point gets, and bounded forward iterators.
//!
//! The `DB` handle lives behind a `tokio::sync::RwLock`: data operations
//! take the read lock (RocksDB is internally thread-safe for reads and
//! batch writes), while column-family creation and removal take the write
//! lock because they mutate the handle itself.

use std::path::{Path, PathBuf};

use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Options, ReadOptions, WriteBatch, WriteOptions, DB,
};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};

/// One RocksDB instance, owned by a single shard.
pub struct KvStore {
    db: RwLock<DB>,
    cf_names: std::sync::Mutex<Vec<String>>,
    path: PathBuf,
}

impl KvStore {
    /// Open (or create) the store at `path`, discovering existing column
    /// families.
    pub fn open(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        // A fresh directory has no CF manifest yet; fall back to "default".
        let cf_names = DB::list_cf(&opts, path).unwrap_or_else(|_| vec!["default".to_string()]);
        let descriptors = cf_names
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;
        Ok(Self {
            db: RwLock::new(db),
            cf_names: std::sync::Mutex::new(cf_names),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shared access for reads, scans, and batch commits.
    pub async fn read(&self) -> RwLockReadGuard<'_, DB> {
        self.db.read().await
    }

    /// Exclusive access; required by column-family mutation.
    pub async fn write(&self) -> RwLockWriteGuard<'_, DB> {
        self.db.write().await
    }

    /// Create a column family if it does not exist yet.
    pub async fn create_cf(&self, name: &str) -> Result<()> {
        let mut db = self.db.write().await;
        if db.cf_handle(name).is_none() {
            db.create_cf(name, &Options::default())?;
            let mut names = self.cf_names.lock().expect("cf name registry");
            names.push(name.to_string());
        }
        Ok(())
    }

    /// Drop a column family. Dropping an absent one is a no-op.
    pub async fn drop_cf(&self, name: &str) -> Result<()> {
        let mut db = self.db.write().await;
        if db.cf_handle(name).is_some() {
            db.drop_cf(name)?;
            let mut names = self.cf_names.lock().expect("cf name registry");
            names.retain(|n| n != name);
        }
        Ok(())
    }

    /// Names of all column families currently open.
    pub fn cf_names(&self) -> Vec<String> {
        self.cf_names.lock().expect("cf name registry").clone()
    }

    /// Commit a write batch with the given durability knobs.
    pub async fn commit(&self, batch: WriteBatch, sync: bool, disable_wal: bool) -> Result<()> {
        let db = self.db.read().await;
        db.write_opt(batch, &write_options(sync, disable_wal))?;
        Ok(())
    }
}

/// Resolve a column-family handle, mapping absence to a backend error.
pub fn cf_handle<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| Error::Backend(format!("missing column family: {name}")))
}

/// Write options for one batch.
pub fn write_options(sync: bool, disable_wal: bool) -> WriteOptions {
    let mut wo = WriteOptions::default();
    wo.set_sync(sync);
    wo.disable_wal(disable_wal);
    wo
}

/// Read options bracketing a cursor inside `[lower, upper)`.
pub fn bounded_read_options(lower: &[u8], upper: Option<&[u8]>) -> ReadOptions {
    let mut ro = ReadOptions::default();
    ro.set_iterate_lower_bound(lower.to_vec());
    if let Some(upper) = upper {
        ro.set_iterate_upper_bound(upper.to_vec());
    }
    ro
}

/// The smallest byte string strictly greater than every string starting
/// with `prefix`, or `None` when the prefix is all `0xff`.
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.last_mut() {
        if *last == 0xff {
            out.pop();
        } else {
            *last += 1;
            return Some(out);
        }
    }
    None
}
