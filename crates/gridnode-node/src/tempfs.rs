//! Per-session temporary directories.
//!
//! Upload staging and managed-download directories live for exactly as long
//! as their session. They are never time-boxed on their own: a download may
//! still be streaming out of a directory long after the last write to it.
//! Deletion happens when the session is evicted; the periodic sweep only
//! forgets entries whose directory has already disappeared from disk.

use std::hash::Hash;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;
use tracing::{debug, error};

use crate::cache::ExpiringCache;

/// A directory that is removed when deleted or dropped.
pub struct TemporaryFilesystem {
    dir: TempDir,
}

impl TemporaryFilesystem {
    /// Create a fresh directory under `base` named `{prefix}<random>`.
    pub fn create(base: &Path, prefix: &str) -> io::Result<Self> {
        std::fs::create_dir_all(base)?;
        let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(base)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Remove the directory and everything in it. Idempotent.
    pub fn delete(&self) -> io::Result<()> {
        match std::fs::remove_dir_all(self.dir.path()) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn exists(&self) -> bool {
        self.dir.path().exists()
    }
}

/// Keyed set of temporary directories with explicit lifetimes.
pub struct TempFsRegistry<K> {
    base: PathBuf,
    prefix: String,
    entries: ExpiringCache<K, Arc<TemporaryFilesystem>>,
}

impl<K> TempFsRegistry<K>
where
    K: Eq + Hash + Clone + std::fmt::Display,
{
    pub fn new(base: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            prefix: prefix.into(),
            entries: ExpiringCache::unbounded(),
        }
    }

    /// Create a new directory for `key`, replacing (and deleting) any
    /// previous one.
    pub fn create(&mut self, key: K) -> io::Result<PathBuf> {
        let fs = Arc::new(TemporaryFilesystem::create(&self.base, &self.prefix)?);
        let path = fs.path().to_path_buf();
        if let Some(previous) = self.entries.insert(key.clone(), fs) {
            if let Err(e) = previous.delete() {
                error!(%key, error = %e, "failed to delete replaced temporary directory");
            }
        }
        debug!(%key, path = ?path, "temporary directory created");
        Ok(path)
    }

    /// The directory for `key`, creating it on first use.
    pub fn get_or_create(&mut self, key: K) -> io::Result<PathBuf> {
        match self.get(&key) {
            Some(path) => Ok(path),
            None => self.create(key),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<PathBuf> {
        self.entries.get(key).map(|fs| fs.path().to_path_buf())
    }

    /// Forget `key` and hand its directory to the caller for deletion.
    pub fn take(&mut self, key: &K) -> Option<Arc<TemporaryFilesystem>> {
        self.entries.invalidate(key)
    }

    /// Forget entries whose directory no longer exists. Safe to call any
    /// number of times; returns how many entries were dropped.
    pub fn cleanup(&mut self) -> usize {
        let gone = self.entries.drain_where(|_, fs| !fs.exists());
        for (key, _) in &gone {
            debug!(%key, "dropped entry for vanished temporary directory");
        }
        gone.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
