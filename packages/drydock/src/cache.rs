//! On-disk dependency cache, keyed by client-supplied identifiers.
//!
//! ## File structure
//!
//! Each cache entry is one subdirectory of the cache root, named by the
//! client's `cacheKey` and holding a materialised `node_modules` tree plus
//! whatever metadata files the package manager wrote next to it. The entry
//! is the unit of reuse and the unit of eviction; the cache never reasons
//! about individual packages inside an entry.
//!
//! ## Eviction
//!
//! The cache carries a byte budget. [`DependencyCache::sweep`] measures every
//! entry, and when the total exceeds the budget it deletes entries whole,
//! least-recently-modified first, until it has freed the overage plus 20% of
//! the budget. The hysteresis keeps the next install from immediately
//! re-triggering eviction.
//!
//! ## Coherency
//!
//! There is no locking: two requests installing under the same key race, and
//! the last writer wins. Readers tolerate partially-populated entries through
//! the resolver's reuse-completeness check, which is advisory rather than
//! transactional.

use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use color_eyre::{Result, eyre::Context};
use derive_more::{Debug, Display};
use tracing::{debug, info, instrument, warn};

use crate::fs;

/// An observed cache entry: one keyed subdirectory of the cache root.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    /// The client-supplied key the entry is stored under.
    pub key: String,

    /// Absolute path of the entry root.
    pub path: PathBuf,

    /// Total on-disk size of the entry in bytes.
    pub size: u64,

    /// Last modification time of the entry root.
    pub mtime: SystemTime,
}

/// The keyed dependency cache with its byte budget.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
#[debug("DependencyCache(root = {}, limit = {})", self.root.display(), self.limit)]
#[display("{}", root.display())]
pub struct DependencyCache {
    root: PathBuf,
    limit: u64,
}

impl DependencyCache {
    /// Create a handle over the provided root with the given byte budget.
    ///
    /// The root directory is created lazily by the first installation.
    pub fn new(root: impl Into<PathBuf>, limit: u64) -> Self {
        Self {
            root: root.into(),
            limit,
        }
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The directory a given key's entry lives at (whether or not it exists).
    pub fn entry_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Enumerate and measure every entry currently in the cache.
    ///
    /// Entries whose metadata cannot be read are logged and skipped, since
    /// concurrent requests may be creating or deleting entries mid-scan.
    #[instrument(name = "DependencyCache::list")]
    pub async fn list(&self) -> Result<Vec<CacheEntry>> {
        let mut read_dir = match tokio::fs::read_dir(&self.root).await {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err).context(format!("read cache root: {:?}", self.root)),
        };

        let mut entries = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .context("read cache root entry")?
        {
            let path = entry.path();
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!(error = ?err, ?path, "skipping unreadable cache entry");
                    continue;
                }
            };
            if !metadata.is_dir() {
                continue;
            }

            let key = entry.file_name().to_string_lossy().into_owned();
            let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            let size = fs::dir_size(&path).await;
            entries.push(CacheEntry {
                key,
                path,
                size,
                mtime,
            });
        }

        Ok(entries)
    }

    /// Observe a single entry by key, or `None` if it doesn't exist.
    #[instrument(name = "DependencyCache::entry_info")]
    pub async fn entry_info(&self, key: &str) -> Option<CacheEntry> {
        let path = self.entry_path(key);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_dir() => metadata,
            _ => return None,
        };

        Some(CacheEntry {
            key: key.to_string(),
            path: path.clone(),
            size: fs::dir_size(&path).await,
            mtime: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        })
    }

    /// Total on-disk size of all entries, in bytes.
    #[instrument(name = "DependencyCache::total_size")]
    pub async fn total_size(&self) -> Result<u64> {
        Ok(self.list().await?.iter().map(|entry| entry.size).sum())
    }

    /// Evict least-recently-modified entries until the cache is under budget.
    ///
    /// When the total size exceeds the budget, entries are deleted whole in
    /// mtime order until freed bytes reach the overage plus 20% of the
    /// budget. Returns the number of bytes freed.
    #[instrument(name = "DependencyCache::sweep")]
    pub async fn sweep(&self) -> Result<u64> {
        let mut entries = self.list().await.context("enumerate cache entries")?;
        let total: u64 = entries.iter().map(|entry| entry.size).sum();
        if total <= self.limit {
            debug!(total, limit = self.limit, "cache within budget");
            return Ok(0);
        }

        let target = (total - self.limit) + self.limit / 5;
        entries.sort_by_key(|entry| entry.mtime);

        let mut freed = 0u64;
        for entry in entries {
            if freed >= target {
                break;
            }
            match fs::remove_dir_all(&entry.path).await {
                Ok(()) => {
                    freed += entry.size;
                    info!(key = %entry.key, bytes = entry.size, "evicted cache entry");
                }
                Err(err) => {
                    warn!(error = ?err, key = %entry.key, "unable to evict cache entry");
                }
            }
        }

        info!(total, freed, limit = self.limit, "cache sweep complete");
        Ok(freed)
    }
}
