//! Shared filesystem plumbing for the cache, resolver, and workspaces.
//!
//! The callers here deal in whole directory trees, not single files: a
//! cache entry is measured as a tree, repopulated as a tree, and made
//! visible in a workspace as a tree. Symbolic links get special treatment
//! throughout, because a workspace's `node_modules` may be a link into a
//! cache entry and nothing in this module may follow it into double-counting
//! or cycles.

use std::path::Path;

use color_eyre::{Result, eyre::Context};
use futures::{StreamExt, TryStreamExt};
use tap::TapFallible;
use tokio::task::spawn_blocking;
use tracing::{instrument, trace, warn};

/// Create the directory, parents included, if anything is missing.
#[instrument]
pub async fn create_dir_all(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create dir: {dir:?}"))
        .tap_ok(|_| trace!(?dir, "create directory"))
}

/// Delete a directory tree; a tree that is already gone counts as success.
///
/// Cleanup paths race with the pruner and with concurrent requests on the
/// same cache key, so "somebody else already deleted it" is routine here.
pub async fn remove_dir_all(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            trace!(?path, "removed directory");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            trace!(?path, "removed directory (already removed)");
            Ok(())
        }
        Err(err) => Err(err).context(format!("remove directory: {path:?}")),
    }
}

/// Write the provided file content to disk, creating parent directories as
/// needed.
#[instrument(skip(content))]
pub async fn write(path: &Path, content: impl AsRef<[u8]>) -> Result<()> {
    let content = content.as_ref();
    if let Some(parent) = path.parent() {
        create_dir_all(parent)
            .await
            .context("create parent directory")?;
    }
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("write file: {path:?}"))
        .tap_ok(|_| trace!(?path, bytes = content.len(), "write file"))
}

/// Read a file as UTF8, with `None` standing in for "not there".
#[instrument]
pub async fn read_to_string(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(buf) => {
            trace!(?path, bytes = buf.len(), "read file as string");
            Ok(Some(buf))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).context(format!("read file: {path:?}")),
    }
}

/// Whether the path exists; errors read as `false`.
///
/// Only suitable for advisory checks (the reuse probe, tests). Anything
/// that acts on the path afterwards should just attempt the operation.
#[instrument]
pub async fn exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Whether the path is a directory; missing or unreadable reads as `false`.
#[instrument]
pub async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_dir())
}

/// Whether the path is a regular file; missing or unreadable reads as
/// `false`.
#[instrument]
pub async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .is_ok_and(|meta| meta.is_file())
}

/// Copy a dependency tree from `src` into `dst`.
///
/// Tailored to the trees this service moves around (npm installations going
/// between a workspace and its cache entry): directories are recreated,
/// empty ones included; regular files are copied; symbolic links are
/// skipped, since npm links package executables into `.bin` and resolving
/// those would drag cache-entry internals into the copy. The directory
/// structure is laid down first, then the files are copied with bounded
/// concurrency.
///
/// Returns the total number of bytes copied.
#[instrument]
pub async fn copy_dir(src: &Path, dst: &Path) -> Result<u64> {
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];
    let mut files = Vec::new();

    while let Some((from, to)) = pending.pop() {
        create_dir_all(&to).await?;

        let mut entries = tokio::fs::read_dir(&from)
            .await
            .with_context(|| format!("read directory: {from:?}"))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("read entry in {from:?}"))?
        {
            let kind = entry
                .file_type()
                .await
                .with_context(|| format!("stat {:?}", entry.path()))?;
            let target = to.join(entry.file_name());
            if kind.is_dir() {
                pending.push((entry.path(), target));
            } else if kind.is_file() {
                files.push((entry.path(), target));
            }
        }
    }

    futures::stream::iter(files)
        .map(|(from, to)| async move {
            tokio::fs::copy(&from, &to)
                .await
                .with_context(|| format!("copy {from:?} to {to:?}"))
        })
        .buffer_unordered(COPY_CONCURRENCY)
        .try_fold(0u64, |total, bytes| async move { Ok(total + bytes) })
        .await
        .tap_ok(|bytes| trace!(?src, ?dst, bytes, "copied tree"))
}

/// Concurrent file copies during a tree copy. Dependency trees are mostly
/// many small files, so modest parallelism covers the per-file latency.
const COPY_CONCURRENCY: usize = 8;

/// Recursively sum the on-disk size of a directory tree.
///
/// Regular files contribute their length; symbolic links contribute 0 (both
/// to avoid cycles and to avoid double-counting cache reuse via symlinks).
/// Unreadable entries are logged and skipped; the walk never fails, even for
/// entries that disappear mid-walk.
#[instrument]
pub async fn dir_size(root: &Path) -> u64 {
    let root = root.to_path_buf();
    spawn_blocking(move || {
        let mut total = 0u64;
        for entry in jwalk::WalkDir::new(&root).skip_hidden(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(error = ?err, dir = ?root, "skipping unreadable entry");
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            match std::fs::symlink_metadata(entry.path()) {
                Ok(meta) => total += meta.len(),
                Err(err) => {
                    warn!(error = ?err, path = ?entry.path(), "skipping unreadable file");
                }
            }
        }
        total
    })
    .await
    .expect("join task")
}

/// Create a symbolic link at `link` pointing at the directory `original`.
#[instrument]
pub async fn symlink_dir(original: &Path, link: &Path) -> Result<()> {
    #[cfg(unix)]
    let result = tokio::fs::symlink(original, link).await;
    #[cfg(windows)]
    let result = tokio::fs::symlink_dir(original, link).await;

    result
        .with_context(|| format!("symlink {link:?} -> {original:?}"))
        .tap_ok(|_| trace!(?original, ?link, "symlink directory"))
}
