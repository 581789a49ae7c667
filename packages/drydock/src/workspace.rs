//! Per-request execution workspaces.
//!
//! Every request gets a uniquely-named directory under the executions root;
//! the name embeds the creation time in unix milliseconds plus a short random
//! suffix, so concurrent allocations never collide and the pruner can order
//! workspaces by age without stat calls.

use std::path::{Path, PathBuf};

use color_eyre::{Result, eyre::Context};
use derive_more::{Debug, Display};
use jiff::Timestamp;
use rand::{Rng, distributions::Alphanumeric};
use tracing::{debug, info, instrument, warn};

use crate::fs;

/// A per-request workspace directory.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
#[display("{name}")]
pub struct Workspace {
    /// Directory name, `exec-<unix-millis>-<rand5>`.
    pub name: String,

    /// Full path of the workspace directory.
    pub path: PathBuf,
}

/// Allocates and prunes workspaces under the executions root.
#[derive(Clone, Eq, PartialEq, Debug, Display)]
#[debug("ExecutionRoot(root = {}, keep = {})", self.root.display(), self.keep)]
#[display("{}", root.display())]
pub struct ExecutionRoot {
    root: PathBuf,
    keep: usize,
}

impl ExecutionRoot {
    /// Create a handle over the provided root with the given retention count.
    ///
    /// `keep == 0` means no retention: the orchestrator deletes each
    /// workspace as soon as its response is sent, and [`prune`](Self::prune)
    /// is never invoked.
    pub fn new(root: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            root: root.into(),
            keep,
        }
    }

    /// The executions root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether old workspaces are retained (and pruned by count) rather than
    /// deleted eagerly.
    pub fn retains(&self) -> bool {
        self.keep > 0
    }

    /// Create a fresh, uniquely-named workspace directory.
    #[instrument(name = "ExecutionRoot::allocate")]
    pub async fn allocate(&self) -> Result<Workspace> {
        let millis = Timestamp::now().as_millisecond();
        let suffix: String = {
            let rng = rand::thread_rng();
            rng.sample_iter(&Alphanumeric)
                .take(5)
                .map(char::from)
                .collect::<String>()
                .to_lowercase()
        };

        let name = format!("exec-{millis}-{suffix}");
        let path = self.root.join(&name);
        fs::create_dir_all(&path)
            .await
            .context("create workspace directory")?;

        debug!(%name, "allocated workspace");
        Ok(Workspace { name, path })
    }

    /// Delete the oldest workspaces beyond the retention count.
    ///
    /// Ordering comes from the millisecond component embedded in each name;
    /// directories that don't parse as workspace names are left alone.
    #[instrument(name = "ExecutionRoot::prune")]
    pub async fn prune(&self) -> Result<usize> {
        if self.keep == 0 {
            return Ok(0);
        }

        let mut read_dir = match tokio::fs::read_dir(&self.root).await {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err).context(format!("read executions root: {:?}", self.root)),
        };

        let mut workspaces = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .context("read executions root entry")?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(millis) = creation_millis(&name) else {
                continue;
            };
            workspaces.push((millis, entry.path()));
        }

        if workspaces.len() <= self.keep {
            return Ok(0);
        }

        workspaces.sort_by_key(|(millis, _)| *millis);
        let excess = workspaces.len() - self.keep;

        let mut removed = 0;
        for (_, path) in workspaces.into_iter().take(excess) {
            match fs::remove_dir_all(&path).await {
                Ok(()) => removed += 1,
                Err(err) => warn!(error = ?err, ?path, "unable to prune workspace"),
            }
        }

        info!(removed, keep = self.keep, "pruned old workspaces");
        Ok(removed)
    }

    /// Delete a single workspace.
    #[instrument(name = "ExecutionRoot::remove")]
    pub async fn remove(&self, workspace: &Workspace) -> Result<()> {
        fs::remove_dir_all(&workspace.path)
            .await
            .with_context(|| format!("remove workspace {workspace}"))
    }
}

/// Parse the unix-millisecond component out of a workspace directory name.
fn creation_millis(name: &str) -> Option<i64> {
    let rest = name.strip_prefix("exec-")?;
    let (millis, _suffix) = rest.split_once('-')?;
    millis.parse().ok()
}
