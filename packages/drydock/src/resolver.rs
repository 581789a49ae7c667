//! Materialises dependency trees into workspaces, backed by the keyed cache.
//!
//! ## Reuse
//!
//! A cache entry is reused when it exists and passes the completeness probe:
//! every requested package must be present in the entry's `node_modules`
//! with its own metadata file. The probe is advisory: a concurrent install
//! under the same key can still swap the tree out from under us, so every
//! reuse failure falls back to a fresh install rather than surfacing.
//!
//! ## Linking
//!
//! Reused trees are made visible in the workspace by symlink when possible
//! and by recursive copy otherwise (symlink creation is a privileged
//! operation on some platforms).

use std::{
    collections::BTreeMap,
    path::Path,
    process::Stdio,
};

use color_eyre::{Report, Result, eyre::Context};
use derive_more::Display;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::{cache::DependencyCache, fs};

/// The dependency tree directory the package manager materialises.
pub const MODULES_DIR: &str = "node_modules";

/// The manifest file the package manager reads.
const MANIFEST_FILE: &str = "package.json";

/// How an install request was satisfied.
#[derive(Clone, Debug)]
pub struct InstallReport {
    /// Whether an existing cache entry covered the request.
    pub used_cache: bool,

    /// The actually-installed version of each requested package, discovered
    /// by reading each package's own metadata after install.
    pub installed: BTreeMap<String, String>,
}

/// Install failure, split by who is at fault.
///
/// A package-manager failure is the client's problem (bad package name,
/// unresolvable version) and travels in the response body; everything else
/// is a server fault.
#[derive(Debug, Display)]
pub enum InstallError {
    /// The package manager exited non-zero; carries its diagnostic output.
    #[display("{output}")]
    PackageManager { output: String },

    /// Unexpected filesystem or process failure.
    #[display("{_0}")]
    Internal(Report),
}

impl From<Report> for InstallError {
    fn from(report: Report) -> Self {
        InstallError::Internal(report)
    }
}

/// Materialises dependency sets, consulting and repopulating the cache.
#[derive(Clone, Debug)]
pub struct Resolver {
    cache: DependencyCache,
}

impl Resolver {
    pub fn new(cache: DependencyCache) -> Self {
        Self { cache }
    }

    /// Make the requested dependency set available inside the workspace.
    ///
    /// With an empty set this returns immediately and the workspace gets no
    /// `node_modules` at all. Otherwise the cache entry named by `cache_key`
    /// is reused when complete (unless `force_update`), or freshly installed
    /// and copied back into the cache.
    #[instrument(name = "Resolver::install", skip(self, deps), fields(packages = deps.len()))]
    pub async fn install(
        &self,
        deps: &BTreeMap<String, String>,
        workspace: &Path,
        cache_key: &str,
        force_update: bool,
    ) -> Result<InstallReport, InstallError> {
        if deps.is_empty() {
            debug!("no dependencies to install");
            return Ok(InstallReport {
                used_cache: false,
                installed: BTreeMap::new(),
            });
        }

        let entry_modules = self.cache.entry_path(cache_key).join(MODULES_DIR);
        let workspace_modules = workspace.join(MODULES_DIR);

        if !force_update
            && fs::is_dir(&entry_modules).await
            && entry_is_complete(&entry_modules, deps).await
        {
            match link_or_copy(&entry_modules, &workspace_modules).await {
                Ok(()) => {
                    let installed = read_installed_versions(&workspace_modules, deps).await;
                    info!(key = %cache_key, "reused cache entry");
                    return Ok(InstallReport {
                        used_cache: true,
                        installed,
                    });
                }
                Err(err) => {
                    warn!(error = ?err, key = %cache_key, "cache reuse failed; reinstalling");
                }
            }
        }

        self.install_fresh(deps, workspace, cache_key).await?;
        let installed = read_installed_versions(&workspace_modules, deps).await;
        Ok(InstallReport {
            used_cache: false,
            installed,
        })
    }

    /// Run the package manager in the workspace, then repopulate the cache
    /// entry from the result.
    #[instrument(name = "Resolver::install_fresh", skip(self, deps))]
    async fn install_fresh(
        &self,
        deps: &BTreeMap<String, String>,
        workspace: &Path,
        cache_key: &str,
    ) -> Result<(), InstallError> {
        let manifest = json!({
            "name": "drydock-workspace",
            "private": true,
            "dependencies": deps,
        });
        let body = serde_json::to_string_pretty(&manifest).context("serialise manifest")?;
        fs::write(&workspace.join(MANIFEST_FILE), body)
            .await
            .context("write manifest")?;

        info!(packages = deps.len(), "installing dependencies");
        let output = tokio::process::Command::new("npm")
            .arg("install")
            .current_dir(workspace)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .context("spawn npm")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let diagnostics = [stderr.trim(), stdout.trim()]
                .into_iter()
                .find(|text| !text.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("npm exited with status: {}", output.status));
            return Err(InstallError::PackageManager {
                output: diagnostics,
            });
        }

        // Repopulation is best-effort; the workspace has a working tree
        // either way.
        if let Err(err) = self.repopulate(workspace, cache_key).await {
            warn!(error = ?err, key = %cache_key, "unable to repopulate cache entry");
        }

        Ok(())
    }

    /// Replace the cache entry with the workspace's freshly-installed tree.
    #[instrument(name = "Resolver::repopulate", skip(self))]
    async fn repopulate(&self, workspace: &Path, cache_key: &str) -> Result<()> {
        self.cache.sweep().await.context("sweep cache")?;

        let entry = self.cache.entry_path(cache_key);
        fs::remove_dir_all(&entry)
            .await
            .context("remove stale cache entry")?;
        let bytes = fs::copy_dir(&workspace.join(MODULES_DIR), &entry.join(MODULES_DIR))
            .await
            .context("copy dependency tree into cache")?;

        info!(key = %cache_key, bytes, "repopulated cache entry");
        Ok(())
    }
}

/// Probe whether a cache entry's tree covers every requested package.
///
/// Scoped names check both the scope directory and the package directory.
async fn entry_is_complete(modules: &Path, deps: &BTreeMap<String, String>) -> bool {
    for name in deps.keys() {
        if let Some((scope, pkg)) = name.split_once('/') {
            if !fs::is_dir(&modules.join(scope)).await {
                return false;
            }
            if !fs::is_file(&modules.join(scope).join(pkg).join(MANIFEST_FILE)).await {
                return false;
            }
        } else if !fs::is_file(&modules.join(name).join(MANIFEST_FILE)).await {
            return false;
        }
    }
    true
}

/// Make the cached tree visible inside the workspace: symlink preferred,
/// recursive copy as the fallback.
async fn link_or_copy(entry_modules: &Path, workspace_modules: &Path) -> Result<()> {
    match fs::symlink_dir(entry_modules, workspace_modules).await {
        Ok(()) => Ok(()),
        Err(err) => {
            warn!(error = ?err, "symlink unavailable; copying dependency tree");
            fs::copy_dir(entry_modules, workspace_modules)
                .await
                .context("copy dependency tree into workspace")
                .map(|_| ())
        }
    }
}

/// Discover the actually-installed version of each requested package by
/// reading its metadata file inside the workspace tree.
async fn read_installed_versions(
    modules: &Path,
    deps: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut versions = BTreeMap::new();
    for name in deps.keys() {
        let manifest = modules.join(name).join(MANIFEST_FILE);
        let version = match fs::read_to_string(&manifest).await {
            Ok(Some(body)) => serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|meta| meta.get("version")?.as_str().map(str::to_string)),
            Ok(None) => None,
            Err(err) => {
                warn!(error = ?err, package = %name, "unable to read package metadata");
                None
            }
        };
        if let Some(version) = version {
            versions.insert(name.clone(), version);
        } else {
            warn!(package = %name, "installed version not discoverable");
        }
    }
    versions
}
