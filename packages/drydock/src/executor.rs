//! The request pipeline: validate, resolve dependencies, execute, clean up.
//!
//! Client-visible execution failures (install errors, thrown errors,
//! timeouts, bad output) are *responses*, not errors; only unexpected
//! filesystem or orchestration faults propagate as [`ExecuteError::Internal`].

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use color_eyre::{Report, Result, eyre::Context};
use derive_more::Display;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{error, info, instrument, warn};

use crate::{
    cache::DependencyCache,
    config::Config,
    deps,
    resolver::{InstallError, InstallReport, Resolver},
    runner::{self, ConsoleEntry, WRAPPER_FILE},
    size::format_size,
    workspace::{ExecutionRoot, Workspace},
};

/// A code execution request, as submitted by the client.
///
/// `code` and `cacheKey` are optional at the wire level so their absence is
/// reported as a bad-request response body rather than a deserialization
/// rejection.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    #[serde(default)]
    pub code: Option<String>,

    #[serde(default = "default_items")]
    pub items: Value,

    #[serde(default)]
    pub cache_key: Option<String>,

    #[serde(default)]
    pub options: ExecuteOptions,
}

fn default_items() -> Value {
    Value::Array(Vec::new())
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteOptions {
    /// Wall-clock budget for the user execution, in milliseconds.
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Skip cache reuse and install fresh.
    #[serde(default)]
    pub force_update: bool,

    /// Merge debug telemetry into the response.
    #[serde(default)]
    pub debug: bool,
}

/// The response body for an execution request.
#[derive(Clone, Debug, Serialize)]
pub struct ExecuteResponse {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    pub console: Vec<ConsoleEntry>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugInfo>,
}

/// Telemetry merged into the response when `options.debug` is set.
#[derive(Clone, Debug, Serialize)]
pub struct DebugInfo {
    pub server: ServerDebug,
    pub cache: CacheDebug,
    pub execution: ExecutionDebug,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerDebug {
    pub node_version: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheDebug {
    pub used_cache: bool,
    pub cache_key: String,
    pub current_cache_size: u64,
    pub current_cache_size_formatted: String,
    pub total_cache_size: u64,
    pub total_cache_size_formatted: String,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionDebug {
    pub start_time: String,
    pub installed_dependencies: BTreeMap<String, String>,
    pub dependency_install_time_ms: u64,
    pub total_response_time_ms: u64,
    pub execution_time_ms: u64,
}

/// Failures the HTTP layer must map to non-200 statuses.
#[derive(Debug, Display)]
pub enum ExecuteError {
    /// The request is missing or malforms a required field.
    #[display("{_0}")]
    BadRequest(String),

    /// Unexpected server fault.
    #[display("{_0}")]
    Internal(Report),
}

impl From<Report> for ExecuteError {
    fn from(report: Report) -> Self {
        ExecuteError::Internal(report)
    }
}

/// Glues the pipeline together: one instance serves all requests.
#[derive(Debug)]
pub struct Executor {
    config: Arc<Config>,
    cache: DependencyCache,
    resolver: Resolver,
    executions: ExecutionRoot,
}

impl Executor {
    pub fn new(config: Arc<Config>) -> Self {
        let cache = DependencyCache::new(&config.cache_dir, config.cache_limit_bytes);
        let resolver = Resolver::new(cache.clone());
        let executions = ExecutionRoot::new(&config.execution_dir, config.prune_max_count);
        Self {
            config,
            cache,
            resolver,
            executions,
        }
    }

    /// The cache handle, for the startup sweep.
    pub fn cache(&self) -> &DependencyCache {
        &self.cache
    }

    /// Service one request end to end.
    ///
    /// The workspace is reclaimed (or left for the pruner) on every path out
    /// of this function, including internal errors.
    #[instrument(name = "Executor::execute", skip(self, request))]
    pub async fn execute(&self, request: ExecuteRequest) -> Result<ExecuteResponse, ExecuteError> {
        let started = Instant::now();
        let start_time = Timestamp::now();

        let (code, cache_key) = validate(&request)?;
        let dependencies = deps::extract_dependencies(&code);
        info!(
            cache_key = %cache_key,
            packages = dependencies.len(),
            "accepted execution request"
        );

        let workspace = self
            .executions
            .allocate()
            .await
            .context("allocate workspace")?;

        let result = self
            .execute_in(&workspace, &code, &cache_key, &dependencies, &request, started, start_time)
            .await;

        // Cleanup errors are logged and swallowed; the response (or error)
        // already left the pipeline.
        if self.executions.retains() {
            if let Err(err) = self.executions.prune().await {
                warn!(error = ?err, "workspace pruning failed");
            }
        } else if let Err(err) = self.executions.remove(&workspace).await {
            warn!(error = ?err, workspace = %workspace, "workspace cleanup failed");
        }

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_in(
        &self,
        workspace: &Workspace,
        code: &str,
        cache_key: &str,
        dependencies: &BTreeMap<String, String>,
        request: &ExecuteRequest,
        started: Instant,
        start_time: Timestamp,
    ) -> Result<ExecuteResponse, ExecuteError> {
        let install_started = Instant::now();
        let install = self
            .resolver
            .install(
                dependencies,
                &workspace.path,
                cache_key,
                request.options.force_update,
            )
            .await;
        let install_elapsed = install_started.elapsed();

        let report = match install {
            Ok(report) => report,
            Err(InstallError::PackageManager { output }) => {
                warn!(cache_key = %cache_key, "dependency install failed");
                let mut response = failure_response(output, None, Vec::new());
                if request.options.debug {
                    response.debug = Some(
                        self.debug_info(
                            cache_key,
                            &InstallReport {
                                used_cache: false,
                                installed: BTreeMap::new(),
                            },
                            start_time,
                            install_elapsed,
                            Duration::ZERO,
                            started,
                        )
                        .await,
                    );
                }
                return Ok(response);
            }
            Err(InstallError::Internal(report)) => {
                error!(error = ?report, "dependency install fault");
                return Err(ExecuteError::Internal(report));
            }
        };

        let timeout = Duration::from_millis(
            request
                .options
                .timeout
                .unwrap_or(self.config.default_timeout_ms),
        );
        let outcome = runner::run(&workspace.path, code, &request.items, timeout)
            .await
            .context("run user program")?;

        let framed = outcome.result;
        let mut response = if framed.success {
            ExecuteResponse {
                success: true,
                data: framed.data,
                error: None,
                stack: None,
                console: framed.console,
                debug: None,
            }
        } else {
            failure_response(
                framed.error.unwrap_or_else(|| "Unknown execution error".to_string()),
                framed
                    .stack
                    .map(|stack| scrub_stack(&stack, &workspace.path)),
                framed.console,
            )
        };

        if request.options.debug {
            response.debug = Some(
                self.debug_info(
                    cache_key,
                    &report,
                    start_time,
                    install_elapsed,
                    outcome.elapsed,
                    started,
                )
                .await,
            );
        }

        Ok(response)
    }

    async fn debug_info(
        &self,
        cache_key: &str,
        report: &InstallReport,
        start_time: Timestamp,
        install_elapsed: Duration,
        execution_elapsed: Duration,
        started: Instant,
    ) -> DebugInfo {
        let current = self
            .cache
            .entry_info(cache_key)
            .await
            .map(|entry| entry.size)
            .unwrap_or(0);
        let total = match self.cache.total_size().await {
            Ok(total) => total,
            Err(err) => {
                warn!(error = ?err, "unable to measure cache");
                0
            }
        };

        DebugInfo {
            server: ServerDebug {
                node_version: node_version().await,
            },
            cache: CacheDebug {
                used_cache: report.used_cache,
                cache_key: cache_key.to_string(),
                current_cache_size: current,
                current_cache_size_formatted: format_size(current),
                total_cache_size: total,
                total_cache_size_formatted: format_size(total),
            },
            execution: ExecutionDebug {
                start_time: start_time.to_string(),
                installed_dependencies: report.installed.clone(),
                dependency_install_time_ms: install_elapsed.as_millis() as u64,
                total_response_time_ms: started.elapsed().as_millis() as u64,
                execution_time_ms: execution_elapsed.as_millis() as u64,
            },
        }
    }
}

/// Check the request's required fields before any resource is allocated.
fn validate(request: &ExecuteRequest) -> Result<(String, String), ExecuteError> {
    let code = request
        .code
        .as_deref()
        .filter(|code| !code.trim().is_empty())
        .ok_or_else(|| ExecuteError::BadRequest("Missing required field: code".to_string()))?;

    let cache_key = request
        .cache_key
        .as_deref()
        .filter(|key| !key.trim().is_empty())
        .ok_or_else(|| ExecuteError::BadRequest("Missing required field: cacheKey".to_string()))?;

    // The key names a directory under the cache root; reject anything that
    // could escape it or collide with traversal entries.
    if cache_key.contains(['/', '\\']) || cache_key == "." || cache_key == ".." {
        return Err(ExecuteError::BadRequest(
            "cacheKey must be a plain directory name".to_string(),
        ));
    }

    Ok((code.to_string(), cache_key.to_string()))
}

fn failure_response(
    error: String,
    stack: Option<String>,
    console: Vec<ConsoleEntry>,
) -> ExecuteResponse {
    ExecuteResponse {
        success: false,
        data: None,
        error: Some(error),
        stack,
        console,
        debug: None,
    }
}

/// The interpreter version reported in debug telemetry.
async fn node_version() -> String {
    let output = tokio::process::Command::new("node")
        .arg("--version")
        .output()
        .await;
    match output {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        _ => "unknown".to_string(),
    }
}

/// Scrub server paths out of an error stack before it leaves the service.
///
/// Line-wise rules:
/// - non-frame lines (the message itself) pass through untouched;
/// - frames referencing the wrapper collapse to a single `at [code]` line;
/// - frames referencing the dependency tree lose the server prefix up to
///   `node_modules/`;
/// - frames referencing the workspace lose the workspace prefix;
/// - every other frame is dropped.
fn scrub_stack(stack: &str, workspace: &std::path::Path) -> String {
    let workspace_prefix = format!("{}/", workspace.display());
    let mut scrubbed = Vec::new();
    let mut wrapper_collapsed = false;

    for line in stack.lines() {
        if !line.trim_start().starts_with("at ") {
            scrubbed.push(line.to_string());
            continue;
        }

        if line.contains(WRAPPER_FILE) {
            if !wrapper_collapsed {
                scrubbed.push("    at [code]".to_string());
                wrapper_collapsed = true;
            }
            continue;
        }

        if let Some(position) = line.find("/node_modules/") {
            let path_start = line[..position]
                .rfind(|c: char| c == '(' || c.is_whitespace())
                .map(|index| index + 1)
                .unwrap_or(0);
            let mut rewritten = String::new();
            rewritten.push_str(&line[..path_start]);
            rewritten.push_str("node_modules/");
            rewritten.push_str(&line[position + "/node_modules/".len()..]);
            scrubbed.push(rewritten);
            continue;
        }

        if line.contains(&workspace_prefix) {
            scrubbed.push(line.replace(&workspace_prefix, ""));
            continue;
        }
    }

    scrubbed.join("\n")
}
