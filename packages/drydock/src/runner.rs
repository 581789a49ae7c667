//! Runs user programs in a `node` child process and frames the result.
//!
//! The capture layer lives inside the child: a generated wrapper
//! program shims the console writers, invokes the user's exported function,
//! and emits exactly one framed JSON object (success on stdout, failure on
//! stderr) using writers saved before the shims were installed, so the frame
//! itself is never captured. The host side only classifies streams and
//! enforces the deadline.

use std::{path::Path, process::Stdio, time::Duration};

use color_eyre::{Result, eyre::Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::fs;

/// Filename the user's program is written to inside the workspace.
pub const USER_PROGRAM_FILE: &str = "code.js";

/// Filename the request's input items are serialised to.
pub const INPUT_FILE: &str = "items.json";

/// Filename of the generated wrapper program.
pub const WRAPPER_FILE: &str = "execute.js";

/// A single captured diagnostic record.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct ConsoleEntry {
    /// Which console writer produced the record.
    #[serde(rename = "type")]
    pub level: ConsoleLevel,

    /// The stringified, space-joined arguments of the call.
    pub message: String,

    /// ISO-8601 instant at which the call happened inside the child.
    pub timestamp: String,
}

/// The five console writers the wrapper intercepts.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

/// The single JSON object the wrapper emits on one of its streams.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FramedResult {
    pub success: bool,

    /// The user function's return value; present on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// The failure message; present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// The failure stack, unscrubbed; present on failure when available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Diagnostic records captured up to the success or failure point.
    #[serde(default)]
    pub console: Vec<ConsoleEntry>,
}

impl FramedResult {
    /// A synthesised failure with no captured diagnostics.
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            stack: None,
            console: Vec::new(),
        }
    }
}

/// The classified result of one child execution.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub result: FramedResult,

    /// Wall-clock time the child was alive.
    pub elapsed: Duration,
}

/// Write the user program, input data, and wrapper into the workspace, then
/// execute under the wall-clock deadline.
///
/// Execution failures (non-zero exit, timeout, unparseable output, spawn
/// refusal) are framed results, not errors; `Err` here means the workspace
/// files couldn't even be set up.
#[instrument(skip(code, items))]
pub async fn run(
    workspace: &Path,
    code: &str,
    items: &Value,
    timeout: Duration,
) -> Result<RunOutcome> {
    fs::write(&workspace.join(USER_PROGRAM_FILE), code)
        .await
        .context("write user program")?;
    let input = serde_json::to_string(items).context("serialise input items")?;
    fs::write(&workspace.join(INPUT_FILE), input)
        .await
        .context("write input items")?;
    fs::write(&workspace.join(WRAPPER_FILE), WRAPPER_PROGRAM)
        .await
        .context("write wrapper program")?;

    let started = Instant::now();
    let spawned = tokio::process::Command::new("node")
        .arg(WRAPPER_FILE)
        .current_dir(workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match spawned {
        Ok(child) => child,
        Err(err) => {
            warn!(error = ?err, "unable to spawn interpreter");
            return Ok(RunOutcome {
                result: FramedResult::failure(format!("Failed to start interpreter: {err}")),
                elapsed: started.elapsed(),
            });
        }
    };

    // Dropping the in-flight future on deadline expiry drops the child
    // handle, and `kill_on_drop` takes it down with the pending I/O.
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => output.context("await interpreter")?,
        Err(_) => {
            debug!(?timeout, "deadline expired; child killed");
            return Ok(RunOutcome {
                result: FramedResult::failure(format!(
                    "Execution terminated: timed out after {} ms",
                    timeout.as_millis()
                )),
                elapsed: started.elapsed(),
            });
        }
    };

    let elapsed = started.elapsed();
    let result = classify_output(
        output.status.success(),
        &output.stdout,
        &output.stderr,
    );
    Ok(RunOutcome { result, elapsed })
}

/// Classify a finished child's streams into a framed result.
///
/// A clean exit with an empty diagnostic stream parses the primary stream;
/// everything else parses the diagnostic stream, with synthesised fallbacks
/// when the frame itself is missing or corrupt.
fn classify_output(exited_clean: bool, stdout: &[u8], stderr: &[u8]) -> FramedResult {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);

    if exited_clean && stderr.trim().is_empty() {
        match serde_json::from_str(stdout.trim()) {
            Ok(result) => result,
            Err(err) => {
                warn!(error = ?err, raw = %stdout, "primary stream did not parse");
                FramedResult::failure("Invalid output format")
            }
        }
    } else {
        match serde_json::from_str(stderr.trim()) {
            Ok(result) => result,
            Err(_) => {
                let message = match stderr.trim() {
                    "" => "Unknown execution error".to_string(),
                    text => text.to_string(),
                };
                FramedResult::failure(message)
            }
        }
    }
}

/// The wrapper program generated into each workspace.
///
/// Keep the diagnostic shims above everything else: the user module must
/// never observe the unshimmed writers.
const WRAPPER_PROGRAM: &str = r#"'use strict';

const fs = require('fs');

const captured = [];
const emitOut = process.stdout.write.bind(process.stdout);
const emitErr = process.stderr.write.bind(process.stderr);

function render(value) {
  if (value === undefined) return 'undefined';
  if (value === null) return 'null';
  if (typeof value === 'object') {
    try {
      return JSON.stringify(value);
    } catch (err) {
      return '[Circular]';
    }
  }
  return String(value);
}

for (const type of ['log', 'info', 'warn', 'error', 'debug']) {
  console[type] = (...args) => {
    captured.push({
      type,
      message: args.map(render).join(' '),
      timestamp: new Date().toISOString(),
    });
  };
}

(async () => {
  try {
    const entrypoint = require('./code.js');
    if (typeof entrypoint !== 'function') {
      throw new Error('Module must export a function');
    }
    const items = JSON.parse(fs.readFileSync('./items.json', 'utf8'));
    const data = await entrypoint(items);
    emitOut(JSON.stringify({
      success: true,
      data: data === undefined ? null : data,
      console: captured,
    }) + '\n');
  } catch (err) {
    emitErr(JSON.stringify({
      success: false,
      error: err instanceof Error ? err.message : String(err),
      stack: err instanceof Error ? err.stack : undefined,
      console: captured,
    }) + '\n');
    process.exitCode = 1;
  }
})();
"#;
