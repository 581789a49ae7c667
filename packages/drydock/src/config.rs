//! Startup configuration.
//!
//! Every knob is captured exactly once, at startup, into an immutable
//! [`Config`] handle shared across the components; nothing in the core reads
//! the environment after that.

use std::path::PathBuf;

use clap::Parser;
use derive_more::Debug;

use crate::size::parse_size;

/// Command-line and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Options {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value = "3000")]
    pub port: u16,

    /// Host to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Root directory for per-request execution workspaces
    #[arg(long, env = "EXECUTION_DIR", default_value = "./executions")]
    pub execution_dir: PathBuf,

    /// Root directory for the keyed dependency cache
    #[arg(long, env = "CACHE_DIR", default_value = "./dependencies-cache")]
    pub cache_dir: PathBuf,

    /// Bearer token required on authenticated endpoints; omit to run open
    #[arg(long, env = "SECRET_KEY")]
    #[debug(ignore)]
    pub secret_key: Option<String>,

    /// Default execution deadline in milliseconds
    #[arg(long, env = "DEFAULT_TIMEOUT", default_value = "60000")]
    pub default_timeout: u64,

    /// Cache byte budget, human readable ("1GB", "500MB")
    #[arg(long, env = "CACHE_SIZE_LIMIT", default_value = "1GB")]
    pub cache_size_limit: String,

    /// How many finished workspaces to retain; 0 deletes each one eagerly
    #[arg(long, env = "EXECUTIONS_DATA_PRUNE_MAX_COUNT", default_value = "100")]
    pub prune_max_count: usize,
}

/// The immutable configuration handle the components share.
#[derive(Clone, Debug)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub execution_dir: PathBuf,
    pub cache_dir: PathBuf,
    #[debug(ignore)]
    pub secret_key: Option<String>,
    pub default_timeout_ms: u64,
    pub cache_limit_bytes: u64,
    pub prune_max_count: usize,
}

impl From<Options> for Config {
    fn from(options: Options) -> Self {
        Self {
            host: options.host,
            port: options.port,
            execution_dir: options.execution_dir,
            cache_dir: options.cache_dir,
            secret_key: options.secret_key.filter(|key| !key.is_empty()),
            default_timeout_ms: options.default_timeout,
            cache_limit_bytes: parse_size(&options.cache_size_limit),
            prune_max_count: options.prune_max_count,
        }
    }
}
