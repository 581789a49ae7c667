use std::sync::Arc;

use clap::Parser;
use color_eyre::{Result, eyre::Context};
use tracing::level_filters::LevelFilter;
use tracing_error::ErrorLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use drydock::{
    api::{self, App},
    config::{Config, Options},
    executor::Executor,
};

#[tokio::main]
async fn main() -> Result<()> {
    let options = Options::parse();
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(ErrorLayer::default())
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_file(true)
                .with_line_number(true)
                .with_target(true)
                .pretty(),
        )
        .with(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    serve(Config::from(options)).await
}

async fn serve(config: Config) -> Result<()> {
    tracing::info!(?config, "starting drydock");

    let config = Arc::new(config);
    let executor = Arc::new(Executor::new(Arc::clone(&config)));

    // Reclaim budget left over from a previous run before taking traffic.
    let freed = executor
        .cache()
        .sweep()
        .await
        .context("startup cache sweep")?;
    if freed > 0 {
        tracing::info!(freed, "startup sweep reclaimed cache space");
    }

    let router = api::router(App {
        config: Arc::clone(&config),
        executor,
    });

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    // In-flight executions are allowed to finish (up to their own
    // deadlines) once a stop signal arrives.
    axum::serve(listener, router)
        .with_graceful_shutdown(stop_requested())
        .await?;

    tracing::info!("drained; exiting");
    Ok(())
}

/// Resolves once the process is asked to stop (SIGINT or SIGTERM).
async fn stop_requested() {
    #[cfg(unix)]
    let sigterm = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.expect("install Ctrl+C handler");
        }
        () = sigterm => {}
    }

    tracing::info!("stop requested; draining in-flight requests");
}
