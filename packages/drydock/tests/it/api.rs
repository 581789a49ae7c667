use std::{path::Path, sync::Arc};

use axum_test::TestServer;
use drydock::{
    api::{self, App},
    config::Config,
    executor::Executor,
};
use color_eyre::Result;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use crate::{require_node, temporary_directory};

fn test_config(root: &Path, secret_key: Option<&str>) -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        execution_dir: root.join("executions"),
        cache_dir: root.join("dependencies-cache"),
        secret_key: secret_key.map(str::to_string),
        default_timeout_ms: 60_000,
        cache_limit_bytes: 1024 * 1024 * 1024,
        prune_max_count: 0,
    }
}

fn test_server(config: Config) -> TestServer {
    let config = Arc::new(config);
    let executor = Arc::new(Executor::new(Arc::clone(&config)));
    TestServer::new(api::router(App { config, executor })).expect("start test server")
}

#[test_log::test(tokio::test)]
async fn health_reports_configuration() {
    let (_guard, root) = temporary_directory();
    let server = test_server(test_config(&root, None));

    let response = server.get("/health").await;
    response.assert_status_ok();

    let body = response.json::<Value>();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["auth"], "disabled");
    assert_eq!(body["defaultTimeout"], "60000ms");
    assert!(body["version"].is_string());
}

#[test_log::test(tokio::test)]
async fn health_is_reachable_without_credentials_even_when_auth_is_on() {
    let (_guard, root) = temporary_directory();
    let server = test_server(test_config(&root, Some("hunter2")));

    let response = server.get("/health").await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["auth"], "enabled");
}

#[test_log::test(tokio::test)]
async fn verify_auth_distinguishes_missing_from_wrong() {
    let (_guard, root) = temporary_directory();
    let server = test_server(test_config(&root, Some("hunter2")));

    let missing = server.get("/verify-auth").await;
    missing.assert_status(axum::http::StatusCode::UNAUTHORIZED);
    assert_eq!(missing.json::<Value>()["success"], false);

    let wrong = server
        .get("/verify-auth")
        .add_header("Authorization", "Bearer nope")
        .await;
    wrong.assert_status(axum::http::StatusCode::FORBIDDEN);

    let right = server
        .get("/verify-auth")
        .add_header("Authorization", "Bearer hunter2")
        .await;
    right.assert_status_ok();
    let body = right.json::<Value>();
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Authentication successful");
    assert_eq!(body["authenticated"], true);
}

#[test_log::test(tokio::test)]
async fn verify_auth_passes_open_when_no_secret_is_configured() {
    let (_guard, root) = temporary_directory();
    let server = test_server(test_config(&root, None));

    let response = server.get("/verify-auth").await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["authenticated"], true);
}

#[test_log::test(tokio::test)]
async fn execute_requires_code_and_cache_key() {
    let (_guard, root) = temporary_directory();
    let server = test_server(test_config(&root, None));

    let missing_code = server
        .post("/execute")
        .json(&json!({ "cacheKey": "k1" }))
        .await;
    missing_code.assert_status(axum::http::StatusCode::BAD_REQUEST);
    let body = missing_code.json::<Value>();
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().is_some_and(|msg| msg.contains("code")));

    let missing_key = server
        .post("/execute")
        .json(&json!({ "code": "module.exports = () => 1;" }))
        .await;
    missing_key.assert_status(axum::http::StatusCode::BAD_REQUEST);
    let body = missing_key.json::<Value>();
    assert!(
        body["error"]
            .as_str()
            .is_some_and(|msg| msg.contains("cacheKey"))
    );
}

#[test_log::test(tokio::test)]
async fn execute_runs_a_pure_program_end_to_end() -> Result<()> {
    require_node!();
    let (_guard, root) = temporary_directory();
    let server = test_server(test_config(&root, None));

    let response = server
        .post("/execute")
        .json(&json!({
            "code": "module.exports = function(items){ return items.map(x=>x*2); }",
            "items": [1, 2, 3, 4, 5],
            "cacheKey": "t1",
        }))
        .await;
    response.assert_status_ok();

    let body = response.json::<Value>();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"], json!([2, 4, 6, 8, 10]));
    assert_eq!(body["console"], json!([]));
    Ok(())
}

/// With retention disabled, no workspace survives the response; the
/// dependency-free program never touches the cache root either.
#[test_log::test(tokio::test)]
async fn execute_reclaims_the_workspace() -> Result<()> {
    require_node!();
    let (_guard, root) = temporary_directory();
    let config = test_config(&root, None);
    let executions = config.execution_dir.clone();
    let cache_root = config.cache_dir.clone();
    let server = test_server(config);

    let response = server
        .post("/execute")
        .json(&json!({
            "code": "module.exports = function(){ return 'done'; }",
            "cacheKey": "t1",
        }))
        .await;
    response.assert_status_ok();

    let mut leftovers = Vec::new();
    if let Ok(mut read_dir) = tokio::fs::read_dir(&executions).await {
        while let Some(entry) = read_dir.next_entry().await? {
            leftovers.push(entry.file_name());
        }
    }
    assert_eq!(leftovers, Vec::<std::ffi::OsString>::new());
    assert!(
        !drydock::fs::exists(&cache_root).await
            || tokio::fs::read_dir(&cache_root)
                .await?
                .next_entry()
                .await?
                .is_none(),
        "dependency-free execution must not create cache entries"
    );
    Ok(())
}

#[test_log::test(tokio::test)]
async fn execute_merges_debug_telemetry_on_request() -> Result<()> {
    require_node!();
    let (_guard, root) = temporary_directory();
    let server = test_server(test_config(&root, None));

    let response = server
        .post("/execute")
        .json(&json!({
            "code": "module.exports = function(){ return 1; }",
            "cacheKey": "t1",
            "options": { "debug": true },
        }))
        .await;
    response.assert_status_ok();

    let body = response.json::<Value>();
    assert_eq!(body["success"], true);
    let debug = &body["debug"];
    assert_eq!(debug["cache"]["usedCache"], false);
    assert_eq!(debug["cache"]["cacheKey"], "t1");
    assert!(debug["server"]["nodeVersion"].is_string());
    assert!(debug["execution"]["totalResponseTimeMs"].is_u64());
    assert!(debug["execution"]["executionTimeMs"].is_u64());
    Ok(())
}
