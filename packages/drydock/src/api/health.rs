use axum::{Json, extract::State};
use serde_json::{Value, json};

use crate::api::App;

/// Health and configuration probe; reachable without credentials even when
/// auth is enabled.
#[tracing::instrument(skip_all)]
pub async fn handle(State(app): State<App>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "auth": if app.config.secret_key.is_some() { "enabled" } else { "disabled" },
        "defaultTimeout": format!("{}ms", app.config.default_timeout_ms),
    }))
}
