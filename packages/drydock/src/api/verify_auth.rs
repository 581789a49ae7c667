use axum::Json;
use serde_json::{Value, json};

use crate::auth::Verified;

/// Credential probe: reaching the handler at all means the extractor
/// accepted the request.
#[tracing::instrument(skip_all)]
pub async fn handle(_auth: Verified) -> Json<Value> {
    Json(json!({
        "success": true,
        "message": "Authentication successful",
        "authenticated": true,
    }))
}
