use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use color_eyre::Report;
use serde_json::json;
use tracing::{error, info};

use crate::{
    api::App,
    auth::Verified,
    executor::{ExecuteError, ExecuteRequest, ExecuteResponse},
};

/// Execute a user-submitted program.
///
/// A well-formed request always gets a 200; whether the execution succeeded
/// is carried in the body's `success` flag. 400 is reserved for requests
/// missing `code` or `cacheKey`.
#[tracing::instrument(skip_all)]
pub async fn handle(
    State(app): State<App>,
    _auth: Verified,
    Json(request): Json<ExecuteRequest>,
) -> ExecuteHttpResponse {
    match app.executor.execute(request).await {
        Ok(response) => {
            info!(success = response.success, "execute.complete");
            ExecuteHttpResponse::Completed(Box::new(response))
        }
        Err(ExecuteError::BadRequest(message)) => {
            info!(%message, "execute.bad_request");
            ExecuteHttpResponse::BadRequest(message)
        }
        Err(ExecuteError::Internal(report)) => {
            error!(error = ?report, "execute.error");
            ExecuteHttpResponse::Error(report)
        }
    }
}

#[derive(Debug)]
pub enum ExecuteHttpResponse {
    Completed(Box<ExecuteResponse>),
    BadRequest(String),
    Error(Report),
}

impl IntoResponse for ExecuteHttpResponse {
    fn into_response(self) -> Response {
        match self {
            ExecuteHttpResponse::Completed(response) => {
                (StatusCode::OK, Json(response)).into_response()
            }
            ExecuteHttpResponse::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "success": false, "error": message })),
            )
                .into_response(),
            ExecuteHttpResponse::Error(report) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": format!("{report:#}") })),
            )
                .into_response(),
        }
    }
}
