//! The HTTP surface: three routes over the executor.
//!
//! ## Status codes
//!
//! Execution failures are client-facing results, not server faults: the
//! execute endpoint returns 200 with `success: false` in the body for
//! install and execution failures, and reserves 400/401/403/500 for
//! malformed requests, auth, and internal faults.
//!
//! Each handler returns its own [`IntoResponse`](axum::response::IntoResponse)
//! type so the full set of shapes a route can produce is spelled out next to
//! the handler.

use std::{sync::Arc, time::Instant};

use axum::{
    Router,
    extract::Request,
    http::HeaderValue,
    middleware::Next,
    response::Response,
    routing::{get, post},
};
use tracing::Instrument;
use uuid::Uuid;

use crate::{config::Config, executor::Executor};

pub mod execute;
pub mod health;
pub mod verify_auth;

/// Shared handler state: the configuration handle and the executor.
#[derive(Clone)]
pub struct App {
    pub config: Arc<Config>,
    pub executor: Arc<Executor>,
}

pub fn router(app: App) -> Router {
    Router::new()
        .route("/execute", post(execute::handle))
        .route("/health", get(health::handle))
        .route("/verify-auth", get(verify_auth::handle))
        .layer(axum::middleware::from_fn(trace_request))
        .with_state(app)
}

/// Give every request a generated id, a span, and an outcome log line.
///
/// An `/execute` request can legitimately stay open for the full execution
/// deadline, so the id is echoed back in an `x-request-id` header: it is
/// what lets an operator line a slow response up with the resolver and
/// child-process logs it produced. Ids are always generated here rather
/// than taken from the client, since nothing upstream of this service
/// assigns them.
async fn trace_request(request: Request, next: Next) -> Response {
    let id = Uuid::new_v4();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let span = tracing::info_span!("request", %id, %method, %path);
    async move {
        let mut response = next.run(request).await;
        tracing::info!(
            status = %response.status(),
            elapsed = ?started.elapsed(),
            "request finished"
        );
        if let Ok(value) = HeaderValue::try_from(id.to_string()) {
            response.headers_mut().insert("x-request-id", value);
        }
        response
    }
    .instrument(span)
    .await
}
