// Admin HTTP API handlers
//
// JSON in, JSON out: clients that cannot accept JSON get 406, malformed
// payloads get 400, unknown identifiers get 404.

use std::sync::Arc;

use axum::{
    extract::rejection::JsonRejection,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use cookiemonster_core::CookieJar;

/// Application state shared across all requests
#[derive(Clone)]
pub(crate) struct AppState {
    pub jar: Arc<dyn CookieJar>,
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/queue", get(queue_length))
        .route("/queue/reprocess", post(reprocess))
        .route(
            "/cookiejar/*identifier",
            get(fetch_cookie).delete(delete_cookie),
        )
        .route("/health", get(health_check))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Error type that implements IntoResponse
pub(crate) struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl AppError {
    fn with_status(status: StatusCode, error: anyhow::Error) -> Self {
        Self { status, error }
    }

    fn not_found(identifier: &str) -> Self {
        Self::with_status(
            StatusCode::NOT_FOUND,
            anyhow::anyhow!("unknown cookie: {identifier}"),
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("Request error: {:?}", self.error);
        }
        (
            self.status,
            Json(json!({
                "error": self.error.to_string(),
            })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: err.into(),
        }
    }
}

/// The API only speaks JSON; reject clients that will not accept it.
fn require_json(headers: &HeaderMap) -> Result<(), AppError> {
    let acceptable = match headers.get(axum::http::header::ACCEPT) {
        None => true,
        Some(accept) => accept
            .to_str()
            .map(|value| value.contains("application/json") || value.contains("*/*"))
            .unwrap_or(false),
    };
    if acceptable {
        Ok(())
    } else {
        Err(AppError::with_status(
            StatusCode::NOT_ACCEPTABLE,
            anyhow::anyhow!("this API only produces application/json"),
        ))
    }
}

/// Cookie identifiers are rooted paths; the route wildcard strips the
/// leading slash.
fn rooted(identifier: String) -> String {
    if identifier.starts_with('/') {
        identifier
    } else {
        format!("/{identifier}")
    }
}

/// GET /health - Basic health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "healthy"})))
}

/// GET /queue - Current processing queue length
async fn queue_length(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    require_json(&headers)?;
    let queue_length = state.jar.queue_length().await?;
    Ok((StatusCode::OK, Json(json!({ "queue_length": queue_length }))).into_response())
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ReprocessRequest {
    pub path: String,
}

/// POST /queue/reprocess - Return a cookie to the queue immediately
async fn reprocess(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<ReprocessRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    require_json(&headers)?;
    let Json(request) = payload.map_err(|rejection| {
        AppError::with_status(
            StatusCode::BAD_REQUEST,
            anyhow::anyhow!("malformed reprocess request: {rejection}"),
        )
    })?;

    state.jar.mark_for_processing(&request.path).await?;
    Ok((StatusCode::OK, Json(json!({ "path": request.path }))).into_response())
}

/// GET /cookiejar/{identifier} - A cookie with its chronological history
async fn fetch_cookie(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(identifier): Path<String>,
) -> Result<Response, AppError> {
    require_json(&headers)?;
    let identifier = rooted(identifier);
    match state.jar.fetch_cookie(&identifier).await? {
        Some(cookie) => Ok((StatusCode::OK, Json(cookie)).into_response()),
        None => Err(AppError::not_found(&identifier)),
    }
}

/// DELETE /cookiejar/{identifier} - Remove a cookie's metadata and queue
/// records
async fn delete_cookie(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(identifier): Path<String>,
) -> Result<Response, AppError> {
    require_json(&headers)?;
    let identifier = rooted(identifier);
    if state.jar.fetch_cookie(&identifier).await?.is_none() {
        return Err(AppError::not_found(&identifier));
    }
    state.jar.delete_cookie(&identifier).await?;
    Ok((StatusCode::OK, Json(json!({ "deleted": identifier }))).into_response())
}
