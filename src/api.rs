//! HTTP routes over [`FeedService`].
//!
//! Public: `GET /health`, `GET /feeds/{id}`. Everything under `/admin`
//! requires `Authorization: Bearer <token>` and answers 503 when no admin
//! token is configured.

use axum::{
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::service::{FeedService, ServiceError};

const RSS_CONTENT_TYPE: &str = "application/rss+xml; charset=utf-8";

#[derive(Clone)]
pub struct AppState {
    service: Arc<FeedService>,
    admin_token: Option<Arc<SecretString>>,
}

pub fn create_router(service: Arc<FeedService>, admin_token: Option<SecretString>) -> Router {
    let state = AppState {
        service,
        admin_token: admin_token.map(Arc::new),
    };

    let admin = Router::new()
        .route("/feeds", get(list_feeds))
        .route("/feeds/{id}", get(feed_details))
        .route("/feeds/{id}/reload", post(reload_feed))
        .route("/feeds/{id}/refilter", post(refilter))
        .route("/sources/reload", post(reload_sources))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(health))
        .route("/feeds/{id}", get(get_feed))
        .nest("/admin", admin)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_admin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.admin_token.as_deref() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "admin API disabled: no admin token configured",
        );
    };

    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token_matches(token, expected.expose_secret()));

    if !authorized {
        tracing::warn!(path = %request.uri().path(), "Rejected admin request");
        return error_response(StatusCode::UNAUTHORIZED, "missing or invalid bearer token");
    }
    next.run(request).await
}

/// Compare without short-circuiting on the first differing byte.
fn token_matches(provided: &str, expected: &str) -> bool {
    let (a, b) = (provided.as_bytes(), expected.as_bytes());
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

async fn health(State(state): State<AppState>) -> Result<Response, ServiceError> {
    Ok(Json(state.service.health().await?).into_response())
}

async fn get_feed(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ServiceError> {
    let body = state.service.get_feed(&id).await?;
    Ok(([(header::CONTENT_TYPE, RSS_CONTENT_TYPE)], body).into_response())
}

async fn list_feeds(State(state): State<AppState>) -> Result<Response, ServiceError> {
    Ok(Json(state.service.list_feeds().await?).into_response())
}

async fn feed_details(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ServiceError> {
    Ok(Json(state.service.get_feed_details(&id).await?).into_response())
}

async fn reload_feed(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ServiceError> {
    let result = state.service.reload_feed(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(result)).into_response())
}

async fn refilter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ServiceError> {
    Ok(Json(state.service.refilter(&id).await?).into_response())
}

async fn reload_sources(State(state): State<AppState>) -> Result<Response, ServiceError> {
    Ok(Json(state.service.reload_sources().await?).into_response())
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::SourceDisabled(_) => StatusCode::CONFLICT,
            ServiceError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Sources(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::Database(_) | ServiceError::Render(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        error_response(status, &self.to_string())
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}
