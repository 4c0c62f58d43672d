//! Balancer control endpoints used by the autoscaler.
//!
//! Provides:
//! - Pending request count (`/num-requests`)
//! - Worker and request statistics (`/system/info`)
//! - Worker address replacement (`/system/update-servers`)

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Request, State},
    http::header,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use sha2::{Digest, Sha256};

use autobatch_common::SystemInfo;

use crate::balancer::ServerChange;
use crate::error::Error;
use crate::AppState;

fn digest(value: &str) -> String {
    hex::encode(Sha256::digest(value.as_bytes()))
}

/// Bearer token from the `Authorization` header, if any.
fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Middleware that requires the shared admin secret.
///
/// Without a configured secret every call goes through, with a warning.
async fn require_secret(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let secret = state
        .config
        .admin
        .auth_secret
        .as_deref()
        .filter(|s| !s.is_empty());

    let Some(secret) = secret else {
        tracing::warn!(
            path = %request.uri().path(),
            "No admin secret configured, serving unauthenticated request"
        );
        return next.run(request).await;
    };

    let authorized = bearer_token(&request).is_some_and(|token| digest(token) == digest(secret));
    if !authorized {
        tracing::warn!(path = %request.uri().path(), "Rejected admin request");
        return Error::Unauthorized.into_response();
    }
    next.run(request).await
}

/// GET /num-requests - requests not resolved yet
async fn num_requests(State(state): State<Arc<AppState>>) -> Json<usize> {
    Json(state.balancer.num_pending_requests().await)
}

/// GET /system/info
async fn system_info(State(state): State<Arc<AppState>>) -> Json<SystemInfo> {
    Json(state.balancer.system_info().await)
}

/// PUT /system/update-servers - replace the full worker address list
async fn update_servers(
    State(state): State<Arc<AppState>>,
    servers: Result<Json<Vec<String>>, JsonRejection>,
) -> Result<Json<ServerChange>, Error> {
    let Json(servers) = servers.map_err(|e| Error::InvalidRequest(e.body_text()))?;
    Ok(Json(state.balancer.update_servers(servers).await))
}

pub fn router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/system/info", get(system_info))
        .route("/system/update-servers", put(update_servers))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_secret));

    Router::new()
        .route("/num-requests", get(num_requests))
        .merge(protected)
        .with_state(state)
}
