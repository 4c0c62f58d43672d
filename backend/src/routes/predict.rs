use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::{routing::post, Json, Router};
use serde_json::Value;

use crate::error::Error;
use crate::AppState;

/// POST {endpoint} - one payload in, one worker output back
async fn predict(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Value>, Error> {
    let Json(payload) = payload.map_err(|e| Error::InvalidRequest(e.body_text()))?;

    let output = state.balancer.submit_detached(payload).await?;
    Ok(Json(output))
}

pub fn router(state: Arc<AppState>) -> Router {
    let endpoint = state.config.balancer.endpoint.clone();
    Router::new()
        .route(&endpoint, post(predict))
        .with_state(state)
}
