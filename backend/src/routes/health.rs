use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let version = env!("CARGO_PKG_VERSION");
    let workers = state.balancer.servers().await.len();
    let pending = state.balancer.num_pending_requests().await;
    let request_metrics = state.balancer.metrics();

    let body = format!(
        "# HELP autobatch_up Whether the service is up\n\
         # TYPE autobatch_up gauge\n\
         autobatch_up 1\n\
         # HELP autobatch_info Service information\n\
         # TYPE autobatch_info gauge\n\
         autobatch_info{{version=\"{}\"}} 1\n\
         # HELP autobatch_workers Dispatchable worker addresses\n\
         # TYPE autobatch_workers gauge\n\
         autobatch_workers {}\n\
         # HELP autobatch_pending_requests Queued or dispatched requests without an outcome\n\
         # TYPE autobatch_pending_requests gauge\n\
         autobatch_pending_requests {}\n\
         # HELP autobatch_requests_in_flight Client requests being served\n\
         # TYPE autobatch_requests_in_flight gauge\n\
         autobatch_requests_in_flight {}\n\
         # HELP autobatch_requests_total Client requests received\n\
         # TYPE autobatch_requests_total counter\n\
         autobatch_requests_total {}\n\
         # HELP autobatch_last_processing_seconds Duration of the last finished client request\n\
         # TYPE autobatch_last_processing_seconds gauge\n\
         autobatch_last_processing_seconds {}\n",
        version,
        workers,
        pending,
        request_metrics.in_flight(),
        request_metrics.total(),
        request_metrics.last_processing_time().as_secs_f64(),
    );
    (StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response()
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
}
