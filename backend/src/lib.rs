pub mod autoscaler;
pub mod balancer;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod routes;
pub mod test_util;

pub use autoscaler::{AutoScaler, BalancerHandle, DefaultScalingPolicy, RemoteBalancer, ScalingPolicy};
pub use balancer::{ColdStartProxy, HttpColdStartProxy, HttpWorkerClient, LoadBalancer, WorkerClient};
pub use config::Config;
pub use error::{Error, Result};
pub use lifecycle::{ProcessLifecycle, WorkerLifecycle};

use std::sync::Arc;

use axum::{middleware, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    /// The in-process balancer the HTTP surface fronts.
    pub balancer: Arc<LoadBalancer>,
}

/// Build the full HTTP surface: client endpoint, balancer control, health.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(routes::health::router(state.clone()))
        .merge(routes::system::router(state.clone()))
        .merge(routes::predict::router(state))
        .layer(middleware::from_fn(logging::request_logger))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
