//! autobatch - batching load balancer and autoscaler for inference workers.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use autobatch_backend::autoscaler::{AutoScaler, BalancerHandle, DefaultScalingPolicy, RemoteBalancer};
use autobatch_backend::balancer::{ColdStartProxy, HttpColdStartProxy, HttpWorkerClient, LoadBalancer};
use autobatch_backend::lifecycle::{ProcessLifecycle, WorkerLifecycle};
use autobatch_backend::{create_router, logging, AppState, Config};

const VERSION: &str = env!("CARGO_PKG_VERSION");

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

/// Bootstrap the autoscaler and run it on its own task.
async fn spawn_autoscaler(
    config: &Config,
    balancer: Arc<dyn BalancerHandle>,
) -> Result<Option<tokio::task::JoinHandle<()>>, Box<dyn std::error::Error>> {
    if !config.autoscaler.enabled {
        tracing::info!("Autoscaler disabled");
        return Ok(None);
    }
    let Some(worker_config) = config.worker.clone() else {
        tracing::warn!(
            "Autoscaler enabled but no [worker] section configured; \
             workers must be registered through /system/update-servers"
        );
        return Ok(None);
    };

    tracing::info!(
        "Autoscaler: {}..{} replicas of `{}`, every {}s",
        config.autoscaler.min_replicas,
        config.autoscaler.max_replicas,
        worker_config.command,
        config.autoscaler.autoscale_interval_secs
    );

    let lifecycle: Arc<dyn WorkerLifecycle> = Arc::new(ProcessLifecycle::new(worker_config));
    let mut autoscaler = AutoScaler::new(
        &config.autoscaler,
        lifecycle,
        balancer,
        Box::new(DefaultScalingPolicy::new(config.balancer.max_batch_size)),
    )?;
    autoscaler.bootstrap().await?;

    Ok(Some(tokio::spawn(autoscaler.run())))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Handle --version / -V
    let args: Vec<String> = env::args().collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("autobatch {}", VERSION);
        return Ok(());
    }

    let config = Config::load()?;
    logging::init_tracing(&config.logging.level);

    tracing::info!("Starting autobatch v{}", VERSION);

    if config.admin.auth_secret.as_deref().map_or(true, str::is_empty) {
        tracing::warn!(
            "No admin secret configured (AUTOBATCH__ADMIN__AUTH_SECRET); \
             /system endpoints are unauthenticated"
        );
    }

    // Autoscaler-only mode: drive a balancer that runs elsewhere.
    if let Some(url) = config.autoscaler.balancer_url.clone() {
        tracing::info!("Driving remote balancer at {}", url);
        let remote: Arc<dyn BalancerHandle> =
            Arc::new(RemoteBalancer::new(&url, config.admin.auth_secret.clone()));
        match spawn_autoscaler(&config, remote).await? {
            Some(handle) => {
                tokio::select! {
                    _ = handle => {}
                    _ = shutdown_signal() => {}
                }
            }
            None => tracing::warn!("Nothing to do without an autoscaler"),
        }
        return Ok(());
    }

    let client = Arc::new(HttpWorkerClient::new(&config.balancer.endpoint));
    let cold_start: Option<Arc<dyn ColdStartProxy>> = config.cold_start.as_ref().map(|c| {
        tracing::info!("Cold start proxy: {}", c.proxy_url);
        Arc::new(HttpColdStartProxy::new(
            &c.proxy_url,
            Duration::from_secs(c.timeout_secs),
        )) as Arc<dyn ColdStartProxy>
    });

    let balancer = Arc::new(LoadBalancer::new(&config.balancer, client, cold_start));
    balancer.start();
    tracing::info!(
        "Balancer: endpoint {}, max batch size {}, batching timeout {:?}",
        config.balancer.endpoint,
        config.balancer.max_batch_size,
        config.balancer.timeout_batching()
    );

    let state = Arc::new(AppState {
        config: config.clone(),
        balancer: balancer.clone(),
    });
    let app = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let _autoscaler = spawn_autoscaler(&config, balancer).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
