//! Single request/response front for the worker pool.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use autobatch_common::SystemInfo;

use super::batch_queue::{BatchQueue, BatchQueueConfig, QueuedRequest, RequestId};
use super::cold_start::{ColdStartProxy, ProcessedColdStartSet};
use super::dispatcher::Dispatcher;
use super::metrics::RequestMetrics;
use super::registry::ResponseRegistry;
use super::worker_client::WorkerClient;
use super::worker_set::{ServerChange, WorkerSet};
use crate::config::BalancerConfig;
use crate::error::{Error, Result};

/// Batches client requests, round-robins batches across workers and falls
/// back to the cold-start proxy while there are none.
pub struct LoadBalancer {
    queue: Arc<BatchQueue>,
    registry: Arc<ResponseRegistry>,
    dispatcher: Arc<Dispatcher>,
    worker_set: Arc<WorkerSet>,
    cold_start: Option<Arc<dyn ColdStartProxy>>,
    cold_start_processed: Arc<Mutex<ProcessedColdStartSet>>,
    metrics: RequestMetrics,
}

impl LoadBalancer {
    pub fn new(
        config: &BalancerConfig,
        client: Arc<dyn WorkerClient>,
        cold_start: Option<Arc<dyn ColdStartProxy>>,
    ) -> Self {
        let queue = Arc::new(BatchQueue::new(BatchQueueConfig::new(
            config.max_batch_size,
            config.timeout_batching(),
        )));
        let registry = Arc::new(ResponseRegistry::new(config.response_poll_interval()));
        let worker_set = Arc::new(WorkerSet::new());
        let cold_start_processed = Arc::new(Mutex::new(ProcessedColdStartSet::new(
            config.cold_start_capacity,
        )));
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            worker_set.clone(),
            registry.clone(),
            cold_start_processed.clone(),
            client,
            config.timeout_inference(),
            config.flush_interval(),
        ));

        Self {
            queue,
            registry,
            dispatcher,
            worker_set,
            cold_start,
            cold_start_processed,
            metrics: RequestMetrics::new(),
        }
    }

    /// Spawn the flush loop.
    pub fn start(&self) -> JoinHandle<()> {
        tokio::spawn(self.dispatcher.clone().run())
    }

    /// Admit one payload and wait for its outcome.
    ///
    /// The request is queued even when it is answered by the cold-start
    /// proxy, so that the pending count reflects real demand.
    pub async fn submit(&self, payload: Value) -> Result<Value> {
        let _in_flight = self.metrics.start();

        let no_workers = self.worker_set.is_empty().await;
        let id = RequestId::new();

        match (no_workers, &self.cold_start) {
            (true, None) => Err(Error::NoHealthyWorkers),
            (true, Some(proxy)) => {
                // Mark before queueing so a dispatch racing a new worker can't deliver it.
                self.cold_start_processed.lock().await.insert(id);
                self.queue
                    .enqueue(QueuedRequest::new(id, payload.clone()))
                    .await;
                tracing::debug!("No workers available, proxying request {}", id);
                proxy.handle_request(&payload).await
            }
            (false, _) => {
                self.queue.enqueue(QueuedRequest::new(id, payload)).await;
                self.registry.await_outcome(id).await
            }
        }
    }

    /// Like [`submit`](Self::submit), but runs to completion on its own task
    /// so that a caller going away can't strand an outcome in the registry.
    pub async fn submit_detached(self: &Arc<Self>, payload: Value) -> Result<Value> {
        let balancer = Arc::clone(self);
        tokio::spawn(async move { balancer.submit(payload).await })
            .await
            .map_err(|e| Error::Internal(format!("request task failed: {}", e)))?
    }

    /// Replace the set of workers batches are sent to.
    pub async fn update_servers(&self, servers: Vec<String>) -> ServerChange {
        let change = self.worker_set.replace(servers).await;
        if !change.added.is_empty() {
            tracing::info!("servers added: {:?}", change.added);
        }
        if !change.removed.is_empty() {
            tracing::info!("servers deleted: {:?}", change.removed);
        }
        change
    }

    pub async fn servers(&self) -> Vec<String> {
        self.worker_set.addresses().await
    }

    /// Queued requests plus dispatched requests without an outcome yet.
    pub async fn num_pending_requests(&self) -> usize {
        self.queue.len().await + self.dispatcher.in_flight()
    }

    pub fn metrics(&self) -> &RequestMetrics {
        &self.metrics
    }

    pub async fn system_info(&self) -> SystemInfo {
        let servers = self.servers().await;
        SystemInfo {
            num_workers: servers.len(),
            servers,
            num_requests: self.metrics.in_flight(),
            processing_time_secs: self.metrics.last_processing_time().as_secs_f64(),
            global_request_count: self.metrics.total(),
            pending_requests: self.num_pending_requests().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{test_config, MockColdStartProxy, MockWorkerClient, WorkerBehavior};
    use futures_util::future::join_all;
    use serde_json::json;
    use std::time::Duration;

    fn balancer(
        max_batch_size: usize,
        timeout_batching_secs: f64,
        client: Arc<MockWorkerClient>,
        cold_start: Option<Arc<dyn ColdStartProxy>>,
    ) -> Arc<LoadBalancer> {
        let mut config = test_config().balancer;
        config.max_batch_size = max_batch_size;
        config.timeout_batching_secs = timeout_batching_secs;
        config.flush_interval_ms = 10;
        config.response_poll_interval_ms = 10;
        let balancer = Arc::new(LoadBalancer::new(&config, client, cold_start));
        balancer.start();
        balancer
    }

    #[tokio::test]
    async fn test_no_workers_no_proxy_fails_fast() {
        let client = Arc::new(MockWorkerClient::new(WorkerBehavior::Echo));
        let lb = balancer(2, 1.0, client, None);

        let err = lb.submit(json!("x")).await.unwrap_err();
        assert!(matches!(err, Error::NoHealthyWorkers));
        assert_eq!(lb.num_pending_requests().await, 0);
        assert_eq!(lb.metrics().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_submit_resolves_through_worker() {
        let client = Arc::new(MockWorkerClient::new(WorkerBehavior::Echo));
        let lb = balancer(1, 1.0, client.clone(), None);
        lb.update_servers(vec!["http://w1".into()]).await;

        let output = lb.submit(json!("hello")).await.unwrap();
        assert_eq!(output, json!({"echo": "hello"}));
        assert_eq!(client.calls().await, vec![("http://w1".to_string(), 1)]);
        assert_eq!(lb.num_pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_full_batch_then_timeout_batch() {
        let client = Arc::new(MockWorkerClient::new(WorkerBehavior::Echo));
        let lb = balancer(2, 0.3, client.clone(), None);
        lb.update_servers(vec!["http://w1".into()]).await;

        let started = tokio::time::Instant::now();
        let results = join_all((0..3).map(|i| {
            let lb = lb.clone();
            async move { (i, lb.submit(json!(i)).await, started.elapsed()) }
        }))
        .await;

        for (i, result, _) in &results {
            assert_eq!(result.as_ref().unwrap(), &json!({ "echo": i }));
        }

        let mut sizes: Vec<usize> = client.calls().await.into_iter().map(|(_, n)| n).collect();
        sizes.sort();
        assert_eq!(sizes, vec![1, 2]);

        // The straggler waited for the batching timeout.
        let slowest = results.iter().map(|(_, _, t)| *t).max().unwrap();
        assert!(slowest >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_cold_start_answers_and_skips_registry() {
        let client = Arc::new(MockWorkerClient::new(WorkerBehavior::Echo));
        let proxy = Arc::new(MockColdStartProxy::new(json!("from-proxy")));
        let lb = balancer(1, 0.05, client.clone(), Some(proxy.clone()));

        let output = lb.submit(json!("x")).await.unwrap();
        assert_eq!(output, json!("from-proxy"));
        assert_eq!(proxy.calls(), 1);

        // The queued copy is cut and fails on the empty set, but nobody
        // waits for it and nothing lingers in the registry.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(lb.num_pending_requests().await, 0);
        assert!(lb.registry.is_empty().await);
        assert!(lb.cold_start_processed.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_cold_start_request_counts_as_pending() {
        let client = Arc::new(MockWorkerClient::new(WorkerBehavior::Echo));
        let proxy = Arc::new(MockColdStartProxy::new(json!("ok")));
        let lb = balancer(8, 60.0, client, Some(proxy));

        lb.submit(json!(1)).await.unwrap();
        lb.submit(json!(2)).await.unwrap();
        assert_eq!(lb.num_pending_requests().await, 2);
    }

    #[tokio::test]
    async fn test_cold_start_duplicate_from_new_worker_dropped() {
        let client = Arc::new(MockWorkerClient::new(WorkerBehavior::Echo));
        let proxy = Arc::new(MockColdStartProxy::new(json!("from-proxy")));
        let lb = balancer(8, 0.2, client.clone(), Some(proxy));

        assert_eq!(lb.submit(json!("x")).await.unwrap(), json!("from-proxy"));
        // A worker comes up before the queued copy is flushed.
        lb.update_servers(vec!["http://w1".into()]).await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(client.calls().await, vec![("http://w1".to_string(), 1)]);
        assert!(lb.registry.is_empty().await);
        assert_eq!(lb.num_pending_requests().await, 0);
    }

    #[tokio::test]
    async fn test_backend_failure_surfaces_to_each_caller() {
        let client = Arc::new(MockWorkerClient::new(WorkerBehavior::Fail(
            Error::BackendError("HTTP 500".into()),
        )));
        let lb = balancer(2, 1.0, client, None);
        lb.update_servers(vec!["http://w1".into()]).await;

        let results = join_all((0..2).map(|i| {
            let lb = lb.clone();
            async move { lb.submit(json!(i)).await }
        }))
        .await;
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(Error::BackendError(_)))));
    }

    #[tokio::test]
    async fn test_system_info_reports_counters() {
        let client = Arc::new(MockWorkerClient::new(WorkerBehavior::Echo));
        let lb = balancer(1, 1.0, client, None);
        lb.update_servers(vec!["http://w1".into(), "http://w2".into()])
            .await;
        lb.submit_detached(json!(1)).await.unwrap();

        let info = lb.system_info().await;
        assert_eq!(info.num_workers, 2);
        assert_eq!(info.servers, vec!["http://w1", "http://w2"]);
        assert_eq!(info.num_requests, 0);
        assert_eq!(info.global_request_count, 1);
        assert_eq!(info.pending_requests, 0);
    }

    #[tokio::test]
    async fn test_update_servers_reports_change() {
        let client = Arc::new(MockWorkerClient::new(WorkerBehavior::Echo));
        let lb = balancer(1, 1.0, client, None);

        let change = lb.update_servers(vec!["http://w1".into()]).await;
        assert_eq!(change.added, vec!["http://w1"]);
        assert!(lb.update_servers(vec!["http://w1".into()]).await.is_empty());
    }
}
