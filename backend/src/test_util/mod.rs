//! Test configuration and in-memory collaborators.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::autoscaler::BalancerHandle;
use crate::balancer::{ColdStartProxy, LoadBalancer, WorkerClient};
use crate::config::{
    AdminConfig, AutoscalerConfig, BalancerConfig, Config, LoggingConfig, ServerConfig,
};
use crate::error::{Error, Result};
use crate::lifecycle::{WorkerHandle, WorkerLifecycle, WorkerState, WorkerStatus};
use crate::AppState;

pub fn test_config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
        },
        balancer: BalancerConfig {
            endpoint: "/predict".to_string(),
            max_batch_size: 4,
            timeout_batching_secs: 0.05,
            timeout_inference_secs: 5,
            flush_interval_ms: 10,
            response_poll_interval_ms: 10,
            cold_start_capacity: 100,
        },
        autoscaler: AutoscalerConfig {
            enabled: false,
            min_replicas: 1,
            max_replicas: 4,
            autoscale_interval_secs: 10,
            balancer_url: None,
        },
        cold_start: None,
        admin: AdminConfig {
            auth_secret: Some("test-secret".to_string()),
        },
        worker: None,
        logging: LoggingConfig {
            level: "debug".to_string(),
        },
    }
}

/// App state around a started balancer.
pub fn create_test_state(
    config: Config,
    client: Arc<dyn WorkerClient>,
    cold_start: Option<Arc<dyn ColdStartProxy>>,
) -> Arc<AppState> {
    let balancer = Arc::new(LoadBalancer::new(&config.balancer, client, cold_start));
    balancer.start();
    Arc::new(AppState { config, balancer })
}

/// What [`MockWorkerClient`] does with a batch.
#[derive(Debug, Clone)]
pub enum WorkerBehavior {
    /// One `{"echo": input}` per input.
    Echo,
    Fail(Error),
    /// Echo, minus the last output.
    DropLast,
    /// Echo after sleeping.
    Delay(Duration),
}

pub struct MockWorkerClient {
    behavior: WorkerBehavior,
    calls: Mutex<Vec<(String, usize)>>,
}

impl MockWorkerClient {
    pub fn new(behavior: WorkerBehavior) -> Self {
        Self {
            behavior,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// `(address, batch size)` of every call, in call order.
    pub async fn calls(&self) -> Vec<(String, usize)> {
        self.calls.lock().await.clone()
    }
}

fn echo(inputs: Vec<Value>) -> Vec<Value> {
    inputs.into_iter().map(|input| json!({ "echo": input })).collect()
}

#[async_trait]
impl WorkerClient for MockWorkerClient {
    async fn predict(
        &self,
        address: &str,
        inputs: Vec<Value>,
        _timeout: Duration,
    ) -> Result<Vec<Value>> {
        self.calls
            .lock()
            .await
            .push((address.to_string(), inputs.len()));

        match &self.behavior {
            WorkerBehavior::Echo => Ok(echo(inputs)),
            WorkerBehavior::Fail(e) => Err(e.clone()),
            WorkerBehavior::DropLast => {
                let mut outputs = echo(inputs);
                outputs.pop();
                Ok(outputs)
            }
            WorkerBehavior::Delay(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(echo(inputs))
            }
        }
    }
}

/// Cold-start proxy answering every request with the same value.
pub struct MockColdStartProxy {
    response: Value,
    calls: AtomicUsize,
}

impl MockColdStartProxy {
    pub fn new(response: Value) -> Self {
        Self {
            response,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ColdStartProxy for MockColdStartProxy {
    async fn handle_request(&self, _payload: &Value) -> Result<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.clone())
    }
}

#[derive(Default)]
struct MockLifecycleInner {
    workers: Vec<WorkerStatus>,
    stopped: Vec<WorkerHandle>,
    created: usize,
}

/// Worker lifecycle that only keeps a list.
///
/// Workers are named `worker-<n>` with address `http://worker-<n>`.
pub struct MockLifecycle {
    initial_state: WorkerState,
    inner: StdMutex<MockLifecycleInner>,
    create_failing: AtomicBool,
    list_failing: AtomicBool,
}

impl MockLifecycle {
    /// New workers are `Running` straight away.
    pub fn new() -> Self {
        Self::with_initial_state(WorkerState::Running)
    }

    pub fn with_initial_state(initial_state: WorkerState) -> Self {
        Self {
            initial_state,
            inner: StdMutex::new(MockLifecycleInner::default()),
            create_failing: AtomicBool::new(false),
            list_failing: AtomicBool::new(false),
        }
    }

    pub fn set_state(&self, handle: &WorkerHandle, state: WorkerState) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(worker) = inner.workers.iter_mut().find(|w| &w.handle == handle) {
            worker.state = state;
        }
    }

    pub fn set_create_failing(&self, failing: bool) {
        self.create_failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_list_failing(&self, failing: bool) {
        self.list_failing.store(failing, Ordering::SeqCst);
    }

    /// Number of successful `create_worker` calls.
    pub fn created(&self) -> usize {
        self.inner.lock().unwrap().created
    }

    pub fn stopped(&self) -> Vec<WorkerHandle> {
        self.inner.lock().unwrap().stopped.clone()
    }
}

impl Default for MockLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerLifecycle for MockLifecycle {
    async fn create_worker(&self) -> Result<WorkerHandle> {
        if self.create_failing.load(Ordering::SeqCst) {
            return Err(Error::Lifecycle("create disabled".to_string()));
        }
        let mut inner = self.inner.lock().unwrap();
        let handle = WorkerHandle::new(format!("worker-{}", inner.created));
        inner.workers.push(WorkerStatus {
            handle: handle.clone(),
            address: Some(format!("http://{}", handle)),
            state: self.initial_state,
        });
        inner.created += 1;
        Ok(handle)
    }

    async fn stop_worker(&self, handle: &WorkerHandle) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.workers.retain(|w| &w.handle != handle);
        inner.stopped.push(handle.clone());
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerStatus>> {
        if self.list_failing.load(Ordering::SeqCst) {
            return Err(Error::Lifecycle("list disabled".to_string()));
        }
        Ok(self.inner.lock().unwrap().workers.clone())
    }
}

/// Balancer stand-in with a settable pending count.
pub struct MockBalancerHandle {
    pending: AtomicUsize,
    failing: AtomicBool,
    updates: StdMutex<Vec<Vec<String>>>,
}

impl MockBalancerHandle {
    pub fn new(pending: usize) -> Self {
        Self {
            pending: AtomicUsize::new(pending),
            failing: AtomicBool::new(false),
            updates: StdMutex::new(Vec::new()),
        }
    }

    pub fn set_pending(&self, pending: usize) {
        self.pending.store(pending, Ordering::SeqCst);
    }

    /// Make every call fail as if the balancer were unreachable.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn updates(&self) -> Vec<Vec<String>> {
        self.updates.lock().unwrap().clone()
    }

    pub fn last_update(&self) -> Option<Vec<String>> {
        self.updates.lock().unwrap().last().cloned()
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::ScalingMetricsUnavailable(
                "balancer unreachable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BalancerHandle for MockBalancerHandle {
    async fn update_servers(&self, servers: Vec<String>) -> Result<()> {
        self.check()?;
        self.updates.lock().unwrap().push(servers);
        Ok(())
    }

    async fn num_pending_requests(&self) -> Result<usize> {
        self.check()?;
        Ok(self.pending.load(Ordering::SeqCst))
    }
}
