//! Subprocess-backed worker lifecycle.
//!
//! Each replica is one child process started from the configured command
//! template, listening on its own port. A background task polls the worker's
//! health endpoint and promotes it from `Pending` to `Running`. Workers that
//! time out or die on their own are listed once as `Stopped` and then
//! forgotten, which frees their port.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{WorkerHandle, WorkerLifecycle, WorkerState, WorkerStatus};
use crate::config::WorkerProcessConfig;
use crate::error::{Error, Result};

const HEALTH_CHECK_INTERVAL_MS: u64 = 500;

/// One spawned worker process.
struct WorkerProcess {
    handle: WorkerHandle,
    port: u16,
    address: String,
    state: RwLock<WorkerState>,
    process: RwLock<Option<Child>>,
}

impl WorkerProcess {
    fn new(handle: WorkerHandle, host: &str, port: u16, process: Child) -> Self {
        Self {
            handle,
            port,
            address: format!("http://{}:{}", host, port),
            state: RwLock::new(WorkerState::Pending),
            process: RwLock::new(Some(process)),
        }
    }

    async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    async fn set_state(&self, state: WorkerState) {
        *self.state.write().await = state;
    }

    /// Check if the worker process is still alive.
    async fn is_process_alive(&self) -> bool {
        let mut process = self.process.write().await;
        match process.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Terminate the worker process gracefully, killing it after `timeout`.
    async fn terminate(&self, timeout: Duration) {
        self.set_state(WorkerState::Stopping).await;

        let mut process_guard = self.process.write().await;
        if let Some(mut child) = process_guard.take() {
            // Try SIGTERM first on Unix
            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                if let Some(pid) = child.id() {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                }
            }

            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    tracing::debug!("Worker {} exited with {}", self.handle, status);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Error waiting for worker {}: {}", self.handle, e);
                }
                Err(_timeout) => {
                    tracing::warn!("Worker {} didn't stop gracefully, killing", self.handle);
                    let _ = child.kill().await;
                }
            }
        }

        self.set_state(WorkerState::Stopped).await;
    }
}

/// Spawns one subprocess per worker replica.
pub struct ProcessLifecycle {
    config: WorkerProcessConfig,
    http_client: Client,
    workers: RwLock<HashMap<WorkerHandle, Arc<WorkerProcess>>>,
    created: AtomicUsize,
}

impl ProcessLifecycle {
    pub fn new(config: WorkerProcessConfig) -> Self {
        Self {
            config,
            http_client: Client::builder()
                .timeout(Duration::from_secs(5))
                .build()
                .unwrap_or_default(),
            workers: RwLock::new(HashMap::new()),
            created: AtomicUsize::new(0),
        }
    }

    /// Allocate a port for a new worker.
    async fn allocate_port(&self) -> Result<u16> {
        if let Some(base) = self.config.base_port {
            let workers = self.workers.read().await;
            let used: HashSet<u16> = workers.values().map(|w| w.port).collect();
            for offset in 0..1000u16 {
                let port = base.saturating_add(offset);
                if !used.contains(&port) {
                    return Ok(port);
                }
            }
            Err(Error::Lifecycle(format!(
                "No available ports in range {}-{}",
                base,
                base.saturating_add(1000)
            )))
        } else {
            // Use OS-assigned port
            let listener = TcpListener::bind(format!("{}:0", self.config.host))
                .await
                .map_err(|e| Error::Lifecycle(format!("Failed to bind for port allocation: {}", e)))?;
            let port = listener
                .local_addr()
                .map_err(|e| Error::Lifecycle(format!("Failed to get local addr: {}", e)))?
                .port();
            drop(listener);
            Ok(port)
        }
    }

    fn render_args(&self, port: u16) -> Vec<String> {
        self.config
            .args
            .iter()
            .map(|arg| {
                arg.replace("{port}", &port.to_string())
                    .replace("{host}", &self.config.host)
            })
            .collect()
    }

    /// Drop workers that ended up `Stopped` on their own, freeing their ports.
    async fn reap_stopped(&self) {
        let mut workers = self.workers.write().await;
        let mut stopped = Vec::new();
        for (handle, worker) in workers.iter() {
            if worker.state().await == WorkerState::Stopped {
                stopped.push(handle.clone());
            }
        }
        for handle in stopped {
            workers.remove(&handle);
            tracing::debug!("Forgot stopped worker {}", handle);
        }
    }

    fn next_handle(&self) -> WorkerHandle {
        let index = self.created.fetch_add(1, Ordering::SeqCst);
        WorkerHandle::new(format!("worker_{}_{}", index, Uuid::new_v4().simple()))
    }
}

/// Poll the worker until it answers its health check.
async fn wait_for_ready(
    client: Client,
    worker: Arc<WorkerProcess>,
    health_url: String,
    startup_timeout: Duration,
    shutdown_timeout: Duration,
) {
    let start = Instant::now();

    loop {
        // Stopped while starting up.
        if worker.state().await != WorkerState::Pending {
            return;
        }

        if start.elapsed() > startup_timeout {
            tracing::error!(
                "Worker {} startup timeout after {:?}",
                worker.handle,
                start.elapsed()
            );
            worker.terminate(shutdown_timeout).await;
            return;
        }

        if !worker.is_process_alive().await {
            tracing::error!("Worker {} process died during startup", worker.handle);
            worker.set_state(WorkerState::Stopped).await;
            return;
        }

        if let Ok(resp) = client.get(&health_url).send().await {
            if resp.status().is_success() {
                worker.set_state(WorkerState::Running).await;
                tracing::info!(
                    "Worker {} ready at {} ({:?})",
                    worker.handle,
                    worker.address,
                    start.elapsed()
                );
                return;
            }
        }

        tokio::time::sleep(Duration::from_millis(HEALTH_CHECK_INTERVAL_MS)).await;
    }
}

#[async_trait]
impl WorkerLifecycle for ProcessLifecycle {
    async fn create_worker(&self) -> Result<WorkerHandle> {
        self.reap_stopped().await;
        let port = self.allocate_port().await?;
        let handle = self.next_handle();

        let mut cmd = Command::new(&self.config.command);
        cmd.args(self.render_args(port))
            .env("PORT", port.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if self.config.log_output {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }

        let process = cmd.spawn().map_err(|e| {
            Error::Lifecycle(format!(
                "Failed to spawn worker {}: {}. Command: {}",
                handle, e, self.config.command
            ))
        })?;

        tracing::info!(
            "Spawned worker {} on port {} (pid: {:?})",
            handle,
            port,
            process.id()
        );

        let worker = Arc::new(WorkerProcess::new(
            handle.clone(),
            &self.config.host,
            port,
            process,
        ));
        self.workers
            .write()
            .await
            .insert(handle.clone(), worker.clone());

        let health_url = format!("{}{}", worker.address, self.config.health_path);
        tokio::spawn(wait_for_ready(
            self.http_client.clone(),
            worker,
            health_url,
            Duration::from_secs(self.config.startup_timeout_secs),
            Duration::from_secs(self.config.shutdown_timeout_secs),
        ));

        Ok(handle)
    }

    async fn stop_worker(&self, handle: &WorkerHandle) -> Result<()> {
        let worker = self
            .workers
            .write()
            .await
            .remove(handle)
            .ok_or_else(|| Error::Lifecycle(format!("Unknown worker {}", handle)))?;

        worker
            .terminate(Duration::from_secs(self.config.shutdown_timeout_secs))
            .await;
        tracing::info!("Worker {} stopped", handle);
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerStatus>> {
        let workers: Vec<Arc<WorkerProcess>> =
            self.workers.read().await.values().cloned().collect();

        let mut statuses = Vec::with_capacity(workers.len());
        for worker in workers {
            let mut state = worker.state().await;
            if state == WorkerState::Running && !worker.is_process_alive().await {
                tracing::warn!("Worker {} exited unexpectedly", worker.handle);
                worker.set_state(WorkerState::Stopped).await;
                state = WorkerState::Stopped;
            }
            statuses.push(WorkerStatus {
                handle: worker.handle.clone(),
                address: Some(worker.address.clone()),
                state,
            });
        }
        // Stopped workers are reported once, then forgotten.
        self.reap_stopped().await;

        statuses.sort_by(|a, b| a.handle.cmp(&b.handle));
        Ok(statuses)
    }
}

impl Drop for ProcessLifecycle {
    fn drop(&mut self) {
        // No async cleanup in Drop; children go away through kill_on_drop(true).
        tracing::debug!("ProcessLifecycle dropped, worker processes will be cleaned up");
    }
}
