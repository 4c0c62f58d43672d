//! Worker lifecycle management.
//!
//! The autoscaler creates and stops workers through the [`WorkerLifecycle`]
//! trait and only observes their state. Workers move through
//! `Pending -> Running -> Stopping -> Stopped`.

mod process;

pub use process::ProcessLifecycle;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;

/// Lifecycle state of one replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Created, not answering health checks yet.
    Pending,
    /// Ready to receive batches.
    Running,
    /// Being shut down.
    Stopping,
    /// Gone.
    Stopped,
}

impl WorkerState {
    pub fn is_dispatchable(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Opaque reference to a created worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerHandle(String);

impl WorkerHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the lifecycle manager reports about a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub handle: WorkerHandle,
    /// Base URL, once one has been assigned.
    pub address: Option<String>,
    pub state: WorkerState,
}

/// Creates, stops and lists worker replicas.
#[async_trait]
pub trait WorkerLifecycle: Send + Sync {
    /// Start a new worker. Returns as soon as it is created; the worker is
    /// reported as `Pending` until it can take traffic.
    async fn create_worker(&self) -> Result<WorkerHandle>;

    async fn stop_worker(&self, handle: &WorkerHandle) -> Result<()>;

    async fn list_workers(&self) -> Result<Vec<WorkerStatus>>;
}
