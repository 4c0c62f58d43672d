//! Request batching queue for the balancer.
//!
//! This module provides a FIFO queue of admitted requests that is cut into
//! batches either when `max_batch_size` requests are waiting or when the
//! batching timeout has elapsed since the previous cut.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

/// Opaque unique request token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Configuration for the batch queue.
#[derive(Debug, Clone)]
pub struct BatchQueueConfig {
    /// Largest batch handed to a worker.
    pub max_batch_size: usize,
    /// Maximum time to wait for a batch to fill.
    pub batch_timeout: Duration,
}

impl BatchQueueConfig {
    pub fn new(max_batch_size: usize, batch_timeout: Duration) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            batch_timeout,
        }
    }
}

impl Default for BatchQueueConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 8,
            batch_timeout: Duration::from_secs(1),
        }
    }
}

/// A request admitted but not yet dispatched.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub id: RequestId,
    pub payload: Value,
    pub admitted_at: DateTime<Utc>,
}

impl QueuedRequest {
    pub fn new(id: RequestId, payload: Value) -> Self {
        Self {
            id,
            payload,
            admitted_at: Utc::now(),
        }
    }
}

/// A batch of requests ready to be dispatched as one worker call.
#[derive(Debug)]
pub struct RequestBatch {
    pub requests: Vec<QueuedRequest>,
}

impl RequestBatch {
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn ids(&self) -> Vec<RequestId> {
        self.requests.iter().map(|r| r.id).collect()
    }

    /// Split into ids and payloads, preserving order.
    pub fn into_parts(self) -> (Vec<RequestId>, Vec<Value>) {
        self.requests.into_iter().map(|r| (r.id, r.payload)).unzip()
    }
}

struct QueueState {
    requests: VecDeque<QueuedRequest>,
    last_flush: Instant,
}

impl QueueState {
    fn is_ready(&self, config: &BatchQueueConfig, now: Instant) -> bool {
        if self.requests.is_empty() {
            return false;
        }
        // Dispatch if we have a full batch
        if self.requests.len() >= config.max_batch_size {
            return true;
        }
        // Dispatch a partial batch once we've waited long enough
        now.saturating_duration_since(self.last_flush) > config.batch_timeout
    }

    fn take_batch(&mut self, max_size: usize) -> Vec<QueuedRequest> {
        let take_count = max_size.min(self.requests.len());
        self.requests.drain(..take_count).collect()
    }
}

/// Main batch queue.
pub struct BatchQueue {
    config: BatchQueueConfig,
    state: Mutex<QueueState>,
}

impl BatchQueue {
    /// Create a new batch queue with the given configuration.
    pub fn new(config: BatchQueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState {
                requests: VecDeque::new(),
                last_flush: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> &BatchQueueConfig {
        &self.config
    }

    /// Append a request to the tail of the queue.
    pub async fn enqueue(&self, request: QueuedRequest) {
        self.state.lock().await.requests.push_back(request);
    }

    /// Whether the head of the queue should be cut now.
    pub async fn should_flush(&self) -> bool {
        self.state.lock().await.is_ready(&self.config, Instant::now())
    }

    /// Cut every batch that is ready right now.
    ///
    /// Full batches are cut back to back. A partial batch is only cut when the
    /// batching timeout has elapsed since the previous cut, so after a cut the
    /// remainder waits for either a full batch or another timeout.
    pub async fn take_ready_batches(&self) -> Vec<RequestBatch> {
        let mut state = self.state.lock().await;
        let mut batches = vec![];

        loop {
            let now = Instant::now();
            if !state.is_ready(&self.config, now) {
                break;
            }
            let requests = state.take_batch(self.config.max_batch_size);
            state.last_flush = now;
            batches.push(RequestBatch { requests });
        }

        batches
    }

    /// Number of requests waiting to be cut.
    pub async fn len(&self) -> usize {
        self.state.lock().await.requests.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.requests.is_empty()
    }
}
