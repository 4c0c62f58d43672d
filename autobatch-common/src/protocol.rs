//! HTTP protocol types for balancer-worker and admin communication.
//!
//! # Worker RPC
//!
//! The balancer sends one combined call per batch:
//!
//! ```text
//! POST {worker}{endpoint}   {"inputs": [p0, p1, ...]}
//! 200 OK                    {"outputs": [o0, o1, ...]}
//! ```
//!
//! Outputs are matched to inputs positionally, so a worker must return exactly
//! one output per input, in the same order.
//!
//! # Admin surface
//!
//! - `GET /num-requests` returns the pending request count as a bare integer.
//! - `GET /system/info` returns [`SystemInfo`].
//! - `PUT /system/update-servers` takes the full replacement address list.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body of a batched worker call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequest {
    pub inputs: Vec<Value>,
}

impl BatchRequest {
    pub fn new(inputs: Vec<Value>) -> Self {
        Self { inputs }
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

/// Body returned by a worker for a batched call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub outputs: Vec<Value>,
}

/// Snapshot returned by `GET /system/info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Number of dispatchable workers.
    pub num_workers: usize,
    /// Worker addresses in round-robin order.
    pub servers: Vec<String>,
    /// Client requests currently in flight.
    pub num_requests: usize,
    /// Duration of the most recently completed client request.
    pub processing_time_secs: f64,
    /// Client requests seen since startup.
    pub global_request_count: u64,
    /// Queued plus dispatched-but-unresolved requests.
    #[serde(default)]
    pub pending_requests: usize,
}
