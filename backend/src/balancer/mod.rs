//! Request-batching load balancer.
//!
//! This module provides:
//! - Copy-on-write worker set with round-robin selection
//! - Batch queue with size and timeout flush triggers
//! - Dispatcher sending batches to workers and fanning results out
//! - Response registry correlating request ids with outcomes
//! - Cold-start fallback for when no worker is available

pub mod batch_queue;
pub mod cold_start;
pub mod dispatcher;
mod load_balancer;
pub mod metrics;
pub mod registry;
pub mod worker_client;
pub mod worker_set;

pub use batch_queue::{BatchQueue, BatchQueueConfig, RequestId};
pub use cold_start::{ColdStartProxy, HttpColdStartProxy, ProcessedColdStartSet};
pub use dispatcher::Dispatcher;
pub use load_balancer::LoadBalancer;
pub use registry::{Outcome, ResponseRegistry};
pub use worker_client::{HttpWorkerClient, WorkerClient};
pub use worker_set::{ServerChange, WorkerSet};
