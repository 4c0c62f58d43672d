//! Batch dispatcher for processing queued requests.
//!
//! The dispatcher runs an async loop that cuts ready batches off the queue and
//! sends each one to the next worker in rotation without waiting for earlier
//! sends to finish. Every request of a batch ends up with exactly one outcome
//! in the response registry, whatever happens to the worker call.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;

use super::batch_queue::{BatchQueue, RequestBatch, RequestId};
use super::cold_start::ProcessedColdStartSet;
use super::registry::{Outcome, ResponseRegistry};
use super::worker_client::WorkerClient;
use super::worker_set::WorkerSet;
use crate::error::{Error, Result};

/// Batch dispatcher that processes queued requests.
pub struct Dispatcher {
    queue: Arc<BatchQueue>,
    worker_set: Arc<WorkerSet>,
    registry: Arc<ResponseRegistry>,
    cold_start_processed: Arc<Mutex<ProcessedColdStartSet>>,
    client: Arc<dyn WorkerClient>,
    inference_timeout: Duration,
    flush_interval: Duration,
    /// Requests cut from the queue whose outcome is not written yet.
    in_flight: AtomicUsize,
}

impl Dispatcher {
    /// Create a new batch dispatcher.
    pub fn new(
        queue: Arc<BatchQueue>,
        worker_set: Arc<WorkerSet>,
        registry: Arc<ResponseRegistry>,
        cold_start_processed: Arc<Mutex<ProcessedColdStartSet>>,
        client: Arc<dyn WorkerClient>,
        inference_timeout: Duration,
        flush_interval: Duration,
    ) -> Self {
        Self {
            queue,
            worker_set,
            registry,
            cold_start_processed,
            client,
            inference_timeout,
            flush_interval,
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Run the flush loop.
    ///
    /// This method runs indefinitely, checking the queue on a fixed interval.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            self.flush().await;
        }
    }

    /// Cut every ready batch and start sending each one in the background.
    ///
    /// Returns the number of batches started.
    pub async fn flush(self: &Arc<Self>) -> usize {
        let batches = self.queue.take_ready_batches().await;
        let started = batches.len();

        for batch in batches {
            self.in_flight.fetch_add(batch.len(), Ordering::SeqCst);
            tracing::debug!("Dispatching batch of {} requests", batch.len());

            let dispatcher = Arc::clone(self);
            tokio::spawn(async move {
                dispatcher.send(batch).await;
            });
        }

        started
    }

    /// Requests dispatched but not yet resolved.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Send one batch to the next worker and route the result.
    ///
    /// Callers of `send` outside of `flush` must not have counted the batch as
    /// in flight.
    async fn send(&self, batch: RequestBatch) {
        let count = batch.len();
        let (ids, payloads) = batch.into_parts();

        let result = self.call_worker(payloads).await;
        self.route(ids, result).await;

        self.in_flight.fetch_sub(count, Ordering::SeqCst);
    }

    /// One combined worker call, with the result count checked.
    async fn call_worker(&self, payloads: Vec<Value>) -> Result<Vec<Value>> {
        let expected = payloads.len();
        let address = self
            .worker_set
            .next_address()
            .await
            .ok_or(Error::NoHealthyWorkers)?;

        let call = self
            .client
            .predict(&address, payloads, self.inference_timeout);
        let outputs = match tokio::time::timeout(self.inference_timeout, call).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "worker {} did not answer within {:?}",
                    address, self.inference_timeout
                )))
            }
        };

        if outputs.len() != expected {
            return Err(Error::ResultCountMismatch {
                expected,
                actual: outputs.len(),
            });
        }
        Ok(outputs)
    }

    /// Fan the batch result out to one outcome per request.
    ///
    /// Ids already answered through the cold-start proxy are skipped and
    /// forgotten; nobody is waiting on them.
    async fn route(&self, ids: Vec<RequestId>, result: Result<Vec<Value>>) {
        let outcomes: Vec<(RequestId, Outcome)> = match result {
            Ok(outputs) => ids.into_iter().zip(outputs.into_iter().map(Ok)).collect(),
            Err(e) => {
                tracing::warn!("Batch of {} requests failed: {}", ids.len(), e);
                ids.into_iter().map(|id| (id, Err(e.clone()))).collect()
            }
        };

        let deliver: Vec<(RequestId, Outcome)> = {
            let mut processed = self.cold_start_processed.lock().await;
            outcomes
                .into_iter()
                .filter(|(id, _)| {
                    if processed.remove(id) {
                        tracing::debug!(
                            "Dropping batch result for {}, already answered by cold start proxy",
                            id
                        );
                        false
                    } else {
                        true
                    }
                })
                .collect()
        };

        self.registry.write_all(deliver).await;
    }
}
