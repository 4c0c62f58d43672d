//! Correlates request ids with their eventual outcome.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, Notify};

use super::batch_queue::RequestId;
use crate::error::Result;

/// Result of one request: the worker output or the failure that hit its batch.
pub type Outcome = Result<Value>;

/// Outcomes written by the dispatcher and waiting to be picked up by callers.
///
/// Waiters poll on a fixed interval and are additionally woken on every
/// write, so a result is usually picked up without waiting a full interval.
pub struct ResponseRegistry {
    outcomes: Mutex<HashMap<RequestId, Outcome>>,
    written: Notify,
    poll_interval: Duration,
}

impl ResponseRegistry {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            outcomes: Mutex::new(HashMap::new()),
            written: Notify::new(),
            poll_interval,
        }
    }

    /// Record the outcome for `id`.
    ///
    /// Each id is written once. A second write is a defect upstream; the newer
    /// outcome wins and the overwrite is logged.
    pub async fn write(&self, id: RequestId, outcome: Outcome) {
        let previous = self.outcomes.lock().await.insert(id, outcome);
        if previous.is_some() {
            tracing::warn!("Outcome for request {} written twice, keeping the latest", id);
        }
        self.written.notify_waiters();
    }

    /// Record several outcomes under one lock.
    pub async fn write_all(&self, outcomes: impl IntoIterator<Item = (RequestId, Outcome)>) {
        {
            let mut map = self.outcomes.lock().await;
            for (id, outcome) in outcomes {
                if map.insert(id, outcome).is_some() {
                    tracing::warn!("Outcome for request {} written twice, keeping the latest", id);
                }
            }
        }
        self.written.notify_waiters();
    }

    /// Remove and return the outcome for `id` if it has been written.
    pub async fn take(&self, id: &RequestId) -> Option<Outcome> {
        self.outcomes.lock().await.remove(id)
    }

    /// Wait until the outcome for `id` is written, then remove and return it.
    pub async fn await_outcome(&self, id: RequestId) -> Outcome {
        loop {
            // Register interest before checking so a write in between still wakes us.
            let notified = self.written.notified();
            if let Some(outcome) = self.take(&id).await {
                return outcome;
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Outcomes written but not yet collected.
    pub async fn len(&self) -> usize {
        self.outcomes.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.outcomes.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_write_then_await() {
        let registry = ResponseRegistry::new(Duration::from_millis(10));
        let id = RequestId::new();
        registry.write(id, Ok(json!("done"))).await;

        let outcome = registry.await_outcome(id).await;
        assert_eq!(outcome.unwrap(), json!("done"));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_await_blocks_until_written() {
        let registry = Arc::new(ResponseRegistry::new(Duration::from_secs(60)));
        let id = RequestId::new();

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.await_outcome(id).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        registry.write(id, Err(Error::Timeout("slow".into()))).await;

        // Poll interval is a minute, so only the write notification can wake it.
        let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_outcome_read_once() {
        let registry = ResponseRegistry::new(Duration::from_millis(10));
        let id = RequestId::new();
        registry.write(id, Ok(json!(1))).await;

        assert!(registry.take(&id).await.is_some());
        assert!(registry.take(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_double_write_keeps_latest() {
        let registry = ResponseRegistry::new(Duration::from_millis(10));
        let id = RequestId::new();
        registry.write(id, Ok(json!("first"))).await;
        registry.write(id, Ok(json!("second"))).await;

        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.await_outcome(id).await.unwrap(), json!("second"));
    }

    #[tokio::test]
    async fn test_unrelated_waiters_do_not_steal() {
        let registry = Arc::new(ResponseRegistry::new(Duration::from_millis(5)));
        let a = RequestId::new();
        let b = RequestId::new();

        let wait_b = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.await_outcome(b).await })
        };

        registry.write_all(vec![(a, Ok(json!("a")))]).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!wait_b.is_finished());
        assert_eq!(registry.len().await, 1);

        registry.write(b, Ok(json!("b"))).await;
        assert_eq!(wait_b.await.unwrap().unwrap(), json!("b"));
        assert_eq!(registry.await_outcome(a).await.unwrap(), json!("a"));
    }
}
