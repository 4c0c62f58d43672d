//! Fallback path used while the worker pool is empty.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::batch_queue::RequestId;
use crate::error::{Error, Result};

/// Answers a single request when no worker is available.
///
/// Retries and backoff, if any, are the implementor's business.
#[async_trait]
pub trait ColdStartProxy: Send + Sync {
    async fn handle_request(&self, payload: &Value) -> Result<Value>;
}

/// Forwards the payload to another serving endpoint over HTTP.
pub struct HttpColdStartProxy {
    http_client: Client,
    proxy_url: String,
    timeout: Duration,
}

impl HttpColdStartProxy {
    pub fn new(proxy_url: &str, timeout: Duration) -> Self {
        Self {
            http_client: Client::new(),
            proxy_url: proxy_url.to_string(),
            timeout,
        }
    }

    pub fn proxy_url(&self) -> &str {
        &self.proxy_url
    }
}

#[async_trait]
impl ColdStartProxy for HttpColdStartProxy {
    async fn handle_request(&self, payload: &Value) -> Result<Value> {
        tracing::debug!("Forwarding request to cold start proxy at {}", self.proxy_url);

        let response = self
            .http_client
            .post(&self.proxy_url)
            .json(payload)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::ColdStartFailure(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::ColdStartFailure(format!("HTTP {}: {}", status, body)));
        }

        response
            .json()
            .await
            .map_err(|e| Error::ColdStartFailure(format!("invalid response body: {}", e)))
    }
}

/// Ids already answered through the cold-start proxy.
///
/// Bounded: once more than `capacity` ids are held, the oldest half is
/// forgotten. Removal only touches `members`; `order` keeps the stale id
/// until eviction skips over it or a compaction drops it.
#[derive(Debug)]
pub struct ProcessedColdStartSet {
    capacity: usize,
    order: VecDeque<RequestId>,
    members: HashSet<RequestId>,
}

impl ProcessedColdStartSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    pub fn insert(&mut self, id: RequestId) {
        if !self.members.insert(id) {
            return;
        }
        self.order.push_back(id);

        if self.members.len() > self.capacity {
            let keep = self.capacity / 2;
            while self.members.len() > keep {
                match self.order.pop_front() {
                    Some(old) => {
                        self.members.remove(&old);
                    }
                    None => break,
                }
            }
        }

        if self.order.len() > self.capacity * 2 {
            let members = &self.members;
            self.order.retain(|held| members.contains(held));
        }
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.members.contains(id)
    }

    /// Forget `id`, returning whether it was present.
    pub fn remove(&mut self, id: &RequestId) -> bool {
        self.members.remove(id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
