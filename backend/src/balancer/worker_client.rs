//! Batched RPC to inference workers.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use autobatch_common::{BatchRequest, BatchResponse};

use crate::error::{Error, Result};

/// Sends one batch of payloads to one worker.
///
/// Implementations return the worker's outputs as-is; checking that there is
/// one output per input is left to the dispatcher.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn predict(&self, address: &str, inputs: Vec<Value>, timeout: Duration)
        -> Result<Vec<Value>>;
}

/// JSON-over-HTTP worker client.
pub struct HttpWorkerClient {
    http_client: Client,
    endpoint: String,
}

impl HttpWorkerClient {
    pub fn new(endpoint: &str) -> Self {
        Self {
            http_client: Client::new(),
            endpoint: endpoint.to_string(),
        }
    }

    fn url(&self, address: &str) -> String {
        format!("{}{}", address.trim_end_matches('/'), self.endpoint)
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn predict(
        &self,
        address: &str,
        inputs: Vec<Value>,
        timeout: Duration,
    ) -> Result<Vec<Value>> {
        let url = self.url(address);
        let body = BatchRequest::new(inputs);

        let response = self
            .http_client
            .post(&url)
            .header("accept", "application/json")
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(Error::from_transport)?;

        let status = response.status();
        if status == StatusCode::REQUEST_TIMEOUT {
            return Err(Error::Timeout(format!("worker {} answered 408", address)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::BackendError(format!("HTTP {}: {}", status, body)));
        }

        let batch: BatchResponse = response.json().await.map_err(Error::from_transport)?;
        Ok(batch.outputs)
    }
}
