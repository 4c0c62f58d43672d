//! How the autoscaler reaches the load balancer.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::balancer::LoadBalancer;
use crate::error::{Error, Result};

/// The two balancer operations the control loop needs.
#[async_trait]
pub trait BalancerHandle: Send + Sync {
    /// Replace the balancer's dispatchable worker addresses.
    async fn update_servers(&self, servers: Vec<String>) -> Result<()>;

    async fn num_pending_requests(&self) -> Result<usize>;
}

#[async_trait]
impl BalancerHandle for LoadBalancer {
    async fn update_servers(&self, servers: Vec<String>) -> Result<()> {
        LoadBalancer::update_servers(self, servers).await;
        Ok(())
    }

    async fn num_pending_requests(&self) -> Result<usize> {
        Ok(LoadBalancer::num_pending_requests(self).await)
    }
}

/// A balancer running in another process, driven over its admin endpoints.
pub struct RemoteBalancer {
    http_client: Client,
    base_url: String,
    auth_secret: Option<String>,
}

impl RemoteBalancer {
    pub fn new(base_url: &str, auth_secret: Option<String>) -> Self {
        Self {
            http_client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_secret,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

fn unavailable(e: impl std::fmt::Display) -> Error {
    Error::ScalingMetricsUnavailable(e.to_string())
}

#[async_trait]
impl BalancerHandle for RemoteBalancer {
    async fn update_servers(&self, servers: Vec<String>) -> Result<()> {
        let url = format!("{}/system/update-servers", self.base_url);
        let mut request = self.http_client.put(&url).json(&servers);
        if let Some(secret) = &self.auth_secret {
            request = request.bearer_auth(secret);
        }

        let response = request.send().await.map_err(unavailable)?;
        if !response.status().is_success() {
            return Err(unavailable(format!(
                "update-servers returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn num_pending_requests(&self) -> Result<usize> {
        let url = format!("{}/num-requests", self.base_url);
        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(unavailable)?;
        if !response.status().is_success() {
            return Err(unavailable(format!(
                "num-requests returned HTTP {}",
                response.status()
            )));
        }
        response.json::<usize>().await.map_err(unavailable)
    }
}
