//! Scaling decisions.

use serde::Serialize;

/// Load observed at the start of a tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScalingMetrics {
    /// Requests admitted by the balancer and not resolved yet.
    pub pending_requests: usize,
    /// Replicas created but not ready for traffic.
    pub pending_workers: usize,
}

/// Pluggable scaling strategy.
///
/// `decide` returns the wanted replica count; the autoscaler clamps it to
/// `[min_replicas, max_replicas]` and moves at most as far as the result says.
pub trait ScalingPolicy: Send + Sync {
    fn name(&self) -> &str;

    fn decide(&self, current_replicas: usize, metrics: &ScalingMetrics) -> usize;
}

/// Pending requests per replica compared against the batch size.
///
/// Scales out by one when each running or starting replica has at least a full
/// batch waiting, and in by one when it has less than a quarter of one.
///
/// One case departs from those load rules: with no replica running or
/// starting and requests pending, load would read as zero, yet the policy
/// asks for one replica so demand can bring a pool up from nothing. This only
/// matters with `min_replicas = 0`.
#[derive(Debug, Clone)]
pub struct DefaultScalingPolicy {
    max_batch_size: usize,
}

impl DefaultScalingPolicy {
    pub fn new(max_batch_size: usize) -> Self {
        Self { max_batch_size }
    }

    fn load(current_replicas: usize, metrics: &ScalingMetrics) -> f64 {
        let denominator = current_replicas + metrics.pending_workers;
        if denominator == 0 {
            return 0.0;
        }
        metrics.pending_requests as f64 / denominator as f64
    }
}

impl ScalingPolicy for DefaultScalingPolicy {
    fn name(&self) -> &str {
        "default"
    }

    fn decide(&self, current_replicas: usize, metrics: &ScalingMetrics) -> usize {
        // Nothing running or starting: any demand needs a first replica.
        if current_replicas + metrics.pending_workers == 0 {
            return if metrics.pending_requests > 0 { 1 } else { 0 };
        }

        let load = Self::load(current_replicas, metrics);
        let max_per_worker = self.max_batch_size as f64;

        if load >= max_per_worker {
            return current_replicas + 1;
        }
        if load < max_per_worker * 0.25 {
            return current_replicas.saturating_sub(1);
        }
        current_replicas
    }
}
