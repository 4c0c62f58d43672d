//! Autoscaling control loop.
//!
//! On every tick the autoscaler pushes the ready worker addresses into the
//! balancer, reads the pending-request and pending-worker counts, asks the
//! [`ScalingPolicy`] for a target and creates or stops replicas one at a time
//! to reach it. Ticks closer together than the configured interval do nothing.

mod balancer_handle;
mod policy;

pub use balancer_handle::{BalancerHandle, RemoteBalancer};
pub use policy::{DefaultScalingPolicy, ScalingMetrics, ScalingPolicy};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::AutoscalerConfig;
use crate::error::{Error, Result};
use crate::lifecycle::{WorkerHandle, WorkerLifecycle, WorkerState, WorkerStatus};

/// Replica bookkeeping owned by the control loop.
#[derive(Debug)]
pub struct ScalingState {
    /// Replicas in creation order; the last one is removed first.
    replicas: Vec<WorkerHandle>,
    min_replicas: usize,
    max_replicas: usize,
    last_scale_time: Instant,
}

impl ScalingState {
    pub fn current_replica_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn replicas(&self) -> &[WorkerHandle] {
        &self.replicas
    }

    pub fn min_replicas(&self) -> usize {
        self.min_replicas
    }

    pub fn max_replicas(&self) -> usize {
        self.max_replicas
    }

    pub fn last_scale_time(&self) -> Instant {
        self.last_scale_time
    }

    fn clamp(&self, target: usize) -> usize {
        target.clamp(self.min_replicas, self.max_replicas)
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Called again within the autoscale interval.
    Skipped,
    Unchanged { replicas: usize },
    Scaled { from: usize, to: usize },
}

/// Periodic replica-count controller.
pub struct AutoScaler {
    lifecycle: Arc<dyn WorkerLifecycle>,
    balancer: Arc<dyn BalancerHandle>,
    policy: Box<dyn ScalingPolicy>,
    interval: Duration,
    state: ScalingState,
}

impl AutoScaler {
    pub fn new(
        config: &AutoscalerConfig,
        lifecycle: Arc<dyn WorkerLifecycle>,
        balancer: Arc<dyn BalancerHandle>,
        policy: Box<dyn ScalingPolicy>,
    ) -> Result<Self> {
        if config.max_replicas < config.min_replicas {
            return Err(Error::Internal(format!(
                "max_replicas={} must be greater than or equal to min_replicas={}",
                config.max_replicas, config.min_replicas
            )));
        }

        Ok(Self {
            lifecycle,
            balancer,
            policy,
            interval: config.autoscale_interval(),
            state: ScalingState {
                replicas: Vec::new(),
                min_replicas: config.min_replicas,
                max_replicas: config.max_replicas,
                last_scale_time: Instant::now(),
            },
        })
    }

    pub fn state(&self) -> &ScalingState {
        &self.state
    }

    pub fn policy_name(&self) -> &str {
        self.policy.name()
    }

    /// Create the initial `min_replicas` workers and publish what is ready.
    pub async fn bootstrap(&mut self) -> Result<()> {
        tracing::info!(
            "Starting {} initial worker(s) (policy: {})",
            self.state.min_replicas,
            self.policy.name()
        );
        while self.state.replicas.len() < self.state.min_replicas {
            self.add_replica().await?;
        }
        self.publish_servers().await
    }

    /// Run one control-loop step now.
    pub async fn tick(&mut self) -> Result<TickOutcome> {
        self.tick_at(Instant::now()).await
    }

    /// Run one control-loop step as if the current time were `now`.
    ///
    /// Metrics failures return `ScalingMetricsUnavailable` before any replica
    /// is touched; the next tick retries from scratch.
    pub async fn tick_at(&mut self, now: Instant) -> Result<TickOutcome> {
        if now.saturating_duration_since(self.state.last_scale_time) < self.interval {
            return Ok(TickOutcome::Skipped);
        }

        let statuses = self.list_workers().await?;
        let (addresses, pending_workers) = self.split_statuses(&statuses);
        self.balancer.update_servers(addresses).await?;
        let pending_requests = self.balancer.num_pending_requests().await?;

        self.prune_stopped(&statuses);

        let metrics = ScalingMetrics {
            pending_requests,
            pending_workers,
        };
        let current = self.state.replicas.len();
        let target = self.state.clamp(self.policy.decide(current, &metrics));
        tracing::debug!(
            "Autoscale tick: {} replica(s), {:?}, target {}",
            current,
            metrics,
            target
        );

        if target > current {
            for _ in current..target {
                tracing::info!(
                    "Upscaling from {} to {}",
                    self.state.replicas.len(),
                    self.state.replicas.len() + 1
                );
                if let Err(e) = self.add_replica().await {
                    tracing::error!("Failed to create worker: {}", e);
                    break;
                }
            }
        } else {
            for _ in target..current {
                tracing::info!(
                    "Downscaling from {} to {}",
                    self.state.replicas.len(),
                    self.state.replicas.len() - 1
                );
                self.remove_replica().await;
            }
        }

        if let Err(e) = self.publish_servers().await {
            tracing::warn!("Failed to push servers after scaling: {}", e);
        }
        self.state.last_scale_time = now;

        let to = self.state.replicas.len();
        Ok(if to == current {
            TickOutcome::Unchanged { replicas: to }
        } else {
            TickOutcome::Scaled { from: current, to }
        })
    }

    /// Tick forever. Errors are logged and the loop carries on.
    ///
    /// Each step is stamped with the ticker's scheduled instant rather than
    /// the wake-up time, so a wake that lands a little late never pushes the
    /// next one inside the interval.
    pub async fn run(mut self) {
        let period = self.interval.max(Duration::from_millis(100));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let scheduled = ticker.tick().await;
            match self.tick_at(scheduled).await {
                Ok(TickOutcome::Scaled { from, to }) => {
                    tracing::info!("Scaled from {} to {} replica(s)", from, to);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Autoscale tick aborted: {}", e);
                }
            }
        }
    }

    async fn list_workers(&self) -> Result<Vec<WorkerStatus>> {
        self.lifecycle
            .list_workers()
            .await
            .map_err(|e| Error::ScalingMetricsUnavailable(e.to_string()))
    }

    /// Running addresses in replica order, and the number still starting.
    fn split_statuses(&self, statuses: &[WorkerStatus]) -> (Vec<String>, usize) {
        let by_handle: HashMap<&WorkerHandle, &WorkerStatus> =
            statuses.iter().map(|s| (&s.handle, s)).collect();

        let mut addresses = Vec::new();
        let mut pending = 0;
        for handle in &self.state.replicas {
            let Some(status) = by_handle.get(handle) else {
                continue;
            };
            match status.state {
                WorkerState::Pending => pending += 1,
                state if state.is_dispatchable() => {
                    if let Some(address) = &status.address {
                        addresses.push(address.clone());
                    }
                }
                _ => {}
            }
        }
        (addresses, pending)
    }

    /// Forget replicas that died or vanished on their own.
    fn prune_stopped(&mut self, statuses: &[WorkerStatus]) {
        let alive: HashMap<&WorkerHandle, WorkerState> =
            statuses.iter().map(|s| (&s.handle, s.state)).collect();
        self.state.replicas.retain(|handle| match alive.get(handle) {
            Some(WorkerState::Stopped) | None => {
                tracing::warn!("Worker {} is gone, dropping it", handle);
                false
            }
            Some(_) => true,
        });
    }

    async fn add_replica(&mut self) -> Result<()> {
        let handle = self.lifecycle.create_worker().await?;
        tracing::info!("Work created: '{}'", handle);
        self.state.replicas.push(handle);
        Ok(())
    }

    async fn remove_replica(&mut self) {
        let Some(handle) = self.state.replicas.pop() else {
            return;
        };
        match self.lifecycle.stop_worker(&handle).await {
            Ok(()) => tracing::info!("Work removed: '{}'", handle),
            Err(e) => tracing::error!("Failed to stop worker {}: {}", handle, e),
        }
    }

    async fn publish_servers(&self) -> Result<()> {
        let statuses = self.list_workers().await?;
        let (addresses, _) = self.split_statuses(&statuses);
        self.balancer.update_servers(addresses).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{test_config, MockBalancerHandle, MockLifecycle};

    fn autoscaler(
        min_replicas: usize,
        max_replicas: usize,
        lifecycle: Arc<MockLifecycle>,
        balancer: Arc<MockBalancerHandle>,
    ) -> AutoScaler {
        let mut config = test_config().autoscaler;
        config.min_replicas = min_replicas;
        config.max_replicas = max_replicas;
        config.autoscale_interval_secs = 10;
        AutoScaler::new(
            &config,
            lifecycle,
            balancer,
            Box::new(DefaultScalingPolicy::new(8)),
        )
        .unwrap()
    }

    fn later(scaler: &AutoScaler, secs: u64) -> Instant {
        scaler.state().last_scale_time() + Duration::from_secs(secs)
    }

    #[test]
    fn test_rejects_max_below_min() {
        let mut config = test_config().autoscaler;
        config.min_replicas = 3;
        config.max_replicas = 2;
        let result = AutoScaler::new(
            &config,
            Arc::new(MockLifecycle::new()),
            Arc::new(MockBalancerHandle::new(0)),
            Box::new(DefaultScalingPolicy::new(8)),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bootstrap_creates_min_replicas() {
        let lifecycle = Arc::new(MockLifecycle::new());
        let balancer = Arc::new(MockBalancerHandle::new(0));
        let mut scaler = autoscaler(2, 4, lifecycle.clone(), balancer.clone());

        scaler.bootstrap().await.unwrap();
        assert_eq!(scaler.state().current_replica_count(), 2);
        assert_eq!(lifecycle.created(), 2);
        assert_eq!(
            balancer.last_update(),
            Some(vec!["http://worker-0".to_string(), "http://worker-1".to_string()])
        );
    }

    #[tokio::test]
    async fn test_tick_within_interval_is_noop() {
        let lifecycle = Arc::new(MockLifecycle::new());
        let balancer = Arc::new(MockBalancerHandle::new(1000));
        let mut scaler = autoscaler(1, 4, lifecycle.clone(), balancer.clone());
        scaler.bootstrap().await.unwrap();
        let updates_before = balancer.updates().len();

        let outcome = scaler.tick_at(later(&scaler, 5)).await.unwrap();
        assert_eq!(outcome, TickOutcome::Skipped);
        assert_eq!(scaler.state().current_replica_count(), 1);
        assert_eq!(lifecycle.created(), 1);
        assert_eq!(balancer.updates().len(), updates_before);
    }

    #[tokio::test]
    async fn test_heavy_load_adds_exactly_one_replica() {
        let lifecycle = Arc::new(MockLifecycle::new());
        let balancer = Arc::new(MockBalancerHandle::new(1000));
        let mut scaler = autoscaler(1, 4, lifecycle.clone(), balancer.clone());
        scaler.bootstrap().await.unwrap();

        let now = later(&scaler, 10);
        let outcome = scaler.tick_at(now).await.unwrap();
        assert_eq!(outcome, TickOutcome::Scaled { from: 1, to: 2 });
        assert_eq!(scaler.state().last_scale_time(), now);
        assert_eq!(
            balancer.last_update(),
            Some(vec!["http://worker-0".to_string(), "http://worker-1".to_string()])
        );
    }

    #[tokio::test]
    async fn test_idle_scales_down_to_min() {
        let lifecycle = Arc::new(MockLifecycle::new());
        let balancer = Arc::new(MockBalancerHandle::new(1000));
        let mut scaler = autoscaler(1, 3, lifecycle.clone(), balancer.clone());
        scaler.bootstrap().await.unwrap();
        scaler.tick_at(later(&scaler, 10)).await.unwrap();
        scaler.tick_at(later(&scaler, 10)).await.unwrap();
        assert_eq!(scaler.state().current_replica_count(), 3);

        balancer.set_pending(0);
        let outcome = scaler.tick_at(later(&scaler, 10)).await.unwrap();
        assert_eq!(outcome, TickOutcome::Scaled { from: 3, to: 2 });
        // Highest-indexed replica goes first.
        assert_eq!(lifecycle.stopped(), vec![WorkerHandle::new("worker-2")]);

        scaler.tick_at(later(&scaler, 10)).await.unwrap();
        let outcome = scaler.tick_at(later(&scaler, 10)).await.unwrap();
        assert_eq!(outcome, TickOutcome::Unchanged { replicas: 1 });
        assert_eq!(scaler.state().current_replica_count(), 1);
    }

    #[tokio::test]
    async fn test_never_exceeds_max_replicas() {
        let lifecycle = Arc::new(MockLifecycle::new());
        let balancer = Arc::new(MockBalancerHandle::new(1_000_000));
        let mut scaler = autoscaler(1, 2, lifecycle.clone(), balancer);
        scaler.bootstrap().await.unwrap();

        for _ in 0..5 {
            scaler.tick_at(later(&scaler, 10)).await.unwrap();
            assert!(scaler.state().current_replica_count() <= 2);
        }
        assert_eq!(lifecycle.created(), 2);
    }

    #[tokio::test]
    async fn test_pending_workers_only_published_once_running() {
        let lifecycle = Arc::new(MockLifecycle::with_initial_state(WorkerState::Pending));
        let balancer = Arc::new(MockBalancerHandle::new(0));
        let mut scaler = autoscaler(1, 4, lifecycle.clone(), balancer.clone());
        scaler.bootstrap().await.unwrap();
        assert_eq!(balancer.last_update(), Some(vec![]));

        lifecycle.set_state(&WorkerHandle::new("worker-0"), WorkerState::Running);
        scaler.tick_at(later(&scaler, 10)).await.unwrap();
        assert_eq!(
            balancer.last_update(),
            Some(vec!["http://worker-0".to_string()])
        );
    }

    #[tokio::test]
    async fn test_metrics_failure_aborts_tick() {
        let lifecycle = Arc::new(MockLifecycle::new());
        let balancer = Arc::new(MockBalancerHandle::new(1000));
        let mut scaler = autoscaler(1, 4, lifecycle.clone(), balancer.clone());
        scaler.bootstrap().await.unwrap();
        let before = scaler.state().last_scale_time();

        balancer.set_failing(true);
        let err = scaler.tick_at(later(&scaler, 10)).await.unwrap_err();
        assert!(matches!(err, Error::ScalingMetricsUnavailable(_)));
        assert_eq!(scaler.state().current_replica_count(), 1);
        assert_eq!(scaler.state().last_scale_time(), before);
        assert_eq!(lifecycle.created(), 1);

        // Retried on the next tick once the balancer is back.
        balancer.set_failing(false);
        let outcome = scaler.tick_at(later(&scaler, 10)).await.unwrap();
        assert_eq!(outcome, TickOutcome::Scaled { from: 1, to: 2 });
    }

    #[tokio::test]
    async fn test_lifecycle_listing_failure_aborts_tick() {
        let lifecycle = Arc::new(MockLifecycle::new());
        let balancer = Arc::new(MockBalancerHandle::new(1000));
        let mut scaler = autoscaler(1, 4, lifecycle.clone(), balancer);
        scaler.bootstrap().await.unwrap();

        lifecycle.set_list_failing(true);
        let err = scaler.tick_at(later(&scaler, 10)).await.unwrap_err();
        assert!(matches!(err, Error::ScalingMetricsUnavailable(_)));
        assert_eq!(lifecycle.created(), 1);
    }

    #[tokio::test]
    async fn test_create_failure_keeps_count_consistent() {
        let lifecycle = Arc::new(MockLifecycle::new());
        let balancer = Arc::new(MockBalancerHandle::new(1000));
        let mut scaler = autoscaler(1, 4, lifecycle.clone(), balancer);
        scaler.bootstrap().await.unwrap();

        lifecycle.set_create_failing(true);
        let outcome = scaler.tick_at(later(&scaler, 10)).await.unwrap();
        assert_eq!(outcome, TickOutcome::Unchanged { replicas: 1 });
    }

    /// Let the spawned control loop finish whatever step is ready.
    async fn settle() {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    fn looping_autoscaler(
        lifecycle: Arc<MockLifecycle>,
        balancer: Arc<MockBalancerHandle>,
    ) -> AutoScaler {
        let mut config = test_config().autoscaler;
        config.min_replicas = 1;
        config.max_replicas = 100;
        config.autoscale_interval_secs = 1;
        AutoScaler::new(
            &config,
            lifecycle,
            balancer,
            Box::new(DefaultScalingPolicy::new(8)),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_scales_once_per_interval_despite_late_wakes() {
        let lifecycle = Arc::new(MockLifecycle::new());
        let balancer = Arc::new(MockBalancerHandle::new(1_000_000));
        let mut scaler = looping_autoscaler(lifecycle.clone(), balancer.clone());
        scaler.bootstrap().await.unwrap();

        let handle = tokio::spawn(scaler.run());
        settle().await;
        assert_eq!(lifecycle.created(), 1);

        // First wake lands 3ms late, the second one on schedule.
        tokio::time::advance(Duration::from_millis(1003)).await;
        settle().await;
        assert_eq!(lifecycle.created(), 2);

        tokio::time::advance(Duration::from_millis(997)).await;
        settle().await;
        assert_eq!(lifecycle.created(), 3);

        for expected in 4..=6 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
            assert_eq!(lifecycle.created(), expected);
        }

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_survives_unavailable_metrics() {
        let lifecycle = Arc::new(MockLifecycle::new());
        let balancer = Arc::new(MockBalancerHandle::new(1_000_000));
        let mut scaler = looping_autoscaler(lifecycle.clone(), balancer.clone());
        scaler.bootstrap().await.unwrap();

        let handle = tokio::spawn(scaler.run());
        settle().await;

        balancer.set_failing(true);
        for _ in 0..2 {
            tokio::time::advance(Duration::from_secs(1)).await;
            settle().await;
        }
        assert_eq!(lifecycle.created(), 1);
        assert!(!handle.is_finished());

        balancer.set_failing(false);
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(lifecycle.created(), 2);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(lifecycle.created(), 3);

        handle.abort();
    }

    #[tokio::test]
    async fn test_dead_worker_is_replaced() {
        let lifecycle = Arc::new(MockLifecycle::new());
        let balancer = Arc::new(MockBalancerHandle::new(0));
        let mut scaler = autoscaler(1, 4, lifecycle.clone(), balancer.clone());
        scaler.bootstrap().await.unwrap();

        lifecycle.set_state(&WorkerHandle::new("worker-0"), WorkerState::Stopped);
        let outcome = scaler.tick_at(later(&scaler, 10)).await.unwrap();
        assert_eq!(outcome, TickOutcome::Scaled { from: 0, to: 1 });
        assert_eq!(
            scaler.state().replicas(),
            &[WorkerHandle::new("worker-1")][..]
        );
        assert_eq!(
            balancer.last_update(),
            Some(vec!["http://worker-1".to_string()])
        );
    }
}
