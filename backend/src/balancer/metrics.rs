//! Client request counters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Counters updated around every client submission.
#[derive(Debug, Default)]
pub struct RequestMetrics {
    in_flight: AtomicUsize,
    total: AtomicU64,
    last_processing_time: Mutex<Duration>,
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request as started. The returned guard counts it as finished
    /// when dropped, including when the caller goes away mid-request.
    pub fn start(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            metrics: self,
            started: Instant::now(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn last_processing_time(&self) -> Duration {
        self.last_processing_time
            .lock()
            .map(|d| *d)
            .unwrap_or_default()
    }
}

pub struct InFlightGuard<'a> {
    metrics: &'a RequestMetrics,
    started: Instant,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut last) = self.metrics.last_processing_time.lock() {
            *last = self.started.elapsed();
        }
        self.metrics.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
