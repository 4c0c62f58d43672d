//! Copy-on-write set of dispatchable worker addresses.
//!
//! Readers take an `Arc` snapshot and round-robin within it; writers replace
//! the whole snapshot. A reader therefore sees either the old or the new set,
//! never a mix, and a replacement restarts the rotation at the first address.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

/// One immutable generation of the worker list.
#[derive(Debug, Default)]
pub struct WorkerSnapshot {
    addresses: Vec<String>,
    round_robin_counter: AtomicUsize,
}

impl WorkerSnapshot {
    fn new(addresses: Vec<String>) -> Self {
        Self {
            addresses,
            round_robin_counter: AtomicUsize::new(0),
        }
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Next address in rotation, wrapping at the end of the list.
    pub fn select_round_robin(&self) -> Option<&str> {
        let count = self.addresses.len();
        if count == 0 {
            return None;
        }
        let idx = self.round_robin_counter.fetch_add(1, Ordering::Relaxed) % count;
        Some(&self.addresses[idx])
    }
}

/// Difference between two generations, for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServerChange {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl ServerChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// The authoritative list of healthy workers.
#[derive(Debug, Default)]
pub struct WorkerSet {
    current: RwLock<Arc<WorkerSnapshot>>,
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_addresses(addresses: Vec<String>) -> Self {
        Self {
            current: RwLock::new(Arc::new(WorkerSnapshot::new(addresses))),
        }
    }

    /// Current generation.
    pub async fn snapshot(&self) -> Arc<WorkerSnapshot> {
        self.current.read().await.clone()
    }

    /// Pick the next worker of the current generation.
    pub async fn next_address(&self) -> Option<String> {
        self.snapshot().await.select_round_robin().map(str::to_string)
    }

    pub async fn is_empty(&self) -> bool {
        self.current.read().await.is_empty()
    }

    pub async fn len(&self) -> usize {
        self.current.read().await.len()
    }

    pub async fn addresses(&self) -> Vec<String> {
        self.current.read().await.addresses().to_vec()
    }

    /// Swap in a new address list.
    ///
    /// Replaying the same set of addresses is a no-op and keeps the current
    /// rotation; anything else installs a fresh generation.
    pub async fn replace(&self, addresses: Vec<String>) -> ServerChange {
        let mut deduped = Vec::with_capacity(addresses.len());
        let mut seen = BTreeSet::new();
        for address in addresses {
            if seen.insert(address.clone()) {
                deduped.push(address);
            }
        }

        let mut current = self.current.write().await;
        let old: BTreeSet<String> = current.addresses().iter().cloned().collect();
        let change = ServerChange {
            added: seen.difference(&old).cloned().collect(),
            removed: old.difference(&seen).cloned().collect(),
        };

        if !change.is_empty() {
            *current = Arc::new(WorkerSnapshot::new(deduped));
        }
        change
    }
}
