use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, error, trace};

use super::backend::Backend;

/// Errors returned by pool mutations
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PoolError {
    #[error("backend {0} is already registered, remove it first")]
    Duplicate(String),

    #[error("backend {0} is not registered")]
    NotFound(String),
}

/// Concurrent registry of backends with round-robin failover selection.
///
/// Backends are keyed by address in an ordered map so snapshots iterate in a
/// stable order and rotation fairness is deterministic. The registry lock is
/// never held across a health check or a dial.
#[derive(Debug, Default)]
pub struct Pool {
    backends: RwLock<BTreeMap<String, Arc<Backend>>>,
    current: AtomicU64,
}

impl Pool {
    /// Create an empty pool. Construct once at startup and share via `Arc`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend; fails if the address is already present
    pub fn add(&self, backend: Backend) -> Result<(), PoolError> {
        let mut backends = self.backends.write().expect("pool lock poisoned");
        if backends.contains_key(&backend.addr) {
            return Err(PoolError::Duplicate(backend.addr.clone()));
        }

        backends.insert(backend.addr.clone(), Arc::new(backend));
        Ok(())
    }

    /// Remove a backend by address; in-flight connections through it are
    /// left to drain on their own
    pub fn remove(&self, addr: &str) -> Result<(), PoolError> {
        let mut backends = self.backends.write().expect("pool lock poisoned");
        if backends.remove(addr).is_none() {
            return Err(PoolError::NotFound(addr.to_string()));
        }
        Ok(())
    }

    /// Point-in-time snapshot of all backends
    pub fn all(&self) -> Vec<Arc<Backend>> {
        let backends = self.backends.read().expect("pool lock poisoned");
        backends.values().cloned().collect()
    }

    /// Snapshot filtered to backends alive at read time
    pub fn all_healthy(&self) -> Vec<Arc<Backend>> {
        let backends = self.backends.read().expect("pool lock poisoned");
        backends
            .values()
            .filter(|b| b.alive())
            .cloned()
            .collect()
    }

    /// Number of registered backends
    pub fn len(&self) -> usize {
        self.backends.read().expect("pool lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Select the next healthy backend, round-robin with failover.
    ///
    /// Returns `None` when no healthy backend exists; callers must treat
    /// that as "service unavailable" and close the waiting connection
    /// rather than retry here.
    pub fn next(&self) -> Option<Arc<Backend>> {
        let healthy = self.all_healthy();
        trace!("found {} available backends", healthy.len());

        if healthy.is_empty() {
            return None;
        }

        // Single atomic increment; races between concurrent callers only
        // perturb fairness, never correctness.
        let next = (self.current.fetch_add(1, Ordering::Relaxed) + 1) as usize % healthy.len();

        // Scan one full cycle from the starting offset. The alive() recheck
        // guards against a backend flipping unhealthy between the snapshot
        // and this scan.
        for i in next..next + healthy.len() {
            let idx = i % healthy.len();
            if healthy[idx].alive() {
                // Persist the landing index when entries were skipped so the
                // next call continues from here
                if i != next {
                    self.current.store(idx as u64, Ordering::Relaxed);
                }
                return Some(Arc::clone(&healthy[idx]));
            }
        }

        None
    }

    /// Run a health check on every backend.
    ///
    /// The registry lock is released before any probe starts, so slow
    /// probes never block add/remove/selection. A failing probe is logged
    /// and recorded on the backend; it never aborts the sweep.
    pub async fn check_all(&self) {
        let backends = self.all();

        for backend in backends {
            match backend.check().await {
                Ok(()) => debug!("health check successful for backend {}", backend.addr),
                Err(e) => error!("health check failed for backend {}: {}", backend.addr, e),
            }
        }
    }
}
