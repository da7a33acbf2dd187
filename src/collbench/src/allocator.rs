//! Fixed-shape placement acquisition under a deadline.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

pub type PlacementId = usize;

/// Resources reserved on one physical host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRequest {
    pub gpus: usize,
    pub cpus: usize,
}

/// One granted bundle, pinned to a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleGrant {
    pub host: String,
    pub gpus: usize,
    pub cpus: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementStrategy {
    /// Every bundle lands on a physically distinct host. Overlapping
    /// placement would invalidate the benchmark's topology assumptions.
    Spread,
    /// Bundles may share hosts as long as capacity suffices.
    Pack,
}

/// Immutable once submitted.
#[derive(Debug, Clone)]
pub struct ClusterRequest {
    pub num_nodes: usize,
    pub bundle: BundleRequest,
    pub timeout: Duration,
}

/// The cluster resource manager as seen by this crate.
pub trait ClusterManager: Send + Sync {
    fn submit(&self, bundles: &[BundleRequest], strategy: PlacementStrategy) -> PlacementId;

    /// Block until the full bundle set is ready or the timeout elapses.
    fn wait_ready(&self, id: PlacementId, timeout: Duration) -> bool;

    /// Host assignments of a ready placement, in bundle order.
    fn grants(&self, id: PlacementId) -> Vec<BundleGrant>;

    /// Return the reserved capacity. Idempotent, never blocks.
    fn release(&self, id: PlacementId);
}

/// A granted placement. Must be released exactly once; releasing again is a
/// no-op.
pub struct Allocation {
    id: PlacementId,
    manager: Arc<dyn ClusterManager>,
    pub bundles: Vec<BundleGrant>,
    released: bool,
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocation")
            .field("id", &self.id)
            .field("bundles", &self.bundles)
            .field("released", &self.released)
            .finish()
    }
}

impl Allocation {
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.manager.release(self.id);
        log::info!("placement {} released", self.id);
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

pub struct ResourceAllocator {
    manager: Arc<dyn ClusterManager>,
}

impl ResourceAllocator {
    pub fn new(manager: Arc<dyn ClusterManager>) -> Self {
        ResourceAllocator { manager }
    }

    /// Submit a spread placement and wait for the whole bundle set. Never
    /// returns a partial allocation; on timeout the pending placement is
    /// cancelled and a distinct error is returned.
    pub fn request(&self, req: &ClusterRequest) -> Result<Allocation, Error> {
        let bundles = vec![req.bundle; req.num_nodes];
        let id = self.manager.submit(&bundles, PlacementStrategy::Spread);
        log::info!(
            "placement {} submitted: {} x {:?}, waiting up to {:?}",
            id,
            req.num_nodes,
            req.bundle,
            req.timeout
        );

        if !self.manager.wait_ready(id, req.timeout) {
            self.manager.release(id);
            return Err(Error::AllocationTimeout(req.timeout));
        }

        let grants = self.manager.grants(id);
        assert_eq!(grants.len(), req.num_nodes);
        Ok(Allocation {
            id,
            manager: Arc::clone(&self.manager),
            bundles: grants,
            released: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimSetting;
    use crate::sim::SimClusterManager;
    use std::collections::HashSet;
    use std::time::Instant;

    fn quick_setting(num_hosts: usize) -> SimSetting {
        SimSetting {
            num_hosts,
            gpus_per_host: 8,
            provision_ms: 10,
            ..Default::default()
        }
    }

    fn request(num_nodes: usize, gpus: usize, timeout_ms: u64) -> ClusterRequest {
        ClusterRequest {
            num_nodes,
            bundle: BundleRequest { gpus, cpus: gpus },
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[test]
    fn spread_lands_on_distinct_hosts() {
        let manager = Arc::new(SimClusterManager::new(quick_setting(4)));
        let allocator = ResourceAllocator::new(manager);
        let mut allocation = allocator.request(&request(4, 8, 1000)).unwrap();
        assert_eq!(allocation.bundles.len(), 4);
        let hosts: HashSet<_> = allocation.bundles.iter().map(|b| b.host.clone()).collect();
        assert_eq!(hosts.len(), 4);
        allocation.release();
    }

    #[test]
    fn oversized_request_times_out_within_the_deadline() {
        let manager = Arc::new(SimClusterManager::new(quick_setting(2)));
        let allocator = ResourceAllocator::new(manager);
        let start = Instant::now();
        let res = allocator.request(&request(3, 8, 200));
        let elapsed = start.elapsed();
        match res {
            Err(Error::AllocationTimeout(t)) => assert_eq!(t, Duration::from_millis(200)),
            other => panic!("expected AllocationTimeout, got {:?}", other.map(|_| ())),
        }
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(2000));
    }

    #[test]
    fn spread_never_accepts_overlapping_placement() {
        // one big host could fit both bundles, but not on distinct hosts
        let manager = Arc::new(SimClusterManager::new(quick_setting(1)));
        let allocator = ResourceAllocator::new(manager.clone());
        let res = allocator.request(&request(2, 4, 100));
        assert!(matches!(res, Err(Error::AllocationTimeout(_))));

        // the same shape is satisfiable under Pack
        let id = manager.submit(
            &[BundleRequest { gpus: 4, cpus: 4 }; 2],
            PlacementStrategy::Pack,
        );
        assert!(manager.wait_ready(id, Duration::from_millis(1000)));
        let grants = manager.grants(id);
        assert_eq!(grants.len(), 2);
        assert_eq!(grants[0].host, grants[1].host);
        manager.release(id);
    }

    #[test]
    fn release_is_idempotent() {
        let manager = Arc::new(SimClusterManager::new(quick_setting(2)));
        let allocator = ResourceAllocator::new(manager.clone());
        let mut allocation = allocator.request(&request(2, 8, 1000)).unwrap();
        allocation.release();
        allocation.release();
        assert!(allocation.is_released());

        // capacity actually came back: the same request succeeds again
        let mut again = allocator.request(&request(2, 8, 1000)).unwrap();
        again.release();
    }
}
