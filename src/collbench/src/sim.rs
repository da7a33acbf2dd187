//! In-process stand-ins for the external collaborators: a cluster resource
//! manager with a fixed host fleet and a collective transport whose cost is
//! modeled from payload size and link bandwidth. They implement only what the
//! coordinator protocol observes.

use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::allocator::{BundleGrant, BundleRequest, ClusterManager, PlacementId, PlacementStrategy};
use crate::comm::{self, CollectiveBackend};
use crate::config::SimSetting;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

struct Host {
    name: String,
    gpus_free: usize,
}

struct Pending {
    bundles: Vec<BundleRequest>,
    strategy: PlacementStrategy,
    submitted_at: Instant,
    grants: Option<Vec<BundleGrant>>,
}

struct MgrState {
    hosts: Vec<Host>,
    requests: HashMap<PlacementId, Pending>,
    next_id: PlacementId,
}

/// A fleet of identical hosts. Satisfiable requests become ready once the
/// provisioning delay has elapsed, modeling cluster scale-up; unsatisfiable
/// ones never do, so requesters observe a timeout instead of a partial grant.
pub struct SimClusterManager {
    setting: SimSetting,
    state: Mutex<MgrState>,
}

impl SimClusterManager {
    pub fn new(setting: SimSetting) -> Self {
        let hosts = (0..setting.num_hosts)
            .map(|i| Host {
                name: format!("host-{}", i),
                gpus_free: setting.gpus_per_host,
            })
            .collect();
        SimClusterManager {
            setting,
            state: Mutex::new(MgrState {
                hosts,
                requests: HashMap::new(),
                next_id: 0,
            }),
        }
    }

    /// Accelerators currently reserved across the fleet.
    pub fn gpus_in_use(&self) -> usize {
        let state = self.state.lock().unwrap();
        let capacity = state.hosts.len() * self.setting.gpus_per_host;
        capacity - state.hosts.iter().map(|h| h.gpus_free).sum::<usize>()
    }

    /// Pick hosts for the bundle set, or `None` if the fleet cannot satisfy
    /// it right now. Spread requires one distinct host per bundle.
    fn plan(hosts: &[Host], bundles: &[BundleRequest], strategy: PlacementStrategy) -> Option<Vec<usize>> {
        let mut free: Vec<usize> = hosts.iter().map(|h| h.gpus_free).collect();
        let mut picks = Vec::with_capacity(bundles.len());
        for bundle in bundles {
            let pick = free.iter().enumerate().position(|(i, &f)| {
                f >= bundle.gpus
                    && (strategy == PlacementStrategy::Pack || !picks.contains(&i))
            })?;
            free[pick] -= bundle.gpus;
            picks.push(pick);
        }
        Some(picks)
    }
}

impl ClusterManager for SimClusterManager {
    fn submit(&self, bundles: &[BundleRequest], strategy: PlacementStrategy) -> PlacementId {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.requests.insert(
            id,
            Pending {
                bundles: bundles.to_vec(),
                strategy,
                submitted_at: Instant::now(),
                grants: None,
            },
        );
        id
    }

    fn wait_ready(&self, id: PlacementId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().unwrap();
                let state = &mut *state;
                let pending = match state.requests.get_mut(&id) {
                    Some(p) => p,
                    None => return false, // cancelled
                };
                if pending.grants.is_some() {
                    return true;
                }
                let provisioned = pending.submitted_at.elapsed()
                    >= Duration::from_millis(self.setting.provision_ms);
                if provisioned {
                    if let Some(picks) =
                        Self::plan(&state.hosts, &pending.bundles, pending.strategy)
                    {
                        let mut grants = Vec::with_capacity(picks.len());
                        for (bundle, &i) in pending.bundles.iter().zip(&picks) {
                            state.hosts[i].gpus_free -= bundle.gpus;
                            grants.push(BundleGrant {
                                host: state.hosts[i].name.clone(),
                                gpus: bundle.gpus,
                                cpus: bundle.cpus,
                            });
                        }
                        pending.grants = Some(grants);
                        return true;
                    }
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn grants(&self, id: PlacementId) -> Vec<BundleGrant> {
        let state = self.state.lock().unwrap();
        state
            .requests
            .get(&id)
            .and_then(|p| p.grants.clone())
            .unwrap_or_default()
    }

    fn release(&self, id: PlacementId) {
        let mut state = self.state.lock().unwrap();
        if let Some(pending) = state.requests.remove(&id) {
            if let Some(grants) = pending.grants {
                for grant in grants {
                    if let Some(host) = state.hosts.iter_mut().find(|h| h.name == grant.host) {
                        host.gpus_free += grant.gpus;
                    }
                }
            }
        }
    }
}

struct Group {
    world_size: usize,
    members: HashSet<usize>,
    arrived: usize,
    generation: u64,
}

struct CommState {
    groups: HashMap<String, Group>,
    rng: StdRng,
}

/// Shared-memory collective transport. An all-reduce is a generation-counted
/// condvar barrier across the full group followed by a modeled transfer
/// delay, so worker-observed durations behave like the real thing.
pub struct SimCollective {
    setting: SimSetting,
    state: Mutex<CommState>,
    barrier_cv: Condvar,
}

impl SimCollective {
    pub fn new(setting: SimSetting) -> Self {
        let rng = StdRng::seed_from_u64(setting.seed);
        SimCollective {
            setting,
            state: Mutex::new(CommState {
                groups: HashMap::new(),
                rng,
            }),
            barrier_cv: Condvar::new(),
        }
    }

    pub fn num_groups(&self) -> usize {
        self.state.lock().unwrap().groups.len()
    }

    /// Per-link traffic of a ring all-reduce: 2(n-1)/n of the payload.
    fn transfer_secs(&self, world_size: usize, payload_bytes: usize, jitter: f64) -> f64 {
        let n = world_size as f64;
        let traffic_bits = 2.0 * (n - 1.0) / n * payload_bytes as f64 * 8.0;
        let secs = traffic_bits / (self.setting.link_gbps * 1e9);
        secs * (1.0 + jitter) / self.setting.time_compression
    }
}

impl CollectiveBackend for SimCollective {
    fn init_group(&self, world_size: usize, rank: usize, group_name: &str) -> Result<(), comm::Error> {
        if self.setting.fail_rank == Some(rank) {
            return Err(comm::Error::Init(format!(
                "injected init failure for rank {}",
                rank
            )));
        }
        let mut state = self.state.lock().unwrap();
        let group = state.groups.entry(group_name.to_string()).or_insert(Group {
            world_size,
            members: HashSet::new(),
            arrived: 0,
            generation: 0,
        });
        if group.world_size != world_size {
            return Err(comm::Error::Init(format!(
                "world size mismatch in group {}: {} vs {}",
                group_name, group.world_size, world_size
            )));
        }
        if !group.members.insert(rank) {
            return Err(comm::Error::Init(format!(
                "rank {} already joined group {}",
                rank, group_name
            )));
        }
        Ok(())
    }

    fn all_reduce(
        &self,
        group_name: &str,
        rank: usize,
        payload_bytes: usize,
    ) -> Result<(), comm::Error> {
        let mut state = self.state.lock().unwrap();

        let jitter_amp = self.setting.jitter;
        let jitter = if jitter_amp > 0.0 {
            state.rng.gen_range(-jitter_amp..=jitter_amp)
        } else {
            0.0
        };

        let group = state
            .groups
            .get_mut(group_name)
            .ok_or_else(|| comm::Error::AllReduce(format!("no such group: {}", group_name)))?;
        if !group.members.contains(&rank) {
            return Err(comm::Error::AllReduce(format!(
                "rank {} is not a member of group {}",
                rank, group_name
            )));
        }
        if group.members.len() != group.world_size {
            return Err(comm::Error::AllReduce(format!(
                "group {} is incomplete: {}/{} members",
                group_name,
                group.members.len(),
                group.world_size
            )));
        }
        let world_size = group.world_size;

        group.arrived += 1;
        if group.arrived == world_size {
            group.arrived = 0;
            group.generation += 1;
            self.barrier_cv.notify_all();
        } else {
            let generation = group.generation;
            loop {
                state = self.barrier_cv.wait(state).unwrap();
                let group = state.groups.get(group_name).ok_or_else(|| {
                    comm::Error::AllReduce(format!(
                        "group {} destroyed during allreduce",
                        group_name
                    ))
                })?;
                if group.generation != generation {
                    break;
                }
            }
        }
        drop(state);

        let secs = self.transfer_secs(world_size, payload_bytes, jitter);
        if secs > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(secs));
        }
        Ok(())
    }

    fn synchronize(&self) {
        // transfers complete before all_reduce returns, nothing in flight
    }

    fn destroy_group(&self, group_name: &str, rank: usize) -> Result<(), comm::Error> {
        let mut state = self.state.lock().unwrap();
        let group = state
            .groups
            .get_mut(group_name)
            .ok_or_else(|| comm::Error::Destroy(format!("no such group: {}", group_name)))?;
        if !group.members.remove(&rank) {
            return Err(comm::Error::Destroy(format!(
                "rank {} is not a member of group {}",
                rank, group_name
            )));
        }
        if group.members.is_empty() {
            state.groups.remove(group_name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_setting() -> SimSetting {
        SimSetting {
            num_hosts: 2,
            gpus_per_host: 8,
            provision_ms: 0,
            time_compression: 1e9,
            ..Default::default()
        }
    }

    #[test]
    fn group_membership_lifecycle() {
        let comm = SimCollective::new(quick_setting());
        comm.init_group(2, 0, "g").unwrap();
        comm.init_group(2, 1, "g").unwrap();
        assert_eq!(comm.num_groups(), 1);

        // duplicate rank and world-size disagreement are rejected
        assert!(comm.init_group(2, 1, "g").is_err());
        assert!(comm.init_group(3, 2, "g").is_err());

        comm.destroy_group("g", 0).unwrap();
        comm.destroy_group("g", 1).unwrap();
        assert_eq!(comm.num_groups(), 0);
    }

    #[test]
    fn allreduce_on_incomplete_group_fails() {
        let comm = SimCollective::new(quick_setting());
        comm.init_group(2, 0, "g").unwrap();
        assert!(comm.all_reduce("g", 0, 1024).is_err());
    }

    #[test]
    fn barrier_aligns_all_ranks() {
        use std::sync::Arc;
        let comm = Arc::new(SimCollective::new(quick_setting()));
        for rank in 0..4 {
            comm.init_group(4, rank, "g").unwrap();
        }
        let mut handles = vec![];
        for rank in 0..4 {
            let comm = Arc::clone(&comm);
            handles.push(std::thread::spawn(move || {
                for _ in 0..10 {
                    comm.all_reduce("g", rank, 1 << 16).unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn provisioning_delay_is_respected() {
        let setting = SimSetting {
            provision_ms: 50,
            ..quick_setting()
        };
        let manager = SimClusterManager::new(setting);
        let id = manager.submit(
            &[BundleRequest { gpus: 8, cpus: 8 }; 2],
            PlacementStrategy::Spread,
        );
        // not ready before the provisioning delay has elapsed
        assert!(!manager.wait_ready(id, Duration::from_millis(10)));
        assert!(manager.wait_ready(id, Duration::from_millis(500)));
        assert_eq!(manager.gpus_in_use(), 16);
        manager.release(id);
        assert_eq!(manager.gpus_in_use(), 0);
    }
}
