//! Drives the end-to-end protocol: allocate, spawn, initialize, benchmark,
//! aggregate, tear down. Every phase transition is a full barrier over all
//! workers; there is no partial-success path through a phase.

use std::time::Duration;

use crate::aggregate::{self, AggregateReport};
use crate::allocator::{Allocation, BundleRequest, ClusterRequest, ResourceAllocator};
use crate::rank;
use crate::worker::{WorkerCommand, WorkerHandle, WorkerLauncher, WorkerReply};
use crate::{Error, JobSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Allocating,
    Spawning,
    Initializing,
    WarmingUp,
    Timing,
    Aggregating,
    ShuttingDown,
    Done,
    Failed,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Idle => "Idle",
            State::Allocating => "Allocating",
            State::Spawning => "Spawning",
            State::Initializing => "Initializing",
            State::WarmingUp => "WarmingUp",
            State::Timing => "Timing",
            State::Aggregating => "Aggregating",
            State::ShuttingDown => "ShuttingDown",
            State::Done => "Done",
            State::Failed => "Failed",
        };
        write!(f, "{}", name)
    }
}

pub struct BenchmarkCoordinator {
    job_spec: JobSpec,
    group_name: String,
    cpus_per_node: usize,
    timeout: Duration,
    allocator: ResourceAllocator,
    launcher: Box<dyn WorkerLauncher>,
    state: State,
    allocation: Option<Allocation>,
    workers: Vec<Box<dyn WorkerHandle>>,
    initialized: Vec<usize>,
}

impl BenchmarkCoordinator {
    pub fn new(
        job_spec: JobSpec,
        group_name: String,
        timeout: Duration,
        allocator: ResourceAllocator,
        launcher: Box<dyn WorkerLauncher>,
    ) -> Self {
        // one CPU per accelerator slot, same shape the workers are bound to
        let cpus_per_node = job_spec.gpus_per_node;
        BenchmarkCoordinator {
            job_spec,
            group_name,
            cpus_per_node,
            timeout,
            allocator,
            launcher,
            state: State::Idle,
            allocation: None,
            workers: Vec::new(),
            initialized: Vec::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Run the whole protocol once. On any fatal error the run is aborted,
    /// already-initialized workers are shut down best-effort, the allocation
    /// is released, and the original error is returned unmasked.
    pub fn run(&mut self) -> Result<AggregateReport, Error> {
        let res = self.run_inner();
        if let Err(e) = &res {
            self.set_state(State::Failed);
            log::error!("benchmark run failed: {}", e);
            self.shutdown_workers();
            self.release_allocation();
        }
        res
    }

    fn run_inner(&mut self) -> Result<AggregateReport, Error> {
        let job_spec = self.job_spec.clone();
        log::info!(
            "starting benchmark: {} nodes x {} GPUs, world size {}",
            job_spec.num_nodes,
            job_spec.gpus_per_node,
            job_spec.world_size()
        );

        self.set_state(State::Allocating);
        let request = ClusterRequest {
            num_nodes: job_spec.num_nodes,
            bundle: BundleRequest {
                gpus: job_spec.gpus_per_node,
                cpus: self.cpus_per_node,
            },
            timeout: self.timeout,
        };
        let allocation = self.allocator.request(&request)?;
        self.allocation = Some(allocation);

        self.set_state(State::Spawning);
        let specs = rank::assign(
            job_spec.num_nodes,
            job_spec.gpus_per_node,
            &self.group_name,
            job_spec.buffer_size,
        );
        for spec in &specs {
            let grant = &self.allocation.as_ref().unwrap().bundles[spec.node_index];
            let worker = self.launcher.spawn(spec.clone(), grant)?;
            self.workers.push(worker);
        }

        self.set_state(State::Initializing);
        for (worker, spec) in self.workers.iter_mut().zip(specs) {
            worker.post(WorkerCommand::Initialize(spec))?;
        }
        let replies = self.wait_all()?;
        let mut first_failure = None;
        for (worker, reply) in self.workers.iter().zip(&replies) {
            match reply {
                WorkerReply::Initialized => self.initialized.push(worker.rank()),
                WorkerReply::Error { rank, msg } => {
                    if first_failure.is_none() {
                        first_failure = Some(Error::InitializationFailure {
                            rank: *rank,
                            msg: msg.clone(),
                        });
                    }
                }
                other => {
                    if first_failure.is_none() {
                        first_failure = Some(Error::InitializationFailure {
                            rank: worker.rank(),
                            msg: format!("unexpected reply: {:?}", other),
                        });
                    }
                }
            }
        }
        if let Some(e) = first_failure {
            return Err(e);
        }
        log::info!("all {} workers initialized", self.workers.len());

        // RunBenchmark performs the warm-up internally, so the coordinator
        // observes no separate warm-up barrier
        self.set_state(State::WarmingUp);
        let iterations = job_spec.num_iterations;
        for worker in self.workers.iter_mut() {
            worker.post(WorkerCommand::RunBenchmark { iterations })?;
        }
        self.set_state(State::Timing);
        let replies = self.wait_all()?;
        let mut results = Vec::with_capacity(replies.len());
        for (worker, reply) in self.workers.iter().zip(replies) {
            match reply {
                WorkerReply::BenchmarkDone(result) => results.push(result),
                WorkerReply::Error { rank, msg } => {
                    return Err(Error::BenchmarkExecutionFailure { rank, msg });
                }
                other => {
                    return Err(Error::BenchmarkExecutionFailure {
                        rank: worker.rank(),
                        msg: format!("unexpected reply: {:?}", other),
                    });
                }
            }
        }

        self.set_state(State::Aggregating);
        let report = aggregate::aggregate(&results, &job_spec)?;

        self.set_state(State::ShuttingDown);
        self.shutdown_workers();
        self.release_allocation();

        self.set_state(State::Done);
        Ok(report)
    }

    fn set_state(&mut self, next: State) {
        log::info!("coordinator: {} -> {}", self.state, next);
        self.state = next;
    }

    /// Full barrier: collect one reply from every worker before inspecting
    /// any of them.
    fn wait_all(&mut self) -> Result<Vec<WorkerReply>, Error> {
        let mut replies = Vec::with_capacity(self.workers.len());
        for worker in self.workers.iter_mut() {
            replies.push(worker.wait()?);
        }
        Ok(replies)
    }

    /// Best-effort: shutdown failures are logged and cleanup continues.
    /// Only successfully initialized workers are told to leave the group.
    fn shutdown_workers(&mut self) {
        let initialized = std::mem::take(&mut self.initialized);
        for worker in self.workers.iter_mut() {
            if !initialized.contains(&worker.rank()) {
                continue;
            }
            let res = worker
                .post(WorkerCommand::Shutdown)
                .and_then(|()| worker.wait());
            match res {
                Ok(WorkerReply::ShutdownDone) => {}
                Ok(WorkerReply::Error { rank, msg }) => {
                    log::warn!("{}", Error::ShutdownFailure { rank, msg });
                }
                Ok(other) => {
                    log::warn!("rank {}: unexpected shutdown reply: {:?}", worker.rank(), other);
                }
                Err(e) => log::warn!("rank {}: {}", worker.rank(), e),
            }
        }
        self.workers.clear();
    }

    /// No-op when no allocation was ever acquired.
    fn release_allocation(&mut self) {
        if let Some(allocation) = self.allocation.as_mut() {
            allocation.release();
        }
    }
}
