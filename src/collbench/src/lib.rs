use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod argument;
pub mod config;

pub mod allocator;
pub mod rank;

pub mod comm;
pub mod worker;

pub mod aggregate;
pub mod coordinator;

pub mod sim;

/// Default name of the collective group all workers join.
pub const DEFAULT_GROUP: &str = "dense_allreduce_benchmark_group";

/// Number of untimed warm-up collective operations before the timed run.
pub const WARMUP_ITERATIONS: usize = 5;

/// The shape and workload of one benchmark run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub num_nodes: usize,
    pub gpus_per_node: usize,
    /// Payload size per worker in bytes.
    pub buffer_size: usize,
    pub num_iterations: usize,
}

impl JobSpec {
    pub fn new(
        num_nodes: usize,
        gpus_per_node: usize,
        buffer_size: usize,
        num_iterations: usize,
    ) -> Self {
        JobSpec {
            num_nodes,
            gpus_per_node,
            buffer_size,
            num_iterations,
        }
    }

    #[inline]
    pub fn world_size(&self) -> usize {
        self.num_nodes * self.gpus_per_node
    }
}

/// Everything one worker needs to join the collective group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub global_rank: usize,
    pub world_size: usize,
    pub node_index: usize,
    pub group_name: String,
    pub payload_size_bytes: usize,
}

/// Timing sample reported by the designated reporting rank. All other ranks
/// produce `None` for the timing phase.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub rank: usize,
    pub duration_secs: f64,
    pub iterations: usize,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Fatal, never retried: retrying a timed-out scale-up silently could
    /// mask a capacity problem.
    #[error("cluster allocation timed out after {0:?}")]
    AllocationTimeout(std::time::Duration),
    /// Fatal: a collective group with a missing member cannot proceed.
    #[error("worker rank {rank} failed to initialize: {msg}")]
    InitializationFailure { rank: usize, msg: String },
    /// Fatal: a failed collective op can leave the group in an undefined
    /// state, so no partial-result recovery is attempted.
    #[error("benchmark execution failed on rank {rank}: {msg}")]
    BenchmarkExecutionFailure { rank: usize, msg: String },
    /// Fatal protocol violation: no rank reported a timing result.
    #[error("no worker reported a timing result")]
    NoData,
    /// Non-fatal, cleanup continues for the remaining workers.
    #[error("worker rank {rank} failed to shut down: {msg}")]
    ShutdownFailure { rank: usize, msg: String },
    #[error("lost the channel to worker rank {0}")]
    WorkerLost(usize),
    #[error("failed to spawn worker rank {rank}: {msg}")]
    Spawn { rank: usize, msg: String },
}
