//! The collective-communication library as seen by a worker. The benchmark
//! never reaches into the transport's internal state; cross-rank coordination
//! happens entirely behind this trait.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("group init failed: {0}")]
    Init(String),
    #[error("allreduce failed: {0}")]
    AllReduce(String),
    #[error("group destroy failed: {0}")]
    Destroy(String),
}

pub trait CollectiveBackend: Send + Sync {
    /// Join `group_name` as `rank` of `world_size` participants.
    fn init_group(&self, world_size: usize, rank: usize, group_name: &str) -> Result<(), Error>;

    /// One collective all-reduce over a payload of `payload_bytes`.
    fn all_reduce(&self, group_name: &str, rank: usize, payload_bytes: usize)
        -> Result<(), Error>;

    /// Fence on outstanding device work. Local to the calling worker.
    fn synchronize(&self);

    /// Leave the group. NOT idempotent: a second call for the same rank fails.
    fn destroy_group(&self, group_name: &str, rank: usize) -> Result<(), Error>;
}
