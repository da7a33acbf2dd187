//! Benchmark participants. Each worker is an independent unit of execution
//! bound to one accelerator slot; the concrete variant here runs on its own
//! OS thread and talks to the coordinator over channels.

use std::sync::Arc;
use std::time::Instant;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::allocator::BundleGrant;
use crate::comm::CollectiveBackend;
use crate::config::CommConfig;
use crate::{BenchmarkResult, Error, WorkerSpec, WARMUP_ITERATIONS};

#[derive(Debug, Clone)]
pub enum WorkerCommand {
    /// join the collective group, sent once before anything else
    Initialize(WorkerSpec),
    /// warm up, then run the timed collective loop
    RunBenchmark { iterations: usize },
    /// leave the collective group, sent exactly once per initialized worker
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum WorkerReply {
    Initialized,
    /// `None` from every rank except the designated reporting rank
    BenchmarkDone(Option<BenchmarkResult>),
    ShutdownDone,
    Error { rank: usize, msg: String },
}

/// A remotely-executing benchmark participant. Commands are posted fan-out;
/// replies are collected fan-in, one reply per command.
pub trait WorkerHandle {
    fn rank(&self) -> usize;
    fn post(&mut self, cmd: WorkerCommand) -> Result<(), Error>;
    fn wait(&mut self) -> Result<WorkerReply, Error>;
}

/// Spawns a worker bound to a granted bundle.
pub trait WorkerLauncher {
    fn spawn(&self, spec: WorkerSpec, grant: &BundleGrant) -> Result<Box<dyn WorkerHandle>, Error>;
}

pub struct ThreadWorker {
    rank: usize,
    cmd_tx: Option<Sender<WorkerCommand>>,
    reply_rx: Receiver<WorkerReply>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl WorkerHandle for ThreadWorker {
    fn rank(&self) -> usize {
        self.rank
    }

    fn post(&mut self, cmd: WorkerCommand) -> Result<(), Error> {
        self.cmd_tx
            .as_ref()
            .expect("worker already torn down")
            .send(cmd)
            .map_err(|_| Error::WorkerLost(self.rank))
    }

    fn wait(&mut self) -> Result<WorkerReply, Error> {
        self.reply_rx.recv().map_err(|_| Error::WorkerLost(self.rank))
    }
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        // closing the command channel ends the worker loop
        self.cmd_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Launches `ThreadWorker`s against a shared collective backend.
pub struct ThreadLauncher {
    comm: Arc<dyn CollectiveBackend>,
    config: CommConfig,
}

impl ThreadLauncher {
    pub fn new(comm: Arc<dyn CollectiveBackend>, config: CommConfig) -> Self {
        ThreadLauncher { comm, config }
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn spawn(&self, spec: WorkerSpec, grant: &BundleGrant) -> Result<Box<dyn WorkerHandle>, Error> {
        let rank = spec.global_rank;
        log::debug!("spawning worker rank {} on {}", rank, grant.host);

        let (cmd_tx, cmd_rx) = unbounded();
        let (reply_tx, reply_rx) = unbounded();
        let comm = Arc::clone(&self.comm);
        let config = self.config.clone();
        let host = grant.host.clone();
        let handle = std::thread::Builder::new()
            .name(format!("collbench-worker-{}", rank))
            .spawn(move || worker_loop(comm, config, host, rank, cmd_rx, reply_tx))
            .map_err(|e| Error::Spawn {
                rank,
                msg: e.to_string(),
            })?;

        Ok(Box::new(ThreadWorker {
            rank,
            cmd_tx: Some(cmd_tx),
            reply_rx,
            handle: Some(handle),
        }))
    }
}

fn worker_loop(
    comm: Arc<dyn CollectiveBackend>,
    config: CommConfig,
    host: String,
    rank: usize,
    cmd_rx: Receiver<WorkerCommand>,
    reply_tx: Sender<WorkerReply>,
) {
    let mut spec: Option<WorkerSpec> = None;

    for cmd in cmd_rx.iter() {
        let stop = matches!(cmd, WorkerCommand::Shutdown);
        let reply = handle_command(&*comm, &config, &host, rank, &mut spec, cmd);
        if reply_tx.send(reply).is_err() {
            // coordinator is gone, nothing left to report to
            break;
        }
        if stop {
            break;
        }
    }
}

fn handle_command(
    comm: &dyn CollectiveBackend,
    config: &CommConfig,
    host: &str,
    rank: usize,
    spec: &mut Option<WorkerSpec>,
    cmd: WorkerCommand,
) -> WorkerReply {
    match cmd {
        WorkerCommand::Initialize(s) => {
            log::info!(
                "[rank {}/{}] on {}: comm config: debug={} nchannels={:?} socket_ifname={:?}",
                s.global_rank,
                s.world_size,
                host,
                config.debug,
                config.nchannels,
                config.socket_ifname,
            );
            match comm.init_group(s.world_size, s.global_rank, &s.group_name) {
                Ok(()) => {
                    log::info!(
                        "[rank {}/{}] collective group initialized",
                        s.global_rank,
                        s.world_size
                    );
                    *spec = Some(s);
                    WorkerReply::Initialized
                }
                Err(e) => WorkerReply::Error {
                    rank: s.global_rank,
                    msg: e.to_string(),
                },
            }
        }
        WorkerCommand::RunBenchmark { iterations } => match spec {
            Some(s) => run_benchmark(comm, s, iterations),
            // precondition violation: the coordinator never issues
            // RunBenchmark before a successful Initialize
            None => WorkerReply::Error {
                rank,
                msg: "RunBenchmark issued before a successful Initialize".to_string(),
            },
        },
        WorkerCommand::Shutdown => match spec.take() {
            Some(s) => {
                log::info!("[rank {}/{}] shutting down", s.global_rank, s.world_size);
                match comm.destroy_group(&s.group_name, s.global_rank) {
                    Ok(()) => WorkerReply::ShutdownDone,
                    Err(e) => WorkerReply::Error {
                        rank: s.global_rank,
                        msg: e.to_string(),
                    },
                }
            }
            None => WorkerReply::Error {
                rank,
                msg: "Shutdown issued before a successful Initialize".to_string(),
            },
        },
    }
}

fn run_benchmark(comm: &dyn CollectiveBackend, spec: &WorkerSpec, iterations: usize) -> WorkerReply {
    let rank = spec.global_rank;

    for _ in 0..WARMUP_ITERATIONS {
        if let Err(e) = comm.all_reduce(&spec.group_name, rank, spec.payload_size_bytes) {
            return WorkerReply::Error {
                rank,
                msg: format!("warm-up: {}", e),
            };
        }
    }
    comm.synchronize();

    let start = Instant::now();
    for _ in 0..iterations {
        if let Err(e) = comm.all_reduce(&spec.group_name, rank, spec.payload_size_bytes) {
            return WorkerReply::Error {
                rank,
                msg: e.to_string(),
            };
        }
    }
    comm.synchronize();
    let duration_secs = start.elapsed().as_secs_f64();

    // only the reporting rank returns a sample, so the aggregate is not
    // recomputed identically on every rank
    if rank == 0 {
        WorkerReply::BenchmarkDone(Some(BenchmarkResult {
            rank,
            duration_secs,
            iterations,
        }))
    } else {
        WorkerReply::BenchmarkDone(None)
    }
}
