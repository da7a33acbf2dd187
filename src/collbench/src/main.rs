use std::sync::Arc;
use std::time::Duration;

use structopt::StructOpt;

use collbench::allocator::ResourceAllocator;
use collbench::argument::Opt;
use collbench::config::ExperimentConfig;
use collbench::coordinator::BenchmarkCoordinator;
use collbench::sim::{SimClusterManager, SimCollective};
use collbench::worker::ThreadLauncher;
use collbench::{JobSpec, DEFAULT_GROUP};

fn main() -> anyhow::Result<()> {
    logging::init_log();

    let opt = Opt::from_args();
    log::info!("options: {:?}", opt);

    let mut config = match &opt.config {
        Some(path) => ExperimentConfig::from_path(path)?,
        None => ExperimentConfig::from_opt(&opt),
    };

    if config.num_nodes == 0
        || config.gpus_per_node == 0
        || config.buffer_size_gb == 0
        || config.num_iterations == 0
    {
        log::error!("node, GPU, payload, and iteration counts must all be greater than 0");
        std::process::exit(1);
    }

    if config.sim.num_hosts == 0 {
        config.sim.num_hosts = config.num_nodes;
    }

    let job_spec = JobSpec::new(
        config.num_nodes,
        config.gpus_per_node,
        config.buffer_size_gb << 30,
        config.num_iterations,
    );
    let group_name = config
        .group_name
        .clone()
        .unwrap_or_else(|| DEFAULT_GROUP.to_string());

    let manager = Arc::new(SimClusterManager::new(config.sim.clone()));
    let comm = Arc::new(SimCollective::new(config.sim.clone()));
    let mut coordinator = BenchmarkCoordinator::new(
        job_spec,
        group_name,
        Duration::from_secs(config.timeout_secs),
        ResourceAllocator::new(manager),
        Box::new(ThreadLauncher::new(comm, config.comm.clone())),
    );

    match coordinator.run() {
        Ok(report) => {
            log::info!("benchmark finished");
            println!("{}", report);
            Ok(())
        }
        Err(e) => {
            log::error!("benchmark failed: {}", e);
            std::process::exit(1);
        }
    }
}
