use structopt::StructOpt;

#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "collbench", about = "Dense all-reduce bandwidth benchmark.")]
pub struct Opt {
    /// Number of nodes to provision and use
    #[structopt(short = "n", long, default_value = "2")]
    pub num_nodes: usize,

    /// Number of GPUs to use on each node
    #[structopt(short = "g", long, default_value = "8")]
    pub gpus_per_node: usize,

    /// Payload size per worker in gigabytes
    #[structopt(short = "b", long, default_value = "8")]
    pub buffer_size_gb: usize,

    /// Number of timed benchmark iterations
    #[structopt(short = "i", long, default_value = "10")]
    pub num_iterations: usize,

    /// Timeout in seconds to wait for nodes to be provisioned
    #[structopt(short = "t", long, default_value = "1800")]
    pub timeout_secs: u64,

    /// Experiment config file; settings from the file override the flags above
    #[structopt(short = "c", long)]
    pub config: Option<std::path::PathBuf>,
}
