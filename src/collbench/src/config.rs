//! Experiment configuration. The communication settings are passed into each
//! worker explicitly at construction time instead of being smuggled through
//! process-global environment variables.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugLevel {
    Off,
    Warn,
    Info,
    Trace,
}

impl std::default::Default for DebugLevel {
    fn default() -> Self {
        DebugLevel::Info
    }
}

impl std::fmt::Display for DebugLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DebugLevel::Off => write!(f, "off"),
            DebugLevel::Warn => write!(f, "warn"),
            DebugLevel::Info => write!(f, "info"),
            DebugLevel::Trace => write!(f, "trace"),
        }
    }
}

/// Transport-level knobs handed to every worker. Each worker logs the
/// effective settings during initialization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommConfig {
    #[serde(default)]
    pub debug: DebugLevel,

    /// Number of communication channels/rings, backend default when unset
    #[serde(default)]
    pub nchannels: Option<usize>,

    /// Interface name the transport should bind to, backend default when unset
    #[serde(default)]
    pub socket_ifname: Option<String>,
}

/// Parameters of the simulated fabric and fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimSetting {
    /// Number of hosts in the fleet; 0 means match the requested node count
    #[serde(default)]
    pub num_hosts: usize,

    pub gpus_per_host: usize,

    /// Scale-up delay before a satisfiable placement becomes ready
    pub provision_ms: u64,

    /// Per-host link bandwidth used to model transfer time
    pub link_gbps: f64,

    /// Wall-clock compression applied to modeled transfer times
    pub time_compression: f64,

    /// Relative jitter applied to each modeled collective op
    #[serde(default)]
    pub jitter: f64,

    #[serde(default)]
    pub seed: u64,

    /// Fault injection: this rank fails to join the collective group
    #[serde(default)]
    pub fail_rank: Option<usize>,
}

impl std::default::Default for SimSetting {
    fn default() -> Self {
        SimSetting {
            num_hosts: 0,
            gpus_per_host: 8,
            provision_ms: 200,
            link_gbps: 100.0,
            time_compression: 1000.0,
            jitter: 0.05,
            seed: 0,
            fail_rank: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    pub num_nodes: usize,
    pub gpus_per_node: usize,

    /// Payload size per worker in gigabytes
    pub buffer_size_gb: usize,

    pub num_iterations: usize,

    /// Seconds to wait for the placement before giving up
    pub timeout_secs: u64,

    #[serde(default)]
    pub group_name: Option<String>,

    #[serde(default)]
    pub comm: CommConfig,

    #[serde(default)]
    pub sim: SimSetting,
}

impl ExperimentConfig {
    pub fn from_path<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_opt(opt: &crate::argument::Opt) -> Self {
        ExperimentConfig {
            num_nodes: opt.num_nodes,
            gpus_per_node: opt.gpus_per_node,
            buffer_size_gb: opt.buffer_size_gb,
            num_iterations: opt.num_iterations,
            timeout_secs: opt.timeout_secs,
            group_name: None,
            comm: Default::default(),
            sim: Default::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let content = r#"
            num_nodes = 2
            gpus_per_node = 8
            buffer_size_gb = 8
            num_iterations = 10
            timeout_secs = 1800
            group_name = "test_group"

            [comm]
            debug = "trace"
            nchannels = 4

            [sim]
            gpus_per_host = 8
            provision_ms = 50
            link_gbps = 200.0
            time_compression = 10000.0
            fail_rank = 3
        "#;
        let config: ExperimentConfig = toml::from_str(content).unwrap();
        assert_eq!(config.num_nodes, 2);
        assert_eq!(config.comm.debug, DebugLevel::Trace);
        assert_eq!(config.comm.nchannels, Some(4));
        assert_eq!(config.comm.socket_ifname, None);
        assert_eq!(config.sim.fail_rank, Some(3));
        assert_eq!(config.sim.num_hosts, 0);
    }

    #[test]
    fn unknown_field_is_rejected() {
        let content = r#"
            num_nodes = 2
            gpus_per_node = 8
            buffer_size_gb = 8
            num_iterations = 10
            timeout_secs = 1800
            tensor_gb = 8
        "#;
        assert!(toml::from_str::<ExperimentConfig>(content).is_err());
    }
}
