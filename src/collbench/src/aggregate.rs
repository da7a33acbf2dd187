//! Folds per-rank timing samples into one reported bandwidth figure.

use crate::{BenchmarkResult, Error, JobSpec};

const BYTES_PER_GB: f64 = (1usize << 30) as f64;

/// Derived once per run, immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateReport {
    pub total_nodes: usize,
    pub total_workers: usize,
    pub iterations: usize,
    pub payload_gb_per_worker: f64,
    /// Algorithmic bandwidth in Gbit/s, counting send+receive per worker.
    pub bandwidth_gbps: f64,
    /// The same figure in GByte/s.
    pub bandwidth_gbs: f64,
}

impl std::fmt::Display for AggregateReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bar = "=".repeat(60);
        writeln!(f, "{}", bar)?;
        writeln!(f, " Dense All-Reduce Benchmark Completed")?;
        writeln!(f, "{}", bar)?;
        writeln!(f, "  Total Nodes: {}", self.total_nodes)?;
        writeln!(f, "  Total Workers: {}", self.total_workers)?;
        writeln!(f, "  Message Size per Worker: {} GB", self.payload_gb_per_worker)?;
        writeln!(f, "  Iterations: {}", self.iterations)?;
        writeln!(f, "{}", "-".repeat(60))?;
        writeln!(
            f,
            "  Aggregate Algorithm Bandwidth: {:.2} Gbps ({:.2} GB/s)",
            self.bandwidth_gbps, self.bandwidth_gbs
        )?;
        write!(f, "{}", bar)
    }
}

/// Picks the first reported sample and derives the bandwidth figures. Any
/// single sample suffices: every rank observes the same barrier-bounded
/// duration by construction (rank skew is not measured or bounded here).
/// Fails loudly when no rank reported.
pub fn aggregate(
    results: &[Option<BenchmarkResult>],
    job_spec: &JobSpec,
) -> Result<AggregateReport, Error> {
    let result = results
        .iter()
        .flatten()
        .next()
        .ok_or(Error::NoData)?;

    assert!(result.iterations > 0);
    let avg_secs = result.duration_secs / result.iterations as f64;
    // send + receive traffic per worker in an all-reduce
    let effective_bytes = 2.0 * job_spec.buffer_size as f64;
    let bandwidth_gbps = effective_bytes * 8.0 / (avg_secs * 1e9);
    let bandwidth_gbs = effective_bytes / (avg_secs * 1e9);

    Ok(AggregateReport {
        total_nodes: job_spec.num_nodes,
        total_workers: job_spec.world_size(),
        iterations: result.iterations,
        payload_gb_per_worker: job_spec.buffer_size as f64 / BYTES_PER_GB,
        bandwidth_gbps,
        bandwidth_gbs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_spec() -> JobSpec {
        JobSpec::new(2, 8, 8 << 30, 10)
    }

    fn sample(rank: usize, duration_secs: f64) -> Option<BenchmarkResult> {
        Some(BenchmarkResult {
            rank,
            duration_secs,
            iterations: 10,
        })
    }

    #[test]
    fn bandwidth_formula() {
        // world size 16, payload 8 GB, 10 iterations, 2 s per iteration
        let mut results = vec![None; 16];
        results[0] = sample(0, 20.0);
        let report = aggregate(&results, &job_spec()).unwrap();
        assert_eq!(report.total_workers, 16);
        assert_eq!(report.payload_gb_per_worker, 8.0);
        let expected_gbps = (2.0 * (8u64 << 30) as f64 * 8.0) / (2.0 * 1e9);
        assert!((report.bandwidth_gbps - expected_gbps).abs() < 1e-9);
        assert!((report.bandwidth_gbs - expected_gbps / 8.0).abs() < 1e-9);
    }

    #[test]
    fn order_of_results_does_not_matter() {
        let mut front = vec![None; 16];
        front[0] = sample(0, 20.0);
        let mut back = vec![None; 16];
        back[15] = sample(0, 20.0);
        assert_eq!(
            aggregate(&front, &job_spec()).unwrap(),
            aggregate(&back, &job_spec()).unwrap()
        );
    }

    #[test]
    fn all_null_input_fails_loudly() {
        let results = vec![None; 16];
        assert!(matches!(aggregate(&results, &job_spec()), Err(Error::NoData)));
    }

    #[test]
    fn reporting_rank_failure_is_not_papered_over() {
        // rank 0 failed mid-run while the other ranks completed; they all
        // return None, and the aggregator must refuse to report a default
        let results: Vec<Option<BenchmarkResult>> = vec![None; 15];
        assert!(matches!(aggregate(&results, &job_spec()), Err(Error::NoData)));
    }
}
