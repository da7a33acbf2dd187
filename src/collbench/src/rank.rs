//! Deterministic rank layout: node-major, `rank = node * slots + slot`. The
//! same topology yields the same layout every run, which keeps multi-node
//! debugging reproducible.

use crate::WorkerSpec;

pub fn assign(
    num_nodes: usize,
    slots_per_node: usize,
    group_name: &str,
    payload_size_bytes: usize,
) -> Vec<WorkerSpec> {
    let world_size = num_nodes * slots_per_node;
    let mut specs = Vec::with_capacity(world_size);
    for node_index in 0..num_nodes {
        for slot in 0..slots_per_node {
            specs.push(WorkerSpec {
                global_rank: node_index * slots_per_node + slot,
                world_size,
                node_index,
                group_name: group_name.to_string(),
                payload_size_bytes,
            });
        }
    }
    specs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_form_a_permutation() {
        for &(n, k) in &[(1, 1), (2, 8), (3, 4), (7, 5)] {
            let specs = assign(n, k, "g", 1024);
            assert_eq!(specs.len(), n * k);
            let mut seen = vec![false; n * k];
            for spec in &specs {
                assert_eq!(spec.world_size, n * k);
                assert!(!seen[spec.global_rank], "duplicate rank {}", spec.global_rank);
                seen[spec.global_rank] = true;
            }
            assert!(seen.iter().all(|&s| s));
        }
    }

    #[test]
    fn layout_is_node_major() {
        let specs = assign(2, 8, "g", 1024);
        for spec in &specs {
            assert_eq!(spec.global_rank, spec.node_index * 8 + spec.global_rank % 8);
        }
        // node 0 holds ranks 0..8
        let node0: Vec<_> = specs
            .iter()
            .filter(|s| s.node_index == 0)
            .map(|s| s.global_rank)
            .collect();
        assert_eq!(node0, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn assignment_is_deterministic() {
        let a = assign(4, 6, "g", 4096);
        let b = assign(4, 6, "g", 4096);
        assert_eq!(a, b);
    }
}
