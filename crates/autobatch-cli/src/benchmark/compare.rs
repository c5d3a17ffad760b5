use std::sync::Arc;

use anyhow::Result;
use autobatch::{AutobatchConfig, BatchBackend, BatchStrategy, ComputationGraph, ExecutionStats};
use serde::Serialize;

use crate::workload::{build_workload, WorkloadSpec};

#[derive(Debug, Clone, Serialize)]
pub struct StrategyComparison {
    pub strategy: BatchStrategy,
    pub stats: ExecutionStats,
    /// Largest absolute difference from the unbatched run over every node value.
    pub max_abs_diff: f32,
    /// Number of node values that are not bit-identical to the unbatched run.
    pub mismatched_nodes: usize,
}

impl StrategyComparison {
    pub fn matches(&self) -> bool {
        self.mismatched_nodes == 0
    }
}

/// Evaluates the same workload under every strategy and diffs each against [`BatchStrategy::Off`].
pub fn compare_strategies<B: BatchBackend + 'static>(
    backend: Arc<B>,
    base: &AutobatchConfig,
    spec: &WorkloadSpec,
) -> Result<Vec<StrategyComparison>> {
    let mut reference: Option<Vec<Vec<f32>>> = None;
    let mut comparisons = Vec::with_capacity(BatchStrategy::ALL.len());
    for strategy in BatchStrategy::ALL {
        let config = AutobatchConfig {
            strategy,
            ..base.clone()
        };
        let graph = ComputationGraph::with_config(Arc::clone(&backend), config);
        let workload = build_workload(&graph, spec)?;
        workload.total.forward()?;
        let values = workload
            .nodes
            .iter()
            .map(|node| node.to_vec())
            .collect::<Result<Vec<_>>>()?;

        let (max_abs_diff, mismatched_nodes) = match &reference {
            Some(expected) => diff(expected, &values),
            None => (0.0, 0),
        };
        if mismatched_nodes > 0 {
            tracing::warn!(%strategy, mismatched_nodes, max_abs_diff, "strategy diverged");
        }
        comparisons.push(StrategyComparison {
            strategy,
            stats: graph.take_stats(),
            max_abs_diff,
            mismatched_nodes,
        });
        reference.get_or_insert(values);
    }
    Ok(comparisons)
}

pub(crate) fn diff(expected: &[Vec<f32>], actual: &[Vec<f32>]) -> (f32, usize) {
    let mut max_abs_diff = 0.0f32;
    let mut mismatched = 0;
    for (lhs, rhs) in expected.iter().zip(actual) {
        let identical = lhs.len() == rhs.len()
            && lhs.iter().zip(rhs).all(|(a, b)| a.to_bits() == b.to_bits());
        if !identical {
            mismatched += 1;
        }
        for (a, b) in lhs.iter().zip(rhs) {
            max_abs_diff = max_abs_diff.max((a - b).abs());
        }
    }
    if expected.len() != actual.len() {
        mismatched += expected.len().abs_diff(actual.len());
    }
    (max_abs_diff, mismatched)
}

#[cfg(test)]
mod tests {
    use super::diff;

    #[test]
    fn diff_counts_nodes_not_elements() {
        let expected = vec![vec![1.0, 2.0], vec![3.0]];
        let actual = vec![vec![1.0, 2.5], vec![3.0]];
        let (max, mismatched) = diff(&expected, &actual);
        assert_eq!(mismatched, 1);
        assert!((max - 0.5).abs() < 1e-6);
    }

    #[test]
    fn diff_treats_identical_nans_as_equal() {
        let values = vec![vec![f32::NAN]];
        assert_eq!(diff(&values, &values).1, 0);
    }
}
