use serde::Serialize;

/// Cumulative execution counters for one graph instance.
///
/// Counters survive [`reset`](super::ComputationGraph::reset) so that a training loop can read
/// totals across iterations; use [`take_stats`](super::ComputationGraph::take_stats) to drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionStats {
    /// Calls to `evaluate`, including ones satisfied entirely from the cache.
    pub evaluations: u64,
    pub plans_built: u64,
    pub plan_cache_hits: u64,
    pub steps: u64,
    /// Backend kernel invocations, batched or single-node.
    pub kernel_launches: u64,
    pub nodes_computed: u64,
    /// Nodes computed as members of a multi-node batched call.
    pub batched_nodes: u64,
    /// Nodes whose batched call was declined and re-run one at a time.
    pub fallback_nodes: u64,
}

impl ExecutionStats {
    /// Mean number of nodes handled per kernel launch.
    pub fn average_batch_size(&self) -> f64 {
        if self.kernel_launches == 0 {
            return 0.0;
        }
        self.nodes_computed as f64 / self.kernel_launches as f64
    }

    pub(super) fn absorb(&mut self, run: &RunSummary) {
        self.steps += run.steps;
        self.kernel_launches += run.kernel_launches;
        self.nodes_computed += run.nodes_computed;
        self.batched_nodes += run.batched_nodes;
        self.fallback_nodes += run.fallback_nodes;
    }
}

/// Counters produced by a single executor run.
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct RunSummary {
    pub(super) steps: u64,
    pub(super) kernel_launches: u64,
    pub(super) nodes_computed: u64,
    pub(super) batched_nodes: u64,
    pub(super) fallback_nodes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_batch_size_handles_idle_graphs() {
        let mut stats = ExecutionStats::default();
        assert_eq!(stats.average_batch_size(), 0.0);
        stats.absorb(&RunSummary {
            steps: 2,
            kernel_launches: 2,
            nodes_computed: 6,
            batched_nodes: 6,
            fallback_nodes: 0,
        });
        assert_eq!(stats.average_batch_size(), 3.0);
    }
}
