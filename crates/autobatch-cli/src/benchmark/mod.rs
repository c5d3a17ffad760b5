//! Timed evaluation of a synthetic workload under one autobatching configuration.

mod compare;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use autobatch::graph::timing;
use autobatch::{AutobatchConfig, BatchBackend, ComputationGraph, ExecutionStats};
use serde::Serialize;

use crate::workload::{build_workload, Workload, WorkloadSpec};

pub use compare::{compare_strategies, StrategyComparison};

/// Order in which the benchmark asks for values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EvalOrder {
    /// Evaluate the total loss only, the way a training loop would.
    Latest,
    /// Force every node one at a time in creation order.
    Creation,
}

impl fmt::Display for EvalOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalOrder::Latest => f.write_str("latest"),
            EvalOrder::Creation => f.write_str("creation"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BenchOptions {
    pub config: AutobatchConfig,
    pub order: EvalOrder,
    pub iterations: usize,
    pub workload: WorkloadSpec,
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub config: AutobatchConfig,
    pub order: EvalOrder,
    pub iterations: usize,
    pub nodes_per_iteration: usize,
    pub build_ms: f64,
    pub evaluate_ms: f64,
    pub schedule_ms: f64,
    pub total_loss: f32,
    pub stats: ExecutionStats,
}

impl BenchReport {
    pub fn evaluate_ms_per_iteration(&self) -> f64 {
        self.evaluate_ms / self.iterations.max(1) as f64
    }
}

/// Builds and evaluates the workload `iterations` times on one graph, resetting between runs.
pub fn run_bench<B: BatchBackend + 'static>(
    backend: Arc<B>,
    options: &BenchOptions,
) -> Result<BenchReport> {
    options.config.validate()?;
    let graph = ComputationGraph::with_config(backend, options.config.clone());
    let iterations = options.iterations.max(1);
    let mut build = Duration::ZERO;
    let mut evaluate = Duration::ZERO;
    let mut nodes_per_iteration = 0;
    let mut total_loss = 0.0;

    timing::reset_schedule_time();
    for iteration in 0..iterations {
        graph.reset();
        let started = Instant::now();
        let workload = build_workload(&graph, &options.workload)?;
        build += started.elapsed();
        nodes_per_iteration = workload.nodes.len();

        let started = Instant::now();
        force(&workload, options.order)?;
        evaluate += started.elapsed();
        total_loss = workload.total.scalar_value()?;
        tracing::debug!(iteration, total_loss, "benchmark iteration finished");
    }

    Ok(BenchReport {
        config: options.config.clone(),
        order: options.order,
        iterations,
        nodes_per_iteration,
        build_ms: millis(build),
        evaluate_ms: millis(evaluate),
        schedule_ms: millis(timing::take_schedule_time()),
        total_loss,
        stats: graph.take_stats(),
    })
}

fn force<B: BatchBackend + 'static>(workload: &Workload<B>, order: EvalOrder) -> Result<()> {
    match order {
        EvalOrder::Latest => workload.total.forward(),
        EvalOrder::Creation => {
            for node in &workload.nodes {
                node.forward()?;
            }
            Ok(())
        }
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1e3
}
