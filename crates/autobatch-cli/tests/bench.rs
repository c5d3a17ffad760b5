use std::sync::Arc;

use anyhow::Result;
use autobatch::{AutobatchConfig, BatchStrategy};
use autobatch_backend_ref_cpu::CpuBackend;
use autobatch_cli::benchmark::{compare_strategies, run_bench, BenchOptions, EvalOrder};
use autobatch_cli::workload::WorkloadSpec;

fn small_workload() -> WorkloadSpec {
    WorkloadSpec {
        sequences: 6,
        min_len: 2,
        max_len: 5,
        input_dim: 3,
        hidden_dim: 4,
        classes: 3,
        seed: 17,
    }
}

fn bench(strategy: BatchStrategy, order: EvalOrder) -> Result<autobatch_cli::BenchReport> {
    run_bench(
        Arc::new(CpuBackend::new()),
        &BenchOptions {
            config: AutobatchConfig::new(strategy),
            order,
            iterations: 3,
            workload: small_workload(),
        },
    )
}

#[test]
fn compare_reports_every_strategy_in_agreement() -> Result<()> {
    let comparisons = compare_strategies(
        Arc::new(CpuBackend::new()),
        &AutobatchConfig::default(),
        &small_workload(),
    )?;
    assert_eq!(comparisons.len(), BatchStrategy::ALL.len());
    for comparison in &comparisons {
        assert!(comparison.matches(), "{} diverged", comparison.strategy);
        assert_eq!(comparison.max_abs_diff, 0.0);
    }
    Ok(())
}

#[test]
fn batching_launches_fewer_kernels_for_the_same_loss() -> Result<()> {
    let off = bench(BatchStrategy::Off, EvalOrder::Latest)?;
    for strategy in [BatchStrategy::Agenda, BatchStrategy::Depth] {
        let batched = bench(strategy, EvalOrder::Latest)?;
        assert_eq!(batched.total_loss.to_bits(), off.total_loss.to_bits());
        assert_eq!(batched.stats.nodes_computed, off.stats.nodes_computed);
        assert!(batched.stats.kernel_launches < off.stats.kernel_launches);
        assert!(batched.stats.average_batch_size() > 1.0);
    }
    Ok(())
}

#[test]
fn repeated_iterations_reuse_the_cached_plan() -> Result<()> {
    let report = bench(BatchStrategy::Agenda, EvalOrder::Latest)?;
    assert_eq!(report.iterations, 3);
    assert_eq!(report.stats.plans_built, 1);
    assert_eq!(report.stats.plan_cache_hits, 2);
    Ok(())
}

#[test]
fn creation_order_forces_every_node_individually() -> Result<()> {
    let latest = bench(BatchStrategy::Depth, EvalOrder::Latest)?;
    let creation = bench(BatchStrategy::Depth, EvalOrder::Creation)?;
    assert_eq!(creation.total_loss.to_bits(), latest.total_loss.to_bits());
    assert_eq!(creation.stats.nodes_computed, latest.stats.nodes_computed);
    // One evaluation per node plus the loss read-back, per iteration.
    assert_eq!(
        creation.stats.evaluations,
        3 * (creation.nodes_per_iteration as u64 + 1)
    );
    Ok(())
}

#[test]
fn report_serializes_strategy_by_name() -> Result<()> {
    let report = bench(BatchStrategy::Depth, EvalOrder::Creation)?;
    let json: serde_json::Value = serde_json::to_value(&report)?;
    assert_eq!(json["config"]["strategy"], "depth");
    assert_eq!(json["order"], "creation");
    assert!(json["stats"]["kernel_launches"].as_u64().is_some());
    Ok(())
}

#[test]
fn invalid_workloads_are_rejected() {
    let options = BenchOptions {
        config: AutobatchConfig::default(),
        order: EvalOrder::Latest,
        iterations: 1,
        workload: WorkloadSpec {
            min_len: 4,
            max_len: 2,
            ..small_workload()
        },
    };
    let err = run_bench(Arc::new(CpuBackend::new()), &options).unwrap_err();
    assert!(err.to_string().contains("sequence length range"));
}
