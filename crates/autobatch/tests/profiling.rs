use std::sync::Arc;

use anyhow::Result;
use autobatch::backend::{
    BackendError, BackendResult, BatchMember, OpKind, Operation, Shape, UnaryOp,
};
use autobatch::ops::{self, ExpressionOps};
use autobatch::{profiling, AutobatchConfig, BatchStrategy, ComputationGraph, Expression};
use autobatch_backend_ref_cpu::{CpuKernelInterceptor, CpuTensor, GenericCpuBackend};

/// Refuses every batched sigmoid so the executor has to fall back.
struct NoBatchedSigmoid;

impl CpuKernelInterceptor for NoBatchedSigmoid {
    fn try_execute(
        &self,
        _op: &Operation,
        _inputs: &[CpuTensor],
        _output: &Shape,
    ) -> Option<BackendResult<CpuTensor>> {
        None
    }

    fn try_execute_batch(
        &self,
        kind: OpKind,
        _members: &[BatchMember<'_, CpuTensor>],
    ) -> Option<BackendResult<Vec<CpuTensor>>> {
        (kind == OpKind::Unary(UnaryOp::Sigmoid))
            .then(|| Err(BackendError::unimplemented(kind.name(), "sigmoid runs per node")))
    }
}

fn sigmoids(
    graph: &Arc<ComputationGraph<GenericCpuBackend<NoBatchedSigmoid>>>,
) -> Result<Vec<Expression<GenericCpuBackend<NoBatchedSigmoid>>>> {
    (0..4)
        .map(|index| ops::constant(graph, Shape::vector(3), index as f32)?.sigmoid())
        .collect()
}

#[test]
fn registry_records_fallbacks_plan_reuse_and_scopes() -> Result<()> {
    profiling::reset();
    profiling::enable(true);

    let graph = ComputationGraph::with_config(
        Arc::new(GenericCpuBackend::with_interceptor(NoBatchedSigmoid)),
        AutobatchConfig::new(BatchStrategy::Depth),
    );
    let first = sigmoids(&graph)?;
    ops::forward(&first.iter().collect::<Vec<_>>())?;

    graph.reset();
    let second = sigmoids(&graph)?;
    let targets: Vec<_> = second.iter().collect();
    ops::forward(&targets)?;
    ops::forward(&targets)?;

    let report = profiling::snapshot();
    profiling::enable(false);

    assert_eq!(report.counter("plan_cache_miss"), 1);
    assert_eq!(report.counter("plan_cache_hit"), 1);
    assert_eq!(report.counter("evaluate_cached"), 1);
    assert_eq!(report.counter("executor::fallback_nodes"), 8);
    assert_eq!(report.counter("never_recorded"), 0);

    assert_eq!(report.scopes["graph::evaluate"].calls, 3);
    assert_eq!(report.scopes["graph::schedule"].calls, 1);
    assert_eq!(report.scopes["executor::batched_kernel"].calls, 2);
    assert!(report.scopes.values().all(|scope| scope.total_ms >= 0.0));

    let json: serde_json::Value = serde_json::from_str(&report.to_json()?)?;
    assert_eq!(json["counters"]["plan_cache_hit"], 1);

    // Disabled profiling records nothing further.
    second[0].forward()?;
    assert_eq!(profiling::snapshot(), report);

    profiling::reset();
    assert!(profiling::snapshot().counters.is_empty());
    Ok(())
}
