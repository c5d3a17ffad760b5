//! Runs scheduled steps against the backend and fills node cache slots.

use std::sync::Arc;
use std::time::Instant;

use smallvec::SmallVec;

use crate::backend::spec::{BackendError, BatchBackend, BatchMember, OpKind, Operation};
use crate::profiling;
use crate::trace::{self, ExecutionTraceSink, StepContext, StepStats, StepStatus};

use super::error::GraphError;
use super::plan::PlanStep;
use super::state::{GraphInner, NodeOp, NodeState};
use super::stats::RunSummary;

struct StepOutcome {
    kernel_launches: usize,
    fallback: bool,
}

/// Executes `steps` in order. `pending` maps plan positions to node indices.
pub(super) fn run_plan<B: BatchBackend + 'static>(
    backend: &B,
    inner: &mut GraphInner<B>,
    pending: &[u32],
    steps: &[PlanStep],
) -> Result<RunSummary, GraphError> {
    let sink = trace::current_sink();
    let mut summary = RunSummary::default();

    for (step_index, step) in steps.iter().enumerate() {
        let nodes: SmallVec<[u32; 8]> = step
            .members
            .iter()
            .map(|position| pending[*position as usize])
            .collect();
        let context = sink.as_ref().map(|_| StepContext {
            graph_id: inner.graph_id,
            generation: inner.generation,
            step_index,
            step_count: steps.len(),
            kind: step.kind,
            nodes: nodes.to_vec(),
            batched: step.batched,
        });
        notify_before(sink.as_ref(), context.as_ref());

        let start = Instant::now();
        let result = if step.batched {
            run_batched(backend, inner, step.kind, &nodes)
        } else {
            run_each(backend, inner, &nodes).map(|kernel_launches| StepOutcome {
                kernel_launches,
                fallback: false,
            })
        };
        let duration = start.elapsed();

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                notify_after(
                    sink.as_ref(),
                    context.as_ref(),
                    StepStats {
                        duration,
                        kernel_launches: 0,
                        status: StepStatus::Failure {
                            message: error_chain(&err),
                        },
                    },
                );
                return Err(err);
            }
        };

        tracing::trace!(
            step = step_index,
            kind = %step.kind,
            nodes = nodes.len(),
            batched = step.batched,
            fallback = outcome.fallback,
            elapsed_us = duration.as_micros() as u64,
            "executed step"
        );
        notify_after(
            sink.as_ref(),
            context.as_ref(),
            StepStats {
                duration,
                kernel_launches: outcome.kernel_launches,
                status: if outcome.fallback {
                    StepStatus::Fallback
                } else {
                    StepStatus::Success
                },
            },
        );

        let count = nodes.len() as u64;
        summary.steps += 1;
        summary.kernel_launches += outcome.kernel_launches as u64;
        summary.nodes_computed += count;
        if outcome.fallback {
            summary.fallback_nodes += count;
        } else if step.batched {
            summary.batched_nodes += count;
        }
    }
    Ok(summary)
}

fn notify_before(sink: Option<&Arc<dyn ExecutionTraceSink>>, context: Option<&StepContext>) {
    if let (Some(sink), Some(context)) = (sink, context) {
        sink.before_step(context);
    }
}

fn notify_after(
    sink: Option<&Arc<dyn ExecutionTraceSink>>,
    context: Option<&StepContext>,
    stats: StepStats,
) {
    if let (Some(sink), Some(context)) = (sink, context) {
        sink.after_step(context, &stats);
    }
}

fn run_batched<B: BatchBackend + 'static>(
    backend: &B,
    inner: &mut GraphInner<B>,
    kind: OpKind,
    nodes: &[u32],
) -> Result<StepOutcome, GraphError> {
    let produced = {
        let _scope = profiling::scope("executor::batched_kernel");
        let inputs = nodes
            .iter()
            .map(|node| operand_handles(inner, *node))
            .collect::<Result<Vec<_>, _>>()?;
        let mut members = Vec::with_capacity(nodes.len());
        for (node, inputs) in nodes.iter().zip(&inputs) {
            members.push(BatchMember {
                op: operation(inner, *node)?,
                inputs: inputs.as_slice(),
                shape: &inner.record(*node).shape,
            });
        }
        backend.execute_batch(kind, &members)
    };

    match produced {
        Ok(outputs) => {
            if outputs.len() != nodes.len() {
                return Err(backend_error(
                    backend,
                    kind.name(),
                    BackendError::execution(format!(
                        "batched {kind} returned {} outputs, expected {}",
                        outputs.len(),
                        nodes.len()
                    )),
                ));
            }
            for (node, handle) in nodes.iter().zip(outputs) {
                inner.nodes[*node as usize].state = NodeState::Ready(handle);
            }
            Ok(StepOutcome {
                kernel_launches: 1,
                fallback: false,
            })
        }
        Err(err) if err.is_unimplemented() => {
            tracing::debug!(
                kind = %kind,
                nodes = nodes.len(),
                reason = %err,
                "batched kernel unavailable, running members individually"
            );
            profiling::counter_add("executor::fallback_nodes", nodes.len() as u64);
            let kernel_launches = run_each(backend, inner, nodes)?;
            Ok(StepOutcome {
                kernel_launches,
                fallback: true,
            })
        }
        Err(err) => Err(backend_error(backend, kind.name(), err)),
    }
}

/// Runs each node with its own kernel call, returning the number of launches.
fn run_each<B: BatchBackend + 'static>(
    backend: &B,
    inner: &mut GraphInner<B>,
    nodes: &[u32],
) -> Result<usize, GraphError> {
    for node in nodes {
        let handle = {
            let op = operation(inner, *node)?;
            let inputs = operand_handles(inner, *node)?;
            backend
                .execute_node(op, &inputs, &inner.record(*node).shape)
                .map_err(|err| backend_error(backend, op.name(), err))?
        };
        inner.nodes[*node as usize].state = NodeState::Ready(handle);
    }
    Ok(nodes.len())
}

fn operation<B: BatchBackend + 'static>(
    inner: &GraphInner<B>,
    node: u32,
) -> Result<&Operation, GraphError> {
    match &inner.record(node).op {
        NodeOp::Op(op) => Ok(op),
        // Inputs are ready from creation and never scheduled.
        NodeOp::Input => Err(GraphError::UnknownNode(node)),
    }
}

fn operand_handles<B: BatchBackend + 'static>(
    inner: &GraphInner<B>,
    node: u32,
) -> Result<SmallVec<[B::TensorHandle; 4]>, GraphError> {
    inner
        .record(node)
        .operands
        .iter()
        .map(|operand| inner.ready_handle(*operand))
        .collect()
}

fn error_chain(err: &GraphError) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn backend_error<B: BatchBackend>(backend: &B, op: &'static str, source: BackendError) -> GraphError {
    GraphError::Backend {
        backend: backend.backend_name().to_string(),
        op,
        source,
    }
}
