use std::sync::Arc;

use anyhow::Result;
use autobatch::backend::spec::{
    BatchBackend, BatchMember, BinaryOp, OpKind, Operation, Shape, UnaryOp,
};
use autobatch::graph::{ComputationGraph, GraphError};
use autobatch::ops::{self, ExpressionOps};
use autobatch::{AutobatchConfig, BatchStrategy, Expression, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::counting_backend::CountingBackend;

const TOLERANCE: f32 = 1e-5;

pub fn assert_close(actual: &[f32], expected: &[f32], context: &str) {
    assert_eq!(actual.len(), expected.len(), "{context}: length mismatch");
    for (index, (lhs, rhs)) in actual.iter().zip(expected).enumerate() {
        let scale = lhs.abs().max(rhs.abs()).max(1.0);
        assert!(
            (lhs - rhs).abs() <= TOLERANCE * scale,
            "{context}: element {index} differs ({lhs} vs {rhs})"
        );
    }
}

struct KernelCase {
    /// One operation per batch member; attributes may differ.
    ops: Vec<Operation>,
    operands: Vec<Shape>,
    output: Shape,
    /// Operand position whose handle is reused by every member.
    shared: Option<usize>,
}

fn kernel_cases(members: usize) -> Vec<KernelCase> {
    let same = |op: Operation| vec![op; members];
    let mut cases = Vec::new();
    for unary in [
        UnaryOp::Neg,
        UnaryOp::Tanh,
        UnaryOp::Sigmoid,
        UnaryOp::Relu,
        UnaryOp::Exp,
        UnaryOp::Log,
        UnaryOp::Square,
    ] {
        cases.push(KernelCase {
            ops: same(Operation::Unary(unary)),
            operands: vec![Shape::vector(5)],
            output: Shape::vector(5),
            shared: None,
        });
    }
    for binary in [BinaryOp::Add, BinaryOp::Sub, BinaryOp::Mul, BinaryOp::Div] {
        cases.push(KernelCase {
            ops: same(Operation::Binary(binary)),
            operands: vec![Shape::matrix(2, 3); 2],
            output: Shape::matrix(2, 3),
            shared: None,
        });
    }
    cases.push(KernelCase {
        ops: same(Operation::Sum),
        operands: vec![Shape::vector(4); 3],
        output: Shape::vector(4),
        shared: None,
    });
    cases.push(KernelCase {
        ops: same(Operation::MatVec),
        operands: vec![Shape::matrix(3, 4), Shape::vector(4)],
        output: Shape::vector(3),
        shared: Some(0),
    });
    cases.push(KernelCase {
        ops: same(Operation::MatVec),
        operands: vec![Shape::matrix(3, 4), Shape::vector(4)],
        output: Shape::vector(3),
        shared: None,
    });
    cases.push(KernelCase {
        ops: same(Operation::Affine),
        operands: vec![Shape::vector(3), Shape::matrix(3, 4), Shape::vector(4)],
        output: Shape::vector(3),
        shared: Some(1),
    });
    cases.push(KernelCase {
        ops: same(Operation::Dot),
        operands: vec![Shape::vector(6); 2],
        output: Shape::scalar(),
        shared: None,
    });
    for op in [
        Operation::SumElements,
        Operation::Softmax,
        Operation::LogSoftmax,
    ] {
        let output = if op == Operation::SumElements {
            Shape::scalar()
        } else {
            Shape::vector(5)
        };
        cases.push(KernelCase {
            ops: same(op),
            operands: vec![Shape::vector(5)],
            output,
            shared: None,
        });
    }
    cases.push(KernelCase {
        ops: (0..members).map(|index| Operation::Pick { index: index % 5 }).collect(),
        operands: vec![Shape::vector(5)],
        output: Shape::scalar(),
        shared: None,
    });
    cases.push(KernelCase {
        ops: (0..members)
            .map(|index| Operation::PickNegLogSoftmax { index: (index * 2) % 5 })
            .collect(),
        operands: vec![Shape::vector(5)],
        output: Shape::scalar(),
        shared: None,
    });
    cases
}

fn random_tensor(shape: &Shape, rng: &mut StdRng) -> Tensor {
    let data = (0..shape.num_elements())
        .map(|_| rng.gen_range(0.25f32..1.75))
        .collect();
    Tensor::from_vec(shape.clone(), data).unwrap()
}

/// Every batched kernel the backend advertises must agree with its single-node kernel.
pub fn batched_kernels_match_single_node<B: BatchBackend + 'static>(backend: &Arc<B>) {
    let mut rng = StdRng::seed_from_u64(7);
    for case in kernel_cases(4) {
        let kind = case.ops[0].kind();
        if !backend.supports_batching(kind) {
            continue;
        }
        let shared: Vec<Option<B::TensorHandle>> = case
            .operands
            .iter()
            .enumerate()
            .map(|(position, shape)| {
                (case.shared == Some(position))
                    .then(|| backend.materialize(&random_tensor(shape, &mut rng)).unwrap())
            })
            .collect();
        let inputs: Vec<Vec<B::TensorHandle>> = case
            .ops
            .iter()
            .map(|_| {
                case.operands
                    .iter()
                    .zip(&shared)
                    .map(|(shape, shared)| match shared {
                        Some(handle) => handle.clone(),
                        None => backend.materialize(&random_tensor(shape, &mut rng)).unwrap(),
                    })
                    .collect()
            })
            .collect();

        let expected: Vec<Tensor> = case
            .ops
            .iter()
            .zip(&inputs)
            .map(|(op, inputs)| {
                let handle = backend.execute_node(op, inputs, &case.output).unwrap();
                backend.to_host(&handle).unwrap()
            })
            .collect();

        let members: Vec<BatchMember<'_, B::TensorHandle>> = case
            .ops
            .iter()
            .zip(&inputs)
            .map(|(op, inputs)| BatchMember {
                op,
                inputs,
                shape: &case.output,
            })
            .collect();
        let outputs = match backend.execute_batch(kind, &members) {
            Ok(outputs) => outputs,
            Err(err) if err.is_unimplemented() => continue,
            Err(err) => panic!("batched {kind} failed: {err}"),
        };
        assert_eq!(outputs.len(), expected.len(), "batched {kind} output count");
        for (index, (output, expected)) in outputs.iter().zip(&expected).enumerate() {
            let actual = backend.to_host(output).unwrap();
            assert_eq!(actual.shape(), expected.shape(), "batched {kind} member {index}");
            assert_close(
                actual.data(),
                expected.data(),
                &format!("batched {kind} member {index}"),
            );
        }
    }
}

/// Expressions produced by [`build_recurrent`].
pub struct RecurrentWorkload<B: BatchBackend + 'static> {
    /// Per-sequence losses followed by their sum.
    pub losses: Vec<Expression<B>>,
    /// Every non-leaf expression, in creation order.
    pub nodes: Vec<Expression<B>>,
}

/// Records a small tanh RNN over sequences of different lengths that share parameters.
pub fn build_recurrent<B: BatchBackend + 'static>(
    graph: &Arc<ComputationGraph<B>>,
    seed: u64,
) -> Result<RecurrentWorkload<B>> {
    const HIDDEN: usize = 6;
    const INPUT: usize = 4;
    const CLASSES: usize = 3;
    let mut rng = StdRng::seed_from_u64(seed);

    let w = ops::input(graph, &Tensor::randn(Shape::matrix(HIDDEN, INPUT), 0.5, &mut rng))?;
    let u = ops::input(graph, &Tensor::randn(Shape::matrix(HIDDEN, HIDDEN), 0.5, &mut rng))?;
    let b = ops::input(graph, &Tensor::randn(Shape::vector(HIDDEN), 0.1, &mut rng))?;
    let v = ops::input(graph, &Tensor::randn(Shape::matrix(CLASSES, HIDDEN), 0.5, &mut rng))?;

    let mut nodes = Vec::new();
    let mut losses = Vec::new();
    for (sequence, length) in [3usize, 5, 2, 5].into_iter().enumerate() {
        let mut hidden = ops::constant(graph, Shape::vector(HIDDEN), 0.0)?;
        for _ in 0..length {
            let x = ops::input(graph, &Tensor::randn(Shape::vector(INPUT), 1.0, &mut rng))?;
            let projected = ops::affine(&b, &w, &x)?;
            let recurrent = ops::matvec(&u, &hidden)?;
            let preactivation = projected.add(&recurrent)?;
            hidden = preactivation.tanh()?;
            nodes.extend([projected, recurrent, preactivation, hidden.clone()]);
        }
        let logits = ops::matvec(&v, &hidden)?;
        let loss = logits.pick_neg_log_softmax(sequence % CLASSES)?;
        nodes.extend([logits, loss.clone()]);
        losses.push(loss);
    }
    let total = ops::sum(&losses.iter().collect::<Vec<_>>())?;
    nodes.push(total.clone());
    losses.push(total);
    Ok(RecurrentWorkload { losses, nodes })
}

fn graph_with<B: BatchBackend + 'static>(
    backend: &Arc<B>,
    strategy: BatchStrategy,
) -> Arc<ComputationGraph<B>> {
    ComputationGraph::with_config(Arc::clone(backend), AutobatchConfig::new(strategy))
}

pub fn recurrent_values_match_across_strategies<B: BatchBackend + 'static>(backend: &Arc<B>) {
    let mut reference: Option<Vec<Vec<f32>>> = None;
    for strategy in BatchStrategy::ALL {
        let graph = graph_with(backend, strategy);
        let workload = build_recurrent(&graph, 11).unwrap();
        ops::forward(&workload.losses.iter().collect::<Vec<_>>()).unwrap();
        let values: Vec<Vec<f32>> = workload
            .nodes
            .iter()
            .map(|expr| expr.to_vec().unwrap())
            .collect();
        match &reference {
            None => reference = Some(values),
            Some(expected) => {
                for (index, (actual, expected)) in values.iter().zip(expected).enumerate() {
                    assert_close(actual, expected, &format!("{strategy} node {index}"));
                }
            }
        }
    }
}

pub fn evaluation_order_does_not_change_values<B: BatchBackend + 'static>(backend: &Arc<B>) {
    for strategy in [BatchStrategy::Agenda, BatchStrategy::Depth] {
        let latest = graph_with(backend, strategy);
        let latest_workload = build_recurrent(&latest, 5).unwrap();
        for expr in latest_workload.nodes.iter().rev() {
            expr.forward().unwrap();
        }

        let creation = graph_with(backend, strategy);
        let creation_workload = build_recurrent(&creation, 5).unwrap();
        for expr in &creation_workload.nodes {
            expr.forward().unwrap();
        }

        for (index, (lhs, rhs)) in latest_workload
            .nodes
            .iter()
            .zip(&creation_workload.nodes)
            .enumerate()
        {
            assert_close(
                &lhs.to_vec().unwrap(),
                &rhs.to_vec().unwrap(),
                &format!("{strategy} node {index}"),
            );
        }
    }
}

pub fn independent_chains_share_kernel_launches<B: BatchBackend + 'static>(backend: &Arc<B>) {
    let counting = Arc::new(CountingBackend::new(Arc::clone(backend)));
    let graph = graph_with(&counting, BatchStrategy::Agenda);
    let mut heads = Vec::new();
    for chain in 0..4 {
        let mut x = ops::constant(&graph, Shape::vector(8), chain as f32 * 0.1).unwrap();
        for _ in 0..3 {
            x = x.tanh().unwrap();
        }
        heads.push(x);
    }
    ops::forward(&heads.iter().collect::<Vec<_>>()).unwrap();

    let stats = graph.stats();
    assert_eq!(stats.nodes_computed, 12);
    if !backend.supports_batching(OpKind::Unary(UnaryOp::Tanh)) {
        assert_eq!(stats.steps, 12);
        assert_eq!(counting.node_calls(), 12);
        return;
    }
    assert_eq!(stats.steps, 3);
    assert_eq!(counting.batch_calls(), 3);
    assert_eq!(counting.batched_nodes(), 12);
    if stats.fallback_nodes == 0 {
        assert_eq!(stats.kernel_launches, 3);
        assert_eq!(counting.node_calls(), 0);
    } else {
        assert_eq!(counting.node_calls(), 12);
    }
}

pub fn cached_targets_skip_backend<B: BatchBackend + 'static>(backend: &Arc<B>) {
    let counting = Arc::new(CountingBackend::new(Arc::clone(backend)));
    let graph = graph_with(&counting, BatchStrategy::Depth);
    let workload = build_recurrent(&graph, 3).unwrap();
    let total = workload.losses.last().unwrap();

    total.forward().unwrap();
    let first = total.scalar_value().unwrap();
    let calls = counting.calls();
    assert!(calls > 0);

    total.forward().unwrap();
    for expr in &workload.nodes {
        expr.forward().unwrap();
    }
    assert_eq!(counting.calls(), calls, "cached targets must not reach the backend");
    assert_eq!(total.scalar_value().unwrap(), first);
}

pub fn unbatched_kinds_still_evaluate<B: BatchBackend + 'static>(backend: &Arc<B>) {
    let graph = graph_with(backend, BatchStrategy::Agenda);
    let a = ops::input(&graph, &Tensor::from_vec(Shape::vector(2), vec![1.0, 2.0]).unwrap()).unwrap();
    let b = ops::input(&graph, &Tensor::from_vec(Shape::vector(1), vec![3.0]).unwrap()).unwrap();
    let m = ops::input(
        &graph,
        &Tensor::from_vec(Shape::matrix(2, 3), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap(),
    )
    .unwrap();

    let first = ops::concat(&[&a, &b]).unwrap();
    let second = ops::concat(&[&b, &a]).unwrap();
    let flipped = m.transpose().unwrap();
    let flipped_twice = m.transpose().unwrap();
    ops::forward(&[&first, &second, &flipped, &flipped_twice]).unwrap();

    assert_eq!(first.to_vec().unwrap(), vec![1.0, 2.0, 3.0]);
    assert_eq!(second.to_vec().unwrap(), vec![3.0, 1.0, 2.0]);
    assert_eq!(flipped.shape(), &Shape::matrix(3, 2));
    assert_eq!(flipped.to_vec().unwrap(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    assert_eq!(flipped_twice.to_vec().unwrap(), flipped.to_vec().unwrap());
}

pub fn reset_invalidates_handles<B: BatchBackend + 'static>(backend: &Arc<B>) {
    let graph = graph_with(backend, BatchStrategy::Agenda);
    let x = ops::constant(&graph, Shape::vector(3), 0.5).unwrap();
    let y = x.tanh().unwrap();
    y.forward().unwrap();

    graph.reset();
    assert!(graph.is_empty());

    let err = y.forward().unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<GraphError>(),
            Some(GraphError::StaleHandle { .. })
        ),
        "unexpected error: {err}"
    );
    let err = y.tanh().unwrap_err();
    assert!(
        matches!(
            err.downcast_ref::<GraphError>(),
            Some(GraphError::StaleHandle { .. })
        ),
        "unexpected error: {err}"
    );

    let fresh = ops::constant(&graph, Shape::vector(3), 0.5).unwrap();
    assert_eq!(fresh.tanh().unwrap().to_vec().unwrap(), vec![0.5f32.tanh(); 3]);
}
