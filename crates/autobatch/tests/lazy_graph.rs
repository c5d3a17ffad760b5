use std::sync::Arc;

use anyhow::Result;
use autobatch::backend::spec::{BinaryOp, Operation, Shape, UnaryOp};
use autobatch::graph::GraphError;
use autobatch::ops::{self, ExpressionOps};
use autobatch::{AutobatchConfig, BatchStrategy, ComputationGraph, Tensor};
use autobatch_backend_ref_cpu::CpuBackend;
use autobatch_backend_tests::CountingBackend;

type Counting = CountingBackend<CpuBackend>;

fn counting_graph(
    strategy: BatchStrategy,
) -> (Arc<Counting>, Arc<ComputationGraph<Counting>>) {
    let backend = Arc::new(CountingBackend::new(Arc::new(CpuBackend::new())));
    let graph = ComputationGraph::with_config(Arc::clone(&backend), AutobatchConfig::new(strategy));
    (backend, graph)
}

fn graph_error(err: &anyhow::Error) -> &GraphError {
    err.downcast_ref::<GraphError>()
        .unwrap_or_else(|| panic!("expected a graph error, got: {err}"))
}

#[test]
fn building_expressions_runs_nothing() -> Result<()> {
    let (backend, graph) = counting_graph(BatchStrategy::Agenda);
    let x = ops::input(&graph, &Tensor::from_vec(Shape::vector(2), vec![0.5, -1.0])?)?;
    let y = x.tanh()?;
    let z = y.add(&x)?;
    assert_eq!(backend.calls(), 0);
    assert!(!z.is_computed()?);

    let values = z.to_vec()?;
    assert!(backend.calls() > 0);
    assert!(y.is_computed()?);
    assert_eq!(values, vec![0.5f32.tanh() + 0.5, (-1.0f32).tanh() - 1.0]);
    Ok(())
}

#[test]
fn evaluating_cached_targets_is_a_no_op() -> Result<()> {
    let (backend, graph) = counting_graph(BatchStrategy::Depth);
    let x = ops::constant(&graph, Shape::vector(3), 2.0)?;
    let y = x.square()?.neg()?;

    y.forward()?;
    let calls = backend.calls();
    let evaluations = graph.stats().evaluations;

    y.forward()?;
    graph.evaluate(&[y.node(), x.node()])?;
    assert_eq!(y.to_vec()?, vec![-4.0; 3]);
    assert_eq!(backend.calls(), calls);
    assert_eq!(graph.stats().evaluations, evaluations + 3);
    assert_eq!(graph.stats().plans_built, 1);
    Ok(())
}

#[test]
fn partial_evaluation_reuses_computed_ancestors() -> Result<()> {
    let (backend, graph) = counting_graph(BatchStrategy::Off);
    let x = ops::constant(&graph, Shape::vector(4), 0.25)?;
    let hidden = x.sigmoid()?.tanh()?;
    hidden.forward()?;
    assert_eq!(backend.node_calls(), 2);

    let out = hidden.mul(&x)?;
    out.forward()?;
    assert_eq!(backend.node_calls(), 3);
    Ok(())
}

#[test]
fn reset_rejects_pre_reset_handles() -> Result<()> {
    let (_backend, graph) = counting_graph(BatchStrategy::Agenda);
    let x = ops::constant(&graph, Shape::vector(2), 1.0)?;
    let y = x.exp()?;
    y.forward()?;
    let generation = graph.generation();

    graph.reset();
    assert_eq!(graph.generation(), generation + 1);
    assert!(graph.is_empty());

    let err = graph.evaluate(&[y.node()]).unwrap_err();
    assert!(matches!(
        graph_error(&err),
        GraphError::StaleHandle { node_generation, current, .. }
            if *node_generation == generation && *current == generation + 1
    ));
    assert!(matches!(
        graph_error(&graph.value(x.node()).unwrap_err()),
        GraphError::StaleHandle { .. }
    ));
    let err = graph
        .create_node(
            Operation::Unary(UnaryOp::Neg),
            &[x.node()],
            Shape::vector(2),
        )
        .unwrap_err();
    assert!(matches!(graph_error(&err), GraphError::StaleHandle { .. }));

    let fresh = ops::constant(&graph, Shape::vector(2), 1.0)?;
    assert_eq!(fresh.node().sequence(), 0);
    assert_eq!(fresh.exp()?.to_vec()?, vec![1.0f32.exp(); 2]);
    Ok(())
}

#[test]
fn handles_from_other_graphs_are_rejected() -> Result<()> {
    let (_, first) = counting_graph(BatchStrategy::Agenda);
    let (_, second) = counting_graph(BatchStrategy::Agenda);
    let a = ops::constant(&first, Shape::vector(2), 1.0)?;
    let b = ops::constant(&second, Shape::vector(2), 2.0)?;

    let err = a.add(&b).unwrap_err();
    assert!(matches!(graph_error(&err), GraphError::ForeignHandle { .. }));
    let err = ops::forward(&[&a, &b]).unwrap_err();
    assert!(matches!(graph_error(&err), GraphError::ForeignHandle { .. }));
    Ok(())
}

#[test]
fn create_node_validates_operands_and_declared_shape() -> Result<()> {
    let (_, graph) = counting_graph(BatchStrategy::Agenda);
    let x = graph.input(&Tensor::zeros(Shape::vector(3)))?;
    let y = graph.input(&Tensor::zeros(Shape::vector(4)))?;

    let err = graph
        .create_node(Operation::Unary(UnaryOp::Relu), &[x], Shape::vector(4))
        .unwrap_err();
    assert!(matches!(
        graph_error(&err),
        GraphError::DeclaredShapeMismatch { op: "relu", .. }
    ));

    let err = graph
        .create_node(Operation::Binary(BinaryOp::Add), &[x, y], Shape::vector(3))
        .unwrap_err();
    assert!(matches!(graph_error(&err), GraphError::Shape(_)));

    let err = graph
        .create_node(Operation::Pick { index: 3 }, &[x], Shape::scalar())
        .unwrap_err();
    assert!(matches!(graph_error(&err), GraphError::Shape(_)));

    let ok = graph.create_node(Operation::Pick { index: 2 }, &[x], Shape::scalar())?;
    assert_eq!(graph.shape(ok)?, Shape::scalar());
    assert_eq!(graph.len(), 3);
    Ok(())
}

#[test]
fn scalar_value_requires_a_single_element() -> Result<()> {
    let (backend, graph) = counting_graph(BatchStrategy::Agenda);
    let x = ops::input(&graph, &Tensor::from_vec(Shape::vector(3), vec![1.0, 2.0, 3.0])?)?;
    let err = x.softmax()?.scalar_value().unwrap_err();
    assert!(matches!(graph_error(&err), GraphError::NotScalar(_)));
    assert_eq!(backend.calls(), 0);

    assert_eq!(x.sum_elements()?.scalar_value()?, 6.0);
    assert_eq!(x.pick(1)?.scalar_value()?, 2.0);
    Ok(())
}

#[test]
fn sequence_numbers_follow_creation_order() -> Result<()> {
    let (_, graph) = counting_graph(BatchStrategy::Agenda);
    let x = ops::constant(&graph, Shape::vector(2), 0.0)?;
    let y = x.relu()?;
    let z = ops::sum(&[&x, &y, &y])?;
    assert_eq!(
        [x.node().sequence(), y.node().sequence(), z.node().sequence()],
        [0, 1, 2]
    );
    assert!(x.node() < z.node());
    assert_eq!(z.node().graph_id(), graph.id());
    Ok(())
}
