//! Property: batching is an optimisation only. Every strategy and evaluation order yields the
//! same value for every node of a randomly generated graph.

use std::sync::Arc;

use anyhow::Result;
use autobatch::backend::{BinaryOp, Shape, UnaryOp};
use autobatch::ops::{self, ExpressionOps};
use autobatch::{AutobatchConfig, BatchStrategy, ComputationGraph, Expression, Tensor};
use autobatch_backend_ref_cpu::CpuBackend;
use proptest::prelude::*;
use proptest::sample::Index;
use proptest::test_runner::Config;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

const WIDE: usize = 4;
const NARROW: usize = 2;

const UNARY: [UnaryOp; 4] = [UnaryOp::Neg, UnaryOp::Tanh, UnaryOp::Sigmoid, UnaryOp::Relu];
const BINARY: [BinaryOp; 3] = [BinaryOp::Add, BinaryOp::Sub, BinaryOp::Mul];

#[derive(Debug, Clone)]
enum NodeSpec {
    Unary { op: usize, wide: bool, src: Index },
    Binary { op: usize, wide: bool, lhs: Index, rhs: Index },
    /// `W[4,4] * x[4]`.
    Recur { src: Index },
    /// `b[2] + V[2,4] * x[4]`.
    Project { src: Index },
    Loss { src: Index, class: usize },
}

fn node_spec() -> impl Strategy<Value = NodeSpec> {
    prop_oneof![
        (0..UNARY.len(), any::<bool>(), any::<Index>())
            .prop_map(|(op, wide, src)| NodeSpec::Unary { op, wide, src }),
        (0..BINARY.len(), any::<bool>(), any::<Index>(), any::<Index>())
            .prop_map(|(op, wide, lhs, rhs)| NodeSpec::Binary { op, wide, lhs, rhs }),
        any::<Index>().prop_map(|src| NodeSpec::Recur { src }),
        any::<Index>().prop_map(|src| NodeSpec::Project { src }),
        (any::<Index>(), 0..NARROW).prop_map(|(src, class)| NodeSpec::Loss { src, class }),
    ]
}

#[derive(Debug, Clone, Copy)]
enum Order {
    AllAtOnce,
    LatestFirst,
    CreationOrder,
    Shuffled(u64),
}

fn build(
    graph: &Arc<ComputationGraph<CpuBackend>>,
    specs: &[NodeSpec],
) -> Result<Vec<Expression<CpuBackend>>> {
    let mut rng = StdRng::seed_from_u64(99);
    let w = ops::input(graph, &Tensor::randn(Shape::matrix(WIDE, WIDE), 0.5, &mut rng))?;
    let v = ops::input(graph, &Tensor::randn(Shape::matrix(NARROW, WIDE), 0.5, &mut rng))?;
    let b = ops::input(graph, &Tensor::randn(Shape::vector(NARROW), 0.5, &mut rng))?;
    let mut wide = (0..3)
        .map(|_| ops::input(graph, &Tensor::randn(Shape::vector(WIDE), 1.0, &mut rng)))
        .collect::<Result<Vec<_>>>()?;
    let mut narrow = vec![ops::input(
        graph,
        &Tensor::randn(Shape::vector(NARROW), 1.0, &mut rng),
    )?];

    let mut created = Vec::new();
    for spec in specs {
        match spec {
            NodeSpec::Unary { op, wide: true, src } => {
                let node = ops::unary(src.get(&wide), UNARY[*op])?;
                wide.push(node.clone());
                created.push(node);
            }
            NodeSpec::Unary { op, wide: false, src } => {
                let node = ops::unary(src.get(&narrow), UNARY[*op])?;
                narrow.push(node.clone());
                created.push(node);
            }
            NodeSpec::Binary { op, wide: true, lhs, rhs } => {
                let node = ops::binary(lhs.get(&wide), rhs.get(&wide), BINARY[*op])?;
                wide.push(node.clone());
                created.push(node);
            }
            NodeSpec::Binary { op, wide: false, lhs, rhs } => {
                let node = ops::binary(lhs.get(&narrow), rhs.get(&narrow), BINARY[*op])?;
                narrow.push(node.clone());
                created.push(node);
            }
            NodeSpec::Recur { src } => {
                let node = ops::matvec(&w, src.get(&wide))?.tanh()?;
                wide.push(node.clone());
                created.push(node);
            }
            NodeSpec::Project { src } => {
                let node = ops::affine(&b, &v, src.get(&wide))?;
                narrow.push(node.clone());
                created.push(node);
            }
            NodeSpec::Loss { src, class } => {
                created.push(src.get(&narrow).pick_neg_log_softmax(*class)?);
            }
        }
    }
    Ok(created)
}

fn run(strategy: BatchStrategy, order: Order, specs: &[NodeSpec]) -> Result<Vec<Vec<u32>>> {
    let graph = ComputationGraph::with_config(
        Arc::new(CpuBackend::new()),
        AutobatchConfig::new(strategy),
    );
    let nodes = build(&graph, specs)?;
    match order {
        Order::AllAtOnce => ops::forward(&nodes.iter().collect::<Vec<_>>())?,
        Order::LatestFirst => {
            for node in nodes.iter().rev() {
                node.forward()?;
            }
        }
        Order::CreationOrder => {
            for node in &nodes {
                node.forward()?;
            }
        }
        Order::Shuffled(seed) => {
            let mut shuffled: Vec<&Expression<CpuBackend>> = nodes.iter().collect();
            shuffled.shuffle(&mut StdRng::seed_from_u64(seed));
            for chunk in shuffled.chunks(3) {
                ops::forward(chunk)?;
            }
        }
    }
    // Compare bit patterns so that NaNs from overflowing products still compare equal.
    nodes
        .iter()
        .map(|node| Ok(node.to_vec()?.into_iter().map(f32::to_bits).collect()))
        .collect()
}

proptest! {
    #![proptest_config(Config::with_cases(48))]

    #[test]
    fn prop_strategies_and_orders_agree(
        specs in prop::collection::vec(node_spec(), 1..48),
        seed in any::<u64>()
    ) {
        let reference = run(BatchStrategy::Off, Order::CreationOrder, &specs).unwrap();
        for strategy in BatchStrategy::ALL {
            for order in [
                Order::AllAtOnce,
                Order::LatestFirst,
                Order::CreationOrder,
                Order::Shuffled(seed),
            ] {
                let values = run(strategy, order, &specs).unwrap();
                prop_assert_eq!(&values, &reference, "{} {:?}", strategy, order);
            }
        }
    }
}
