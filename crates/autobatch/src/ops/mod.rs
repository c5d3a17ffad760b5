//! Functional constructors that record deferred operations on a graph.
//!
//! Every function here only appends a node; nothing runs until one of the results is evaluated
//! through [`forward`], [`Expression::forward`], or a value accessor.

mod common;
mod elementwise;
mod linalg;
mod loss;
mod shape;

use std::sync::Arc;

use anyhow::Result;
use smallvec::SmallVec;

use crate::backend::spec::{BatchBackend, Shape};
use crate::expr::Expression;
use crate::graph::{ComputationGraph, NodeId};
use crate::tensor::Tensor;

pub use common::ExpressionOps;
pub use elementwise::{
    add, binary, cdiv, cmult, exp, log, neg, relu, sigmoid, square, sub, sum, tanh, unary,
};
pub use linalg::{affine, dot, matvec};
pub use loss::{log_softmax, pick, pick_neg_log_softmax, softmax, sum_elements};
pub use shape::{concat, transpose};

/// Records `tensor` as a leaf of `graph`.
pub fn input<B: BatchBackend + 'static>(
    graph: &Arc<ComputationGraph<B>>,
    tensor: &Tensor,
) -> Result<Expression<B>> {
    let node = graph.input(tensor)?;
    Ok(Expression::new(
        Arc::clone(graph),
        node,
        tensor.shape().clone(),
    ))
}

/// Leaf filled with `value`.
pub fn constant<B: BatchBackend + 'static>(
    graph: &Arc<ComputationGraph<B>>,
    shape: Shape,
    value: f32,
) -> Result<Expression<B>> {
    input(graph, &Tensor::full(shape, value))
}

/// Evaluates several expressions in one scheduling pass.
///
/// Requesting all outputs together lets the scheduler batch across them, which evaluating
/// them one by one cannot.
pub fn forward<B: BatchBackend + 'static>(exprs: &[&Expression<B>]) -> Result<()> {
    let Some(first) = exprs.first() else {
        return Ok(());
    };
    let nodes: SmallVec<[NodeId; 8]> = exprs.iter().map(|expr| expr.node()).collect();
    first.graph().evaluate(&nodes)
}
