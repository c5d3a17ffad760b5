//! Shared helpers backing the functional expression API.
//!
//! [`ExpressionOps`] lets callers write `x.tanh()?.add(&y)?` instead of the free functions.

use anyhow::{anyhow, Result};
use smallvec::SmallVec;

use crate::backend::spec::{BatchBackend, Operation, Shape};
use crate::expr::Expression;
use crate::graph::{GraphError, NodeId};

/// Infers the output shape of `op` and records it on the operands' graph.
pub(crate) fn emit<B: BatchBackend + 'static>(
    op: Operation,
    operands: &[&Expression<B>],
) -> Result<Expression<B>> {
    let shapes: SmallVec<[&Shape; 4]> = operands.iter().map(|expr| expr.shape()).collect();
    let shape = op.infer_shape(&shapes).map_err(GraphError::from)?;
    let graph = operands
        .first()
        .map(|expr| expr.graph().clone())
        .ok_or_else(|| anyhow!("{} requires at least one operand", op.name()))?;
    let nodes: SmallVec<[NodeId; 4]> = operands.iter().map(|expr| expr.node()).collect();
    let node = graph.create_node(op, &nodes, shape.clone())?;
    Ok(Expression::new(graph, node, shape))
}

/// Method-style access to the functional operators.
pub trait ExpressionOps<B: BatchBackend + 'static>: Sized {
    fn add(&self, rhs: &Self) -> Result<Self>;
    fn sub(&self, rhs: &Self) -> Result<Self>;
    /// Elementwise product.
    fn mul(&self, rhs: &Self) -> Result<Self>;
    /// Elementwise quotient.
    fn div(&self, rhs: &Self) -> Result<Self>;
    fn neg(&self) -> Result<Self>;
    fn tanh(&self) -> Result<Self>;
    fn sigmoid(&self) -> Result<Self>;
    fn relu(&self) -> Result<Self>;
    fn exp(&self) -> Result<Self>;
    fn log(&self) -> Result<Self>;
    fn square(&self) -> Result<Self>;
    fn dot(&self, rhs: &Self) -> Result<Self>;
    fn sum_elements(&self) -> Result<Self>;
    fn softmax(&self) -> Result<Self>;
    fn log_softmax(&self) -> Result<Self>;
    fn pick(&self, index: usize) -> Result<Self>;
    fn pick_neg_log_softmax(&self, index: usize) -> Result<Self>;
    fn transpose(&self) -> Result<Self>;
}

impl<B: BatchBackend + 'static> ExpressionOps<B> for Expression<B> {
    fn add(&self, rhs: &Self) -> Result<Self> {
        super::add(self, rhs)
    }

    fn sub(&self, rhs: &Self) -> Result<Self> {
        super::sub(self, rhs)
    }

    fn mul(&self, rhs: &Self) -> Result<Self> {
        super::cmult(self, rhs)
    }

    fn div(&self, rhs: &Self) -> Result<Self> {
        super::cdiv(self, rhs)
    }

    fn neg(&self) -> Result<Self> {
        super::neg(self)
    }

    fn tanh(&self) -> Result<Self> {
        super::tanh(self)
    }

    fn sigmoid(&self) -> Result<Self> {
        super::sigmoid(self)
    }

    fn relu(&self) -> Result<Self> {
        super::relu(self)
    }

    fn exp(&self) -> Result<Self> {
        super::exp(self)
    }

    fn log(&self) -> Result<Self> {
        super::log(self)
    }

    fn square(&self) -> Result<Self> {
        super::square(self)
    }

    fn dot(&self, rhs: &Self) -> Result<Self> {
        super::dot(self, rhs)
    }

    fn sum_elements(&self) -> Result<Self> {
        super::sum_elements(self)
    }

    fn softmax(&self) -> Result<Self> {
        super::softmax(self)
    }

    fn log_softmax(&self) -> Result<Self> {
        super::log_softmax(self)
    }

    fn pick(&self, index: usize) -> Result<Self> {
        super::pick(self, index)
    }

    fn pick_neg_log_softmax(&self, index: usize) -> Result<Self> {
        super::pick_neg_log_softmax(self, index)
    }

    fn transpose(&self) -> Result<Self> {
        super::transpose(self)
    }
}
