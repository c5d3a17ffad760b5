//! Matrix-vector products.
//!
//! Recurrent cells apply the same weight matrix to many hidden states; batched backends can
//! turn a step of `matvec`/`affine` nodes sharing `W` into one matrix-matrix product.

use anyhow::Result;

use crate::backend::spec::{BatchBackend, Operation};
use crate::expr::Expression;

use super::common::emit;

/// `W[m,k] * x[k] -> [m]`.
pub fn matvec<B: BatchBackend + 'static>(
    weight: &Expression<B>,
    x: &Expression<B>,
) -> Result<Expression<B>> {
    emit(Operation::MatVec, &[weight, x])
}

/// `b[m] + W[m,k] * x[k] -> [m]`.
pub fn affine<B: BatchBackend + 'static>(
    bias: &Expression<B>,
    weight: &Expression<B>,
    x: &Expression<B>,
) -> Result<Expression<B>> {
    emit(Operation::Affine, &[bias, weight, x])
}

/// Inner product of two vectors, producing a `[1]` tensor.
pub fn dot<B: BatchBackend + 'static>(
    lhs: &Expression<B>,
    rhs: &Expression<B>,
) -> Result<Expression<B>> {
    emit(Operation::Dot, &[lhs, rhs])
}
