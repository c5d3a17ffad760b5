//! Normalisation, selection, and loss operators over vectors.

use anyhow::Result;

use crate::backend::spec::{BatchBackend, Operation};
use crate::expr::Expression;

use super::common::emit;

pub fn sum_elements<B: BatchBackend + 'static>(x: &Expression<B>) -> Result<Expression<B>> {
    emit(Operation::SumElements, &[x])
}

/// Numerically stable softmax over a vector.
pub fn softmax<B: BatchBackend + 'static>(x: &Expression<B>) -> Result<Expression<B>> {
    emit(Operation::Softmax, &[x])
}

pub fn log_softmax<B: BatchBackend + 'static>(x: &Expression<B>) -> Result<Expression<B>> {
    emit(Operation::LogSoftmax, &[x])
}

/// Selects element `index` of a vector.
pub fn pick<B: BatchBackend + 'static>(x: &Expression<B>, index: usize) -> Result<Expression<B>> {
    emit(Operation::Pick { index }, &[x])
}

/// Negative log-likelihood of class `index` under `softmax(x)`.
///
/// Batched steps may mix different indices; only the logit shape has to agree.
pub fn pick_neg_log_softmax<B: BatchBackend + 'static>(
    x: &Expression<B>,
    index: usize,
) -> Result<Expression<B>> {
    emit(Operation::PickNegLogSoftmax { index }, &[x])
}
