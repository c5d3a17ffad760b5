//! Layout operators. Backends usually run these node by node.

use anyhow::Result;

use crate::backend::spec::{BatchBackend, Operation};
use crate::expr::Expression;

use super::common::emit;

/// Concatenates vectors end to end.
pub fn concat<B: BatchBackend + 'static>(parts: &[&Expression<B>]) -> Result<Expression<B>> {
    emit(Operation::Concat, parts)
}

pub fn transpose<B: BatchBackend + 'static>(x: &Expression<B>) -> Result<Expression<B>> {
    emit(Operation::Transpose, &[x])
}
