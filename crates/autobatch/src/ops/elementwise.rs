//! Elementwise operators over equally shaped operands.

use anyhow::Result;

use crate::backend::spec::{BatchBackend, BinaryOp, Operation, UnaryOp};
use crate::expr::Expression;

use super::common::emit;

pub fn unary<B: BatchBackend + 'static>(x: &Expression<B>, op: UnaryOp) -> Result<Expression<B>> {
    emit(Operation::Unary(op), &[x])
}

pub fn neg<B: BatchBackend + 'static>(x: &Expression<B>) -> Result<Expression<B>> {
    unary(x, UnaryOp::Neg)
}

pub fn tanh<B: BatchBackend + 'static>(x: &Expression<B>) -> Result<Expression<B>> {
    unary(x, UnaryOp::Tanh)
}

/// Logistic sigmoid `1 / (1 + e^-x)`.
pub fn sigmoid<B: BatchBackend + 'static>(x: &Expression<B>) -> Result<Expression<B>> {
    unary(x, UnaryOp::Sigmoid)
}

pub fn relu<B: BatchBackend + 'static>(x: &Expression<B>) -> Result<Expression<B>> {
    unary(x, UnaryOp::Relu)
}

pub fn exp<B: BatchBackend + 'static>(x: &Expression<B>) -> Result<Expression<B>> {
    unary(x, UnaryOp::Exp)
}

/// Natural logarithm.
pub fn log<B: BatchBackend + 'static>(x: &Expression<B>) -> Result<Expression<B>> {
    unary(x, UnaryOp::Log)
}

pub fn square<B: BatchBackend + 'static>(x: &Expression<B>) -> Result<Expression<B>> {
    unary(x, UnaryOp::Square)
}

pub fn binary<B: BatchBackend + 'static>(
    lhs: &Expression<B>,
    rhs: &Expression<B>,
    op: BinaryOp,
) -> Result<Expression<B>> {
    emit(Operation::Binary(op), &[lhs, rhs])
}

pub fn add<B: BatchBackend + 'static>(
    lhs: &Expression<B>,
    rhs: &Expression<B>,
) -> Result<Expression<B>> {
    binary(lhs, rhs, BinaryOp::Add)
}

pub fn sub<B: BatchBackend + 'static>(
    lhs: &Expression<B>,
    rhs: &Expression<B>,
) -> Result<Expression<B>> {
    binary(lhs, rhs, BinaryOp::Sub)
}

/// Componentwise multiplication.
pub fn cmult<B: BatchBackend + 'static>(
    lhs: &Expression<B>,
    rhs: &Expression<B>,
) -> Result<Expression<B>> {
    binary(lhs, rhs, BinaryOp::Mul)
}

/// Componentwise division.
pub fn cdiv<B: BatchBackend + 'static>(
    lhs: &Expression<B>,
    rhs: &Expression<B>,
) -> Result<Expression<B>> {
    binary(lhs, rhs, BinaryOp::Div)
}

/// Sums any number of equally shaped terms in one node.
pub fn sum<B: BatchBackend + 'static>(terms: &[&Expression<B>]) -> Result<Expression<B>> {
    emit(Operation::Sum, terms)
}
