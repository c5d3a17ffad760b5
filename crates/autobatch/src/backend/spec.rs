use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

use crate::tensor::Tensor;

/// Logical tensor shape as an ordered list of static extents (row-major).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: SmallVec<[usize; 2]>,
}

impl Shape {
    pub fn new(dims: impl AsRef<[usize]>) -> Self {
        Self {
            dims: SmallVec::from_slice(dims.as_ref()),
        }
    }

    pub fn vector(len: usize) -> Self {
        Self::new([len])
    }

    pub fn matrix(rows: usize, cols: usize) -> Self {
        Self::new([rows, cols])
    }

    /// Scalars are represented as single-element vectors.
    pub fn scalar() -> Self {
        Self::new([1])
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (idx, dim) in self.dims.iter().enumerate() {
            if idx > 0 {
                write!(f, "x")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "]")
    }
}

/// Elementwise unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Neg,
    Tanh,
    Sigmoid,
    Relu,
    Exp,
    Log,
    Square,
}

impl UnaryOp {
    pub fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::Relu => x.max(0.0),
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Square => x * x,
        }
    }
}

/// Elementwise binary operators over operands of identical shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    pub fn apply(self, lhs: f32, rhs: f32) -> f32 {
        match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
            BinaryOp::Div => lhs / rhs,
        }
    }
}

/// Deferred operation recorded on a graph node, including its attributes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Unary(UnaryOp),
    Binary(BinaryOp),
    /// N-ary elementwise sum.
    Sum,
    /// `W[m,k] * x[k] -> [m]`.
    MatVec,
    /// `b[m] + W[m,k] * x[k] -> [m]`, operands ordered `(b, W, x)`.
    Affine,
    Dot,
    SumElements,
    Softmax,
    LogSoftmax,
    Pick {
        index: usize,
    },
    PickNegLogSoftmax {
        index: usize,
    },
    Concat,
    Transpose,
}

/// Operator kind without attributes; the unit the scheduler batches over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Unary(UnaryOp),
    Binary(BinaryOp),
    Sum,
    MatVec,
    Affine,
    Dot,
    SumElements,
    Softmax,
    LogSoftmax,
    Pick,
    PickNegLogSoftmax,
    Concat,
    Transpose,
}

impl OpKind {
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Unary(UnaryOp::Neg) => "neg",
            OpKind::Unary(UnaryOp::Tanh) => "tanh",
            OpKind::Unary(UnaryOp::Sigmoid) => "sigmoid",
            OpKind::Unary(UnaryOp::Relu) => "relu",
            OpKind::Unary(UnaryOp::Exp) => "exp",
            OpKind::Unary(UnaryOp::Log) => "log",
            OpKind::Unary(UnaryOp::Square) => "square",
            OpKind::Binary(BinaryOp::Add) => "add",
            OpKind::Binary(BinaryOp::Sub) => "sub",
            OpKind::Binary(BinaryOp::Mul) => "mul",
            OpKind::Binary(BinaryOp::Div) => "div",
            OpKind::Sum => "sum",
            OpKind::MatVec => "matvec",
            OpKind::Affine => "affine",
            OpKind::Dot => "dot",
            OpKind::SumElements => "sum_elements",
            OpKind::Softmax => "softmax",
            OpKind::LogSoftmax => "log_softmax",
            OpKind::Pick => "pick",
            OpKind::PickNegLogSoftmax => "pick_neg_log_softmax",
            OpKind::Concat => "concat",
            OpKind::Transpose => "transpose",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Number of operands an operation accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
}

impl Arity {
    fn accepts(self, count: usize) -> bool {
        match self {
            Arity::Exactly(n) => count == n,
            Arity::AtLeast(n) => count >= n,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exactly(n) => write!(f, "{n}"),
            Arity::AtLeast(n) => write!(f, "at least {n}"),
        }
    }
}

/// Shape validation failure raised before any node is recorded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("{op} expects {expected} operands, got {actual}")]
    Arity {
        op: &'static str,
        expected: Arity,
        actual: usize,
    },
    #[error("{op} operand {index} has shape {actual}, expected {expected}")]
    Operand {
        op: &'static str,
        index: usize,
        expected: String,
        actual: Shape,
    },
    #[error("{op}: {detail}")]
    Invalid { op: &'static str, detail: String },
}

impl Operation {
    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Unary(op) => OpKind::Unary(*op),
            Operation::Binary(op) => OpKind::Binary(*op),
            Operation::Sum => OpKind::Sum,
            Operation::MatVec => OpKind::MatVec,
            Operation::Affine => OpKind::Affine,
            Operation::Dot => OpKind::Dot,
            Operation::SumElements => OpKind::SumElements,
            Operation::Softmax => OpKind::Softmax,
            Operation::LogSoftmax => OpKind::LogSoftmax,
            Operation::Pick { .. } => OpKind::Pick,
            Operation::PickNegLogSoftmax { .. } => OpKind::PickNegLogSoftmax,
            Operation::Concat => OpKind::Concat,
            Operation::Transpose => OpKind::Transpose,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    pub fn arity(&self) -> Arity {
        match self {
            Operation::Unary(_)
            | Operation::SumElements
            | Operation::Softmax
            | Operation::LogSoftmax
            | Operation::Pick { .. }
            | Operation::PickNegLogSoftmax { .. }
            | Operation::Transpose => Arity::Exactly(1),
            Operation::Binary(_) | Operation::MatVec | Operation::Dot => Arity::Exactly(2),
            Operation::Affine => Arity::Exactly(3),
            Operation::Sum | Operation::Concat => Arity::AtLeast(1),
        }
    }

    /// Infers the output shape for the given operand shapes, validating operand compatibility.
    pub fn infer_shape(&self, operands: &[&Shape]) -> Result<Shape, ShapeError> {
        let op = self.name();
        let arity = self.arity();
        if !arity.accepts(operands.len()) {
            return Err(ShapeError::Arity {
                op,
                expected: arity,
                actual: operands.len(),
            });
        }

        match self {
            Operation::Unary(_) => Ok(operands[0].clone()),
            Operation::Binary(_) | Operation::Sum => {
                let first = operands[0];
                for (index, shape) in operands.iter().enumerate().skip(1) {
                    if *shape != first {
                        return Err(operand_error(op, index, first.to_string(), shape));
                    }
                }
                Ok(first.clone())
            }
            Operation::MatVec => {
                let (rows, cols) = expect_matrix(op, 0, operands[0])?;
                let len = expect_vector(op, 1, operands[1])?;
                if len != cols {
                    return Err(operand_error(op, 1, format!("[{cols}]"), operands[1]));
                }
                Ok(Shape::vector(rows))
            }
            Operation::Affine => {
                let bias = expect_vector(op, 0, operands[0])?;
                let (rows, cols) = expect_matrix(op, 1, operands[1])?;
                let len = expect_vector(op, 2, operands[2])?;
                if bias != rows {
                    return Err(operand_error(op, 0, format!("[{rows}]"), operands[0]));
                }
                if len != cols {
                    return Err(operand_error(op, 2, format!("[{cols}]"), operands[2]));
                }
                Ok(Shape::vector(rows))
            }
            Operation::Dot => {
                let lhs = expect_vector(op, 0, operands[0])?;
                let rhs = expect_vector(op, 1, operands[1])?;
                if lhs != rhs {
                    return Err(operand_error(op, 1, format!("[{lhs}]"), operands[1]));
                }
                Ok(Shape::scalar())
            }
            Operation::SumElements => Ok(Shape::scalar()),
            Operation::Softmax | Operation::LogSoftmax => {
                expect_vector(op, 0, operands[0])?;
                Ok(operands[0].clone())
            }
            Operation::Pick { index } | Operation::PickNegLogSoftmax { index } => {
                let len = expect_vector(op, 0, operands[0])?;
                if *index >= len {
                    return Err(ShapeError::Invalid {
                        op,
                        detail: format!("index {index} out of range for length {len}"),
                    });
                }
                Ok(Shape::scalar())
            }
            Operation::Concat => {
                let mut total = 0usize;
                for (index, shape) in operands.iter().enumerate() {
                    total += expect_vector(op, index, shape)?;
                }
                Ok(Shape::vector(total))
            }
            Operation::Transpose => {
                let (rows, cols) = expect_matrix(op, 0, operands[0])?;
                Ok(Shape::matrix(cols, rows))
            }
        }
    }
}

fn operand_error(op: &'static str, index: usize, expected: String, actual: &Shape) -> ShapeError {
    ShapeError::Operand {
        op,
        index,
        expected,
        actual: actual.clone(),
    }
}

fn expect_vector(op: &'static str, index: usize, shape: &Shape) -> Result<usize, ShapeError> {
    match shape.dims() {
        [len] => Ok(*len),
        _ => Err(operand_error(op, index, "a vector".into(), shape)),
    }
}

fn expect_matrix(
    op: &'static str,
    index: usize,
    shape: &Shape,
) -> Result<(usize, usize), ShapeError> {
    match shape.dims() {
        [rows, cols] => Ok((*rows, *cols)),
        _ => Err(operand_error(op, index, "a matrix".into(), shape)),
    }
}

/// Backend error surfaced to higher layers.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: &'static str, reason: String },
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error("backend execution failure: {message}")]
    Execution { message: String },
}

impl BackendError {
    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }

    pub fn is_unimplemented(&self) -> bool {
        matches!(self, BackendError::Unimplemented { .. })
    }
}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// One node of a batched step as handed to [`BatchBackend::execute_batch`].
///
/// Members of a single call share operator kind and operand/output shapes, but may differ in
/// attributes (for example the index of a `Pick`).
pub struct BatchMember<'a, H> {
    pub op: &'a Operation,
    pub inputs: &'a [H],
    pub shape: &'a Shape,
}

/// Numeric backend that executes graph nodes one at a time or as batched kernel calls.
pub trait BatchBackend: Send + Sync {
    type TensorHandle: Clone + Send + Sync + 'static;

    /// Returns a human-readable backend identifier (e.g., `"cpu"`).
    fn backend_name(&self) -> &str;

    /// Uploads host data, returning a device handle.
    fn materialize(&self, tensor: &Tensor) -> BackendResult<Self::TensorHandle>;

    /// Reads a device handle back into a host tensor.
    fn to_host(&self, tensor: &Self::TensorHandle) -> BackendResult<Tensor>;

    /// Whether a batched kernel is registered for `kind`.
    ///
    /// The scheduler never groups nodes of kinds answering `false`; they execute one by one.
    fn supports_batching(&self, _kind: OpKind) -> bool {
        false
    }

    /// Executes a single node given its materialised operands.
    fn execute_node(
        &self,
        op: &Operation,
        inputs: &[Self::TensorHandle],
        output: &Shape,
    ) -> BackendResult<Self::TensorHandle>;

    /// Executes all members in one kernel invocation, returning outputs in member order.
    ///
    /// Returning [`BackendError::Unimplemented`] makes the executor fall back to
    /// [`BatchBackend::execute_node`] for every member.
    fn execute_batch(
        &self,
        kind: OpKind,
        _members: &[BatchMember<'_, Self::TensorHandle>],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        Err(BackendError::unimplemented(
            kind.name(),
            "no batched kernel registered",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affine_checks_bias_and_input_lengths() {
        let b = Shape::vector(3);
        let w = Shape::matrix(3, 4);
        let x = Shape::vector(4);
        assert_eq!(
            Operation::Affine.infer_shape(&[&b, &w, &x]).unwrap(),
            Shape::vector(3)
        );

        let short = Shape::vector(2);
        let err = Operation::Affine
            .infer_shape(&[&b, &w, &short])
            .unwrap_err();
        assert!(matches!(err, ShapeError::Operand { index: 2, .. }));
    }

    #[test]
    fn pick_rejects_out_of_range_index() {
        let x = Shape::vector(3);
        let err = Operation::Pick { index: 3 }.infer_shape(&[&x]).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn sum_requires_matching_operands() {
        let a = Shape::vector(3);
        let b = Shape::vector(4);
        assert!(Operation::Sum.infer_shape(&[&a, &a, &a]).is_ok());
        assert!(Operation::Sum.infer_shape(&[&a, &b]).is_err());
        let err = Operation::Sum.infer_shape(&[]).unwrap_err();
        assert_eq!(err.to_string(), "sum expects at least 1 operands, got 0");
    }

    #[test]
    fn shape_display_joins_dims() {
        assert_eq!(Shape::matrix(2, 3).to_string(), "[2x3]");
        assert_eq!(Shape::scalar().to_string(), "[1]");
    }
}
