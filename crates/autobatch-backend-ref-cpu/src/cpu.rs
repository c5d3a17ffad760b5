use std::sync::Arc;

use autobatch::backend::spec::{
    BackendError, BackendResult, BatchBackend, BatchMember, OpKind, Operation, Shape,
};
use autobatch::tensor::Tensor;
use rayon::prelude::*;

/// Dense row-major `f32` buffer shared between nodes.
#[derive(Clone, Debug)]
pub struct CpuTensor {
    pub shape: Shape,
    pub data: Arc<[f32]>,
}

impl CpuTensor {
    pub fn new(shape: Shape, data: Vec<f32>) -> Self {
        CpuTensor {
            shape,
            data: Arc::from(data),
        }
    }

    /// Whether both handles point at the same buffer.
    pub fn shares_buffer(&self, other: &CpuTensor) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

/// Hook that can replace kernels before the built-in implementation runs.
pub trait CpuKernelInterceptor: Send + Sync {
    fn try_execute(
        &self,
        op: &Operation,
        inputs: &[CpuTensor],
        output: &Shape,
    ) -> Option<BackendResult<CpuTensor>>;

    fn try_execute_batch(
        &self,
        _kind: OpKind,
        _members: &[BatchMember<'_, CpuTensor>],
    ) -> Option<BackendResult<Vec<CpuTensor>>> {
        None
    }
}

#[derive(Default)]
pub struct NoopInterceptor;

impl CpuKernelInterceptor for NoopInterceptor {
    fn try_execute(
        &self,
        _op: &Operation,
        _inputs: &[CpuTensor],
        _output: &Shape,
    ) -> Option<BackendResult<CpuTensor>> {
        None
    }
}

#[derive(Clone)]
pub struct GenericCpuBackend<I: CpuKernelInterceptor> {
    interceptor: Arc<I>,
}

impl<I: CpuKernelInterceptor> GenericCpuBackend<I> {
    pub fn with_interceptor(interceptor: I) -> Self {
        Self {
            interceptor: Arc::new(interceptor),
        }
    }

    pub fn with_arc(interceptor: Arc<I>) -> Self {
        Self { interceptor }
    }

    pub fn interceptor(&self) -> &I {
        self.interceptor.as_ref()
    }
}

impl GenericCpuBackend<NoopInterceptor> {
    pub fn new() -> Self {
        Self::with_interceptor(NoopInterceptor)
    }
}

impl Default for GenericCpuBackend<NoopInterceptor> {
    fn default() -> Self {
        Self::new()
    }
}

pub type CpuBackend = GenericCpuBackend<NoopInterceptor>;

impl<I: CpuKernelInterceptor> BatchBackend for GenericCpuBackend<I> {
    type TensorHandle = CpuTensor;

    fn backend_name(&self) -> &str {
        "cpu"
    }

    fn materialize(&self, tensor: &Tensor) -> BackendResult<CpuTensor> {
        Ok(CpuTensor::new(tensor.shape().clone(), tensor.data().to_vec()))
    }

    fn to_host(&self, tensor: &CpuTensor) -> BackendResult<Tensor> {
        Tensor::from_vec(tensor.shape.clone(), tensor.data.to_vec())
            .map_err(|err| BackendError::execution(err.to_string()))
    }

    fn supports_batching(&self, kind: OpKind) -> bool {
        !matches!(kind, OpKind::Concat | OpKind::Transpose)
    }

    fn execute_node(
        &self,
        op: &Operation,
        inputs: &[CpuTensor],
        output: &Shape,
    ) -> BackendResult<CpuTensor> {
        if let Some(result) = self.interceptor.try_execute(op, inputs, output) {
            return result;
        }
        validate(op, inputs, output)?;
        let data = execute_single(op, inputs, output)?;
        Ok(CpuTensor::new(output.clone(), data))
    }

    fn execute_batch(
        &self,
        kind: OpKind,
        members: &[BatchMember<'_, CpuTensor>],
    ) -> BackendResult<Vec<CpuTensor>> {
        if let Some(result) = self.interceptor.try_execute_batch(kind, members) {
            return result;
        }
        if !self.supports_batching(kind) {
            return Err(BackendError::unimplemented(
                kind.name(),
                "layout ops run node by node on cpu",
            ));
        }
        let Some(first) = members.first() else {
            return Ok(Vec::new());
        };
        for member in members {
            if member.op.kind() != kind {
                return Err(BackendError::execution(format!(
                    "batched {kind} call received a {} member",
                    member.op.name()
                )));
            }
            validate(member.op, member.inputs, member.shape)?;
            let same_signature = member.shape == first.shape
                && member.inputs.len() == first.inputs.len()
                && member
                    .inputs
                    .iter()
                    .zip(first.inputs)
                    .all(|(lhs, rhs)| lhs.shape == rhs.shape);
            if !same_signature {
                return Err(BackendError::execution(format!(
                    "batched {kind} members disagree on operand shapes"
                )));
            }
        }

        let outputs = execute_batched(kind, members)?;
        let row = first.shape.num_elements();
        Ok(member_rows(&outputs, row, members.len())
            .map(|chunk| CpuTensor::new(first.shape.clone(), chunk.to_vec()))
            .collect())
    }
}

fn validate(op: &Operation, inputs: &[CpuTensor], output: &Shape) -> BackendResult<()> {
    let shapes: Vec<&Shape> = inputs.iter().map(|tensor| &tensor.shape).collect();
    let inferred = op.infer_shape(&shapes)?;
    if &inferred != output {
        return Err(BackendError::execution(format!(
            "{} produces {inferred}, caller expected {output}",
            op.name()
        )));
    }
    for tensor in inputs {
        if tensor.data.len() != tensor.shape.num_elements() {
            return Err(BackendError::execution(format!(
                "buffer holds {} values but shape {} needs {}",
                tensor.data.len(),
                tensor.shape,
                tensor.shape.num_elements()
            )));
        }
    }
    Ok(())
}

fn execute_single(op: &Operation, inputs: &[CpuTensor], output: &Shape) -> BackendResult<Vec<f32>> {
    let data = match op {
        Operation::Unary(unary) => inputs[0].data.iter().map(|x| unary.apply(*x)).collect(),
        Operation::Binary(binary) => inputs[0]
            .data
            .iter()
            .zip(inputs[1].data.iter())
            .map(|(lhs, rhs)| binary.apply(*lhs, *rhs))
            .collect(),
        Operation::Sum => {
            let operands: Vec<&[f32]> = inputs.iter().map(|tensor| &tensor.data[..]).collect();
            (0..output.num_elements())
                .map(|index| sum_column(&operands, index))
                .collect()
        }
        Operation::MatVec => {
            let (rows, cols) = matrix_dims(&inputs[0]);
            (0..rows)
                .map(|row| dot_row(&inputs[0].data[row * cols..(row + 1) * cols], &inputs[1].data))
                .collect()
        }
        Operation::Affine => {
            let (rows, cols) = matrix_dims(&inputs[1]);
            (0..rows)
                .map(|row| {
                    inputs[0].data[row]
                        + dot_row(&inputs[1].data[row * cols..(row + 1) * cols], &inputs[2].data)
                })
                .collect()
        }
        Operation::Dot => vec![dot_row(&inputs[0].data, &inputs[1].data)],
        Operation::SumElements
        | Operation::Softmax
        | Operation::LogSoftmax
        | Operation::Pick { .. }
        | Operation::PickNegLogSoftmax { .. } => row_kernel(op, &inputs[0].data)?,
        Operation::Concat => inputs
            .iter()
            .flat_map(|tensor| tensor.data.iter().copied())
            .collect(),
        Operation::Transpose => {
            let (rows, cols) = matrix_dims(&inputs[0]);
            let mut out = vec![0.0; rows * cols];
            for row in 0..rows {
                for col in 0..cols {
                    out[col * rows + row] = inputs[0].data[row * cols + col];
                }
            }
            out
        }
    };
    Ok(data)
}

/// Runs all members in one pass and returns their outputs back to back.
///
/// Every member row goes through the same scalar code as [`execute_single`], so batched and
/// single-node results agree bit for bit.
fn execute_batched(kind: OpKind, members: &[BatchMember<'_, CpuTensor>]) -> BackendResult<Vec<f32>> {
    let first = &members[0];
    let data = match kind {
        OpKind::Unary(unary) => stack_operand(members, 0)
            .par_iter()
            .map(|x| unary.apply(*x))
            .collect(),
        OpKind::Binary(binary) => {
            let lhs = stack_operand(members, 0);
            let rhs = stack_operand(members, 1);
            lhs.par_iter()
                .zip(rhs.par_iter())
                .map(|(lhs, rhs)| binary.apply(*lhs, *rhs))
                .collect()
        }
        OpKind::Sum => {
            let stacks: Vec<Vec<f32>> = (0..first.inputs.len())
                .map(|position| stack_operand(members, position))
                .collect();
            let operands: Vec<&[f32]> = stacks.iter().map(Vec::as_slice).collect();
            (0..stacks[0].len())
                .into_par_iter()
                .map(|index| sum_column(&operands, index))
                .collect()
        }
        OpKind::MatVec => batched_matvec(members, 0, None)?,
        OpKind::Affine => batched_matvec(members, 1, Some(0))?,
        OpKind::Dot => {
            let len = first.inputs[0].shape.num_elements();
            let lhs = stack_operand(members, 0);
            let rhs = stack_operand(members, 1);
            (0..members.len())
                .into_par_iter()
                .map(|member| {
                    let span = member * len..(member + 1) * len;
                    dot_row(&lhs[span.clone()], &rhs[span])
                })
                .collect()
        }
        OpKind::SumElements
        | OpKind::Softmax
        | OpKind::LogSoftmax
        | OpKind::Pick
        | OpKind::PickNegLogSoftmax => {
            let len = first.inputs[0].shape.num_elements();
            let stacked = stack_operand(members, 0);
            let rows = members
                .par_iter()
                .enumerate()
                .map(|(index, member)| {
                    row_kernel(member.op, &stacked[index * len..(index + 1) * len])
                })
                .collect::<BackendResult<Vec<Vec<f32>>>>()?;
            rows.into_iter().flatten().collect()
        }
        OpKind::Concat | OpKind::Transpose => {
            return Err(BackendError::unimplemented(
                kind.name(),
                "layout ops run node by node on cpu",
            ))
        }
    };
    Ok(data)
}

/// Matrix-vector products for a batch. When every member uses the same weight buffer the
/// inputs are stacked and multiplied as one matrix-matrix product.
fn batched_matvec(
    members: &[BatchMember<'_, CpuTensor>],
    weight_position: usize,
    bias_position: Option<usize>,
) -> BackendResult<Vec<f32>> {
    let input_position = weight_position + 1;
    let weight = &members[0].inputs[weight_position];
    let (rows, cols) = matrix_dims(weight);
    let shared = members
        .iter()
        .all(|member| member.inputs[weight_position].shares_buffer(weight));
    tracing::trace!(
        members = members.len(),
        rows,
        cols,
        shared_weight = shared,
        "cpu batched matvec"
    );

    let inputs = stack_operand(members, input_position);
    let biases = bias_position.map(|position| stack_operand(members, position));
    let out = (0..members.len() * rows)
        .into_par_iter()
        .map(|index| {
            let (member, row) = (index / rows, index % rows);
            let weights = if shared {
                &weight.data[..]
            } else {
                &members[member].inputs[weight_position].data[..]
            };
            let product = dot_row(
                &weights[row * cols..(row + 1) * cols],
                &inputs[member * cols..(member + 1) * cols],
            );
            match &biases {
                Some(biases) => biases[index] + product,
                None => product,
            }
        })
        .collect();
    Ok(out)
}

/// Splits `count` back-to-back rows of `len` values. Zero-length rows still yield one slice
/// per member.
fn member_rows(data: &[f32], len: usize, count: usize) -> impl Iterator<Item = &[f32]> {
    (0..count).map(move |index| &data[index * len..(index + 1) * len])
}

fn stack_operand(members: &[BatchMember<'_, CpuTensor>], position: usize) -> Vec<f32> {
    let len = members[0].inputs[position].data.len();
    let mut stacked = Vec::with_capacity(len * members.len());
    for member in members {
        stacked.extend_from_slice(&member.inputs[position].data);
    }
    stacked
}

fn matrix_dims(tensor: &CpuTensor) -> (usize, usize) {
    match tensor.shape.dims() {
        [rows, cols] => (*rows, *cols),
        dims => (1, dims.iter().product()),
    }
}

fn sum_column(operands: &[&[f32]], index: usize) -> f32 {
    let mut acc = operands[0][index];
    for operand in &operands[1..] {
        acc += operand[index];
    }
    acc
}

fn dot_row(lhs: &[f32], rhs: &[f32]) -> f32 {
    let mut acc = 0.0f32;
    for (lhs, rhs) in lhs.iter().zip(rhs) {
        acc += lhs * rhs;
    }
    acc
}

fn row_max(row: &[f32]) -> f32 {
    row.iter().copied().fold(f32::NEG_INFINITY, f32::max)
}

fn log_sum_exp(row: &[f32]) -> f32 {
    let max = row_max(row);
    let sum: f32 = row.iter().map(|x| (x - max).exp()).sum();
    max + sum.ln()
}

fn row_kernel(op: &Operation, row: &[f32]) -> BackendResult<Vec<f32>> {
    let out = match op {
        Operation::SumElements => vec![row.iter().sum()],
        Operation::Softmax => {
            let max = row_max(row);
            let exps: Vec<f32> = row.iter().map(|x| (x - max).exp()).collect();
            let total: f32 = exps.iter().sum();
            exps.into_iter().map(|value| value / total).collect()
        }
        Operation::LogSoftmax => {
            let lse = log_sum_exp(row);
            row.iter().map(|x| x - lse).collect()
        }
        Operation::Pick { index } => vec![row[*index]],
        Operation::PickNegLogSoftmax { index } => vec![log_sum_exp(row) - row[*index]],
        other => {
            return Err(BackendError::unimplemented(
                other.name(),
                "not a row-wise kernel",
            ))
        }
    };
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use autobatch::backend::spec::{BinaryOp, UnaryOp};

    fn tensor(dims: &[usize], data: &[f32]) -> CpuTensor {
        CpuTensor::new(Shape::new(dims), data.to_vec())
    }

    #[test]
    fn matvec_multiplies_rows() {
        let backend = CpuBackend::new();
        let w = tensor(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let x = tensor(&[3], &[1.0, 0.0, -1.0]);
        let out = backend
            .execute_node(&Operation::MatVec, &[w, x], &Shape::vector(2))
            .expect("matvec");
        assert_eq!(&out.data[..], &[-2.0, -2.0]);
    }

    #[test]
    fn transpose_swaps_axes() {
        let backend = CpuBackend::new();
        let x = tensor(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let out = backend
            .execute_node(&Operation::Transpose, &[x], &Shape::matrix(3, 2))
            .expect("transpose");
        assert_eq!(&out.data[..], &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn pick_neg_log_softmax_of_uniform_logits() {
        let backend = CpuBackend::new();
        let x = tensor(&[4], &[0.5; 4]);
        let out = backend
            .execute_node(
                &Operation::PickNegLogSoftmax { index: 2 },
                &[x],
                &Shape::scalar(),
            )
            .expect("loss");
        assert!((out.data[0] - 4.0f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn declared_output_shape_is_checked() {
        let backend = CpuBackend::new();
        let x = tensor(&[3], &[1.0, 2.0, 3.0]);
        let err = backend
            .execute_node(&Operation::Unary(UnaryOp::Neg), &[x], &Shape::vector(4))
            .expect_err("mismatch");
        assert!(err.to_string().contains("caller expected [4]"), "{err}");
    }

    #[test]
    fn batch_rejects_mixed_kinds() {
        let backend = CpuBackend::new();
        let a = [tensor(&[2], &[1.0, 2.0]), tensor(&[2], &[3.0, 4.0])];
        let shape = Shape::vector(2);
        let add = Operation::Binary(BinaryOp::Add);
        let sub = Operation::Binary(BinaryOp::Sub);
        let members = [
            BatchMember {
                op: &add,
                inputs: &a,
                shape: &shape,
            },
            BatchMember {
                op: &sub,
                inputs: &a,
                shape: &shape,
            },
        ];
        let err = backend
            .execute_batch(OpKind::Binary(BinaryOp::Add), &members)
            .expect_err("mixed kinds");
        assert!(!err.is_unimplemented());
    }

    #[test]
    fn layout_ops_decline_batching() {
        let backend = CpuBackend::new();
        assert!(!backend.supports_batching(OpKind::Concat));
        let x = [tensor(&[1, 2], &[1.0, 2.0])];
        let shape = Shape::matrix(2, 1);
        let transpose = Operation::Transpose;
        let members = [BatchMember {
            op: &transpose,
            inputs: &x,
            shape: &shape,
        }];
        let err = backend
            .execute_batch(OpKind::Transpose, &members)
            .expect_err("transpose is unbatched");
        assert!(err.is_unimplemented());
    }

    #[test]
    fn empty_members_still_get_one_output_each() {
        let backend = CpuBackend::new();
        let empty = [tensor(&[0], &[]), tensor(&[0], &[])];
        let vector = Shape::vector(0);
        let scalar = Shape::scalar();
        let cases = [
            (Operation::Unary(UnaryOp::Tanh), 1, &vector, Vec::new()),
            (Operation::Dot, 2, &scalar, vec![0.0]),
            (Operation::SumElements, 1, &scalar, vec![0.0]),
        ];
        for (op, arity, shape, expected) in &cases {
            let members: Vec<BatchMember<'_, CpuTensor>> = (0..3)
                .map(|_| BatchMember {
                    op,
                    inputs: &empty[..*arity],
                    shape,
                })
                .collect();
            let outputs = backend
                .execute_batch(op.kind(), &members)
                .expect("empty batch");
            assert_eq!(outputs.len(), members.len(), "{}", op.name());
            for output in &outputs {
                assert_eq!(&output.data[..], &expected[..], "{}", op.name());
            }
        }
    }
}
