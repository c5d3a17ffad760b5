//! Mutable builder used to record nodes inside a [`ComputationGraph`](super::arena::ComputationGraph).

use std::sync::Arc;

use anyhow::Result;
use smallvec::SmallVec;

use crate::backend::spec::{BatchBackend, Operation, Shape};
use crate::tensor::Tensor;

use super::arena::ComputationGraph;
use super::error::GraphError;
use super::state::{GraphInner, NodeId, NodeOp, NodeRecord, NodeState};

/// Context passed to capture closures for importing tensors and emitting nodes.
///
/// The graph stays locked for the lifetime of the builder, so a whole batch of edits is
/// recorded atomically.
pub struct GraphBuilder<'a, B: BatchBackend + 'static> {
    pub(super) graph: Arc<ComputationGraph<B>>,
    pub(super) inner: &'a mut GraphInner<B>,
}

impl<'a, B: BatchBackend + 'static> GraphBuilder<'a, B> {
    /// Uploads `tensor` and records it as a leaf. Leaves are ready immediately.
    pub fn input(&mut self, tensor: &Tensor) -> Result<NodeId> {
        let backend = self.graph.backend();
        let handle = backend
            .materialize(tensor)
            .map_err(|source| GraphError::Backend {
                backend: backend.backend_name().to_string(),
                op: "materialize",
                source,
            })?;
        let id = self.push(NodeRecord {
            op: NodeOp::Input,
            operands: SmallVec::new(),
            shape: tensor.shape().clone(),
            depth: 0,
            state: NodeState::Ready(handle),
        })?;
        Ok(id)
    }

    /// Records a deferred operation. Nothing is computed until the node is evaluated.
    ///
    /// Fails when an operand comes from another graph or an earlier generation, when operand
    /// shapes are invalid for `op`, or when `shape` differs from the inferred output shape.
    pub fn emit(&mut self, op: Operation, operands: &[NodeId], shape: Shape) -> Result<NodeId> {
        let mut indices: SmallVec<[u32; 4]> = SmallVec::with_capacity(operands.len());
        for operand in operands {
            indices.push(self.inner.resolve(*operand)?);
        }
        let inferred = {
            let shapes: SmallVec<[&Shape; 4]> = indices
                .iter()
                .map(|index| &self.inner.record(*index).shape)
                .collect();
            op.infer_shape(&shapes).map_err(GraphError::from)?
        };
        if inferred != shape {
            return Err(GraphError::DeclaredShapeMismatch {
                op: op.name(),
                declared: shape,
                inferred,
            }
            .into());
        }
        let depth = indices
            .iter()
            .map(|index| self.inner.record(*index).depth)
            .max()
            .map_or(0, |deepest| deepest + 1);
        let id = self.push(NodeRecord {
            op: NodeOp::Op(op),
            operands: indices,
            shape,
            depth,
            state: NodeState::Pending,
        })?;
        Ok(id)
    }

    pub fn shape(&self, node: NodeId) -> Result<Shape> {
        let index = self.inner.resolve(node)?;
        Ok(self.inner.record(index).shape.clone())
    }

    pub fn graph(&self) -> Arc<ComputationGraph<B>> {
        Arc::clone(&self.graph)
    }

    fn push(&mut self, record: NodeRecord<B>) -> Result<NodeId, GraphError> {
        let index =
            u32::try_from(self.inner.nodes.len()).map_err(|_| GraphError::CapacityExceeded)?;
        self.inner.nodes.push(record);
        Ok(self.inner.node_id(index))
    }
}
