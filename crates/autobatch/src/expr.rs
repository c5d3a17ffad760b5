//! Deferred expressions: a node handle paired with its graph and shape.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::backend::spec::{BatchBackend, Shape};
use crate::graph::{ComputationGraph, GraphError, NodeId};
use crate::tensor::Tensor;

/// Lazily evaluated value recorded on a [`ComputationGraph`].
///
/// Building expressions never touches the backend; values are produced on the first call to
/// [`forward`](Expression::forward) or one of the value accessors and cached afterwards.
pub struct Expression<B: BatchBackend + 'static> {
    graph: Arc<ComputationGraph<B>>,
    node: NodeId,
    shape: Shape,
}

impl<B: BatchBackend + 'static> Expression<B> {
    pub(crate) fn new(graph: Arc<ComputationGraph<B>>, node: NodeId, shape: Shape) -> Self {
        Expression { graph, node, shape }
    }

    pub fn graph(&self) -> &Arc<ComputationGraph<B>> {
        &self.graph
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn is_computed(&self) -> Result<bool> {
        self.graph.is_computed(self.node)
    }

    /// Computes this expression and everything it depends on.
    pub fn forward(&self) -> Result<()> {
        self.graph.evaluate(&[self.node])
    }

    pub fn value(&self) -> Result<Tensor> {
        self.graph.value(self.node)
    }

    pub fn handle(&self) -> Result<B::TensorHandle> {
        self.graph.handle(self.node)
    }

    /// Row-major copy of the computed value.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        Ok(self.value()?.into_vec())
    }

    /// Value of a single-element expression, such as a loss.
    pub fn scalar_value(&self) -> Result<f32> {
        if self.shape.num_elements() != 1 {
            return Err(GraphError::NotScalar(self.shape.clone()).into());
        }
        let value = self.value()?;
        match value.data() {
            [scalar] => Ok(*scalar),
            _ => Err(GraphError::NotScalar(value.shape().clone()).into()),
        }
    }
}

impl<B: BatchBackend + 'static> Clone for Expression<B> {
    fn clone(&self) -> Self {
        Expression {
            graph: Arc::clone(&self.graph),
            node: self.node,
            shape: self.shape.clone(),
        }
    }
}

impl<B: BatchBackend + 'static> fmt::Debug for Expression<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Expression")
            .field("graph", &self.graph.id())
            .field("node", &self.node)
            .field("shape", &self.shape)
            .finish()
    }
}
