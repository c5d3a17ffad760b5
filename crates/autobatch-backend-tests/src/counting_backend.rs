use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use autobatch::backend::spec::{
    BackendResult, BatchBackend, BatchMember, OpKind, Operation, Shape,
};
use autobatch::tensor::Tensor;

/// Test-only backend wrapper that counts kernel invocations on the wrapped backend.
pub struct CountingBackend<B: BatchBackend> {
    inner: Arc<B>,
    node_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    batched_nodes: AtomicUsize,
}

impl<B: BatchBackend> CountingBackend<B> {
    pub fn new(inner: Arc<B>) -> Self {
        Self {
            inner,
            node_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
            batched_nodes: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &Arc<B> {
        &self.inner
    }

    pub fn node_calls(&self) -> usize {
        self.node_calls.load(Ordering::SeqCst)
    }

    /// Batched calls issued, including ones the wrapped backend declined.
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    /// Total members passed through batched calls.
    pub fn batched_nodes(&self) -> usize {
        self.batched_nodes.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.node_calls() + self.batch_calls()
    }

    pub fn reset_counts(&self) {
        self.node_calls.store(0, Ordering::SeqCst);
        self.batch_calls.store(0, Ordering::SeqCst);
        self.batched_nodes.store(0, Ordering::SeqCst);
    }
}

impl<B: BatchBackend> BatchBackend for CountingBackend<B> {
    type TensorHandle = B::TensorHandle;

    fn backend_name(&self) -> &str {
        self.inner.backend_name()
    }

    fn materialize(&self, tensor: &Tensor) -> BackendResult<Self::TensorHandle> {
        self.inner.materialize(tensor)
    }

    fn to_host(&self, tensor: &Self::TensorHandle) -> BackendResult<Tensor> {
        self.inner.to_host(tensor)
    }

    fn supports_batching(&self, kind: OpKind) -> bool {
        self.inner.supports_batching(kind)
    }

    fn execute_node(
        &self,
        op: &Operation,
        inputs: &[Self::TensorHandle],
        output: &Shape,
    ) -> BackendResult<Self::TensorHandle> {
        self.node_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.execute_node(op, inputs, output)
    }

    fn execute_batch(
        &self,
        kind: OpKind,
        members: &[BatchMember<'_, Self::TensorHandle>],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.batched_nodes.fetch_add(members.len(), Ordering::SeqCst);
        self.inner.execute_batch(kind, members)
    }
}
