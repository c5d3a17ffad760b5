//! Internal graph bookkeeping shared by the graph, builder, and executor.

use std::fmt;

use smallvec::SmallVec;

use crate::backend::spec::{BatchBackend, Operation, Shape};
use crate::config::AutobatchConfig;

use super::error::GraphError;
use super::plan::PlanCache;
use super::stats::ExecutionStats;

/// Handle to a node recorded in a [`ComputationGraph`](super::ComputationGraph).
///
/// Handles are only valid for the graph generation that created them; after
/// [`reset`](super::ComputationGraph::reset) every lookup through an old handle fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    pub(super) graph: usize,
    pub(super) generation: u64,
    pub(super) index: u32,
}

impl NodeId {
    /// Creation sequence number within the node's generation.
    pub fn sequence(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn graph_id(&self) -> usize {
        self.graph
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}@g{}", self.index, self.generation)
    }
}

/// Mutable graph storage protected by the graph mutex.
pub(super) struct GraphInner<B: BatchBackend + 'static> {
    pub(super) graph_id: usize,
    pub(super) generation: u64,
    /// Nodes in creation order; a node's index is its sequence number.
    pub(super) nodes: Vec<NodeRecord<B>>,
    pub(super) config: AutobatchConfig,
    pub(super) plan_cache: PlanCache,
    pub(super) stats: ExecutionStats,
}

impl<B: BatchBackend + 'static> GraphInner<B> {
    pub(super) fn new(graph_id: usize, config: AutobatchConfig) -> Self {
        let plan_cache = PlanCache::new(config.plan_cache_capacity);
        GraphInner {
            graph_id,
            generation: 0,
            nodes: Vec::new(),
            config,
            plan_cache,
            stats: ExecutionStats::default(),
        }
    }

    /// Maps a handle to its node index, rejecting handles from other graphs or generations.
    pub(super) fn resolve(&self, node: NodeId) -> Result<u32, GraphError> {
        if node.graph != self.graph_id {
            return Err(GraphError::ForeignHandle {
                node: node.index,
                node_graph: node.graph,
                graph: self.graph_id,
            });
        }
        if node.generation != self.generation {
            return Err(GraphError::StaleHandle {
                node: node.index,
                node_generation: node.generation,
                current: self.generation,
            });
        }
        if node.index as usize >= self.nodes.len() {
            return Err(GraphError::UnknownNode(node.index));
        }
        Ok(node.index)
    }

    pub(super) fn node_id(&self, index: u32) -> NodeId {
        NodeId {
            graph: self.graph_id,
            generation: self.generation,
            index,
        }
    }

    pub(super) fn record(&self, index: u32) -> &NodeRecord<B> {
        &self.nodes[index as usize]
    }

    pub(super) fn ready_handle(&self, index: u32) -> Result<B::TensorHandle, GraphError> {
        match &self.record(index).state {
            NodeState::Ready(handle) => Ok(handle.clone()),
            NodeState::Pending => Err(GraphError::OperandNotReady(index)),
        }
    }
}

/// What a node computes: host-provided leaves are materialised at creation time.
pub(super) enum NodeOp {
    Input,
    Op(Operation),
}

pub(super) struct NodeRecord<B: BatchBackend + 'static> {
    pub(super) op: NodeOp,
    pub(super) operands: SmallVec<[u32; 4]>,
    pub(super) shape: Shape,
    /// Longest path from a leaf; leaves have depth zero.
    pub(super) depth: u32,
    pub(super) state: NodeState<B>,
}

/// Nodes start pending and become ready exactly once, when the executor stores their handle.
pub(super) enum NodeState<B: BatchBackend + 'static> {
    Pending,
    Ready(B::TensorHandle),
}

impl<B: BatchBackend + 'static> NodeState<B> {
    pub(super) fn is_ready(&self) -> bool {
        matches!(self, NodeState::Ready(_))
    }
}
