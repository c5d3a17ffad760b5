use thiserror::Error;

use crate::backend::spec::{BackendError, Shape, ShapeError};

/// Failures surfaced by graph construction and evaluation.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error(
        "node %{node} belongs to graph generation {node_generation}, but the graph was reset to generation {current}"
    )]
    StaleHandle {
        node: u32,
        node_generation: u64,
        current: u64,
    },
    #[error("node %{node} belongs to graph {node_graph}, not graph {graph}")]
    ForeignHandle {
        node: u32,
        node_graph: usize,
        graph: usize,
    },
    #[error("node %{0} is not registered in the graph")]
    UnknownNode(u32),
    #[error("declared shape {declared} for {op} does not match inferred shape {inferred}")]
    DeclaredShapeMismatch {
        op: &'static str,
        declared: Shape,
        inferred: Shape,
    },
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error("dependency cycle detected among {remaining} pending nodes")]
    Cycle { remaining: usize },
    #[error("operand %{0} was not computed before its consumer ran")]
    OperandNotReady(u32),
    #[error("expression has shape {0}; a scalar value requires exactly one element")]
    NotScalar(Shape),
    #[error("graph exceeded the maximum number of nodes per generation")]
    CapacityExceeded,
    #[error("backend `{backend}` failed while executing {op}")]
    Backend {
        backend: String,
        op: &'static str,
        #[source]
        source: BackendError,
    },
}
