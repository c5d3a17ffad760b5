//! Lazy computation graphs with automatic operator batching.
//!
//! Client code records deferred tensor expressions on a [`ComputationGraph`]. When a value is
//! requested, the graph schedules every pending ancestor into steps of structurally identical
//! nodes and executes each step as one batched backend call, caching the results per node.

pub mod backend;
pub mod config;
mod env;
pub mod expr;
pub mod graph;
pub mod ops;
pub mod profiling;
pub mod tensor;
pub mod trace;

pub use backend::spec::BatchBackend;
pub use config::{AutobatchConfig, BatchStrategy};
pub use expr::Expression;
pub use graph::{ComputationGraph, ExecutionStats, GraphError, NodeId};
pub use tensor::{Shape, Tensor};
