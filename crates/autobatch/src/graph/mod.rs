//! Lazy computation graph, autobatching scheduler, and batched executor.

mod arena;
mod builder;
mod error;
mod executor;
mod plan;
mod scheduler;
mod state;
mod stats;
pub mod timing;

pub use arena::ComputationGraph;
pub use builder::GraphBuilder;
pub use error::GraphError;
pub use state::NodeId;
pub use stats::ExecutionStats;
