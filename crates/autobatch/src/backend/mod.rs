//! Backend contract: shapes, operations, and the batched-kernel execution trait.
pub mod hashing;
pub mod spec;

pub use spec::{
    Arity, BackendError, BackendResult, BatchBackend, BatchMember, BinaryOp, OpKind, Operation,
    Shape, ShapeError, UnaryOp,
};
