mod host_tensor;

pub use crate::backend::spec::Shape;
pub use host_tensor::Tensor;
