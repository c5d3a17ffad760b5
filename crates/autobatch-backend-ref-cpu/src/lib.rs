pub mod cpu;

pub use cpu::{CpuBackend, CpuKernelInterceptor, CpuTensor, GenericCpuBackend, NoopInterceptor};
