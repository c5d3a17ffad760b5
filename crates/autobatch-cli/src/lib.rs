pub mod benchmark;
pub mod workload;

pub use benchmark::{compare_strategies, run_bench, BenchOptions, BenchReport, EvalOrder};
pub use workload::{build_workload, Workload, WorkloadSpec};
