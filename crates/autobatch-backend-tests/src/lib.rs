pub mod counting_backend;
pub mod smoke;

pub use counting_backend::CountingBackend;

/// Expands to a test module running every smoke check against the backend built by
/// `$backend_ctor`, a closure returning `Arc<B>`.
#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $backend_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            use $crate::smoke;

            #[test]
            fn smoke_batched_kernels_match_single_node() {
                let backend = ($backend_ctor)();
                smoke::batched_kernels_match_single_node(&backend);
            }

            #[test]
            fn smoke_recurrent_values_match_across_strategies() {
                let backend = ($backend_ctor)();
                smoke::recurrent_values_match_across_strategies(&backend);
            }

            #[test]
            fn smoke_evaluation_order_does_not_change_values() {
                let backend = ($backend_ctor)();
                smoke::evaluation_order_does_not_change_values(&backend);
            }

            #[test]
            fn smoke_independent_chains_share_kernel_launches() {
                let backend = ($backend_ctor)();
                smoke::independent_chains_share_kernel_launches(&backend);
            }

            #[test]
            fn smoke_cached_targets_skip_backend() {
                let backend = ($backend_ctor)();
                smoke::cached_targets_skip_backend(&backend);
            }

            #[test]
            fn smoke_unbatched_kinds_still_evaluate() {
                let backend = ($backend_ctor)();
                smoke::unbatched_kinds_still_evaluate(&backend);
            }

            #[test]
            fn smoke_reset_invalidates_handles() {
                let backend = ($backend_ctor)();
                smoke::reset_invalidates_handles(&backend);
            }
        }
    };
}
