//! Execution trace hooks invoked around every step the executor runs.
//!
//! Sinks are installed per thread and nest: the most recently installed sink receives the
//! callbacks. Callbacks run while the graph is locked and must not call back into the graph.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::spec::OpKind;

/// Describes one scheduled step just before and after it executes.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub graph_id: usize,
    pub generation: u64,
    pub step_index: usize,
    pub step_count: usize,
    pub kind: OpKind,
    /// Creation sequence numbers of the step's nodes, in kernel argument order.
    pub nodes: Vec<u32>,
    /// Whether the step is dispatched as a single batched kernel call.
    pub batched: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepStatus {
    Success,
    /// The batched call was declined and members ran one at a time.
    Fallback,
    Failure { message: String },
}

#[derive(Debug, Clone)]
pub struct StepStats {
    pub duration: Duration,
    pub kernel_launches: usize,
    pub status: StepStatus,
}

pub trait ExecutionTraceSink: Send + Sync {
    fn before_step(&self, context: &StepContext);
    fn after_step(&self, context: &StepContext, stats: &StepStats);
}

thread_local! {
    static SINK_STACK: RefCell<Vec<Arc<dyn ExecutionTraceSink>>> = const { RefCell::new(Vec::new()) };
}

/// RAII guard that uninstalls a sink when dropped.
pub struct SinkGuard {
    active: bool,
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        if self.active {
            SINK_STACK.with(|stack| {
                stack.borrow_mut().pop();
            });
            self.active = false;
        }
    }
}

pub fn install_sink(sink: Arc<dyn ExecutionTraceSink>) -> SinkGuard {
    SINK_STACK.with(|stack| stack.borrow_mut().push(sink));
    SinkGuard { active: true }
}

/// Runs `f` with `sink` installed for the current thread.
pub fn with_sink<F, R>(sink: Arc<dyn ExecutionTraceSink>, f: F) -> R
where
    F: FnOnce() -> R,
{
    let guard = install_sink(sink);
    let result = f();
    drop(guard);
    result
}

pub fn current_sink() -> Option<Arc<dyn ExecutionTraceSink>> {
    SINK_STACK.with(|stack| stack.borrow().last().cloned())
}
