//! Lazily evaluated computation graph with autobatched execution.
//!
//! Nodes are recorded without computing anything. [`ComputationGraph::evaluate`] collects the
//! pending ancestors of the requested targets, groups them into batch steps according to the
//! configured [`BatchStrategy`](crate::config::BatchStrategy), and runs those steps on the
//! backend. Results are cached per node until the graph is reset.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::Result;
use smallvec::SmallVec;

use crate::backend::spec::{BatchBackend, Operation, Shape};
use crate::config::AutobatchConfig;
use crate::profiling;
use crate::tensor::Tensor;

use super::builder::GraphBuilder;
use super::error::GraphError;
use super::executor;
use super::plan::{BatchSignature, PendingNode, PlanCache, PlanStep, PlanStructure, SignatureTable};
use super::scheduler;
use super::state::{GraphInner, NodeId, NodeOp};
use super::stats::ExecutionStats;
use super::timing;

static GRAPH_ID_COUNTER: AtomicUsize = AtomicUsize::new(1);

/// Append-only graph of deferred tensor operations bound to one backend.
pub struct ComputationGraph<B: BatchBackend + 'static> {
    backend: Arc<B>,
    inner: Mutex<GraphInner<B>>,
    id: usize,
}

impl<B: BatchBackend + 'static> ComputationGraph<B> {
    /// Creates a graph configured from the `AUTOBATCH*` environment variables.
    pub fn new(backend: Arc<B>) -> Arc<Self> {
        Self::with_config(backend, AutobatchConfig::from_env_or_default())
    }

    pub fn with_config(backend: Arc<B>, config: AutobatchConfig) -> Arc<Self> {
        let id = GRAPH_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
        Arc::new(ComputationGraph {
            backend,
            inner: Mutex::new(GraphInner::new(id, config)),
            id,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn backend(&self) -> Arc<B> {
        Arc::clone(&self.backend)
    }

    pub fn config(&self) -> AutobatchConfig {
        self.lock().config.clone()
    }

    /// Replaces the autobatching settings used by subsequent evaluations.
    pub fn set_config(&self, config: AutobatchConfig) {
        let mut inner = self.lock();
        if config.plan_cache_capacity != inner.config.plan_cache_capacity {
            inner.plan_cache = PlanCache::new(config.plan_cache_capacity);
        }
        inner.config = config;
    }

    /// Current generation; incremented by every [`reset`](Self::reset).
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Number of nodes recorded in the current generation.
    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ExecutionStats {
        self.lock().stats
    }

    /// Returns the accumulated statistics and zeroes them.
    pub fn take_stats(&self) -> ExecutionStats {
        std::mem::take(&mut self.lock().stats)
    }

    pub fn cached_plans(&self) -> usize {
        self.lock().plan_cache.len()
    }

    /// Runs `f` with exclusive access to a [`GraphBuilder`].
    pub fn capture<R, F>(self: &Arc<Self>, f: F) -> Result<R>
    where
        F: FnOnce(&mut GraphBuilder<B>) -> Result<R>,
    {
        let mut inner = self.lock();
        let mut builder = GraphBuilder {
            graph: Arc::clone(self),
            inner: &mut *inner,
        };
        f(&mut builder)
    }

    /// Records a host tensor as a leaf node.
    pub fn input(self: &Arc<Self>, tensor: &Tensor) -> Result<NodeId> {
        self.capture(|builder| builder.input(tensor))
    }

    /// Records a deferred operation over `operands` with declared output `shape`.
    pub fn create_node(
        self: &Arc<Self>,
        op: Operation,
        operands: &[NodeId],
        shape: Shape,
    ) -> Result<NodeId> {
        self.capture(|builder| builder.emit(op, operands, shape))
    }

    /// Discards every node and cached value and starts a new generation.
    ///
    /// Handles from earlier generations are rejected by all later calls. The plan cache and
    /// statistics are kept.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let discarded = inner.nodes.len();
        inner.nodes.clear();
        inner.generation += 1;
        tracing::debug!(
            graph = self.id,
            generation = inner.generation,
            discarded,
            "graph reset"
        );
    }

    pub fn shape(&self, node: NodeId) -> Result<Shape> {
        let inner = self.lock();
        let index = inner.resolve(node)?;
        Ok(inner.record(index).shape.clone())
    }

    pub fn is_computed(&self, node: NodeId) -> Result<bool> {
        let inner = self.lock();
        let index = inner.resolve(node)?;
        Ok(inner.record(index).state.is_ready())
    }

    /// Computes every target that lacks a cached value, batching independent work.
    ///
    /// Targets that are already computed cost nothing: no plan is built and the backend is
    /// not called.
    pub fn evaluate(&self, targets: &[NodeId]) -> Result<()> {
        let _scope = profiling::scope("graph::evaluate");
        let mut guard = self.lock();
        let inner = &mut *guard;

        let mut roots: SmallVec<[u32; 4]> = SmallVec::with_capacity(targets.len());
        for target in targets {
            roots.push(inner.resolve(*target)?);
        }
        inner.stats.evaluations += 1;

        let pending = collect_pending(inner, &roots);
        if pending.is_empty() {
            profiling::cache_event("evaluate_cached");
            return Ok(());
        }

        let planning = Instant::now();
        let (steps, cache_hit) = plan_for(self.backend.as_ref(), inner, &pending)?;
        timing::add_schedule_time(planning.elapsed());

        tracing::debug!(
            graph = self.id,
            generation = inner.generation,
            pending = pending.len(),
            steps = steps.len(),
            strategy = %inner.config.strategy,
            cache_hit,
            "evaluating pending nodes"
        );

        let summary = executor::run_plan(self.backend.as_ref(), inner, &pending, &steps)?;
        inner.stats.absorb(&summary);
        Ok(())
    }

    /// Evaluates `node` and returns its backend handle.
    pub fn handle(&self, node: NodeId) -> Result<B::TensorHandle> {
        self.evaluate(&[node])?;
        let inner = self.lock();
        let index = inner.resolve(node)?;
        Ok(inner.ready_handle(index)?)
    }

    /// Evaluates `node` and copies its value to the host.
    pub fn value(&self, node: NodeId) -> Result<Tensor> {
        let handle = self.handle(node)?;
        let tensor = self
            .backend
            .to_host(&handle)
            .map_err(|source| GraphError::Backend {
                backend: self.backend.backend_name().to_string(),
                op: "to_host",
                source,
            })?;
        Ok(tensor)
    }

    fn lock(&self) -> MutexGuard<'_, GraphInner<B>> {
        self.inner.lock().expect("computation graph poisoned")
    }
}

impl<B: BatchBackend + 'static> fmt::Debug for ComputationGraph<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputationGraph")
            .field("id", &self.id)
            .field("backend", &self.backend.backend_name())
            .finish_non_exhaustive()
    }
}

/// Pending ancestors of `roots`, in ascending creation order.
fn collect_pending<B: BatchBackend + 'static>(inner: &GraphInner<B>, roots: &[u32]) -> Vec<u32> {
    let mut seen: HashSet<u32> = HashSet::new();
    let mut stack: Vec<u32> = roots.to_vec();
    let mut pending = Vec::new();
    while let Some(index) = stack.pop() {
        if !seen.insert(index) {
            continue;
        }
        let record = inner.record(index);
        if record.state.is_ready() {
            continue;
        }
        pending.push(index);
        stack.extend(record.operands.iter().copied());
    }
    pending.sort_unstable();
    pending
}

fn describe<B: BatchBackend + 'static>(
    backend: &B,
    inner: &GraphInner<B>,
    pending: &[u32],
) -> Result<PlanStructure, GraphError> {
    let mut structure = PlanStructure::new(inner.config.strategy, inner.config.max_batch_size);
    let mut table = SignatureTable::default();
    let positions: HashMap<u32, u32> = pending
        .iter()
        .enumerate()
        .map(|(position, index)| (*index, position as u32))
        .collect();

    for index in pending {
        let record = inner.record(*index);
        let NodeOp::Op(op) = &record.op else {
            return Err(GraphError::UnknownNode(*index));
        };
        let signature = BatchSignature {
            kind: op.kind(),
            operands: record
                .operands
                .iter()
                .map(|operand| inner.record(*operand).shape.clone())
                .collect(),
            output: record.shape.clone(),
        };
        let signature = table.intern(&mut structure, signature, |kind| {
            backend.supports_batching(kind)
        });
        structure.nodes.push(PendingNode {
            signature,
            deps: record
                .operands
                .iter()
                .filter_map(|operand| positions.get(operand).copied())
                .collect(),
            depth: record.depth,
        });
    }
    Ok(structure)
}

fn plan_for<B: BatchBackend + 'static>(
    backend: &B,
    inner: &mut GraphInner<B>,
    pending: &[u32],
) -> Result<(Arc<[PlanStep]>, bool), GraphError> {
    let structure = describe(backend, inner, pending)?;
    let key = inner
        .plan_cache
        .is_enabled()
        .then(|| structure.fingerprint());

    if let Some(key) = key {
        if let Some(steps) = inner.plan_cache.lookup(key, &structure) {
            inner.stats.plan_cache_hits += 1;
            profiling::cache_event("plan_cache_hit");
            return Ok((steps, true));
        }
        profiling::cache_event("plan_cache_miss");
    }

    let steps: Arc<[PlanStep]> = {
        let _scope = profiling::scope("graph::schedule");
        Arc::from(scheduler::schedule(&structure)?)
    };
    inner.stats.plans_built += 1;
    if let Some(key) = key {
        inner.plan_cache.insert(key, structure, Arc::clone(&steps));
    }
    Ok((steps, false))
}
