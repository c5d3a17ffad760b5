//! Batch plans and the per-graph structural plan cache.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use smallvec::SmallVec;

use crate::backend::hashing::hash_value;
use crate::backend::spec::{OpKind, Shape};
use crate::config::BatchStrategy;

/// Operator kind plus per-position operand shapes and output shape.
///
/// Two pending nodes may share a batched kernel call only when their signatures are equal.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(super) struct BatchSignature {
    pub(super) kind: OpKind,
    pub(super) operands: SmallVec<[Shape; 3]>,
    pub(super) output: Shape,
}

/// One pending node as seen by the scheduler.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(super) struct PendingNode {
    /// Index into [`PlanStructure::signatures`].
    pub(super) signature: u32,
    /// Positions of operands that are themselves pending in this evaluation.
    pub(super) deps: SmallVec<[u32; 4]>,
    pub(super) depth: u32,
}

/// Everything a plan depends on. Equal structures always yield equal plans.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(super) struct PlanStructure {
    pub(super) strategy: BatchStrategy,
    pub(super) max_batch_size: Option<usize>,
    pub(super) signatures: Vec<BatchSignature>,
    /// Backend batchability, parallel to `signatures`.
    pub(super) batchable: Vec<bool>,
    /// Pending nodes in ascending creation order.
    pub(super) nodes: Vec<PendingNode>,
}

impl PlanStructure {
    pub(super) fn new(strategy: BatchStrategy, max_batch_size: Option<usize>) -> Self {
        PlanStructure {
            strategy,
            max_batch_size,
            signatures: Vec::new(),
            batchable: Vec::new(),
            nodes: Vec::new(),
        }
    }

    pub(super) fn fingerprint(&self) -> u64 {
        hash_value(self)
    }

    pub(super) fn kind(&self, position: u32) -> OpKind {
        let signature = self.nodes[position as usize].signature;
        self.signatures[signature as usize].kind
    }

    pub(super) fn is_batchable(&self, position: u32) -> bool {
        let signature = self.nodes[position as usize].signature;
        self.batchable[signature as usize]
    }
}

/// Interns signatures in first-seen order so ids are a function of graph structure alone.
#[derive(Default)]
pub(super) struct SignatureTable {
    ids: HashMap<BatchSignature, u32>,
}

impl SignatureTable {
    /// Returns the id for `signature`, registering it in `structure` when first seen.
    pub(super) fn intern(
        &mut self,
        structure: &mut PlanStructure,
        signature: BatchSignature,
        batchable: impl FnOnce(OpKind) -> bool,
    ) -> u32 {
        if let Some(id) = self.ids.get(&signature) {
            return *id;
        }
        let id = structure.signatures.len() as u32;
        structure.batchable.push(batchable(signature.kind));
        structure.signatures.push(signature.clone());
        self.ids.insert(signature, id);
        id
    }
}

/// A group of pending nodes dispatched together.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(super) struct PlanStep {
    pub(super) kind: OpKind,
    /// Positions into the pending node list, ascending.
    pub(super) members: Vec<u32>,
    /// Whether the step is issued as one batched kernel call.
    pub(super) batched: bool,
}

struct CachedPlan {
    structure: Arc<PlanStructure>,
    steps: Arc<[PlanStep]>,
}

/// LRU cache of plans keyed by structural fingerprint; disabled at capacity zero.
pub(super) struct PlanCache {
    entries: Option<LruCache<u64, CachedPlan>>,
}

impl PlanCache {
    pub(super) fn new(capacity: usize) -> Self {
        PlanCache {
            entries: NonZeroUsize::new(capacity).map(LruCache::new),
        }
    }

    pub(super) fn is_enabled(&self) -> bool {
        self.entries.is_some()
    }

    pub(super) fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, LruCache::len)
    }

    /// Returns the cached plan for `structure`; fingerprint collisions are treated as misses.
    pub(super) fn lookup(&mut self, key: u64, structure: &PlanStructure) -> Option<Arc<[PlanStep]>> {
        let entries = self.entries.as_mut()?;
        let cached = entries.get(&key)?;
        if cached.structure.as_ref() != structure {
            tracing::debug!(key, "plan cache fingerprint collision");
            return None;
        }
        Some(Arc::clone(&cached.steps))
    }

    pub(super) fn insert(&mut self, key: u64, structure: PlanStructure, steps: Arc<[PlanStep]>) {
        if let Some(entries) = self.entries.as_mut() {
            entries.put(
                key,
                CachedPlan {
                    structure: Arc::new(structure),
                    steps,
                },
            );
        }
    }
}
