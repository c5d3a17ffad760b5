//! Groups pending nodes into topologically ordered batch steps.
//!
//! All strategies produce steps whose members share a batch signature and whose operands were
//! computed by earlier steps. Members within a step are in ascending creation order.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::backend::spec::OpKind;
use crate::config::BatchStrategy;

use super::error::GraphError;
use super::plan::{PlanStep, PlanStructure};

/// Grouping key: batchable nodes group by signature, everything else stands alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Bucket {
    Signature(u32),
    Single(u32),
}

pub(super) fn schedule(structure: &PlanStructure) -> Result<Vec<PlanStep>, GraphError> {
    let steps = match structure.strategy {
        BatchStrategy::Off => sequential(structure),
        BatchStrategy::Agenda => agenda(structure)?,
        BatchStrategy::Depth => by_depth(structure),
    };
    verify_order(structure, &steps)?;
    Ok(steps)
}

fn bucket_of(structure: &PlanStructure, position: u32) -> Bucket {
    if structure.strategy.is_enabled() && structure.is_batchable(position) {
        Bucket::Signature(structure.nodes[position as usize].signature)
    } else {
        Bucket::Single(position)
    }
}

fn sequential(structure: &PlanStructure) -> Vec<PlanStep> {
    (0..structure.nodes.len() as u32)
        .map(|position| PlanStep {
            kind: structure.kind(position),
            members: vec![position],
            batched: false,
        })
        .collect()
}

/// Repeatedly emits the ready bucket with the lowest average depth.
fn agenda(structure: &PlanStructure) -> Result<Vec<PlanStep>, GraphError> {
    let total = structure.nodes.len();
    let mut remaining: Vec<usize> = structure.nodes.iter().map(|node| node.deps.len()).collect();
    let mut dependents: Vec<Vec<u32>> = vec![Vec::new(); total];
    for (position, node) in structure.nodes.iter().enumerate() {
        for dep in &node.deps {
            dependents[*dep as usize].push(position as u32);
        }
    }

    let mut ready: HashMap<Bucket, ReadyBucket> = HashMap::new();
    for position in 0..total as u32 {
        if remaining[position as usize] == 0 {
            ready
                .entry(bucket_of(structure, position))
                .or_default()
                .push(structure, position);
        }
    }

    let mut steps = Vec::new();
    let mut emitted = 0usize;
    while emitted < total {
        let Some(bucket) = pick_bucket(&ready) else {
            return Err(GraphError::Cycle {
                remaining: total - emitted,
            });
        };
        let mut members = ready
            .remove(&bucket)
            .map(|bucket| bucket.members)
            .unwrap_or_default();
        members.sort_unstable();
        for member in &members {
            for dependent in &dependents[*member as usize] {
                let count = &mut remaining[*dependent as usize];
                *count -= 1;
                if *count == 0 {
                    ready
                        .entry(bucket_of(structure, *dependent))
                        .or_default()
                        .push(structure, *dependent);
                }
            }
        }
        emitted += members.len();
        push_chunks(structure, members, &mut steps);
    }
    Ok(steps)
}

/// Ready members of one bucket with their running depth total and smallest position.
#[derive(Default)]
struct ReadyBucket {
    members: Vec<u32>,
    depth_sum: u64,
    first: u32,
}

impl ReadyBucket {
    fn push(&mut self, structure: &PlanStructure, position: u32) {
        if self.members.is_empty() || position < self.first {
            self.first = position;
        }
        self.depth_sum += u64::from(structure.nodes[position as usize].depth);
        self.members.push(position);
    }
}

fn pick_bucket(ready: &HashMap<Bucket, ReadyBucket>) -> Option<Bucket> {
    ready
        .iter()
        .min_by(|(_, lhs), (_, rhs)| {
            // Compare average depths exactly: sum_l / len_l vs sum_r / len_r.
            let (lhs_len, rhs_len) = (lhs.members.len() as u64, rhs.members.len() as u64);
            (lhs.depth_sum * rhs_len)
                .cmp(&(rhs.depth_sum * lhs_len))
                .then_with(|| lhs.first.cmp(&rhs.first))
        })
        .map(|(bucket, _)| *bucket)
}

/// Groups by (depth, signature) and emits level by level.
fn by_depth(structure: &PlanStructure) -> Vec<PlanStep> {
    let mut groups: HashMap<(u32, Bucket), Vec<u32>> = HashMap::new();
    for (position, node) in structure.nodes.iter().enumerate() {
        let position = position as u32;
        groups
            .entry((node.depth, bucket_of(structure, position)))
            .or_default()
            .push(position);
    }
    let mut ordered: Vec<((u32, Bucket), Vec<u32>)> = groups.into_iter().collect();
    ordered.sort_by(|(lhs_key, lhs), (rhs_key, rhs)| match lhs_key.0.cmp(&rhs_key.0) {
        Ordering::Equal => lhs[0].cmp(&rhs[0]),
        other => other,
    });

    let mut steps = Vec::new();
    for (_, members) in ordered {
        push_chunks(structure, members, &mut steps);
    }
    steps
}

fn push_chunks(structure: &PlanStructure, members: Vec<u32>, steps: &mut Vec<PlanStep>) {
    let kind: OpKind = structure.kind(members[0]);
    let batchable = structure.strategy.is_enabled() && structure.is_batchable(members[0]);
    let chunk = structure
        .max_batch_size
        .unwrap_or(members.len())
        .max(1);
    for group in members.chunks(chunk) {
        steps.push(PlanStep {
            kind,
            members: group.to_vec(),
            batched: batchable && group.len() > 1,
        });
    }
}

/// Checks that each node appears once and only after all of its pending operands.
fn verify_order(structure: &PlanStructure, steps: &[PlanStep]) -> Result<(), GraphError> {
    let total = structure.nodes.len();
    let mut done = vec![false; total];
    let mut emitted = 0usize;
    for step in steps {
        for member in &step.members {
            let node = &structure.nodes[*member as usize];
            if done[*member as usize] || node.deps.iter().any(|dep| !done[*dep as usize]) {
                return Err(GraphError::Cycle {
                    remaining: total - emitted,
                });
            }
        }
        for member in &step.members {
            done[*member as usize] = true;
        }
        emitted += step.members.len();
    }
    if emitted != total {
        return Err(GraphError::Cycle {
            remaining: total - emitted,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use smallvec::SmallVec;

    use super::*;
    use crate::backend::spec::{Shape, UnaryOp};
    use crate::graph::plan::{BatchSignature, PendingNode};

    struct Fixture {
        structure: PlanStructure,
    }

    impl Fixture {
        fn new(strategy: BatchStrategy) -> Self {
            let mut structure = PlanStructure::new(strategy, None);
            for (len, batchable) in [(4, true), (8, true), (4, false)] {
                structure.signatures.push(BatchSignature {
                    kind: OpKind::Unary(UnaryOp::Tanh),
                    operands: SmallVec::from_elem(Shape::vector(len), 1),
                    output: Shape::vector(len),
                });
                structure.batchable.push(batchable);
            }
            Fixture { structure }
        }

        fn node(mut self, signature: u32, deps: &[u32], depth: u32) -> Self {
            self.structure.nodes.push(PendingNode {
                signature,
                deps: SmallVec::from_slice(deps),
                depth,
            });
            self
        }

        fn cap(mut self, cap: usize) -> Self {
            self.structure.max_batch_size = Some(cap);
            self
        }

        fn members(self) -> Vec<Vec<u32>> {
            schedule(&self.structure)
                .expect("schedule")
                .into_iter()
                .map(|step| step.members)
                .collect()
        }
    }

    fn two_chains(strategy: BatchStrategy) -> Fixture {
        Fixture::new(strategy)
            .node(0, &[], 1)
            .node(0, &[], 1)
            .node(0, &[0], 2)
            .node(0, &[1], 2)
    }

    #[test]
    fn off_keeps_creation_order() {
        assert_eq!(
            two_chains(BatchStrategy::Off).members(),
            vec![vec![0], vec![1], vec![2], vec![3]]
        );
    }

    #[test]
    fn agenda_batches_parallel_chains() {
        assert_eq!(
            two_chains(BatchStrategy::Agenda).members(),
            vec![vec![0, 1], vec![2, 3]]
        );
    }

    #[test]
    fn depth_batches_parallel_chains() {
        assert_eq!(
            two_chains(BatchStrategy::Depth).members(),
            vec![vec![0, 1], vec![2, 3]]
        );
    }

    #[test]
    fn incompatible_shapes_form_separate_steps() {
        let steps = Fixture::new(BatchStrategy::Agenda)
            .node(1, &[], 1)
            .node(0, &[], 1)
            .node(1, &[], 1)
            .node(0, &[], 1)
            .members();
        assert_eq!(steps, vec![vec![0, 2], vec![1, 3]]);
    }

    #[test]
    fn agenda_prefers_shallower_buckets() {
        // Node 0 is deep (its ancestors were computed earlier); node 1 is shallow.
        let steps = Fixture::new(BatchStrategy::Agenda)
            .node(0, &[], 7)
            .node(1, &[], 1)
            .members();
        assert_eq!(steps, vec![vec![1], vec![0]]);
    }

    #[test]
    fn ties_favour_smaller_sequence() {
        let steps = Fixture::new(BatchStrategy::Agenda)
            .node(1, &[], 1)
            .node(0, &[], 1)
            .members();
        assert_eq!(steps, vec![vec![0], vec![1]]);
    }

    #[test]
    fn ties_see_members_released_in_later_rounds() {
        // Node 1 joins node 3's bucket after node 0 runs and becomes its smallest member.
        let steps = Fixture::new(BatchStrategy::Agenda)
            .node(1, &[], 1)
            .node(0, &[0], 2)
            .node(2, &[], 2)
            .node(0, &[], 2)
            .members();
        assert_eq!(steps, vec![vec![0], vec![1, 3], vec![2]]);
    }

    #[test]
    fn unbatchable_signatures_run_alone() {
        for strategy in [BatchStrategy::Agenda, BatchStrategy::Depth] {
            let steps = Fixture::new(strategy)
                .node(2, &[], 1)
                .node(2, &[], 1)
                .members();
            assert_eq!(steps, vec![vec![0], vec![1]], "{strategy}");
        }
    }

    #[test]
    fn max_batch_size_splits_groups() {
        let steps = Fixture::new(BatchStrategy::Depth)
            .node(0, &[], 1)
            .node(0, &[], 1)
            .node(0, &[], 1)
            .node(0, &[], 1)
            .node(0, &[], 1)
            .cap(2)
            .members();
        assert_eq!(steps, vec![vec![0, 1], vec![2, 3], vec![4]]);
    }

    #[test]
    fn batched_flag_requires_multiple_members() {
        let fixture = Fixture::new(BatchStrategy::Agenda)
            .node(0, &[], 1)
            .node(0, &[], 1)
            .node(1, &[], 1);
        let steps = schedule(&fixture.structure).expect("schedule");
        assert!(steps[0].batched);
        assert!(!steps[1].batched);
    }

    #[test]
    fn cycles_are_reported() {
        for strategy in BatchStrategy::ALL {
            let fixture = Fixture::new(strategy).node(0, &[1], 1).node(0, &[0], 1);
            let err = schedule(&fixture.structure).expect_err("cycle");
            assert!(matches!(err, GraphError::Cycle { .. }), "{strategy}: {err}");
        }
    }
}
