//! Synthetic recurrent workload: many sequences of different lengths sharing one set of weights.

use std::sync::Arc;

use anyhow::{ensure, Result};
use autobatch::ops::{self, ExpressionOps};
use autobatch::{BatchBackend, ComputationGraph, Expression, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct WorkloadSpec {
    pub sequences: usize,
    pub min_len: usize,
    pub max_len: usize,
    pub input_dim: usize,
    pub hidden_dim: usize,
    pub classes: usize,
    pub seed: u64,
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        WorkloadSpec {
            sequences: 32,
            min_len: 4,
            max_len: 16,
            input_dim: 32,
            hidden_dim: 64,
            classes: 5,
            seed: 0,
        }
    }
}

impl WorkloadSpec {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.sequences > 0, "workload needs at least one sequence");
        ensure!(
            self.min_len > 0 && self.min_len <= self.max_len,
            "invalid sequence length range {}..={}",
            self.min_len,
            self.max_len
        );
        ensure!(
            self.input_dim > 0 && self.hidden_dim > 0 && self.classes > 0,
            "workload dimensions must be non-zero"
        );
        Ok(())
    }
}

pub struct Workload<B: BatchBackend + 'static> {
    /// One loss per sequence.
    pub losses: Vec<Expression<B>>,
    /// Sum of all sequence losses.
    pub total: Expression<B>,
    /// Every non-leaf expression in creation order.
    pub nodes: Vec<Expression<B>>,
}

/// Records a tanh RNN classifier over `spec.sequences` random sequences.
///
/// Nothing is computed here; the graph only accumulates pending nodes. The same `spec` always
/// yields the same graph structure and the same input values.
pub fn build_workload<B: BatchBackend + 'static>(
    graph: &Arc<ComputationGraph<B>>,
    spec: &WorkloadSpec,
) -> Result<Workload<B>> {
    spec.validate()?;
    let mut rng = StdRng::seed_from_u64(spec.seed);
    let (input, hidden) = (spec.input_dim, spec.hidden_dim);
    let scale = 1.0 / (hidden as f32).sqrt();

    let w = ops::input(graph, &Tensor::randn(Shape::matrix(hidden, input), scale, &mut rng))?;
    let u = ops::input(graph, &Tensor::randn(Shape::matrix(hidden, hidden), scale, &mut rng))?;
    let b = ops::input(graph, &Tensor::zeros(Shape::vector(hidden)))?;
    let v = ops::input(
        graph,
        &Tensor::randn(Shape::matrix(spec.classes, hidden), scale, &mut rng),
    )?;

    let mut nodes = Vec::new();
    let mut losses = Vec::with_capacity(spec.sequences);
    for _ in 0..spec.sequences {
        let length = rng.gen_range(spec.min_len..=spec.max_len);
        let label = rng.gen_range(0..spec.classes);
        let mut state = ops::constant(graph, Shape::vector(hidden), 0.0)?;
        for _ in 0..length {
            let x = ops::input(graph, &Tensor::randn(Shape::vector(input), 1.0, &mut rng))?;
            let projected = ops::affine(&b, &w, &x)?;
            let recurrent = ops::matvec(&u, &state)?;
            let preactivation = projected.add(&recurrent)?;
            state = preactivation.tanh()?;
            nodes.extend([projected, recurrent, preactivation, state.clone()]);
        }
        let logits = ops::matvec(&v, &state)?;
        let loss = logits.pick_neg_log_softmax(label)?;
        nodes.extend([logits, loss.clone()]);
        losses.push(loss);
    }
    let total = ops::sum(&losses.iter().collect::<Vec<_>>())?;
    nodes.push(total.clone());
    Ok(Workload {
        losses,
        total,
        nodes,
    })
}
