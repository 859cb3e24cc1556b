//! Importance-sampled coordinate finite differences.
//!
//! Every axis of the flattened parameter space keeps a short history of the
//! `|Δloss / 2eps|` values it produced. Axes are drawn with probability
//! proportional to their mean history, mixed with a uniform floor
//! (`random_prob`), using Gumbel-max over independent rows. Duplicate draws
//! are possible and are not filtered; each draw carries its own
//! inverse-probability weight.

use std::collections::VecDeque;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CellNetError, Result};
use crate::estimator::{variant_losses, LossFn};
use crate::metrics::Metrics;
use crate::params::{ParamOverride, ParamSet};
use crate::tape::Tape;

/// Mean used for an axis that has never been evaluated.
pub const EMPTY_HISTORY_WEIGHT: f32 = 10000.0;
const GUMBEL_CLAMP: f32 = 1e-5;

/// Axes to evaluate this step and their importance weights
/// (`1 / (prob · eval_count)`).
#[derive(Clone, Debug, PartialEq)]
pub struct AxisSample {
    pub axes: Vec<usize>,
    pub weights: Vec<f32>,
}

/// Serializable per-axis history, oldest value first.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FiniteDiffsState {
    pub history: Vec<Vec<f32>>,
}

#[derive(Clone, Debug)]
pub struct FiniteDiffs {
    pub eps: f32,
    pub eval_count: usize,
    pub history_count: usize,
    pub random_prob: f32,
    pub batch_size: usize,
    history: Vec<VecDeque<f32>>,
}

impl FiniteDiffs {
    /// `eval_count` is capped at `axis_count`.
    pub fn new(
        axis_count: usize,
        eps: f32,
        eval_count: usize,
        history_count: usize,
        random_prob: f32,
        batch_size: usize,
    ) -> Self {
        FiniteDiffs {
            eps,
            eval_count: eval_count.min(axis_count),
            history_count,
            random_prob,
            batch_size,
            history: vec![VecDeque::with_capacity(history_count); axis_count],
        }
    }

    pub fn axis_count(&self) -> usize {
        self.history.len()
    }

    /// Mean recorded magnitude of `axis`, or the placeholder when empty.
    pub fn axis_weight(&self, axis: usize) -> f32 {
        let h = &self.history[axis];
        if h.is_empty() {
            EMPTY_HISTORY_WEIGHT
        } else {
            h.iter().sum::<f32>() / h.len() as f32
        }
    }

    /// Append a magnitude to an axis, evicting the oldest past `history_count`.
    pub fn observe(&mut self, axis: usize, magnitude: f32) {
        let h = &mut self.history[axis];
        h.push_back(magnitude);
        while h.len() > self.history_count {
            h.pop_front();
        }
    }

    /// Sampling distribution over axes.
    pub fn probabilities(&self) -> Vec<f32> {
        let n = self.axis_count();
        let weights: Vec<f32> = (0..n).map(|a| self.axis_weight(a)).collect();
        let total: f32 = weights.iter().sum();
        let floor = self.random_prob / n as f32;
        weights
            .iter()
            .map(|w| {
                let adaptive = if total > 0.0 { w / total } else { 1.0 / n as f32 };
                adaptive * (1.0 - self.random_prob) + floor
            })
            .collect()
    }

    pub fn sample_axes<R: Rng + ?Sized>(&self, rng: &mut R) -> AxisSample {
        let probs = self.probabilities();
        let logits: Vec<f32> = probs.iter().map(|p| p.ln()).collect();
        let mut axes = Vec::with_capacity(self.eval_count);
        let mut weights = Vec::with_capacity(self.eval_count);
        for _ in 0..self.eval_count {
            let mut best = 0;
            let mut best_score = f32::NEG_INFINITY;
            for (axis, &logit) in logits.iter().enumerate() {
                let u = rng.gen::<f32>().max(GUMBEL_CLAMP);
                let score = logit - (-u.ln()).ln();
                if score > best_score {
                    best_score = score;
                    best = axis;
                }
            }
            axes.push(best);
            weights.push(1.0 / probs[best] / self.eval_count as f32);
        }
        AxisSample { axes, weights }
    }

    pub fn estimate(&mut self, sample: &AxisSample, params: &mut ParamSet, loss: &mut dyn LossFn) -> Result<Metrics> {
        if params.axis_count() != self.axis_count() {
            return Err(CellNetError::ShapeMismatch {
                label: "finite-difference axes".into(),
                expected: vec![self.axis_count()],
                got: vec![params.axis_count()],
            });
        }
        let center = params.flatten();
        let mut grad = vec![0.0f32; center.len()];
        let mut shards = Vec::new();

        let step = self.batch_size.max(1);
        for (axes, weights) in sample.axes.chunks(step).zip(sample.weights.chunks(step)) {
            let mut variants = Vec::with_capacity(axes.len() * 2);
            for &axis in axes {
                for sign in [1.0f32, -1.0] {
                    let mut v = center.clone();
                    v[axis] += sign * self.eps;
                    variants.push(v);
                }
            }
            let overrides = ParamOverride::from_variants(params, &variants)?;
            let count = variants.len();

            let mut tape = Tape::no_grad();
            let eval = loss.evaluate(&mut tape, params, count, Some(&overrides))?;
            let values = variant_losses(&eval.metrics, count)?;
            shards.push(eval.metrics.means());

            for (i, (&axis, &w)) in axes.iter().zip(weights).enumerate() {
                let delta = (values[2 * i] - values[2 * i + 1]) / (2.0 * self.eps);
                grad[axis] += w * delta;
                self.observe(axis, delta.abs());
            }
            debug!(axes = axes.len(), "finite-difference batch evaluated");
        }

        params.accumulate_flat_grad(&grad)?;
        Ok(Metrics::mean_of(&shards))
    }

    pub fn state(&self) -> FiniteDiffsState {
        FiniteDiffsState { history: self.history.iter().map(|h| h.iter().copied().collect()).collect() }
    }

    pub fn load_state(&mut self, state: FiniteDiffsState) -> Result<()> {
        if state.history.len() != self.axis_count() {
            return Err(CellNetError::Restore(format!(
                "finite-difference history has {} axes, parameters have {}",
                state.history.len(),
                self.axis_count()
            )));
        }
        for (h, saved) in self.history.iter_mut().zip(state.history) {
            h.clear();
            let skip = saved.len().saturating_sub(self.history_count);
            h.extend(saved.into_iter().skip(skip));
        }
        Ok(())
    }
}
