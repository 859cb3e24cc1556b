//! Losses over rollout outputs, and the rollout-backed loss function that the
//! gradient estimators drive.
//!
//! Every objective reports values per parameter variant: a vector of length
//! `count` when several variants share one batch, a scalar when `count == 1`.

use std::sync::Arc;

use crate::cell::{Cell, CellWeights, PARAM_NAMES};
use crate::error::{CellNetError, Result};
use crate::estimator::{Evaluation, LossFn};
use crate::graph::Graph;
use crate::metrics::{MetricKey, Metrics};
use crate::params::{ParamOverride, ParamSet};
use crate::rollout::{Rollout, RolloutConfig};
use crate::tape::{BufId, GradHook, Tape};
use crate::tensor::{self, Tensor};
use crate::traced;

/// One rollout's worth of examples: `inputs[t]` `[batch, in_count]`,
/// `labels[t]` `[batch, out_count]` (encoded targets fed to the network)
/// and `label_indices[t]` (class index per batch row).
#[derive(Clone, Debug, PartialEq)]
pub struct RolloutBatch {
    pub inputs: Vec<Tensor>,
    pub labels: Vec<Tensor>,
    pub label_indices: Vec<Vec<usize>>,
}

impl RolloutBatch {
    pub fn batch_size(&self) -> usize {
        self.inputs.first().map(|t| t.shape[0]).unwrap_or(0)
    }

    pub fn example_count(&self) -> usize {
        self.inputs.len()
    }

    /// Rows `[start, start + len)` of every example.
    pub fn slice_rows(&self, start: usize, len: usize) -> RolloutBatch {
        RolloutBatch {
            inputs: self.inputs.iter().map(|t| t.slice_rows(start, len)).collect(),
            labels: self.labels.iter().map(|t| t.slice_rows(start, len)).collect(),
            label_indices: self.label_indices.iter().map(|l| l[start..start + len].to_vec()).collect(),
        }
    }
}

/// Turns rollout outputs into metrics, `Loss` included.
pub trait Objective {
    fn evaluate(&self, tape: &mut Tape, outputs: &[BufId], count: usize) -> Result<Metrics>;
}

fn per_variant(values: Vec<f32>) -> Tensor {
    if values.len() == 1 {
        Tensor::scalar(values[0])
    } else {
        let n = values.len();
        Tensor::from_vec(values, &[n])
    }
}

/// Mean of per-example `[count]` losses, times `scale`, as a traced metric.
fn mean_over_examples(tape: &mut Tape, per_example: &[BufId], scale: f32) -> BufId {
    let mut total = per_example[0];
    for &l in &per_example[1..] {
        total = traced::traced_add(tape, total, l);
    }
    traced::traced_scale(tape, total, scale / per_example.len() as f32)
}

/// Log-softmax cross entropy against class indices, plus arg-max accuracy.
#[derive(Clone, Debug)]
pub struct ClassificationObjective {
    pub label_indices: Vec<Vec<usize>>,
    /// Microbatch weight, `microbatch rows / batch rows`.
    pub scale: f32,
}

impl Objective for ClassificationObjective {
    fn evaluate(&self, tape: &mut Tape, outputs: &[BufId], count: usize) -> Result<Metrics> {
        if outputs.len() != self.label_indices.len() || outputs.is_empty() {
            return Err(CellNetError::InvalidConfig(format!(
                "{} rollout outputs for {} label sets",
                outputs.len(),
                self.label_indices.len()
            )));
        }
        let mut losses = Vec::with_capacity(outputs.len());
        let mut accs = Vec::with_capacity(outputs.len());
        for (&out, labels) in outputs.iter().zip(&self.label_indices) {
            let targets: Vec<usize> = labels.iter().copied().cycle().take(labels.len() * count).collect();
            let rows = targets.len();
            let cols = tape.buf_numel(out) / rows;
            let ce = traced::traced_cross_entropy_rows(tape, out, &targets);
            losses.push(traced::traced_group_mean(tape, ce, count));

            let preds = tensor::argmax_rows(tape.buf_data(out), rows, cols);
            let per_row = labels.len();
            let acc: Vec<f32> = (0..count)
                .map(|v| {
                    let hits = (0..per_row).filter(|&r| preds[v * per_row + r] == targets[v * per_row + r]).count();
                    hits as f32 / per_row as f32
                })
                .collect();
            accs.push(acc);
        }

        let loss = mean_over_examples(tape, &losses, self.scale);
        let last_loss: Vec<f32> = tape.buf_data(losses[losses.len() - 1]).iter().map(|v| v * self.scale).collect();
        let mean_acc: Vec<f32> = (0..count)
            .map(|v| accs.iter().map(|a| a[v]).sum::<f32>() / accs.len() as f32 * self.scale)
            .collect();
        let last_acc: Vec<f32> = accs[accs.len() - 1].iter().map(|a| a * self.scale).collect();

        let mut metrics = Metrics::new();
        metrics.insert_traced(MetricKey::Loss, per_variant(tape.buf_data(loss).to_vec()), loss);
        metrics.insert(MetricKey::LastLoss, per_variant(last_loss));
        metrics.insert(MetricKey::Accuracy, per_variant(mean_acc));
        metrics.insert(MetricKey::LastAccuracy, per_variant(last_acc));
        Ok(metrics)
    }
}

/// Mean squared distance of outputs from fixed targets.
#[derive(Clone, Debug)]
pub struct RegressionObjective {
    /// `[batch, out_count]` per example.
    pub targets: Vec<Tensor>,
    pub scale: f32,
}

impl Objective for RegressionObjective {
    fn evaluate(&self, tape: &mut Tape, outputs: &[BufId], count: usize) -> Result<Metrics> {
        if outputs.len() != self.targets.len() || outputs.is_empty() {
            return Err(CellNetError::InvalidConfig(format!(
                "{} rollout outputs for {} regression targets",
                outputs.len(),
                self.targets.len()
            )));
        }
        let mut losses = Vec::with_capacity(outputs.len());
        for (&out, target) in outputs.iter().zip(&self.targets) {
            let tiled = target.repeat_rows(count);
            let se = traced::traced_squared_error_rows(tape, out, &tiled.data, tiled.shape[0]);
            losses.push(traced::traced_group_mean(tape, se, count));
        }
        let loss = mean_over_examples(tape, &losses, self.scale);
        let mut metrics = Metrics::new();
        metrics.insert_traced(MetricKey::Loss, per_variant(tape.buf_data(loss).to_vec()), loss);
        Ok(metrics)
    }
}

/// Loss function over one (micro)batch: repeats the batch and the wiring for
/// `count` variants, rolls the cell out and scores the outputs.
pub struct RolloutLoss<'a, O: Objective> {
    pub cell: &'a Cell,
    pub graph: &'a Graph,
    pub rollout: &'a RolloutConfig,
    pub inputs: &'a [Tensor],
    pub targets: &'a [Tensor],
    pub objective: &'a O,
    pub act_clipper: Option<Arc<dyn GradHook>>,
}

impl<O: Objective> LossFn for RolloutLoss<'_, O> {
    fn evaluate(
        &mut self,
        tape: &mut Tape,
        params: &ParamSet,
        count: usize,
        overrides: Option<&ParamOverride>,
    ) -> Result<Evaluation> {
        let graph = self.graph.repeated(count);
        let inputs: Vec<Tensor> = self.inputs.iter().map(|t| t.repeat_rows(count)).collect();
        let targets: Vec<Tensor> = self.targets.iter().map(|t| t.repeat_rows(count)).collect();

        let weights = CellWeights::bind(tape, params, overrides)?;
        let mut rollout = Rollout::new(self.cell, &graph, self.rollout);
        if let Some(hook) = &self.act_clipper {
            rollout = rollout.with_act_clipper(Arc::clone(hook));
        }
        let outputs = rollout.run(tape, &weights, &inputs, &targets)?;
        let metrics = self.objective.evaluate(tape, &outputs, count)?;

        let bindings = PARAM_NAMES
            .iter()
            .zip(weights.ids())
            .filter(|(_, id)| tape.is_param(*id))
            .map(|(name, id)| (name.to_string(), id))
            .collect();
        Ok(Evaluation { metrics, bindings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_rows() {
        let batch = RolloutBatch {
            inputs: vec![Tensor::from_vec(vec![0.0, 1.0, 2.0, 3.0], &[2, 2])],
            labels: vec![Tensor::from_vec(vec![1.0, 0.0, 0.0, 1.0], &[2, 2])],
            label_indices: vec![vec![0, 1]],
        };
        let s = batch.slice_rows(1, 1);
        assert_eq!(s.batch_size(), 1);
        assert_eq!(s.inputs[0].data, vec![2.0, 3.0]);
        assert_eq!(s.label_indices[0], vec![1]);
    }

    #[test]
    fn test_classification_per_variant() {
        let mut tape = Tape::new();
        // Two variants of one row each: variant 0 predicts class 1, variant 1 class 0.
        let out = tape.alloc(vec![0.0, 2.0, 2.0, 0.0], vec![2, 2]);
        let obj = ClassificationObjective { label_indices: vec![vec![1]], scale: 1.0 };
        let m = obj.evaluate(&mut tape, &[out], 2).unwrap();
        assert_eq!(m.get(&MetricKey::Accuracy).unwrap().data, vec![1.0, 0.0]);
        let loss = m.get(&MetricKey::Loss).unwrap();
        assert_eq!(loss.shape, vec![2]);
        assert!(loss.data[0] < loss.data[1]);
    }

    #[test]
    fn test_classification_scalar_and_scaled() {
        let mut tape = Tape::new();
        let a = tape.alloc(vec![0.0, 0.0], vec![1, 2]);
        let b = tape.alloc(vec![0.0, 0.0], vec![1, 2]);
        let obj = ClassificationObjective { label_indices: vec![vec![0], vec![1]], scale: 0.5 };
        let m = obj.evaluate(&mut tape, &[a, b], 1).unwrap();
        let loss = m.get(&MetricKey::Loss).unwrap();
        assert!(loss.shape.is_empty());
        assert!((loss.item() - 0.5 * 2f32.ln()).abs() < 1e-6);
        assert!(m.handle(&MetricKey::Loss).is_some());
        assert!(m.handle(&MetricKey::LastLoss).is_none());
    }

    #[test]
    fn test_regression_loss_value() {
        let mut tape = Tape::new();
        let out = tape.alloc(vec![1.0, 3.0], vec![1, 2]);
        let obj = RegressionObjective { targets: vec![Tensor::from_vec(vec![0.0, 1.0], &[1, 2])], scale: 1.0 };
        let m = obj.evaluate(&mut tape, &[out], 1).unwrap();
        assert!((m.scalar(&MetricKey::Loss).unwrap() - 2.5).abs() < 1e-6);
    }
}
