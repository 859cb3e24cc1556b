//! Gradient estimation behind one contract.
//!
//! A loss function evaluates `count` parameter variants at once and returns
//! metrics that include `MetricKey::Loss`. Estimators turn those evaluations
//! into gradients accumulated on the `ParamSet`:
//!
//!   - Backprop: one evaluation on a recording tape, then reverse mode.
//!   - EvolutionStrategies: antithetic Gaussian directions (see `es`).
//!   - FiniteDifferences: importance-sampled coordinate axes (see `finite_diffs`).
//!
//! The strategy is fixed by `EstimatorConfig` at startup.

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CellNetError, Result};
use crate::es::EvolutionStrategies;
use crate::finite_diffs::{AxisSample, FiniteDiffs, FiniteDiffsState};
use crate::metrics::{MetricKey, Metrics};
use crate::params::{ParamOverride, ParamSet};
use crate::tape::{BufId, Tape};
use crate::tensor::Tensor;

/// Result of one loss-function call.
#[derive(Debug, Default)]
pub struct Evaluation {
    pub metrics: Metrics,
    /// Live parameters registered on the tape, by name. Empty when every
    /// weight came from an override.
    pub bindings: Vec<(String, BufId)>,
}

/// Evaluates the loss for `count` variants. `overrides`, when present,
/// holds `count` stacked values per parameter; otherwise `params` is used.
pub trait LossFn {
    fn evaluate(
        &mut self,
        tape: &mut Tape,
        params: &ParamSet,
        count: usize,
        overrides: Option<&ParamOverride>,
    ) -> Result<Evaluation>;
}

impl<F> LossFn for F
where
    F: FnMut(&mut Tape, &ParamSet, usize, Option<&ParamOverride>) -> Result<Evaluation>,
{
    fn evaluate(
        &mut self,
        tape: &mut Tape,
        params: &ParamSet,
        count: usize,
        overrides: Option<&ParamOverride>,
    ) -> Result<Evaluation> {
        self(tape, params, count, overrides)
    }
}

/// Loss values of an evaluation, checked to hold one value per variant.
pub(crate) fn variant_losses(metrics: &Metrics, count: usize) -> Result<Vec<f32>> {
    let loss = metrics.get(&MetricKey::Loss).ok_or_else(|| metrics.missing(&MetricKey::Loss))?;
    if loss.numel() != count {
        return Err(CellNetError::ShapeMismatch {
            label: "per-variant loss".into(),
            expected: vec![count],
            got: loss.shape.clone(),
        });
    }
    if loss.data.iter().any(|v| !v.is_finite()) {
        warn!(count, "non-finite loss among evaluated variants");
    }
    Ok(loss.data.clone())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EstimatorConfig {
    Backprop,
    EvolutionStrategies {
        eps: f32,
        /// Number of antithetic direction pairs per step.
        population: usize,
        /// Directions evaluated per loss-function call.
        batch_size: usize,
    },
    FiniteDifferences {
        eps: f32,
        eval_count: usize,
        #[serde(default = "default_history_count")]
        history_count: usize,
        #[serde(default = "default_random_prob")]
        random_prob: f32,
        /// Axes evaluated per loss-function call.
        batch_size: usize,
    },
}

fn default_history_count() -> usize {
    2
}

fn default_random_prob() -> f32 {
    0.5
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        EstimatorConfig::Backprop
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(CellNetError::InvalidConfig(msg));
        match *self {
            EstimatorConfig::Backprop => Ok(()),
            EstimatorConfig::EvolutionStrategies { eps, population, batch_size } => {
                if eps.is_nan() || eps <= 0.0 {
                    return bad(format!("es eps must be > 0, got {eps}"));
                }
                if population == 0 || batch_size == 0 {
                    return bad(format!("es population ({population}) and batch_size ({batch_size}) must be > 0"));
                }
                Ok(())
            }
            EstimatorConfig::FiniteDifferences { eps, eval_count, history_count, random_prob, batch_size } => {
                if eps.is_nan() || eps <= 0.0 {
                    return bad(format!("finite-difference eps must be > 0, got {eps}"));
                }
                if eval_count == 0 || history_count == 0 || batch_size == 0 {
                    return bad(format!(
                        "eval_count ({eval_count}), history_count ({history_count}) and batch_size ({batch_size}) must be > 0"
                    ));
                }
                if !(0.0..=1.0).contains(&random_prob) {
                    return bad(format!("random_prob must lie in [0, 1], got {random_prob}"));
                }
                Ok(())
            }
        }
    }
}

/// Randomness drawn once per training step and shared by its microbatches.
#[derive(Clone, Debug, PartialEq)]
pub enum EstimatorSample {
    Exact,
    /// One flat parameter-space direction per population member.
    Noise(Vec<Vec<f32>>),
    Axes(AxisSample),
}

/// Persistent estimator state for checkpoints.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EstimatorState {
    #[default]
    Stateless,
    FiniteDifferences(FiniteDiffsState),
}

#[derive(Clone, Debug)]
pub enum GradientEstimator {
    Backprop,
    EvolutionStrategies(EvolutionStrategies),
    FiniteDifferences(FiniteDiffs),
}

impl GradientEstimator {
    pub fn from_config(config: &EstimatorConfig, params: &ParamSet) -> Result<Self> {
        config.validate()?;
        Ok(match *config {
            EstimatorConfig::Backprop => GradientEstimator::Backprop,
            EstimatorConfig::EvolutionStrategies { eps, population, batch_size } => {
                GradientEstimator::EvolutionStrategies(EvolutionStrategies::new(eps, population, batch_size))
            }
            EstimatorConfig::FiniteDifferences { eps, eval_count, history_count, random_prob, batch_size } => {
                GradientEstimator::FiniteDifferences(FiniteDiffs::new(
                    params.axis_count(),
                    eps,
                    eval_count,
                    history_count,
                    random_prob,
                    batch_size,
                ))
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            GradientEstimator::Backprop => "backprop",
            GradientEstimator::EvolutionStrategies(_) => "evolution_strategies",
            GradientEstimator::FiniteDifferences(_) => "finite_differences",
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, params: &ParamSet, rng: &mut R) -> EstimatorSample {
        match self {
            GradientEstimator::Backprop => EstimatorSample::Exact,
            GradientEstimator::EvolutionStrategies(es) => EstimatorSample::Noise(es.sample_noises(params, rng)),
            GradientEstimator::FiniteDifferences(fd) => EstimatorSample::Axes(fd.sample_axes(rng)),
        }
    }

    /// Accumulate a gradient estimate into `params` and return the mean
    /// metrics of the evaluations.
    pub fn estimate(
        &mut self,
        sample: &EstimatorSample,
        params: &mut ParamSet,
        loss: &mut dyn LossFn,
    ) -> Result<Metrics> {
        match (self, sample) {
            (GradientEstimator::Backprop, EstimatorSample::Exact) => backprop(params, loss),
            (GradientEstimator::EvolutionStrategies(es), EstimatorSample::Noise(noises)) => {
                es.estimate(noises, params, loss)
            }
            (GradientEstimator::FiniteDifferences(fd), EstimatorSample::Axes(axes)) => {
                fd.estimate(axes, params, loss)
            }
            (est, _) => Err(CellNetError::InvalidConfig(format!(
                "sample kind does not match the {} estimator",
                est.name()
            ))),
        }
    }

    pub fn state(&self) -> EstimatorState {
        match self {
            GradientEstimator::FiniteDifferences(fd) => EstimatorState::FiniteDifferences(fd.state()),
            _ => EstimatorState::Stateless,
        }
    }

    pub fn load_state(&mut self, state: EstimatorState) -> Result<()> {
        match (self, state) {
            (GradientEstimator::FiniteDifferences(fd), EstimatorState::FiniteDifferences(s)) => fd.load_state(s),
            (_, EstimatorState::Stateless) => Ok(()),
            (est, EstimatorState::FiniteDifferences(_)) => Err(CellNetError::Restore(format!(
                "finite-difference history cannot be loaded into the {} estimator",
                est.name()
            ))),
        }
    }
}

/// Exact gradient: evaluate once on a recording tape and run reverse mode
/// from the loss.
fn backprop(params: &mut ParamSet, loss: &mut dyn LossFn) -> Result<Metrics> {
    let mut tape = Tape::new();
    let eval = loss.evaluate(&mut tape, params, 1, None)?;
    variant_losses(&eval.metrics, 1)?;
    let handle = eval
        .metrics
        .handle(&MetricKey::Loss)
        .ok_or_else(|| CellNetError::InvalidConfig("loss metric was not computed on the tape".into()))?;
    tape.backward(handle);
    for (name, id) in &eval.bindings {
        let grad = Tensor::from_vec(tape.get_param_grad(*id), tape.buf_shape(*id));
        params.accumulate_grad(name, &grad)?;
    }
    Ok(eval.metrics.detach())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traced;

    /// loss = sum(w²) over a single parameter, evaluated per variant.
    fn quadratic(tape: &mut Tape, params: &ParamSet, count: usize, ov: Option<&ParamOverride>) -> Result<Evaluation> {
        let (id, bindings) = match ov.and_then(|o| o.get("w")) {
            Some(stack) => (tape.register_input(&stack.data, stack.shape.clone()), vec![]),
            None => {
                let v = params.value("w")?;
                let id = tape.register_param(&v.data, v.shape.clone());
                (id, vec![("w".to_string(), id)])
            }
        };
        let n = tape.buf_numel(id) / count;
        let zeros = vec![0.0; n * count];
        let se = traced::traced_squared_error_rows(tape, id, &zeros, count);
        let loss = traced::traced_scale(tape, se, n as f32);
        let value = tape.buf_data(loss).to_vec();
        let mut metrics = Metrics::new();
        let t = if count == 1 { Tensor::scalar(value[0]) } else { Tensor::from_vec(value, &[count]) };
        metrics.insert_traced(MetricKey::Loss, t, loss);
        Ok(Evaluation { metrics, bindings })
    }

    fn params() -> ParamSet {
        let mut ps = ParamSet::new();
        ps.insert("w", Tensor::from_vec(vec![1.0, -2.0, 0.5], &[3]));
        ps
    }

    #[test]
    fn test_backprop_quadratic() {
        let mut ps = params();
        let mut est = GradientEstimator::from_config(&EstimatorConfig::Backprop, &ps).unwrap();
        let m = est.estimate(&EstimatorSample::Exact, &mut ps, &mut quadratic).unwrap();
        assert!((m.scalar(&MetricKey::Loss).unwrap() - 5.25).abs() < 1e-5);
        let g = &ps.get("w").unwrap().grad.as_ref().unwrap().data;
        for (gi, wi) in g.iter().zip([1.0f32, -2.0, 0.5]) {
            assert!((gi - 2.0 * wi).abs() < 1e-5);
        }
    }

    #[test]
    fn test_missing_loss_metric_is_an_error() {
        let mut ps = params();
        let mut est = GradientEstimator::Backprop;
        let mut no_loss = |_: &mut Tape, _: &ParamSet, _: usize, _: Option<&ParamOverride>| -> Result<Evaluation> {
            let mut metrics = Metrics::new();
            metrics.insert(MetricKey::Accuracy, Tensor::scalar(1.0));
            Ok(Evaluation { metrics, bindings: vec![] })
        };
        let err = est.estimate(&EstimatorSample::Exact, &mut ps, &mut no_loss);
        assert!(matches!(err, Err(CellNetError::MissingMetric { .. })));
    }

    #[test]
    fn test_sample_mismatch_rejected() {
        let mut ps = params();
        let mut est = GradientEstimator::Backprop;
        let err = est.estimate(&EstimatorSample::Noise(vec![]), &mut ps, &mut quadratic);
        assert!(matches!(err, Err(CellNetError::InvalidConfig(_))));
    }

    #[test]
    fn test_config_validation() {
        assert!(EstimatorConfig::EvolutionStrategies { eps: 0.0, population: 1, batch_size: 1 }.validate().is_err());
        assert!(EstimatorConfig::FiniteDifferences {
            eps: 0.1, eval_count: 4, history_count: 2, random_prob: 1.5, batch_size: 2
        }.validate().is_err());
        let cfg: EstimatorConfig =
            serde_json::from_str(r#"{"kind":"finite_differences","eps":0.01,"eval_count":8,"batch_size":4}"#).unwrap();
        assert_eq!(cfg, EstimatorConfig::FiniteDifferences {
            eps: 0.01, eval_count: 8, history_count: 2, random_prob: 0.5, batch_size: 4
        });
    }
}
