//! Antithetic evolution strategies.
//!
//! For each Gaussian direction `n` the loss is evaluated at `center + eps·n`
//! and `center − eps·n`; the gradient estimate is
//! `Σ n · (loss₊ − loss₋) / (2·eps·population)`.
//! Pairs are laid out `[+n₀, −n₀, +n₁, −n₁, ...]` in each evaluation.

use rand::Rng;
use rand_distr::StandardNormal;
use tracing::debug;

use crate::error::Result;
use crate::estimator::{variant_losses, LossFn};
use crate::metrics::{MetricKey, Metrics};
use crate::params::{offset_flat, ParamOverride, ParamSet};
use crate::tape::Tape;
use crate::tensor::Tensor;

#[derive(Clone, Debug)]
pub struct EvolutionStrategies {
    pub eps: f32,
    pub population: usize,
    pub batch_size: usize,
}

impl EvolutionStrategies {
    pub fn new(eps: f32, population: usize, batch_size: usize) -> Self {
        EvolutionStrategies { eps, population, batch_size }
    }

    /// One flat standard-normal direction per population member, covering
    /// every parameter that carries data.
    pub fn sample_noises<R: Rng + ?Sized>(&self, params: &ParamSet, rng: &mut R) -> Vec<Vec<f32>> {
        let axis_count = params.axis_count();
        (0..self.population)
            .map(|_| (0..axis_count).map(|_| rng.sample::<f32, _>(StandardNormal)).collect())
            .collect()
    }

    pub fn estimate(&self, noises: &[Vec<f32>], params: &mut ParamSet, loss: &mut dyn LossFn) -> Result<Metrics> {
        let center = params.flatten();
        let total = noises.len() as f32;
        let mut grad = vec![0.0f32; center.len()];
        let mut shards = Vec::new();

        for (chunk_idx, chunk) in noises.chunks(self.batch_size.max(1)).enumerate() {
            let variants: Vec<Vec<f32>> = chunk
                .iter()
                .flat_map(|n| [offset_flat(&center, n, self.eps), offset_flat(&center, n, -self.eps)])
                .collect();
            let overrides = ParamOverride::from_variants(params, &variants)?;
            let count = variants.len();

            let mut tape = Tape::no_grad();
            let eval = loss.evaluate(&mut tape, params, count, Some(&overrides))?;
            let values = variant_losses(&eval.metrics, count)?;
            shards.push(eval.metrics.means());

            for (i, noise) in chunk.iter().enumerate() {
                let delta = values[2 * i] - values[2 * i + 1];
                let scale = delta / (2.0 * self.eps * total);
                for (g, n) in grad.iter_mut().zip(noise) {
                    *g += n * scale;
                }
                let mut m = Metrics::new();
                m.insert(MetricKey::EsDelta, Tensor::scalar(delta));
                shards.push(m);
            }
            debug!(chunk = chunk_idx, directions = chunk.len(), "es chunk evaluated");
        }

        params.accumulate_flat_grad(&grad)?;
        Ok(Metrics::mean_of(&shards))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimator::Evaluation;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Linear loss `a·w` per variant.
    fn linear(tape: &mut Tape, params: &ParamSet, count: usize, ov: Option<&ParamOverride>) -> Result<Evaluation> {
        let a = [1.0f32, -2.0];
        let w = match ov.and_then(|o| o.get("w")) {
            Some(stack) => stack.data.clone(),
            None => params.value("w")?.data.repeat(count),
        };
        let losses: Vec<f32> = w.chunks(2).map(|v| v[0] * a[0] + v[1] * a[1]).collect();
        let id = tape.register_input(&losses, vec![count]);
        let mut metrics = Metrics::new();
        metrics.insert_traced(MetricKey::Loss, Tensor::from_vec(losses, &[count]), id);
        Ok(Evaluation { metrics, bindings: vec![] })
    }

    #[test]
    fn test_axis_directions_recover_linear_gradient() {
        let mut ps = ParamSet::new();
        ps.insert("w", Tensor::from_vec(vec![0.3, 0.7], &[2]));
        let es = EvolutionStrategies::new(0.1, 2, 1);
        // Two orthogonal unit directions scaled by sqrt(2): Σ n nᵀ / N = I.
        let s = 2f32.sqrt();
        let noises = vec![vec![s, 0.0], vec![0.0, s]];
        let m = es.estimate(&noises, &mut ps, &mut linear).unwrap();
        let g = &ps.get("w").unwrap().grad.as_ref().unwrap().data;
        assert!((g[0] - 1.0).abs() < 1e-4, "{g:?}");
        assert!((g[1] + 2.0).abs() < 1e-4, "{g:?}");
        assert!(m.contains(&MetricKey::EsDelta));
        assert!(m.contains(&MetricKey::Loss));
    }

    #[test]
    fn test_sample_noises_shape() {
        let mut ps = ParamSet::new();
        ps.insert("w", Tensor::zeros(&[3, 2]));
        let es = EvolutionStrategies::new(0.1, 4, 2);
        let noises = es.sample_noises(&ps, &mut StdRng::seed_from_u64(0));
        assert_eq!(noises.len(), 4);
        assert!(noises.iter().all(|n| n.len() == 6));
    }
}
