//! One training step, end to end.
//!
//! Per step: draw the estimator's randomness once, then for every microbatch
//! wire a fresh random graph and let the estimator accumulate gradients
//! through a rollout loss. Microbatch metrics are summed (each is already
//! weighted by its share of the batch), the global gradient norm is clipped,
//! Muon updates the weights and the gradients are cleared.

use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cell::{Cell, CellConfig};
use crate::checkpoint::TrainState;
use crate::data::{ExampleStream, LogicGate, StreamCursor, LOGIC_GATE_IN_COUNT, LOGIC_GATE_OUT_COUNT};
use crate::error::{CellNetError, Result};
use crate::estimator::{EstimatorConfig, GradientEstimator};
use crate::grad_clip::{ActGradClipper, GradClipConfig, GradClipper};
use crate::graph::{Graph, GraphConfig};
use crate::metrics::{MetricKey, Metrics};
use crate::muon::{Muon, MuonConfig};
use crate::objective::{ClassificationObjective, RolloutBatch, RolloutLoss};
use crate::params::ParamSet;
use crate::rollout::RolloutConfig;
use crate::tape::GradHook;
use crate::tensor::Tensor;

const STEP_SEED_MIX: u64 = 0x9e3779b97f4a7c15;

// ── Configuration ─────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub cell: CellConfig,
    pub graph: GraphConfig,
    pub rollout: RolloutConfig,
    pub estimator: EstimatorConfig,
    pub muon: MuonConfig,
    pub grad_clip: GradClipConfig,
    /// Per-row RMS cap on activation gradients; off when `None`.
    pub act_grad_max_rms: Option<f32>,
    pub batch_size: usize,
    /// Rows per microbatch; the whole batch when `None`.
    pub microbatch: Option<usize>,
    pub examples_per_rollout: usize,
    pub gates: Vec<LogicGate>,
    pub seed: u64,
    pub save_interval: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            cell: CellConfig::default(),
            graph: GraphConfig::default(),
            rollout: RolloutConfig::default(),
            estimator: EstimatorConfig::default(),
            muon: MuonConfig::default(),
            grad_clip: GradClipConfig::default(),
            act_grad_max_rms: None,
            batch_size: 8,
            microbatch: None,
            examples_per_rollout: 5,
            gates: LogicGate::all(),
            seed: 0,
            save_interval: 100,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        self.cell.validate()?;
        self.graph.validate()?;
        self.rollout.validate()?;
        self.estimator.validate()?;
        self.muon.validate()?;
        self.grad_clip.validate()?;
        if self.cell.edge_count != self.graph.act_per_cell {
            return Err(CellNetError::InvalidConfig(format!(
                "cell edge_count ({}) must equal graph act_per_cell ({})",
                self.cell.edge_count, self.graph.act_per_cell
            )));
        }
        if self.graph.in_count != LOGIC_GATE_IN_COUNT || self.graph.out_count != LOGIC_GATE_OUT_COUNT {
            return Err(CellNetError::InvalidConfig(format!(
                "graph in_count/out_count ({}, {}) must match the logic-gate stream ({}, {})",
                self.graph.in_count, self.graph.out_count, LOGIC_GATE_IN_COUNT, LOGIC_GATE_OUT_COUNT
            )));
        }
        if self.batch_size == 0 || self.examples_per_rollout == 0 || self.save_interval == 0 {
            return Err(CellNetError::InvalidConfig(format!(
                "batch_size ({}), examples_per_rollout ({}) and save_interval ({}) must be > 0",
                self.batch_size, self.examples_per_rollout, self.save_interval
            )));
        }
        if self.microbatch == Some(0) {
            return Err(CellNetError::InvalidConfig("microbatch must be > 0".into()));
        }
        if let Some(max_rms) = self.act_grad_max_rms {
            if max_rms.is_nan() || max_rms <= 0.0 {
                return Err(CellNetError::InvalidConfig(format!("act_grad_max_rms must be > 0, got {max_rms}")));
            }
        }
        Ok(())
    }

    /// Load a config from JSON; absent fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<TrainConfig> {
        let json = std::fs::read_to_string(path)?;
        let config: TrainConfig = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

// ── Trainer ───────────────────────────────────────────────────────────

pub struct Trainer {
    config: TrainConfig,
    cell: Cell,
    params: ParamSet,
    estimator: GradientEstimator,
    muon: Muon,
    clipper: GradClipper,
    act_clipper: Option<Arc<ActGradClipper>>,
    step: u64,
}

impl Trainer {
    /// Validate `config` and initialize parameters from its seed.
    pub fn new(config: TrainConfig) -> Result<Self> {
        config.validate()?;
        let cell = Cell::new(config.cell.clone())?;
        let params = cell.init_params(&mut StdRng::seed_from_u64(config.seed));
        let estimator = GradientEstimator::from_config(&config.estimator, &params)?;
        let muon = Muon::new(config.muon.clone())?;
        let clipper = GradClipper::new(config.grad_clip.clone())?;
        let act_clipper = config.act_grad_max_rms.map(ActGradClipper::new).transpose()?.map(Arc::new);
        info!(
            estimator = estimator.name(),
            axes = params.axis_count(),
            "trainer initialized"
        );
        Ok(Trainer { config, cell, params, estimator, muon, clipper, act_clipper, step: 0 })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn cell(&self) -> &Cell {
        &self.cell
    }

    pub fn params(&self) -> &ParamSet {
        &self.params
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Randomness for the current step, keyed by seed and step so a resumed
    /// run repeats the same graphs and estimator samples.
    fn step_rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.config.seed ^ (self.step + 1).wrapping_mul(STEP_SEED_MIX))
    }

    /// Draw a rollout from `stream` and train on it.
    pub fn train_step(&mut self, stream: &mut dyn ExampleStream) -> Result<Metrics> {
        let batch = stream.next_rollout(self.config.examples_per_rollout);
        self.step(&batch)
    }

    /// One optimizer step on `batch`.
    pub fn step(&mut self, batch: &RolloutBatch) -> Result<Metrics> {
        let batch_size = batch.batch_size();
        if batch_size == 0 || batch.example_count() == 0 {
            return Err(CellNetError::InvalidConfig("training batch is empty".into()));
        }
        let mut rng = self.step_rng();
        let sample = self.estimator.sample(&self.params, &mut rng);
        if let Some(clipper) = &self.act_clipper {
            clipper.reset();
        }
        let hook = self.act_clipper.as_ref().map(|c| Arc::clone(c) as Arc<dyn GradHook>);

        let mb_size = self.config.microbatch.unwrap_or(batch_size).min(batch_size);
        let mut shards = Vec::new();
        for start in (0..batch_size).step_by(mb_size) {
            let cur = mb_size.min(batch_size - start);
            let graph = Graph::random(cur, &self.config.graph, &mut rng)?;
            let sub = batch.slice_rows(start, cur);
            let objective = ClassificationObjective {
                label_indices: sub.label_indices.clone(),
                scale: cur as f32 / batch_size as f32,
            };
            let mut loss = RolloutLoss {
                cell: &self.cell,
                graph: &graph,
                rollout: &self.config.rollout,
                inputs: &sub.inputs,
                targets: &sub.labels,
                objective: &objective,
                act_clipper: hook.clone(),
            };
            let metrics = self.estimator.estimate(&sample, &mut self.params, &mut loss)?;
            debug!(start, rows = cur, "microbatch done");
            shards.push(metrics);
        }

        let mut metrics = Metrics::sum_of(&shards);
        if let Some(clipper) = &self.act_clipper {
            metrics.extend(clipper.metrics())?;
        }
        let (grad_norm, grad_scale) = self.clipper.clip_grads(&mut self.params);
        self.muon.step(&mut self.params)?;
        self.params.clear_grads();
        self.step += 1;

        metrics.insert(MetricKey::GradNorm, Tensor::scalar(grad_norm));
        metrics.insert(MetricKey::GradScale, Tensor::scalar(grad_scale));
        info!("step {}: {}", self.step, metrics);
        Ok(metrics)
    }

    /// Snapshot for checkpointing. The data cursor is owned by the caller.
    pub fn state(&self, data: Option<StreamCursor>) -> TrainState {
        TrainState {
            params: self.params.clone(),
            step: self.step,
            muon: self.muon.state(),
            estimator: self.estimator.state(),
            clipper: self.clipper.state(),
            data,
        }
    }

    /// Restore everything but the data cursor, which is returned.
    pub fn restore(&mut self, state: TrainState) -> Result<Option<StreamCursor>> {
        self.params.load_values(&state.params)?;
        self.params.clear_grads();
        self.estimator.load_state(state.estimator)?;
        self.muon.load_state(state.muon);
        self.clipper.load_state(state.clipper);
        self.step = state.step;
        Ok(state.data)
    }
}


// ── Unit tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod rng_tests {
    use super::*;
    use crate::data::LogicGateStream;
    use rand::Rng;

    #[test]
    fn test_step_rng_independent_of_data_rng() {
        for seed in [0u64, 17, 0x9e37_79b9_7f4a_7c15] {
            let mut trainer = Trainer::new(TrainConfig { seed, ..TrainConfig::default() }).unwrap();
            let mut stream = LogicGateStream::new(4, LogicGate::all(), seed).unwrap();
            for step in 0..16u64 {
                trainer.step = step;
                let step_draw: u64 = trainer.step_rng().gen();
                for drawn in [step, step + 1] {
                    stream
                        .restore(&StreamCursor { seed, rollouts_drawn: drawn, content_hash: 0 })
                        .unwrap();
                    let data_draw: u64 = stream.rollout_rng().gen();
                    assert_ne!(step_draw, data_draw, "seed {seed}, step {step}, rollout {drawn}");
                }
            }
        }
    }
}
