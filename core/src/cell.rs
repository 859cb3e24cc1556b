//! The shared transition function applied to every node of the graph.
//!
//! Weights are held once and applied to all `batch * cell_count` rows with a
//! single matmul per projection. A `ParamOverride` swaps in a stack of
//! `count` weight variants; the batch is then split into `count` contiguous
//! blocks, each multiplying against its own slice.

use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::{CellNetError, Result};
use crate::params::{ParamOverride, ParamSet};
use crate::tape::{BufId, Tape};
use crate::tensor::{self, Tensor};
use crate::traced::*;

pub const STATE_PROJ: &str = "stateProj.weight";
pub const EDGE_PROJ: &str = "edgeProj.weight";
pub const PREV_EDGE_PROJ: &str = "prevEdgeProj.weight";
pub const IN_OUT_PROJ: &str = "inOutProj.weight";
pub const LAYER2: &str = "layer2.weight";
pub const LAYER3: &str = "layer3.weight";

/// Parameter names in registration order.
pub const PARAM_NAMES: [&str; 6] = [STATE_PROJ, EDGE_PROJ, PREV_EDGE_PROJ, IN_OUT_PROJ, LAYER2, LAYER3];

const NORM_EPS: f32 = 1e-5;
const ORTHO_ITERS: usize = 60;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    #[default]
    None,
    /// RMS over all `cell_count * hidden` features of a batch row, before the first GELU.
    FirstLayer,
    /// RMS over all `cell_count * hidden` features of a batch row, before the output layer.
    LastLayer,
    /// RMS over the node axis, separately per hidden feature, before the output layer.
    LastLayerDimwise,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Initialization {
    #[default]
    Xavier,
    Ortho,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellConfig {
    /// Activation channels per node; equals the graph's `act_per_cell`.
    pub edge_count: usize,
    pub state_count: usize,
    pub hidden_size: usize,
    pub normalization: Normalization,
    pub initialization: Initialization,
    pub act_scale: f32,
}

impl Default for CellConfig {
    fn default() -> Self {
        CellConfig {
            edge_count: 8,
            state_count: 8,
            hidden_size: 64,
            normalization: Normalization::None,
            initialization: Initialization::Xavier,
            act_scale: 1.0,
        }
    }
}

impl CellConfig {
    pub fn validate(&self) -> Result<()> {
        if self.edge_count == 0 || self.state_count == 0 || self.hidden_size == 0 {
            return Err(CellNetError::InvalidConfig(format!(
                "cell sizes must be > 0 (edge_count={}, state_count={}, hidden_size={})",
                self.edge_count, self.state_count, self.hidden_size
            )));
        }
        if !self.act_scale.is_finite() {
            return Err(CellNetError::InvalidConfig(format!("act_scale must be finite, got {}", self.act_scale)));
        }
        Ok(())
    }

    /// Width of the output layer: memory gate + update, scalar output,
    /// activation gate + update.
    pub fn output_width(&self) -> usize {
        2 * self.state_count + 2 * self.edge_count + 1
    }

    /// `[in, out]` shape of each named weight.
    pub fn param_shapes(&self) -> [(&'static str, [usize; 2]); 6] {
        let (s, e, h) = (self.state_count, self.edge_count, self.hidden_size);
        [
            (STATE_PROJ, [s, h]),
            (EDGE_PROJ, [e, h]),
            (PREV_EDGE_PROJ, [e, h]),
            (IN_OUT_PROJ, [2, h]),
            (LAYER2, [h, h]),
            (LAYER3, [h, self.output_width()]),
        ]
    }
}

/// Host-side state threaded through a rollout.
///
/// Shapes: `inputs`/`targets` `[batch, cell_count]`; `activations` (incoming,
/// already rewired) and `prev_activations` (each node's own last output)
/// `[batch, cell_count * edge_count]`; `cell_states`
/// `[batch, cell_count * state_count]`.
#[derive(Clone, Debug, PartialEq)]
pub struct NetworkState {
    pub inputs: Tensor,
    pub targets: Tensor,
    pub prev_activations: Tensor,
    pub activations: Tensor,
    pub cell_states: Tensor,
}

impl NetworkState {
    pub fn zeros(batch: usize, cell_count: usize, config: &CellConfig) -> Self {
        NetworkState {
            inputs: Tensor::zeros(&[batch, cell_count]),
            targets: Tensor::zeros(&[batch, cell_count]),
            prev_activations: Tensor::zeros(&[batch, cell_count * config.edge_count]),
            activations: Tensor::zeros(&[batch, cell_count * config.edge_count]),
            cell_states: Tensor::zeros(&[batch, cell_count * config.state_count]),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.inputs.shape[0]
    }

    /// Add Gaussian noise to activations, previous activations and memory,
    /// scaled per batch row by `std` times that row's standard deviation.
    pub fn with_noise<R: Rng + ?Sized>(&self, std: f32, rng: &mut R) -> NetworkState {
        NetworkState {
            prev_activations: row_noise(&self.prev_activations, std, rng),
            activations: row_noise(&self.activations, std, rng),
            cell_states: row_noise(&self.cell_states, std, rng),
            ..self.clone()
        }
    }
}

fn row_noise<R: Rng + ?Sized>(t: &Tensor, std: f32, rng: &mut R) -> Tensor {
    let rows = t.shape[0];
    let cols = t.numel() / rows.max(1);
    let mut out = t.clone();
    for row in out.data.chunks_mut(cols.max(1)) {
        let mean = row.iter().sum::<f32>() / cols as f32;
        let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / cols as f32;
        let scale = var.sqrt() * std;
        for v in row.iter_mut() {
            *v += rng.sample::<f32, _>(StandardNormal) * scale;
        }
    }
    out
}

/// Weight buffers bound on one tape, in `PARAM_NAMES` order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellWeights {
    pub state_proj: BufId,
    pub edge_proj: BufId,
    pub prev_edge_proj: BufId,
    pub in_out_proj: BufId,
    pub layer2: BufId,
    pub layer3: BufId,
}

impl CellWeights {
    /// Register the live parameters (as tape parameters) or, where the
    /// override has an entry, the override stack (as constants).
    pub fn bind(tape: &mut Tape, params: &ParamSet, overrides: Option<&ParamOverride>) -> Result<CellWeights> {
        let mut ids = [0usize; 6];
        for (slot, name) in ids.iter_mut().zip(PARAM_NAMES) {
            *slot = match overrides.and_then(|o| o.get(name)) {
                Some(stack) => tape.register_input(&stack.data, stack.shape.clone()),
                None => {
                    let v = params.value(name)?;
                    tape.register_param(&v.data, v.shape.clone())
                }
            };
        }
        Ok(CellWeights::from_ids(&ids))
    }

    pub fn from_ids(ids: &[BufId]) -> CellWeights {
        assert_eq!(ids.len(), 6, "CellWeights::from_ids needs 6 ids, got {}", ids.len());
        CellWeights {
            state_proj: ids[0],
            edge_proj: ids[1],
            prev_edge_proj: ids[2],
            in_out_proj: ids[3],
            layer2: ids[4],
            layer3: ids[5],
        }
    }

    pub fn ids(&self) -> [BufId; 6] {
        [self.state_proj, self.edge_proj, self.prev_edge_proj, self.in_out_proj, self.layer2, self.layer3]
    }
}

/// Tape ids of one cell application's results.
#[derive(Clone, Copy, Debug)]
pub struct CellStep {
    /// One scalar per node, `[batch, cell_count]`.
    pub outputs: BufId,
    /// Each node's new outgoing activations, `[batch * cell_count, edge_count]`.
    pub activations: BufId,
    /// `[batch * cell_count, state_count]`.
    pub cell_states: BufId,
}

#[derive(Clone, Debug)]
pub struct Cell {
    config: CellConfig,
    remember_bias: Vec<f32>,
}

impl Cell {
    pub fn new(config: CellConfig) -> Result<Cell> {
        config.validate()?;
        let s = config.state_count as f32;
        let remember_bias = (0..config.state_count).map(|i| 4.0 * i as f32 / s - 2.0).collect();
        Ok(Cell { config, remember_bias })
    }

    pub fn config(&self) -> &CellConfig {
        &self.config
    }

    /// Fresh parameters under the configured initialization.
    pub fn init_params<R: Rng + ?Sized>(&self, rng: &mut R) -> ParamSet {
        let mut params = ParamSet::new();
        for (name, [fan_in, fan_out]) in self.config.param_shapes() {
            let w = match self.config.initialization {
                Initialization::Xavier => xavier_uniform(fan_in, fan_out, rng),
                Initialization::Ortho => orthogonal(fan_in, fan_out, rng),
            };
            params.insert(name, w);
        }
        params
    }

    /// One application over `batch` rows of `cell_count` nodes.
    ///
    /// `in_out` is `[batch * cell_count, 2]` (input, target) per node;
    /// `prev_acts`/`acts` are `[batch * cell_count, edge_count]`;
    /// `states` is `[batch * cell_count, state_count]`.
    pub fn step(
        &self,
        tape: &mut Tape,
        w: &CellWeights,
        in_out: BufId,
        prev_acts: BufId,
        acts: BufId,
        states: BufId,
        batch: usize,
    ) -> CellStep {
        let CellConfig { edge_count: e, state_count: s, hidden_size: hid, .. } = self.config;
        let rows = tape.buf_numel(states) / s;
        let nodes = rows / batch;

        let h_state = traced_matmul(tape, states, w.state_proj);
        let h_prev = traced_matmul(tape, prev_acts, w.prev_edge_proj);
        let h_edge = traced_matmul(tape, acts, w.edge_proj);
        let h_io = traced_matmul(tape, in_out, w.in_out_proj);
        let mut h = traced_add(tape, h_state, h_prev);
        h = traced_add(tape, h, h_edge);
        h = traced_add(tape, h, h_io);

        if self.config.normalization == Normalization::FirstLayer {
            h = traced_rms_norm(tape, h, batch, nodes * hid, 1, NORM_EPS);
        }
        h = traced_gelu(tape, h);
        h = traced_matmul(tape, h, w.layer2);
        if self.config.act_scale != 1.0 {
            h = traced_scale(tape, h, self.config.act_scale);
        }
        h = traced_gelu(tape, h);
        match self.config.normalization {
            Normalization::LastLayer => h = traced_rms_norm(tape, h, batch, nodes * hid, 1, NORM_EPS),
            Normalization::LastLayerDimwise => h = traced_rms_norm(tape, h, batch, nodes, hid, NORM_EPS),
            _ => {}
        }
        let out = traced_matmul(tape, h, w.layer3);

        let state_logits = traced_slice_cols(tape, out, rows, 0, s);
        let state_gate = traced_add_row(tape, state_logits, &self.remember_bias);
        let state_update = traced_slice_cols(tape, out, rows, s, s);
        let outputs = traced_slice_cols(tape, out, rows, 2 * s, 1);
        let act_gate = traced_slice_cols(tape, out, rows, 2 * s + 1, e);
        let act_update = traced_slice_cols(tape, out, rows, 2 * s + 1 + e, e);

        let activations = gated_update(tape, act_gate, prev_acts, act_update);
        let cell_states = gated_update(tape, state_gate, states, state_update);
        CellStep { outputs, activations, cell_states }
    }

    /// Evaluate one step on host tensors without recording gradients.
    /// Returns `(outputs [batch, cell_count], new activations, new memory)`.
    pub fn apply(
        &self,
        params: &ParamSet,
        state: &NetworkState,
        overrides: Option<&ParamOverride>,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let batch = state.batch_size();
        let nodes = state.inputs.numel() / batch;
        let mut tape = Tape::no_grad();
        let w = CellWeights::bind(&mut tape, params, overrides)?;
        let io = interleave_in_out(&state.inputs, &state.targets);
        let io = tape.register_input(&io, vec![batch * nodes, 2]);
        let e = self.config.edge_count;
        let s = self.config.state_count;
        let prev = tape.register_input(&state.prev_activations.data, vec![batch * nodes, e]);
        let acts = tape.register_input(&state.activations.data, vec![batch * nodes, e]);
        let states = tape.register_input(&state.cell_states.data, vec![batch * nodes, s]);
        let step = self.step(&mut tape, &w, io, prev, acts, states, batch);
        Ok((
            Tensor::from_vec(tape.buf_data(step.outputs).to_vec(), &[batch, nodes]),
            Tensor::from_vec(tape.buf_data(step.activations).to_vec(), &[batch, nodes * e]),
            Tensor::from_vec(tape.buf_data(step.cell_states).to_vec(), &[batch, nodes * s]),
        ))
    }
}

/// `sigmoid(gate) * old + sigmoid(-gate) * tanh(update)`.
fn gated_update(tape: &mut Tape, gate: BufId, old: BufId, update: BufId) -> BufId {
    let keep = traced_sigmoid(tape, gate);
    let neg_gate = traced_negate(tape, gate);
    let write = traced_sigmoid(tape, neg_gate);
    let candidate = traced_tanh(tape, update);
    let kept = traced_mul(tape, keep, old);
    let written = traced_mul(tape, write, candidate);
    traced_add(tape, kept, written)
}

/// Per-node `(input, target)` pairs, flat `[rows, 2]`.
pub fn interleave_in_out(inputs: &Tensor, targets: &Tensor) -> Vec<f32> {
    debug_assert_eq!(inputs.numel(), targets.numel());
    inputs.data.iter().zip(&targets.data).flat_map(|(&i, &t)| [i, t]).collect()
}

/// Uniform in `±sqrt(3 / fan_in)`.
fn xavier_uniform<R: Rng + ?Sized>(fan_in: usize, fan_out: usize, rng: &mut R) -> Tensor {
    let bound = (3.0 / fan_in as f32).sqrt();
    let data = (0..fan_in * fan_out).map(|_| (rng.gen::<f32>() - 0.5) * 2.0 * bound).collect();
    Tensor::from_vec(data, &[fan_in, fan_out])
}

/// Polar factor of a Gaussian matrix, via cubic Newton–Schulz
/// `X ← 1.5·X − 0.5·X·Xᵀ·X` on the wide orientation.
fn orthogonal<R: Rng + ?Sized>(fan_in: usize, fan_out: usize, rng: &mut R) -> Tensor {
    let g = Tensor::randn(&[fan_in, fan_out], rng);
    let tall = fan_in > fan_out;
    let (m, n) = if tall { (fan_out, fan_in) } else { (fan_in, fan_out) };
    let mut x = vec![0.0f32; m * n];
    if tall {
        tensor::transpose_f32(&g.data, &mut x, fan_in, fan_out);
    } else {
        x.copy_from_slice(&g.data);
    }
    let norm = tensor::vec_norm_f32(&x) + 1e-8;
    x.iter_mut().for_each(|v| *v /= norm);

    let mut x_t = vec![0.0f32; n * m];
    let mut gram = vec![0.0f32; m * m];
    let mut cubic = vec![0.0f32; m * n];
    for _ in 0..ORTHO_ITERS {
        tensor::transpose_f32(&x, &mut x_t, m, n);
        tensor::matmul_f32(&x, &x_t, &mut gram, m, n, m);
        tensor::matmul_f32(&gram, &x, &mut cubic, m, m, n);
        for (v, c) in x.iter_mut().zip(&cubic) {
            *v = 1.5 * *v - 0.5 * c;
        }
    }

    if tall {
        let mut out = vec![0.0f32; fan_in * fan_out];
        tensor::transpose_f32(&x, &mut out, m, n);
        Tensor::from_vec(out, &[fan_in, fan_out])
    } else {
        Tensor::from_vec(x, &[fan_in, fan_out])
    }
}
