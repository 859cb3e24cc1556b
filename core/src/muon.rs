//! Muon: momentum SGD whose update direction is orthogonalized by a quintic
//! Newton–Schulz iteration before it is applied.
//!
//! Every parameter is treated as a stack of matrices over its trailing two
//! axes. Rank-1 parameters cannot be orthogonalized and are rejected.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CellNetError, Result};
use crate::params::ParamSet;
use crate::tensor::{matmul_f32, transpose_f32, vec_norm_f32, Tensor};

/// Quintic coefficients, tuned to push singular values toward 1 fast.
const NS_A: f32 = 3.4445;
const NS_B: f32 = -4.7750;
const NS_C: f32 = 2.0315;
const NS_EPS: f32 = 1e-7;

// ── Configuration ─────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuonConfig {
    pub lr: f32,
    pub momentum: f32,
    /// Decoupled decay applied to the weights before each step.
    pub weight_decay: f32,
    pub nesterov: bool,
    pub ns_steps: usize,
}

impl Default for MuonConfig {
    fn default() -> Self {
        MuonConfig { lr: 0.02, momentum: 0.95, weight_decay: 0.0, nesterov: true, ns_steps: 5 }
    }
}

impl MuonConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lr.is_nan() || self.lr <= 0.0 {
            return Err(CellNetError::InvalidConfig(format!("muon lr must be > 0, got {}", self.lr)));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(CellNetError::InvalidConfig(format!(
                "muon momentum must lie in [0, 1), got {}",
                self.momentum
            )));
        }
        if self.weight_decay < 0.0 {
            return Err(CellNetError::InvalidConfig(format!(
                "muon weight_decay must be >= 0, got {}",
                self.weight_decay
            )));
        }
        Ok(())
    }
}

/// Momentum buffer per parameter name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MuonState {
    pub momentum: BTreeMap<String, Tensor>,
}

// ── Newton–Schulz ─────────────────────────────────────────────────────

/// Approximate orthogonalization of every trailing `[rows, cols]` matrix of `g`.
///
/// Wide orientation is used internally (`rows <= cols`), so `X·Xᵀ` is the
/// smaller Gram matrix. Each matrix is divided by `‖X‖_F + 1e-7` first.
pub fn newton_schulz(g: &Tensor, steps: usize) -> Result<Tensor> {
    if g.ndim() < 2 {
        return Err(CellNetError::RankTooLow { shape: g.shape.clone() });
    }
    let rows = g.shape[g.ndim() - 2];
    let cols = g.shape[g.ndim() - 1];
    let size = rows * cols;
    let mut out = Vec::with_capacity(g.numel());
    if size == 0 {
        return Ok(g.clone());
    }
    for matrix in g.data.chunks(size) {
        out.extend(orthogonalize_matrix(matrix, rows, cols, steps));
    }
    Ok(Tensor::from_vec(out, &g.shape))
}

fn orthogonalize_matrix(m: &[f32], rows: usize, cols: usize, steps: usize) -> Vec<f32> {
    let tall = rows > cols;
    let (p, q) = if tall { (cols, rows) } else { (rows, cols) };
    let mut x = if tall {
        let mut t = vec![0.0f32; p * q];
        transpose_f32(m, &mut t, rows, cols);
        t
    } else {
        m.to_vec()
    };

    let inv = 1.0 / (vec_norm_f32(&x) + NS_EPS);
    x.iter_mut().for_each(|v| *v *= inv);

    let mut xt = vec![0.0f32; q * p];
    let mut a = vec![0.0f32; p * p];
    let mut a2 = vec![0.0f32; p * p];
    let mut bx = vec![0.0f32; p * q];
    for _ in 0..steps {
        transpose_f32(&x, &mut xt, p, q);
        matmul_f32(&x, &xt, &mut a, p, q, p);
        matmul_f32(&a, &a, &mut a2, p, p, p);
        // B = b·A + c·A²
        for (ai, a2i) in a.iter_mut().zip(&a2) {
            *ai = NS_B * *ai + NS_C * a2i;
        }
        matmul_f32(&a, &x, &mut bx, p, p, q);
        for (xi, bxi) in x.iter_mut().zip(&bx) {
            *xi = NS_A * *xi + bxi;
        }
    }

    if tall {
        let mut back = vec![0.0f32; rows * cols];
        transpose_f32(&x, &mut back, p, q);
        back
    } else {
        x
    }
}

// ── Optimizer ─────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct Muon {
    pub config: MuonConfig,
    state: MuonState,
}

impl Muon {
    pub fn new(config: MuonConfig) -> Result<Self> {
        config.validate()?;
        Ok(Muon { config, state: MuonState::default() })
    }

    /// Apply one update to every parameter that has both a value and a
    /// gradient. Gradients are left in place.
    pub fn step(&mut self, params: &mut ParamSet) -> Result<()> {
        // Every shape is checked before anything is mutated.
        for (name, param) in params.iter() {
            let (Some(value), Some(grad)) = (param.value.as_ref(), param.grad.as_ref()) else {
                continue;
            };
            if value.ndim() < 2 {
                return Err(CellNetError::RankTooLow { shape: value.shape.clone() });
            }
            if let Some(buf) = self.state.momentum.get(name) {
                if buf.shape != grad.shape {
                    return Err(CellNetError::ShapeMismatch {
                        label: format!("momentum of {name}"),
                        expected: grad.shape.clone(),
                        got: buf.shape.clone(),
                    });
                }
            }
        }

        let cfg = &self.config;
        for (name, param) in params.iter_mut() {
            let (Some(value), Some(grad)) = (param.value.as_mut(), param.grad.as_ref()) else {
                continue;
            };

            let buf = self
                .state
                .momentum
                .entry(name.to_string())
                .or_insert_with(|| Tensor::zeros(&grad.shape));
            for (v, g) in buf.data.iter_mut().zip(&grad.data) {
                *v = cfg.momentum * *v + (1.0 - cfg.momentum) * g;
            }
            let direction = if cfg.nesterov {
                let data = grad
                    .data
                    .iter()
                    .zip(&buf.data)
                    .map(|(g, v)| (1.0 - cfg.momentum) * g + cfg.momentum * v)
                    .collect();
                Tensor::from_vec(data, &grad.shape)
            } else {
                buf.clone()
            };
            let update = newton_schulz(&direction, cfg.ns_steps)?;

            if cfg.weight_decay > 0.0 {
                let decay = 1.0 - cfg.lr * cfg.weight_decay;
                value.data.iter_mut().for_each(|w| *w *= decay);
            }
            let rows = value.shape[value.ndim() - 2] as f32;
            let cols = value.shape[value.ndim() - 1] as f32;
            let step = cfg.lr * (rows / cols).max(1.0).sqrt();
            for (w, u) in value.data.iter_mut().zip(&update.data) {
                *w -= step * u;
            }
        }
        Ok(())
    }

    pub fn state(&self) -> MuonState {
        self.state.clone()
    }

    pub fn load_state(&mut self, state: MuonState) {
        self.state = state;
    }
}
