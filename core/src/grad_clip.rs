//! Gradient clipping at two granularities.
//!
//! `ActGradClipper` sits on the tape as a gradient hook and caps the RMS of
//! each batch row of an activation gradient. `GradClipper` caps the global
//! parameter-gradient norm relative to the recent norm history.

use std::collections::VecDeque;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CellNetError, Result};
use crate::metrics::{MetricKey, Metrics};
use crate::params::ParamSet;
use crate::tape::GradHook;
use crate::tensor::{rms_f32, Tensor};

const NORM_EPS: f32 = 1e-8;

// ── Activation-gradient clipper ───────────────────────────────────────

#[derive(Debug, Default)]
struct ActGradRecord {
    rms: Vec<f32>,
    clipped: Vec<bool>,
}

/// Per-row RMS clipper for activation gradients.
///
/// Backward callbacks may fire from any thread, so the running record lives
/// behind a mutex.
#[derive(Debug)]
pub struct ActGradClipper {
    pub max_rms: f32,
    record: Mutex<ActGradRecord>,
}

impl ActGradClipper {
    pub fn new(max_rms: f32) -> Result<Self> {
        if max_rms.is_nan() || max_rms <= 0.0 {
            return Err(CellNetError::InvalidConfig(format!("act_grad_max_rms must be > 0, got {max_rms}")));
        }
        Ok(ActGradClipper { max_rms, record: Mutex::new(ActGradRecord::default()) })
    }

    /// Mean pre-clip RMS and fraction of clipped rows since the last reset.
    /// Empty when no gradient has passed through.
    pub fn metrics(&self) -> Metrics {
        let record = self.record.lock().unwrap_or_else(|e| e.into_inner());
        let mut metrics = Metrics::new();
        if record.rms.is_empty() {
            return metrics;
        }
        let n = record.rms.len() as f32;
        let mean_rms = record.rms.iter().sum::<f32>() / n;
        let frac = record.clipped.iter().filter(|&&c| c).count() as f32 / n;
        metrics.insert(MetricKey::ActGradRms, Tensor::scalar(mean_rms));
        metrics.insert(MetricKey::ActGradClipFrac, Tensor::scalar(frac));
        metrics
    }

    pub fn reset(&self) {
        let mut record = self.record.lock().unwrap_or_else(|e| e.into_inner());
        record.rms.clear();
        record.clipped.clear();
    }
}

impl GradHook for ActGradClipper {
    fn on_grad(&self, grad: &mut [f32], rows: usize) {
        if rows == 0 || grad.is_empty() {
            return;
        }
        let width = grad.len() / rows;
        let mut rms_seen = Vec::with_capacity(rows);
        let mut clipped = Vec::with_capacity(rows);
        for row in grad.chunks_mut(width) {
            let rms = rms_f32(row);
            let scale = (self.max_rms / (rms + NORM_EPS)).min(1.0);
            if scale < 1.0 {
                row.iter_mut().for_each(|g| *g *= scale);
            }
            rms_seen.push(rms);
            clipped.push(scale < 1.0);
        }
        let mut record = self.record.lock().unwrap_or_else(|e| e.into_inner());
        record.rms.extend(rms_seen);
        record.clipped.extend(clipped);
    }
}

// ── Global gradient-norm clipper ──────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GradClipConfig {
    pub history_size: usize,
    /// Norms recorded before clipping starts.
    pub warmup: usize,
    pub max_stds: f32,
}

impl Default for GradClipConfig {
    fn default() -> Self {
        GradClipConfig { history_size: 30, warmup: 5, max_stds: 2.0 }
    }
}

impl GradClipConfig {
    pub fn validate(&self) -> Result<()> {
        if self.history_size == 0 || self.warmup > self.history_size {
            return Err(CellNetError::InvalidConfig(format!(
                "grad clip needs history_size > 0 and warmup ({}) <= history_size ({})",
                self.warmup, self.history_size
            )));
        }
        if self.max_stds.is_nan() || self.max_stds <= 0.0 {
            return Err(CellNetError::InvalidConfig(format!("grad clip max_stds must be > 0, got {}", self.max_stds)));
        }
        Ok(())
    }
}

/// Recent gradient norms, oldest first.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GradClipState {
    pub norms: Vec<f32>,
}

#[derive(Clone, Debug)]
pub struct GradClipper {
    pub config: GradClipConfig,
    norms: VecDeque<f32>,
}

impl GradClipper {
    pub fn new(config: GradClipConfig) -> Result<Self> {
        config.validate()?;
        Ok(GradClipper { norms: VecDeque::with_capacity(config.history_size), config })
    }

    /// Current clip threshold, or `None` during warmup.
    pub fn threshold(&self) -> Option<f32> {
        if self.norms.len() < self.config.warmup.max(1) {
            return None;
        }
        let n = self.norms.len() as f32;
        let mean = self.norms.iter().sum::<f32>() / n;
        let var = self.norms.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / n;
        Some(mean + self.config.max_stds * var.sqrt())
    }

    /// Clip the global gradient norm of `params` in place and record the
    /// pre-clip norm. Returns `(grad_norm, grad_scale)`.
    pub fn clip_grads(&mut self, params: &mut ParamSet) -> (f32, f32) {
        let norm = params.grad_norm();
        let scale = match self.threshold() {
            Some(limit) if norm > limit => limit / (norm + NORM_EPS),
            _ => 1.0,
        };
        if scale < 1.0 {
            debug!(norm, scale, "clipping gradient norm");
            params.scale_grads(scale);
        }
        if norm.is_finite() {
            self.norms.push_back(norm);
            while self.norms.len() > self.config.history_size {
                self.norms.pop_front();
            }
        }
        (norm, scale)
    }

    pub fn state(&self) -> GradClipState {
        GradClipState { norms: self.norms.iter().copied().collect() }
    }

    pub fn load_state(&mut self, state: GradClipState) {
        let skip = state.norms.len().saturating_sub(self.config.history_size);
        self.norms = state.norms.into_iter().skip(skip).collect();
    }
}
