//! Training metrics: symbolic keys mapped to host tensors.
//!
//! Values computed on a recording tape also remember their `BufId`, so the
//! backprop estimator can differentiate the loss it was handed. `detach()`
//! drops those handles once the tape is gone.

use std::collections::HashMap;
use std::fmt;

use crate::error::{CellNetError, Result};
use crate::tape::BufId;
use crate::tensor::Tensor;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricKey {
    Loss,
    Accuracy,
    LastLoss,
    LastAccuracy,
    GradNorm,
    GradScale,
    EsDelta,
    ActGradClipFrac,
    ActGradRms,
    Named(String),
}

impl MetricKey {
    /// Stable key used in log lines.
    pub fn log_key(&self) -> &str {
        match self {
            MetricKey::Loss => "loss",
            MetricKey::Accuracy => "acc",
            MetricKey::LastLoss => "last_loss",
            MetricKey::LastAccuracy => "last_acc",
            MetricKey::GradNorm => "grad_norm",
            MetricKey::GradScale => "grad_scale",
            MetricKey::EsDelta => "es_delta",
            MetricKey::ActGradClipFrac => "act_grad_clip_frac",
            MetricKey::ActGradRms => "act_grad_rms",
            MetricKey::Named(name) => name,
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.log_key())
    }
}

#[derive(Clone, Debug, Default)]
pub struct Metrics {
    values: HashMap<MetricKey, Tensor>,
    handles: HashMap<MetricKey, BufId>,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn insert(&mut self, key: MetricKey, value: Tensor) {
        self.handles.remove(&key);
        self.values.insert(key, value);
    }

    /// Insert a value that also lives on a recording tape.
    pub fn insert_traced(&mut self, key: MetricKey, value: Tensor, handle: BufId) {
        self.handles.insert(key.clone(), handle);
        self.values.insert(key, value);
    }

    pub fn get(&self, key: &MetricKey) -> Option<&Tensor> {
        self.values.get(key)
    }

    /// Mean of the value, for logging and estimator deltas.
    pub fn scalar(&self, key: &MetricKey) -> Option<f32> {
        self.values.get(key).map(Tensor::mean)
    }

    pub fn handle(&self, key: &MetricKey) -> Option<BufId> {
        self.handles.get(key).copied()
    }

    pub fn contains(&self, key: &MetricKey) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &MetricKey> {
        self.values.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetricKey, &Tensor)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn detach(mut self) -> Metrics {
        self.handles.clear();
        self
    }

    /// Error naming `key` and the keys that are present.
    pub fn missing(&self, key: &MetricKey) -> CellNetError {
        let mut available: Vec<&str> = self.values.keys().map(MetricKey::log_key).collect();
        available.sort_unstable();
        CellNetError::MissingMetric { key: key.log_key().to_string(), available: available.join(", ") }
    }

    /// Merge `other` into `self`; keys must be disjoint.
    pub fn extend(&mut self, other: Metrics) -> Result<()> {
        if let Some(dup) = other.values.keys().find(|k| self.values.contains_key(k)) {
            return Err(CellNetError::DuplicateMetric(dup.log_key().to_string()));
        }
        self.values.extend(other.values);
        self.handles.extend(other.handles);
        Ok(())
    }

    /// Per key, the mean over every element of every shard holding that key.
    pub fn mean_of(shards: &[Metrics]) -> Metrics {
        Self::reduce(shards, |all| all.iter().sum::<f32>() / all.len().max(1) as f32)
    }

    /// Per key, the sum over every element of every shard holding that key.
    pub fn sum_of(shards: &[Metrics]) -> Metrics {
        Self::reduce(shards, |all| all.iter().sum())
    }

    fn reduce(shards: &[Metrics], f: impl Fn(&[f32]) -> f32) -> Metrics {
        let mut gathered: HashMap<MetricKey, Vec<f32>> = HashMap::new();
        for shard in shards {
            for (k, v) in &shard.values {
                gathered.entry(k.clone()).or_default().extend_from_slice(&v.data);
            }
        }
        let mut out = Metrics::new();
        for (k, all) in gathered {
            out.insert(k, Tensor::scalar(f(&all)));
        }
        out
    }

    /// Every value reduced to its scalar mean; handles are dropped.
    pub fn means(&self) -> Metrics {
        let mut out = Metrics::new();
        for (k, v) in &self.values {
            out.insert(k.clone(), Tensor::scalar(v.mean()));
        }
        out
    }

    /// `key=value` fields sorted lexicographically, space separated.
    pub fn format(&self) -> String {
        let mut fields: Vec<String> = self
            .values
            .iter()
            .map(|(k, v)| format!("{}={}", k.log_key(), v.mean()))
            .collect();
        fields.sort();
        fields.join(" ")
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_sorted() {
        let mut m = Metrics::new();
        m.insert(MetricKey::Loss, Tensor::scalar(0.5));
        m.insert(MetricKey::Accuracy, Tensor::scalar(1.0));
        m.insert(MetricKey::Named("zeta".into()), Tensor::scalar(2.0));
        assert_eq!(m.format(), "acc=1 loss=0.5 zeta=2");
    }

    #[test]
    fn test_extend_rejects_duplicates() {
        let mut a = Metrics::new();
        a.insert(MetricKey::Loss, Tensor::scalar(1.0));
        let mut b = Metrics::new();
        b.insert(MetricKey::Loss, Tensor::scalar(2.0));
        assert!(matches!(a.extend(b), Err(CellNetError::DuplicateMetric(_))));

        let mut c = Metrics::new();
        c.insert(MetricKey::EsDelta, Tensor::scalar(3.0));
        a.extend(c).unwrap();
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_mean_and_sum_over_shards() {
        let mut a = Metrics::new();
        a.insert(MetricKey::Loss, Tensor::scalar(1.0));
        a.insert(MetricKey::Accuracy, Tensor::scalar(0.25));
        let mut b = Metrics::new();
        b.insert(MetricKey::Loss, Tensor::scalar(3.0));
        let mean = Metrics::mean_of(&[a.clone(), b.clone()]);
        assert_eq!(mean.scalar(&MetricKey::Loss), Some(2.0));
        assert_eq!(mean.scalar(&MetricKey::Accuracy), Some(0.25));
        let sum = Metrics::sum_of(&[a, b]);
        assert_eq!(sum.scalar(&MetricKey::Loss), Some(4.0));
    }

    #[test]
    fn test_detach_drops_handles() {
        let mut m = Metrics::new();
        m.insert_traced(MetricKey::Loss, Tensor::scalar(1.0), 7);
        assert_eq!(m.handle(&MetricKey::Loss), Some(7));
        let m = m.detach();
        assert_eq!(m.handle(&MetricKey::Loss), None);
        assert!(m.contains(&MetricKey::Loss));
    }

    #[test]
    fn test_missing_lists_available() {
        let mut m = Metrics::new();
        m.insert(MetricKey::Accuracy, Tensor::scalar(1.0));
        let err = m.missing(&MetricKey::Loss).to_string();
        assert!(err.contains("`loss`"), "{err}");
        assert!(err.contains("acc"), "{err}");
    }
}
