//! Named parameter collection shared by the cell, the estimators and the
//! optimizer.
//!
//! Entries keep insertion order, so the flattened parameter space (used by
//! finite differences and by externally supplied population strategies) has
//! a stable axis layout. Entries without a value are skipped everywhere.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CellNetError, Result};
use crate::tensor::Tensor;

/// One trainable tensor plus its gradient accumulator.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Param {
    pub value: Option<Tensor>,
    #[serde(skip)]
    pub grad: Option<Tensor>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ParamSet {
    entries: Vec<(String, Param)>,
}

impl ParamSet {
    pub fn new() -> Self {
        ParamSet::default()
    }

    /// Insert or replace a parameter value; clears any stale gradient.
    pub fn insert(&mut self, name: impl Into<String>, value: Tensor) {
        let name = name.into();
        let param = Param { value: Some(value), grad: None };
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some((_, p)) => *p = param,
            None => self.entries.push((name, param)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Param> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Param> {
        self.entries.iter_mut().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    /// Value of a parameter that must exist and carry data.
    pub fn value(&self, name: &str) -> Result<&Tensor> {
        self.get(name)
            .and_then(|p| p.value.as_ref())
            .ok_or_else(|| CellNetError::UnknownParam(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in insertion order, including those without data.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Param)> {
        self.entries.iter().map(|(n, p)| (n.as_str(), p))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Param)> {
        self.entries.iter_mut().map(|(n, p)| (n.as_str(), p))
    }

    /// Entries that carry data, in insertion order.
    pub fn values(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.entries.iter().filter_map(|(n, p)| p.value.as_ref().map(|v| (n.as_str(), v)))
    }

    /// Total number of scalar coordinates across entries with data.
    pub fn axis_count(&self) -> usize {
        self.values().map(|(_, v)| v.numel()).sum()
    }

    /// Concatenate every value into one flat vector.
    pub fn flatten(&self) -> Vec<f32> {
        let mut flat = Vec::with_capacity(self.axis_count());
        for (_, v) in self.values() {
            flat.extend_from_slice(&v.data);
        }
        flat
    }

    /// Overwrite every value from a flat vector laid out as `flatten` does.
    pub fn unflatten(&mut self, flat: &[f32]) -> Result<()> {
        let expected = self.axis_count();
        if flat.len() != expected {
            return Err(CellNetError::ShapeMismatch {
                label: "flat parameters".into(),
                expected: vec![expected],
                got: vec![flat.len()],
            });
        }
        let mut offset = 0;
        for (_, p) in self.entries.iter_mut() {
            if let Some(v) = p.value.as_mut() {
                let n = v.numel();
                v.data.copy_from_slice(&flat[offset..offset + n]);
                offset += n;
            }
        }
        Ok(())
    }

    pub fn clear_grads(&mut self) {
        for (_, p) in self.entries.iter_mut() {
            p.grad = None;
        }
    }

    /// Add `grad` into the named accumulator, creating it on first use.
    pub fn accumulate_grad(&mut self, name: &str, grad: &Tensor) -> Result<()> {
        let param = self
            .get_mut(name)
            .ok_or_else(|| CellNetError::UnknownParam(name.to_string()))?;
        let Some(value) = param.value.as_ref() else {
            return Err(CellNetError::UnknownParam(name.to_string()));
        };
        if value.shape != grad.shape {
            return Err(CellNetError::ShapeMismatch {
                label: format!("gradient of {name}"),
                expected: value.shape.clone(),
                got: grad.shape.clone(),
            });
        }
        match param.grad.as_mut() {
            Some(acc) => {
                for (a, g) in acc.data.iter_mut().zip(&grad.data) {
                    *a += g;
                }
            }
            None => param.grad = Some(grad.clone()),
        }
        Ok(())
    }

    /// Add a gradient expressed in the flattened parameter space.
    pub fn accumulate_flat_grad(&mut self, flat: &[f32]) -> Result<()> {
        let expected = self.axis_count();
        if flat.len() != expected {
            return Err(CellNetError::ShapeMismatch {
                label: "flat gradient".into(),
                expected: vec![expected],
                got: vec![flat.len()],
            });
        }
        let mut offset = 0;
        let names: Vec<(String, Vec<usize>)> = self
            .values()
            .map(|(n, v)| (n.to_string(), v.shape.clone()))
            .collect();
        for (name, shape) in names {
            let n: usize = shape.iter().product();
            let g = Tensor::from_vec(flat[offset..offset + n].to_vec(), &shape);
            self.accumulate_grad(&name, &g)?;
            offset += n;
        }
        Ok(())
    }

    /// Global L2 norm over all present gradients.
    pub fn grad_norm(&self) -> f32 {
        self.entries
            .iter()
            .filter_map(|(_, p)| p.grad.as_ref())
            .map(|g| g.data.iter().map(|x| x * x).sum::<f32>())
            .sum::<f32>()
            .sqrt()
    }

    pub fn scale_grads(&mut self, scale: f32) {
        for (_, p) in self.entries.iter_mut() {
            if let Some(g) = p.grad.as_mut() {
                g.data.iter_mut().for_each(|x| *x *= scale);
            }
        }
    }

    /// Replace values from a snapshot with identical names and shapes.
    pub fn load_values(&mut self, snapshot: &ParamSet) -> Result<()> {
        for (name, p) in self.entries.iter_mut() {
            let Some(value) = p.value.as_mut() else { continue };
            let loaded = snapshot.value(name)?;
            if loaded.shape != value.shape {
                return Err(CellNetError::ShapeMismatch {
                    label: name.clone(),
                    expected: value.shape.clone(),
                    got: loaded.shape.clone(),
                });
            }
            value.data.clone_from(&loaded.data);
            p.grad = None;
        }
        Ok(())
    }
}

/// A batch of `count` alternate values per parameter, stacked on a new
/// leading axis: each entry has shape `[count, ...param shape]`.
#[derive(Clone, Debug)]
pub struct ParamOverride {
    count: usize,
    tensors: HashMap<String, Tensor>,
}

impl ParamOverride {
    /// Stack flat variants (each laid out as `ParamSet::flatten`).
    pub fn from_variants(params: &ParamSet, variants: &[Vec<f32>]) -> Result<Self> {
        let axis_count = params.axis_count();
        let mut flat = Vec::with_capacity(variants.len() * axis_count);
        for v in variants {
            if v.len() != axis_count {
                return Err(CellNetError::ShapeMismatch {
                    label: "parameter variant".into(),
                    expected: vec![axis_count],
                    got: vec![v.len()],
                });
            }
            flat.extend_from_slice(v);
        }
        Self::from_flat_batch(params, &Tensor::from_vec(flat, &[variants.len(), axis_count]))
    }

    /// Split a `[count, axisCount]` batch into per-parameter stacks.
    pub fn from_flat_batch(params: &ParamSet, batch: &Tensor) -> Result<Self> {
        let axis_count = params.axis_count();
        if batch.ndim() != 2 || batch.shape[1] != axis_count || batch.shape[0] == 0 {
            return Err(CellNetError::ShapeMismatch {
                label: "flat parameter batch".into(),
                expected: vec![batch.shape.first().copied().unwrap_or(0).max(1), axis_count],
                got: batch.shape.clone(),
            });
        }
        let count = batch.shape[0];
        let mut tensors = HashMap::new();
        let mut offset = 0;
        for (name, v) in params.values() {
            let n = v.numel();
            let mut data = Vec::with_capacity(count * n);
            for row in batch.data.chunks(axis_count) {
                data.extend_from_slice(&row[offset..offset + n]);
            }
            let mut shape = vec![count];
            shape.extend_from_slice(&v.shape);
            tensors.insert(name.to_string(), Tensor::from_vec(data, &shape));
            offset += n;
        }
        Ok(ParamOverride { count, tensors })
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }
}

/// Flat `center + scale * direction`.
pub fn offset_flat(center: &[f32], direction: &[f32], scale: f32) -> Vec<f32> {
    debug_assert_eq!(center.len(), direction.len());
    center.iter().zip(direction).map(|(c, d)| c + scale * d).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ParamSet {
        let mut ps = ParamSet::new();
        ps.insert("a.weight", Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]));
        ps.insert("b.weight", Tensor::from_vec(vec![5.0, 6.0], &[1, 2]));
        ps
    }

    #[test]
    fn test_flatten_unflatten_order() {
        let mut ps = sample();
        assert_eq!(ps.axis_count(), 6);
        assert_eq!(ps.flatten(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        ps.unflatten(&[0.0, 0.0, 0.0, 0.0, 7.0, 8.0]).unwrap();
        assert_eq!(ps.value("b.weight").unwrap().data, vec![7.0, 8.0]);
        assert!(ps.unflatten(&[0.0]).is_err());
    }

    #[test]
    fn test_entries_without_value_are_skipped() {
        let mut ps = sample();
        ps.entries.push(("empty".into(), Param::default()));
        assert_eq!(ps.axis_count(), 6);
        assert_eq!(ps.values().count(), 2);
        assert!(ps.value("empty").is_err());
    }

    #[test]
    fn test_accumulate_and_norm() {
        let mut ps = sample();
        ps.accumulate_grad("b.weight", &Tensor::from_vec(vec![3.0, 0.0], &[1, 2])).unwrap();
        ps.accumulate_grad("b.weight", &Tensor::from_vec(vec![0.0, 4.0], &[1, 2])).unwrap();
        assert!((ps.grad_norm() - 5.0).abs() < 1e-6);
        ps.scale_grads(0.5);
        assert!((ps.grad_norm() - 2.5).abs() < 1e-6);
        ps.clear_grads();
        assert_eq!(ps.grad_norm(), 0.0);
    }

    #[test]
    fn test_accumulate_rejects_bad_shape() {
        let mut ps = sample();
        let err = ps.accumulate_grad("a.weight", &Tensor::zeros(&[4]));
        assert!(matches!(err, Err(CellNetError::ShapeMismatch { .. })));
        let err = ps.accumulate_grad("missing", &Tensor::zeros(&[4]));
        assert!(matches!(err, Err(CellNetError::UnknownParam(_))));
    }

    #[test]
    fn test_flat_grad_distributes() {
        let mut ps = sample();
        ps.accumulate_flat_grad(&[1.0, 0.0, 0.0, 0.0, 0.0, 2.0]).unwrap();
        assert_eq!(ps.get("a.weight").unwrap().grad.as_ref().unwrap().data, vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(ps.get("b.weight").unwrap().grad.as_ref().unwrap().data, vec![0.0, 2.0]);
    }

    #[test]
    fn test_override_from_variants() {
        let ps = sample();
        let center = ps.flatten();
        let dir = vec![1.0; 6];
        let ov = ParamOverride::from_variants(
            &ps,
            &[offset_flat(&center, &dir, 1.0), offset_flat(&center, &dir, -1.0)],
        ).unwrap();
        assert_eq!(ov.count(), 2);
        let b = ov.get("b.weight").unwrap();
        assert_eq!(b.shape, vec![2, 1, 2]);
        assert_eq!(b.data, vec![6.0, 7.0, 4.0, 5.0]);
    }
}
