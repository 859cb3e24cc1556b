//! Random wiring between node output slots and next-step input slots.
//!
//! A graph is pure index data: one permutation of `[0, act_count)` per batch
//! row. Slot `cell * act_per_cell + e` is channel `e` of node `cell`, and a
//! permutation only ever maps channel `e` to channel `e` of another node.

use std::borrow::Cow;

use rand::seq::SliceRandom;
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CellNetError, Result};
use crate::tape::{BufId, Tape};
use crate::tensor::Tensor;
use crate::traced;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphKind {
    /// Independent uniform permutation of the nodes per channel.
    #[default]
    Permutation,
    /// Greedy nearest-unclaimed-neighbor wiring in a random Euclidean embedding.
    Spatial,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    pub cell_count: usize,
    pub act_per_cell: usize,
    pub in_count: usize,
    pub out_count: usize,
    pub kind: GraphKind,
    /// Embedding dimension for `GraphKind::Spatial`.
    pub space_dims: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        GraphConfig {
            cell_count: 16,
            act_per_cell: 8,
            in_count: 4,
            out_count: 2,
            kind: GraphKind::Permutation,
            space_dims: 3,
        }
    }
}

impl GraphConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cell_count < self.in_count + self.out_count {
            return Err(CellNetError::GraphTopology {
                cell_count: self.cell_count,
                in_count: self.in_count,
                out_count: self.out_count,
            });
        }
        if self.act_per_cell == 0 {
            return Err(CellNetError::InvalidConfig("act_per_cell must be > 0".into()));
        }
        if self.kind == GraphKind::Spatial && self.space_dims == 0 {
            return Err(CellNetError::InvalidConfig("space_dims must be > 0 for spatial graphs".into()));
        }
        Ok(())
    }

    pub fn act_count(&self) -> usize {
        self.cell_count * self.act_per_cell
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Graph {
    cell_count: usize,
    act_per_cell: usize,
    in_count: usize,
    out_count: usize,
    batch_size: usize,
    /// Row-major `[batch_size, act_count]`.
    perm: Vec<usize>,
}

impl Graph {
    /// Fresh random wiring for `batch_size` rows. Topology is checked before
    /// any sampling.
    pub fn random<R: Rng + ?Sized>(batch_size: usize, config: &GraphConfig, rng: &mut R) -> Result<Graph> {
        config.validate()?;
        if batch_size == 0 {
            return Err(CellNetError::InvalidConfig("graph batch size must be > 0".into()));
        }
        let perm = match config.kind {
            GraphKind::Permutation => random_permutation(batch_size, config, rng),
            GraphKind::Spatial => random_spatial(batch_size, config, rng),
        };
        Ok(Graph {
            cell_count: config.cell_count,
            act_per_cell: config.act_per_cell,
            in_count: config.in_count,
            out_count: config.out_count,
            batch_size,
            perm,
        })
    }

    /// Wrap an explicit `[batch_size, act_count]` permutation.
    pub fn from_perm(config: &GraphConfig, batch_size: usize, perm: Vec<usize>) -> Result<Graph> {
        config.validate()?;
        if perm.len() != batch_size * config.act_count() {
            return Err(CellNetError::ShapeMismatch {
                label: "graph permutation".into(),
                expected: vec![batch_size, config.act_count()],
                got: vec![perm.len()],
            });
        }
        let graph = Graph {
            cell_count: config.cell_count,
            act_per_cell: config.act_per_cell,
            in_count: config.in_count,
            out_count: config.out_count,
            batch_size,
            perm,
        };
        if !graph.is_bijection() {
            return Err(CellNetError::InvalidConfig("graph permutation is not a bijection".into()));
        }
        Ok(graph)
    }

    pub fn cell_count(&self) -> usize {
        self.cell_count
    }

    pub fn act_per_cell(&self) -> usize {
        self.act_per_cell
    }

    pub fn act_count(&self) -> usize {
        self.cell_count * self.act_per_cell
    }

    pub fn in_count(&self) -> usize {
        self.in_count
    }

    pub fn out_count(&self) -> usize {
        self.out_count
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn perm(&self) -> &[usize] {
        &self.perm
    }

    pub fn perm_row(&self, row: usize) -> &[usize] {
        let n = self.act_count();
        &self.perm[row * n..(row + 1) * n]
    }

    /// True if every row is a permutation of `[0, act_count)`.
    pub fn is_bijection(&self) -> bool {
        let n = self.act_count();
        (0..self.batch_size).all(|b| {
            let mut seen = vec![false; n];
            self.perm_row(b).iter().all(|&i| i < n && !std::mem::replace(&mut seen[i], true))
        })
    }

    /// The same wiring tiled `count` times along the batch axis (variant-major).
    pub fn repeated(&self, count: usize) -> Cow<'_, Graph> {
        if count == 1 {
            return Cow::Borrowed(self);
        }
        let mut perm = Vec::with_capacity(self.perm.len() * count);
        for _ in 0..count {
            perm.extend_from_slice(&self.perm);
        }
        Cow::Owned(Graph { batch_size: self.batch_size * count, perm, ..self.clone() })
    }

    /// Columns `[in_count, in_count + out_count)` of per-node outputs
    /// `[batch, cell_count]`.
    pub fn gather_outputs(&self, tape: &mut Tape, outputs: BufId) -> BufId {
        traced::traced_slice_cols(tape, outputs, self.batch_size, self.in_count, self.out_count)
    }

    /// Rewire: next-step input slot `i` of row `b` reads output slot `perm[b, i]`.
    pub fn step_out_to_step_in(&self, tape: &mut Tape, activations: BufId) -> BufId {
        traced::traced_gather(tape, activations, self.batch_size, &self.perm)
    }

    /// Per-node input channel: `inputs` `[batch, in_count]` followed by zeros.
    pub fn populate_inputs(&self, inputs: &Tensor) -> Tensor {
        self.place_columns(inputs, 0, self.in_count)
    }

    /// Per-node target channel: zeros, `targets` `[batch, out_count]` on the
    /// output nodes, then zeros.
    pub fn populate_targets(&self, targets: &Tensor) -> Tensor {
        self.place_columns(targets, self.in_count, self.out_count)
    }

    fn place_columns(&self, values: &Tensor, start: usize, width: usize) -> Tensor {
        assert_eq!(values.numel(), self.batch_size * width,
                   "expected [{}, {width}] values, got {:?}", self.batch_size, values.shape);
        let n = self.cell_count;
        let mut data = vec![0.0f32; self.batch_size * n];
        for b in 0..self.batch_size {
            data[b * n + start..b * n + start + width]
                .copy_from_slice(&values.data[b * width..(b + 1) * width]);
        }
        Tensor::from_vec(data, &[self.batch_size, n])
    }
}

fn random_permutation<R: Rng + ?Sized>(batch_size: usize, config: &GraphConfig, rng: &mut R) -> Vec<usize> {
    let (n, e) = (config.cell_count, config.act_per_cell);
    let mut perm = vec![0usize; batch_size * n * e];
    let mut order: Vec<usize> = (0..n).collect();
    for b in 0..batch_size {
        let row = &mut perm[b * n * e..(b + 1) * n * e];
        for ch in 0..e {
            order.shuffle(rng);
            for (cell, &src) in order.iter().enumerate() {
                row[cell * e + ch] = src * e + ch;
            }
        }
    }
    perm
}

fn random_spatial<R: Rng + ?Sized>(batch_size: usize, config: &GraphConfig, rng: &mut R) -> Vec<usize> {
    let (n, e, dims) = (config.cell_count, config.act_per_cell, config.space_dims);
    let mut perm = vec![0usize; batch_size * n * e];
    for b in 0..batch_size {
        let coords: Vec<f32> = (0..n * dims).map(|_| rng.sample::<f32, _>(StandardNormal)).collect();
        let neighbors: Vec<Vec<usize>> = (0..n)
            .map(|i| {
                let dist = |j: usize| -> f32 {
                    (0..dims).map(|d| (coords[i * dims + d] - coords[j * dims + d]).powi(2)).sum()
                };
                let mut order: Vec<usize> = (0..n).filter(|&j| j != i).collect();
                order.sort_by(|&x, &y| dist(x).total_cmp(&dist(y)));
                order
            })
            .collect();

        let row = &mut perm[b * n * e..(b + 1) * n * e];
        let mut visit: Vec<usize> = (0..n).collect();
        for ch in 0..e {
            let mut has_input = vec![false; n];
            visit.shuffle(rng);
            for &cell in &visit {
                let src = match neighbors[cell].iter().find(|&&j| !has_input[j]) {
                    Some(&j) => j,
                    None => {
                        // Only the last visited cell can run out, and the one
                        // unclaimed node left is itself.
                        debug!(row = b, channel = ch, cell, "spatial wiring exhausted neighbors; self-loop");
                        cell
                    }
                };
                row[cell * e + ch] = src * e + ch;
                has_input[src] = true;
            }
        }
    }
    perm
}
