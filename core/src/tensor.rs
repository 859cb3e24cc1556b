/// Minimal tensor utilities for the cell network.
///
/// All kernels are free functions on flat f32 slices with explicit dimensions.
/// Row-major layout throughout. The `Tensor` struct is only a host container
/// (data + shape) used at API boundaries and in checkpoints; the tape arena
/// stores the same pair internally.

use rand::Rng;
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Rows below this count are multiplied on the calling thread.
const PAR_MIN_ROWS: usize = 64;

/// Flat f32 tensor with shape metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub data: Vec<f32>,
    pub shape: Vec<usize>,
}

impl Tensor {
    pub fn zeros(shape: &[usize]) -> Self {
        let n: usize = shape.iter().product();
        Tensor {
            data: vec![0.0; n],
            shape: shape.to_vec(),
        }
    }

    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Self {
        assert_eq!(
            data.len(),
            shape.iter().product::<usize>(),
            "Tensor::from_vec: {} elements do not fit shape {:?}",
            data.len(),
            shape
        );
        Tensor { data, shape: shape.to_vec() }
    }

    pub fn scalar(value: f32) -> Self {
        Tensor { data: vec![value], shape: vec![] }
    }

    /// Standard normal samples with the given shape.
    pub fn randn<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> Self {
        let n: usize = shape.iter().product();
        let data = (0..n).map(|_| rng.sample::<f32, _>(StandardNormal)).collect();
        Tensor { data, shape: shape.to_vec() }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Mean of all elements (0 for an empty tensor).
    pub fn mean(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().sum::<f32>() / self.data.len() as f32
    }

    pub fn sum(&self) -> f32 {
        self.data.iter().sum()
    }

    /// Single value of a one-element tensor.
    pub fn item(&self) -> f32 {
        assert_eq!(self.numel(), 1, "Tensor::item on tensor of shape {:?}", self.shape);
        self.data[0]
    }

    /// Rows `[start, start+len)` along the leading axis.
    pub fn slice_rows(&self, start: usize, len: usize) -> Tensor {
        assert!(!self.shape.is_empty(), "slice_rows on a scalar");
        let row: usize = self.shape[1..].iter().product();
        assert!(start + len <= self.shape[0], "slice_rows: {start}+{len} > {}", self.shape[0]);
        let mut shape = self.shape.clone();
        shape[0] = len;
        Tensor { data: self.data[start * row..(start + len) * row].to_vec(), shape }
    }

    /// Tile the whole tensor `count` times along the leading axis.
    pub fn repeat_rows(&self, count: usize) -> Tensor {
        if count == 1 {
            return self.clone();
        }
        let mut shape = self.shape.clone();
        shape[0] *= count;
        let mut data = Vec::with_capacity(self.numel() * count);
        for _ in 0..count {
            data.extend_from_slice(&self.data);
        }
        Tensor { data, shape }
    }
}

// ── Free-function math ops on flat slices ────────────────────────────

/// Matrix multiply: C[M,N] = A[M,K] @ B[K,N].  Row-major.
/// `out` must be pre-allocated with M*N elements (will be overwritten).
pub fn matmul_f32(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(b.len(), k * n);
    debug_assert_eq!(out.len(), m * n);
    if n == 0 {
        return;
    }

    let row_kernel = |(i, row): (usize, &mut [f32])| {
        row.iter_mut().for_each(|v| *v = 0.0);
        for p in 0..k {
            let a_ip = a[i * k + p];
            if a_ip == 0.0 {
                continue;
            }
            let b_row = &b[p * n..(p + 1) * n];
            for (o, &bv) in row.iter_mut().zip(b_row) {
                *o += a_ip * bv;
            }
        }
    };

    if m >= PAR_MIN_ROWS {
        out.par_chunks_mut(n).enumerate().for_each(row_kernel);
    } else {
        out.chunks_mut(n).enumerate().for_each(row_kernel);
    }
}

/// Matrix multiply with accumulation: C[M,N] += A[M,K] @ B[K,N].
pub fn matmul_acc_f32(a: &[f32], b: &[f32], out: &mut [f32], m: usize, k: usize, n: usize) {
    let mut tmp = vec![0.0f32; m * n];
    matmul_f32(a, b, &mut tmp, m, k, n);
    for (o, t) in out.iter_mut().zip(tmp) {
        *o += t;
    }
}

/// Transpose A[M,K] → out[K,M].
pub fn transpose_f32(a: &[f32], out: &mut [f32], m: usize, k: usize) {
    debug_assert_eq!(a.len(), m * k);
    debug_assert_eq!(out.len(), k * m);

    for i in 0..m {
        for j in 0..k {
            out[j * m + i] = a[i * k + j];
        }
    }
}

/// Row-wise log-softmax of `rows` rows of length `cols`.
pub fn log_softmax_f32(x: &[f32], out: &mut [f32], rows: usize, cols: usize) {
    debug_assert_eq!(x.len(), rows * cols);
    debug_assert_eq!(out.len(), rows * cols);
    for r in 0..rows {
        let row = &x[r * cols..(r + 1) * cols];
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let lse = row.iter().map(|v| (v - max_val).exp()).sum::<f32>().ln() + max_val;
        for c in 0..cols {
            out[r * cols + c] = row[c] - lse;
        }
    }
}

/// Index of the largest value in each row.
pub fn argmax_rows(x: &[f32], rows: usize, cols: usize) -> Vec<usize> {
    (0..rows)
        .map(|r| {
            let row = &x[r * cols..(r + 1) * cols];
            let mut best = 0;
            for c in 1..cols {
                if row[c] > row[best] {
                    best = c;
                }
            }
            best
        })
        .collect()
}

/// Sigmoid: 1 / (1 + exp(-x)). Clamped to avoid overflow.
#[inline]
pub fn sigmoid_f32(x: f32) -> f32 {
    if x >= 15.0 { return 1.0; }
    if x <= -15.0 { return 0.0; }
    1.0 / (1.0 + (-x).exp())
}

const GELU_C: f32 = 0.797_884_6; // sqrt(2/pi)

/// GELU, tanh approximation.
#[inline]
pub fn gelu_f32(x: f32) -> f32 {
    0.5 * x * (1.0 + (GELU_C * (x + 0.044715 * x * x * x)).tanh())
}

/// Derivative of the tanh-approximated GELU.
#[inline]
pub fn gelu_prime_f32(x: f32) -> f32 {
    let inner = GELU_C * (x + 0.044715 * x * x * x);
    let t = inner.tanh();
    let d_inner = GELU_C * (1.0 + 3.0 * 0.044715 * x * x);
    0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * d_inner
}

/// L2 norm of a vector: sqrt(sum(a[i]^2)).
pub fn vec_norm_f32(a: &[f32]) -> f32 {
    a.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Root mean square of a vector (0 for an empty slice).
pub fn rms_f32(a: &[f32]) -> f32 {
    if a.is_empty() {
        return 0.0;
    }
    (a.iter().map(|x| x * x).sum::<f32>() / a.len() as f32).sqrt()
}

/// Frobenius dot product: sum_ij A[i,j] * B[i,j].
pub fn frobenius_dot_f32(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
