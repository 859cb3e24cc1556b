/// Traced op wrappers: tape-aware computation that records ops for backward.
///
/// Each wrapper:
///   1. Reads inputs from the tape arena
///   2. Calls the flat-slice kernel from `tensor`
///   3. Allocates the output in the arena and records the TapeOp
///   4. Returns the output BufId
///
/// On a no-grad tape step 3 only allocates, so the same code path serves
/// exact backprop and zeroth-order evaluation.

use std::sync::Arc;

use crate::tape::{BufId, GradHook, HookRef, Tape, TapeOp};
use crate::tensor;

fn same_shape(tape: &Tape, a: BufId, b: BufId, op: &str) -> Vec<usize> {
    assert_eq!(tape.buf_numel(a), tape.buf_numel(b),
               "{op}: operand sizes differ ({:?} vs {:?})", tape.buf_shape(a), tape.buf_shape(b));
    tape.buf_shape(a).to_vec()
}

/// out = X @ W. X: [rows, k]. W: [k, n] (shared) or [groups, k, n]
/// (row block g uses W[g]). Output shape [rows, n].
pub fn traced_matmul(tape: &mut Tape, x: BufId, w: BufId) -> BufId {
    let w_shape = tape.buf_shape(w).to_vec();
    let (groups, k, n) = match w_shape.as_slice() {
        [k, n] => (1, *k, *n),
        [g, k, n] => (*g, *k, *n),
        other => panic!("traced_matmul: weight must be rank 2 or 3, got {other:?}"),
    };
    let x_numel = tape.buf_numel(x);
    assert_eq!(x_numel % k, 0, "traced_matmul: input of {x_numel} elements is not [rows, {k}]");
    let rows = x_numel / k;
    assert_eq!(rows % groups, 0, "traced_matmul: {rows} rows do not split into {groups} groups");
    let m = rows / groups;

    let mut out = vec![0.0f32; rows * n];
    {
        let x_data = tape.buf_data(x);
        let w_data = tape.buf_data(w);
        for g in 0..groups {
            tensor::matmul_f32(
                &x_data[g * m * k..(g + 1) * m * k],
                &w_data[g * k * n..(g + 1) * k * n],
                &mut out[g * m * n..(g + 1) * m * n],
                m, k, n,
            );
        }
    }
    tape.record_with_output(out, vec![rows, n], |out_id| {
        TapeOp::Matmul { x, w, out: out_id, groups, rows, k, n }
    })
}

/// Element-wise add: out = a + b.
pub fn traced_add(tape: &mut Tape, a: BufId, b: BufId) -> BufId {
    let shape = same_shape(tape, a, b, "traced_add");
    let out: Vec<f32> = tape.buf_data(a).iter().zip(tape.buf_data(b)).map(|(x, y)| x + y).collect();
    tape.record_with_output(out, shape, |out_id| TapeOp::Add { a, b, out: out_id })
}

/// Element-wise subtract: out = a - b.
pub fn traced_sub(tape: &mut Tape, a: BufId, b: BufId) -> BufId {
    let shape = same_shape(tape, a, b, "traced_sub");
    let out: Vec<f32> = tape.buf_data(a).iter().zip(tape.buf_data(b)).map(|(x, y)| x - y).collect();
    tape.record_with_output(out, shape, |out_id| TapeOp::Sub { a, b, out: out_id })
}

/// Element-wise multiply: out = a * b.
pub fn traced_mul(tape: &mut Tape, a: BufId, b: BufId) -> BufId {
    let shape = same_shape(tape, a, b, "traced_mul");
    let out: Vec<f32> = tape.buf_data(a).iter().zip(tape.buf_data(b)).map(|(x, y)| x * y).collect();
    tape.record_with_output(out, shape, |out_id| TapeOp::Mul { a, b, out: out_id })
}

/// out = scalar * input.
pub fn traced_scale(tape: &mut Tape, input: BufId, scalar: f32) -> BufId {
    let out: Vec<f32> = tape.buf_data(input).iter().map(|x| x * scalar).collect();
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Scale { input, scalar, out: out_id })
}

/// out = -input.
pub fn traced_negate(tape: &mut Tape, input: BufId) -> BufId {
    let out: Vec<f32> = tape.buf_data(input).iter().map(|x| -x).collect();
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Negate { input, out: out_id })
}

/// out[r, c] = input[r, c] + row[c]. The row receives no gradient.
pub fn traced_add_row(tape: &mut Tape, input: BufId, row: &[f32]) -> BufId {
    let cols = row.len();
    assert_eq!(tape.buf_numel(input) % cols, 0, "traced_add_row: row length {cols} does not divide input");
    let out: Vec<f32> = tape.buf_data(input).iter().enumerate().map(|(i, x)| x + row[i % cols]).collect();
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::AddRow { input, row: row.to_vec(), out: out_id })
}

/// Element-wise sigmoid: out = sigmoid(input).
pub fn traced_sigmoid(tape: &mut Tape, input: BufId) -> BufId {
    let out: Vec<f32> = tape.buf_data(input).iter().map(|&x| tensor::sigmoid_f32(x)).collect();
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Sigmoid { input, out: out_id })
}

/// Element-wise tanh.
pub fn traced_tanh(tape: &mut Tape, input: BufId) -> BufId {
    let out: Vec<f32> = tape.buf_data(input).iter().map(|x| x.tanh()).collect();
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Tanh { input, out: out_id })
}

/// Element-wise GELU (tanh approximation).
pub fn traced_gelu(tape: &mut Tape, input: BufId) -> BufId {
    let out: Vec<f32> = tape.buf_data(input).iter().map(|&x| tensor::gelu_f32(x)).collect();
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| TapeOp::Gelu { input, out: out_id })
}

/// RMS normalization of every length-`len` fiber of input viewed as
/// [outer, len, inner].
pub fn traced_rms_norm(tape: &mut Tape, input: BufId, outer: usize, len: usize, inner: usize, eps: f32) -> BufId {
    assert_eq!(tape.buf_numel(input), outer * len * inner,
               "traced_rms_norm: {:?} is not [{outer}, {len}, {inner}]", tape.buf_shape(input));
    let x = tape.buf_data(input);
    let mut out = vec![0.0f32; x.len()];
    for o in 0..outer {
        for i in 0..inner {
            let at = |j: usize| o * len * inner + j * inner + i;
            let ms = (0..len).map(|j| x[at(j)] * x[at(j)]).sum::<f32>() / len as f32;
            let inv = 1.0 / (ms + eps).sqrt();
            for j in 0..len {
                out[at(j)] = x[at(j)] * inv;
            }
        }
    }
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| {
        TapeOp::RmsNorm { input, out: out_id, outer, len, inner, eps }
    })
}

/// Columns `start..start+len` of input viewed as [rows, cols].
pub fn traced_slice_cols(tape: &mut Tape, input: BufId, rows: usize, start: usize, len: usize) -> BufId {
    let numel = tape.buf_numel(input);
    assert_eq!(numel % rows, 0, "traced_slice_cols: {numel} elements do not split into {rows} rows");
    let cols = numel / rows;
    assert!(start + len <= cols, "traced_slice_cols: {start}+{len} > {cols} columns");
    let data = tape.buf_data(input);
    let mut out = Vec::with_capacity(rows * len);
    for r in 0..rows {
        out.extend_from_slice(&data[r * cols + start..r * cols + start + len]);
    }
    tape.record_with_output(out, vec![rows, len], |out_id| {
        TapeOp::SliceCols { input, out: out_id, rows, cols, start, len }
    })
}

/// Concatenate inputs along the last axis; every input is viewed as [rows, *].
pub fn traced_concat_cols(tape: &mut Tape, inputs: &[BufId], rows: usize) -> BufId {
    let widths: Vec<usize> = inputs.iter().map(|&id| tape.buf_numel(id) / rows).collect();
    let total: usize = widths.iter().sum();
    let mut out = Vec::with_capacity(rows * total);
    for r in 0..rows {
        for (&id, &w) in inputs.iter().zip(&widths) {
            out.extend_from_slice(&tape.buf_data(id)[r * w..(r + 1) * w]);
        }
    }
    tape.record_with_output(out, vec![rows, total], |out_id| {
        TapeOp::ConcatCols { inputs: inputs.to_vec(), widths, out: out_id, rows }
    })
}

/// out[r, c] = input[r, indices[r*cols + c]] with input viewed as [rows, cols].
/// Output keeps the input's shape.
pub fn traced_gather(tape: &mut Tape, input: BufId, rows: usize, indices: &[usize]) -> BufId {
    let numel = tape.buf_numel(input);
    assert_eq!(indices.len(), numel, "traced_gather: {} indices for {numel} elements", indices.len());
    let cols = numel / rows;
    let data = tape.buf_data(input);
    let out: Vec<f32> = indices.iter().enumerate().map(|(i, &j)| data[(i / cols) * cols + j]).collect();
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, shape, |out_id| {
        TapeOp::Gather { input, out: out_id, rows, cols, indices: indices.to_vec() }
    })
}

/// Mean of each of `groups` contiguous blocks. Output shape [groups].
pub fn traced_group_mean(tape: &mut Tape, input: BufId, groups: usize) -> BufId {
    let numel = tape.buf_numel(input);
    assert!(groups > 0 && numel % groups == 0,
            "traced_group_mean: {numel} elements do not split into {groups} groups");
    let block = numel / groups;
    let out: Vec<f32> = tape.buf_data(input)
        .chunks(block)
        .map(|c| c.iter().sum::<f32>() / block as f32)
        .collect();
    tape.record_with_output(out, vec![groups], |out_id| TapeOp::GroupMean { input, out: out_id, groups })
}

/// Per-row cross entropy of logits [rows, cols] against class indices.
/// Output shape [rows].
pub fn traced_cross_entropy_rows(tape: &mut Tape, logits: BufId, targets: &[usize]) -> BufId {
    let rows = targets.len();
    let cols = tape.buf_numel(logits) / rows;
    let mut log_p = vec![0.0f32; rows * cols];
    tensor::log_softmax_f32(tape.buf_data(logits), &mut log_p, rows, cols);
    let out: Vec<f32> = targets.iter().enumerate().map(|(r, &t)| {
        assert!(t < cols, "traced_cross_entropy_rows: target {t} >= {cols} classes");
        -log_p[r * cols + t]
    }).collect();
    tape.record_with_output(out, vec![rows], |out_id| {
        TapeOp::CrossEntropyRows { logits, targets: targets.to_vec(), out: out_id, rows, cols }
    })
}

/// Per-row mean squared error against a constant target. Output shape [rows].
pub fn traced_squared_error_rows(tape: &mut Tape, input: BufId, target: &[f32], rows: usize) -> BufId {
    let numel = tape.buf_numel(input);
    assert_eq!(target.len(), numel, "traced_squared_error_rows: target has {} elements, input {numel}", target.len());
    let cols = numel / rows;
    let x = tape.buf_data(input);
    let out: Vec<f32> = (0..rows)
        .map(|r| {
            (0..cols).map(|c| {
                let d = x[r * cols + c] - target[r * cols + c];
                d * d
            }).sum::<f32>() / cols as f32
        })
        .collect();
    tape.record_with_output(out, vec![rows], |out_id| {
        TapeOp::SquaredErrorRows { input, target: target.to_vec(), out: out_id, rows, cols }
    })
}

/// Identity whose backward routes the gradient through `hook`, viewed as
/// `rows` rows. On a no-grad tape this returns `input` unchanged.
pub fn traced_hook(tape: &mut Tape, input: BufId, hook: Arc<dyn GradHook>, rows: usize) -> BufId {
    if !tape.grad_enabled() {
        return input;
    }
    let data = tape.buf_data(input).to_vec();
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(data, shape, |out_id| {
        TapeOp::Hook { input, out: out_id, hook: HookRef(hook), rows }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Central-difference check of d(sum(w ⊙ f(x)))/dx against the tape.
    fn check_grad(x: &[f32], shape: Vec<usize>, f: impl Fn(&mut Tape, BufId) -> BufId) {
        let weights: Vec<f32> = (0..64).map(|i| 0.3 + 0.1 * (i % 7) as f32).collect();
        let eval = |xs: &[f32]| -> f32 {
            let mut t = Tape::no_grad();
            let id = t.alloc(xs.to_vec(), shape.clone());
            let out = f(&mut t, id);
            t.buf_data(out).iter().zip(&weights).map(|(a, b)| a * b).sum()
        };

        let mut tape = Tape::new();
        let id = tape.alloc(x.to_vec(), shape.clone());
        let out = f(&mut tape, id);
        let n_out = tape.buf_numel(out);
        tape.seed_grad(out, weights[..n_out].to_vec());
        tape.backward(out);
        let analytical = tape.get_grad(id).map(|g| g.to_vec()).unwrap_or(vec![0.0; x.len()]);

        let eps = 1e-2;
        for i in 0..x.len() {
            let mut xp = x.to_vec();
            xp[i] += eps;
            let mut xm = x.to_vec();
            xm[i] -= eps;
            let numerical = (eval(&xp) - eval(&xm)) / (2.0 * eps);
            assert!((analytical[i] - numerical).abs() < 2e-2 * (1.0 + numerical.abs()),
                    "grad[{i}]: analytical={}, numerical={numerical}", analytical[i]);
        }
    }

    const X: [f32; 6] = [0.5, -1.2, 0.3, 2.0, -0.7, 0.1];

    #[test]
    fn test_grad_activations() {
        check_grad(&X, vec![2, 3], traced_sigmoid);
        check_grad(&X, vec![2, 3], traced_tanh);
        check_grad(&X, vec![2, 3], traced_gelu);
    }

    #[test]
    fn test_grad_rms_norm_views() {
        check_grad(&X, vec![2, 3], |t, id| traced_rms_norm(t, id, 2, 3, 1, 1e-5));
        check_grad(&X, vec![2, 3], |t, id| traced_rms_norm(t, id, 1, 2, 3, 1e-5));
    }

    #[test]
    fn test_grad_structural() {
        check_grad(&X, vec![2, 3], |t, id| traced_slice_cols(t, id, 2, 1, 2));
        check_grad(&X, vec![2, 3], |t, id| traced_gather(t, id, 2, &[2, 0, 1, 1, 2, 0]));
        check_grad(&X, vec![2, 3], |t, id| {
            let s = traced_slice_cols(t, id, 2, 0, 1);
            traced_concat_cols(t, &[id, s], 2)
        });
    }

    #[test]
    fn test_grad_losses() {
        check_grad(&X, vec![2, 3], |t, id| traced_cross_entropy_rows(t, id, &[2, 0]));
        check_grad(&X, vec![2, 3], |t, id| traced_squared_error_rows(t, id, &[0.1; 6], 2));
        check_grad(&X, vec![2, 3], |t, id| traced_group_mean(t, id, 2));
    }

    #[test]
    fn test_grad_matmul_input() {
        let w = [0.2f32, -0.4, 0.9, 0.1, 0.5, -0.3];
        check_grad(&X, vec![2, 3], move |t, id| {
            let wid = t.register_param(&w, vec![3, 2]);
            traced_matmul(t, id, wid)
        });
    }

    #[test]
    fn test_grouped_matmul_uses_own_slice() {
        let mut tape = Tape::no_grad();
        let x = tape.alloc(vec![1.0, 1.0, 1.0, 1.0], vec![2, 2]);
        let w = tape.alloc(vec![1.0, 0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 2.0], vec![2, 2, 2]);
        let out = traced_matmul(&mut tape, x, w);
        assert_eq!(tape.buf_data(out), &[1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_add_row_broadcasts() {
        let mut tape = Tape::no_grad();
        let x = tape.alloc(vec![0.0; 4], vec![2, 2]);
        let out = traced_add_row(&mut tape, x, &[1.0, -1.0]);
        assert_eq!(tape.buf_data(out), &[1.0, -1.0, 1.0, -1.0]);
    }
}
