// Wengert tape: reverse-mode AD via operation recording.
//
// Records operations during the forward pass into a linear tape,
// then replays them in reverse to compute gradients via the chain rule.
//
// Two extensions over a plain tape drive the cell rollout:
//   - checkpoint regions: the forward runs on a scratch tape and only the
//     region outputs land in this arena; backward re-runs the region.
//   - gradient hooks: identity nodes whose backward hands the incoming
//     gradient to a `GradHook` that may rewrite it in place.
//
// Parameters are snapshotted at registration, immune to later mutation.

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::tensor;

// ── Buffer management ────────────────────────────────────────────────

/// Arena index for tensor buffers. Immutable after creation.
pub type BufId = usize;

/// A flat tensor buffer in the tape arena.
#[derive(Clone, Debug)]
pub struct TapeBuf {
    /// Flat storage (row-major).
    pub data: Vec<f32>,
    /// Shape metadata, e.g. [batch * cells, edges].
    pub shape: Vec<usize>,
    /// True for cell parameters; only these are read back after backward.
    pub is_param: bool,
}

impl TapeBuf {
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        TapeBuf { data, shape, is_param: false }
    }

    pub fn param(data: Vec<f32>, shape: Vec<usize>) -> Self {
        TapeBuf { data, shape, is_param: true }
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

// ── Hooks and regions ────────────────────────────────────────────────

/// Intercepts the gradient flowing backward through a hook node.
///
/// `grad` is the upstream gradient viewed as `rows` equal-length rows and may
/// be rewritten in place. Implementations may be shared across threads, so
/// any accumulated bookkeeping must be synchronized.
pub trait GradHook: Send + Sync {
    fn on_grad(&self, grad: &mut [f32], rows: usize);
}

/// Pure recompute closure of a checkpoint region: maps input ids on the given
/// tape to output ids on the same tape.
pub type RegionFn = dyn Fn(&mut Tape, &[BufId]) -> Vec<BufId>;

#[derive(Clone)]
pub struct Region(pub Rc<RegionFn>);

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Region(..)")
    }
}

#[derive(Clone)]
pub struct HookRef(pub Arc<dyn GradHook>);

impl fmt::Debug for HookRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HookRef(..)")
    }
}

// ── Tape operations ──────────────────────────────────────────────────

/// A single recorded operation on the tape.
#[derive(Debug, Clone)]
pub enum TapeOp {
    // ── Linear algebra ──────────────────────────────────────────
    /// out = X @ W where X: [rows, k], W: [groups, k, n], out: [rows, n].
    /// Row block g (rows/groups rows) multiplies against W[g]; groups == 1
    /// is a plain shared-weight matmul.
    Matmul { x: BufId, w: BufId, out: BufId, groups: usize, rows: usize, k: usize, n: usize },

    // ── Element-wise ────────────────────────────────────────────
    /// out = A + B
    Add { a: BufId, b: BufId, out: BufId },
    /// out = A - B
    Sub { a: BufId, b: BufId, out: BufId },
    /// out = A * B  (element-wise)
    Mul { a: BufId, b: BufId, out: BufId },
    /// out = scalar * A
    Scale { input: BufId, scalar: f32, out: BufId },
    /// out = -A
    Negate { input: BufId, out: BufId },
    /// out[r, c] = A[r, c] + row[c]; `row` is a constant.
    AddRow { input: BufId, row: Vec<f32>, out: BufId },

    // ── Activations ─────────────────────────────────────────────
    /// out = sigmoid(x); saves output for backward
    Sigmoid { input: BufId, out: BufId },
    /// out = tanh(x); saves output for backward
    Tanh { input: BufId, out: BufId },
    /// out = gelu(x), tanh approximation
    Gelu { input: BufId, out: BufId },

    // ── Normalization ───────────────────────────────────────────
    /// Views input as [outer, len, inner] and divides every length-`len`
    /// fiber by sqrt(mean(x²) + eps).
    RmsNorm { input: BufId, out: BufId, outer: usize, len: usize, inner: usize, eps: f32 },

    // ── Structural ──────────────────────────────────────────────
    /// out = input[:, start..start+len] with input viewed as [rows, cols]
    SliceCols { input: BufId, out: BufId, rows: usize, cols: usize, start: usize, len: usize },
    /// out = concat(inputs, axis=-1); `widths` are the per-input column counts
    ConcatCols { inputs: Vec<BufId>, widths: Vec<usize>, out: BufId, rows: usize },
    /// out[r, c] = input[r, indices[r*cols + c]]; scatter-add backward
    Gather { input: BufId, out: BufId, rows: usize, cols: usize, indices: Vec<usize> },

    // ── Reductions / losses ─────────────────────────────────────
    /// out[g] = mean of the g-th contiguous block of input
    GroupMean { input: BufId, out: BufId, groups: usize },
    /// out[r] = -log_softmax(logits[r])[targets[r]]
    CrossEntropyRows { logits: BufId, targets: Vec<usize>, out: BufId, rows: usize, cols: usize },
    /// out[r] = mean_c (input[r, c] - target[r, c])²
    SquaredErrorRows { input: BufId, target: Vec<f32>, out: BufId, rows: usize, cols: usize },

    // ── Interception / recompute ────────────────────────────────
    /// Identity forward; backward passes the gradient through `hook`.
    Hook { input: BufId, out: BufId, hook: HookRef, rows: usize },
    /// Recompute region; see `Tape::checkpoint`.
    Checkpoint { inputs: Vec<BufId>, outputs: Vec<BufId>, region: Region },
}

// ── The Tape ─────────────────────────────────────────────────────────

/// Wengert tape for reverse-mode AD.
///
/// A tape created with `Tape::no_grad()` evaluates every op but records
/// nothing; backward on it is a no-op.
pub struct Tape {
    /// Operations in forward order. Replayed in reverse during backward.
    ops: Vec<TapeOp>,
    /// Arena of tensor buffers. Indexed by BufId.
    bufs: Vec<TapeBuf>,
    /// Gradient accumulators, indexed by BufId. None until backward seeds them.
    grad_accum: Vec<Option<Vec<f32>>>,
    /// False once backward has run.
    recording: bool,
    grad_enabled: bool,
}

impl Default for Tape {
    fn default() -> Self {
        Tape::new()
    }
}

impl Tape {
    /// Create a new empty tape with gradient recording enabled.
    pub fn new() -> Self {
        Tape {
            ops: Vec::new(),
            bufs: Vec::new(),
            grad_accum: Vec::new(),
            recording: true,
            grad_enabled: true,
        }
    }

    /// Create a tape that evaluates without recording.
    pub fn no_grad() -> Self {
        Tape { grad_enabled: false, ..Tape::new() }
    }

    pub fn grad_enabled(&self) -> bool {
        self.grad_enabled
    }

    // ── Buffer management ────────────────────────────────────────

    /// Allocate a new buffer in the arena. Returns its BufId.
    pub fn alloc(&mut self, data: Vec<f32>, shape: Vec<usize>) -> BufId {
        debug_assert_eq!(data.len(), shape.iter().product::<usize>(),
                         "alloc: {} elements for shape {:?}", data.len(), shape);
        let id = self.bufs.len();
        self.bufs.push(TapeBuf::new(data, shape));
        self.grad_accum.push(None);
        id
    }

    /// Register a parameter. Clones the data; the tape holds its own copy.
    pub fn register_param(&mut self, data: &[f32], shape: Vec<usize>) -> BufId {
        let id = self.bufs.len();
        self.bufs.push(TapeBuf::param(data.to_vec(), shape));
        self.grad_accum.push(None);
        id
    }

    /// Register an input (non-parameter) buffer. Clones the data.
    pub fn register_input(&mut self, data: &[f32], shape: Vec<usize>) -> BufId {
        self.alloc(data.to_vec(), shape)
    }

    pub fn buf_data(&self, id: BufId) -> &[f32] {
        &self.bufs[id].data
    }

    pub fn buf_shape(&self, id: BufId) -> &[usize] {
        &self.bufs[id].shape
    }

    pub fn buf_numel(&self, id: BufId) -> usize {
        self.bufs[id].numel()
    }

    pub fn is_param(&self, id: BufId) -> bool {
        self.bufs[id].is_param
    }

    pub fn num_bufs(&self) -> usize {
        self.bufs.len()
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    // ── Recording ────────────────────────────────────────────────

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Record an operation on the tape (dropped on a no-grad tape).
    pub fn record(&mut self, op: TapeOp) {
        assert!(self.recording, "Tape::record called after backward");
        if self.grad_enabled {
            self.ops.push(op);
        }
    }

    /// Record an operation and allocate its output buffer in one step.
    /// Returns the output BufId.
    pub fn record_with_output(&mut self, data: Vec<f32>, shape: Vec<usize>,
                              op_fn: impl FnOnce(BufId) -> TapeOp) -> BufId {
        let out_id = self.alloc(data, shape);
        if self.grad_enabled {
            let op = op_fn(out_id);
            self.record(op);
        }
        out_id
    }

    /// Run `region` as a recompute boundary.
    ///
    /// The region executes on a scratch no-grad tape seeded with copies of
    /// `inputs`; only its outputs are copied into this arena. On backward
    /// the region is re-run on a fresh recording tape to obtain the input
    /// gradients. `region` must be a pure function of its inputs.
    pub fn checkpoint(&mut self, inputs: &[BufId], region: Rc<RegionFn>) -> Vec<BufId> {
        let mut scratch = Tape::no_grad();
        let inner: Vec<BufId> = inputs
            .iter()
            .map(|&id| scratch.alloc(self.bufs[id].data.clone(), self.bufs[id].shape.clone()))
            .collect();
        let inner_outs = region(&mut scratch, &inner);
        let outputs: Vec<BufId> = inner_outs
            .iter()
            .map(|&o| {
                let buf = &scratch.bufs[o];
                self.alloc(buf.data.clone(), buf.shape.clone())
            })
            .collect();
        if self.grad_enabled {
            self.record(TapeOp::Checkpoint {
                inputs: inputs.to_vec(),
                outputs: outputs.clone(),
                region: Region(region),
            });
        }
        outputs
    }

    // ── Gradient seeding and access ──────────────────────────────

    /// Seed the gradient for a buffer (typically the scalar loss).
    pub fn seed_grad(&mut self, id: BufId, grad: Vec<f32>) {
        assert_eq!(grad.len(), self.bufs[id].numel(),
                   "Gradient size mismatch: grad={} buf={}", grad.len(), self.bufs[id].numel());
        self.grad_accum[id] = Some(grad);
    }

    /// Accumulate gradient into a buffer's accumulator.
    fn accumulate_grad(&mut self, id: BufId, grad: &[f32]) {
        let n = self.bufs[id].numel();
        assert_eq!(grad.len(), n, "accumulate_grad size mismatch: grad={} buf={}", grad.len(), n);
        match &mut self.grad_accum[id] {
            Some(existing) => {
                for (e, g) in existing.iter_mut().zip(grad.iter()) {
                    *e += g;
                }
            }
            None => {
                self.grad_accum[id] = Some(grad.to_vec());
            }
        }
    }

    /// Accumulated gradient for a buffer, None if no gradient flowed to it.
    pub fn get_grad(&self, id: BufId) -> Option<&[f32]> {
        self.grad_accum[id].as_deref()
    }

    /// Gradient for a parameter buffer, zeros if no gradient flowed.
    pub fn get_param_grad(&self, id: BufId) -> Vec<f32> {
        assert!(self.bufs[id].is_param, "get_param_grad called on non-param buffer {}", id);
        match &self.grad_accum[id] {
            Some(g) => g.clone(),
            None => vec![0.0; self.bufs[id].numel()],
        }
    }

    // ── Backward pass ────────────────────────────────────────────

    /// Run the backward pass from `loss_id`. A scalar loss without an
    /// explicit seed is seeded with 1.0.
    pub fn backward(&mut self, loss_id: BufId) {
        if self.grad_accum[loss_id].is_none() {
            assert_eq!(self.bufs[loss_id].numel(), 1,
                       "Auto-seeding only works for scalar loss (got {} elements)",
                       self.bufs[loss_id].numel());
            self.grad_accum[loss_id] = Some(vec![1.0]);
        }
        self.propagate();
    }

    /// Replay every recorded op in reverse from whatever seeds are present.
    pub fn propagate(&mut self) {
        self.recording = false;
        let ops = std::mem::take(&mut self.ops);
        for op in ops.iter().rev() {
            self.backward_op(op);
        }
    }

    /// Compute the VJP for a single operation.
    fn backward_op(&mut self, op: &TapeOp) {
        match op {
            // ── Matmul: out = X @ W (per group) ──────────────────
            TapeOp::Matmul { x, w, out, groups, rows, k, n } => {
                let (groups, rows, k, n) = (*groups, *rows, *k, *n);
                let Some(d_out) = self.grad_accum[*out].clone() else { return };
                let m = rows / groups;
                let x_data = &self.bufs[*x].data;
                let w_data = &self.bufs[*w].data;
                let mut d_x = vec![0.0f32; rows * k];
                let mut d_w = vec![0.0f32; groups * k * n];
                let mut w_t = vec![0.0f32; n * k];
                let mut x_t = vec![0.0f32; k * m];
                for g in 0..groups {
                    let xs = &x_data[g * m * k..(g + 1) * m * k];
                    let ws = &w_data[g * k * n..(g + 1) * k * n];
                    let ds = &d_out[g * m * n..(g + 1) * m * n];
                    // d_X = d_out @ W^T
                    tensor::transpose_f32(ws, &mut w_t, k, n);
                    tensor::matmul_f32(ds, &w_t, &mut d_x[g * m * k..(g + 1) * m * k], m, n, k);
                    // d_W = X^T @ d_out
                    tensor::transpose_f32(xs, &mut x_t, m, k);
                    tensor::matmul_f32(&x_t, ds, &mut d_w[g * k * n..(g + 1) * k * n], k, m, n);
                }
                self.accumulate_grad(*x, &d_x);
                self.accumulate_grad(*w, &d_w);
            }

            // ── Element-wise ─────────────────────────────────────
            TapeOp::Add { a, b, out } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    self.accumulate_grad(*a, &d_out);
                    self.accumulate_grad(*b, &d_out);
                }
            }
            TapeOp::Sub { a, b, out } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    self.accumulate_grad(*a, &d_out);
                    let neg: Vec<f32> = d_out.iter().map(|g| -g).collect();
                    self.accumulate_grad(*b, &neg);
                }
            }
            TapeOp::Mul { a, b, out } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let d_a: Vec<f32> = d_out.iter().zip(&self.bufs[*b].data).map(|(g, v)| g * v).collect();
                    let d_b: Vec<f32> = d_out.iter().zip(&self.bufs[*a].data).map(|(g, v)| g * v).collect();
                    self.accumulate_grad(*a, &d_a);
                    self.accumulate_grad(*b, &d_b);
                }
            }
            TapeOp::Scale { input, scalar, out } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let d: Vec<f32> = d_out.iter().map(|g| g * scalar).collect();
                    self.accumulate_grad(*input, &d);
                }
            }
            TapeOp::Negate { input, out } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let d: Vec<f32> = d_out.iter().map(|g| -g).collect();
                    self.accumulate_grad(*input, &d);
                }
            }
            TapeOp::AddRow { input, out, .. } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    self.accumulate_grad(*input, &d_out);
                }
            }

            // ── Activations ──────────────────────────────────────
            TapeOp::Sigmoid { input, out } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let d: Vec<f32> = d_out.iter().zip(&self.bufs[*out].data)
                        .map(|(g, s)| g * s * (1.0 - s)).collect();
                    self.accumulate_grad(*input, &d);
                }
            }
            TapeOp::Tanh { input, out } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let d: Vec<f32> = d_out.iter().zip(&self.bufs[*out].data)
                        .map(|(g, t)| g * (1.0 - t * t)).collect();
                    self.accumulate_grad(*input, &d);
                }
            }
            TapeOp::Gelu { input, out } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let d: Vec<f32> = d_out.iter().zip(&self.bufs[*input].data)
                        .map(|(g, &x)| g * tensor::gelu_prime_f32(x)).collect();
                    self.accumulate_grad(*input, &d);
                }
            }

            // ── RMS norm ─────────────────────────────────────────
            TapeOp::RmsNorm { input, out, outer, len, inner, eps } => {
                let Some(d_out) = self.grad_accum[*out].clone() else { return };
                let (outer, len, inner) = (*outer, *len, *inner);
                let x = &self.bufs[*input].data;
                let mut d_x = vec![0.0f32; x.len()];
                for o in 0..outer {
                    for i in 0..inner {
                        let at = |j: usize| o * len * inner + j * inner + i;
                        let ms = (0..len).map(|j| x[at(j)] * x[at(j)]).sum::<f32>() / len as f32;
                        let r = (ms + eps).sqrt();
                        let dot: f32 = (0..len).map(|j| d_out[at(j)] * x[at(j)]).sum();
                        let coef = dot / (len as f32 * r * r * r);
                        for j in 0..len {
                            d_x[at(j)] = d_out[at(j)] / r - x[at(j)] * coef;
                        }
                    }
                }
                self.accumulate_grad(*input, &d_x);
            }

            // ── Structural ───────────────────────────────────────
            TapeOp::SliceCols { input, out, rows, cols, start, len } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let mut d = vec![0.0f32; rows * cols];
                    for r in 0..*rows {
                        d[r * cols + start..r * cols + start + len]
                            .copy_from_slice(&d_out[r * len..(r + 1) * len]);
                    }
                    self.accumulate_grad(*input, &d);
                }
            }
            TapeOp::ConcatCols { inputs, widths, out, rows } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let total: usize = widths.iter().sum();
                    let mut offset = 0;
                    for (&id, &w) in inputs.iter().zip(widths) {
                        let mut d = Vec::with_capacity(rows * w);
                        for r in 0..*rows {
                            d.extend_from_slice(&d_out[r * total + offset..r * total + offset + w]);
                        }
                        self.accumulate_grad(id, &d);
                        offset += w;
                    }
                }
            }
            TapeOp::Gather { input, out, rows, cols, indices } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let mut d = vec![0.0f32; rows * cols];
                    for r in 0..*rows {
                        for c in 0..*cols {
                            d[r * cols + indices[r * cols + c]] += d_out[r * cols + c];
                        }
                    }
                    self.accumulate_grad(*input, &d);
                }
            }

            // ── Reductions / losses ──────────────────────────────
            TapeOp::GroupMean { input, out, groups } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let block = self.bufs[*input].numel() / groups;
                    let mut d = Vec::with_capacity(block * groups);
                    for g in d_out.iter().take(*groups) {
                        d.extend(std::iter::repeat(g / block as f32).take(block));
                    }
                    self.accumulate_grad(*input, &d);
                }
            }
            TapeOp::CrossEntropyRows { logits, targets, out, rows, cols } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let (rows, cols) = (*rows, *cols);
                    let mut log_p = vec![0.0f32; rows * cols];
                    tensor::log_softmax_f32(&self.bufs[*logits].data, &mut log_p, rows, cols);
                    let mut d = vec![0.0f32; rows * cols];
                    for r in 0..rows {
                        for c in 0..cols {
                            let onehot = if c == targets[r] { 1.0 } else { 0.0 };
                            d[r * cols + c] = d_out[r] * (log_p[r * cols + c].exp() - onehot);
                        }
                    }
                    self.accumulate_grad(*logits, &d);
                }
            }
            TapeOp::SquaredErrorRows { input, target, out, rows, cols } => {
                if let Some(d_out) = self.grad_accum[*out].clone() {
                    let x = &self.bufs[*input].data;
                    let mut d = vec![0.0f32; rows * cols];
                    for r in 0..*rows {
                        for c in 0..*cols {
                            let i = r * cols + c;
                            d[i] = d_out[r] * 2.0 * (x[i] - target[i]) / *cols as f32;
                        }
                    }
                    self.accumulate_grad(*input, &d);
                }
            }

            // ── Interception / recompute ─────────────────────────
            TapeOp::Hook { input, out, hook, rows } => {
                if let Some(mut d) = self.grad_accum[*out].clone() {
                    hook.0.on_grad(&mut d, *rows);
                    self.accumulate_grad(*input, &d);
                }
            }
            TapeOp::Checkpoint { inputs, outputs, region } => {
                self.backward_checkpoint(inputs, outputs, region);
            }
        }
    }

    fn backward_checkpoint(&mut self, inputs: &[BufId], outputs: &[BufId], region: &Region) {
        let seeds: Vec<Option<Vec<f32>>> =
            outputs.iter().map(|&o| self.grad_accum[o].clone()).collect();
        if seeds.iter().all(Option::is_none) {
            return;
        }

        let mut inner = Tape::new();
        let inner_inputs: Vec<BufId> = inputs
            .iter()
            .map(|&id| inner.alloc(self.bufs[id].data.clone(), self.bufs[id].shape.clone()))
            .collect();
        let inner_outs = (region.0)(&mut inner, &inner_inputs);
        assert_eq!(inner_outs.len(), outputs.len(),
                   "checkpoint region returned {} outputs on recompute, {} on forward",
                   inner_outs.len(), outputs.len());
        for (&o, seed) in inner_outs.iter().zip(seeds) {
            if let Some(g) = seed {
                inner.accumulate_grad(o, &g);
            }
        }
        inner.propagate();

        for (&id, &inner_id) in inputs.iter().zip(&inner_inputs) {
            if let Some(g) = inner.grad_accum[inner_id].take() {
                self.accumulate_grad(id, &g);
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
