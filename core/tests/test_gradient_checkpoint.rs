// Gradient checkpointing equivalence tests.
//
// The recompute-region rollout must produce the same parameter gradients as
// the full unroll, across normalization modes, with and without activation
// reset, and with an activation-gradient clipper in the loop. A central
// finite-difference check anchors both to the true derivative.

use std::sync::Arc;

use cellnet_core::cell::{Cell, CellConfig, Normalization, PARAM_NAMES};
use cellnet_core::estimator::{EstimatorSample, GradientEstimator};
use cellnet_core::grad_clip::ActGradClipper;
use cellnet_core::graph::{Graph, GraphConfig};
use cellnet_core::metrics::MetricKey;
use cellnet_core::objective::{RegressionObjective, RolloutLoss};
use cellnet_core::rollout::RolloutConfig;
use cellnet_core::tape::{GradHook, Tape};
use cellnet_core::tensor::Tensor;
use cellnet_core::{LossFn, ParamSet};
use rand::rngs::StdRng;
use rand::SeedableRng;

struct Fixture {
    cell: Cell,
    graph: Graph,
    params: ParamSet,
    inputs: Vec<Tensor>,
    targets: Vec<Tensor>,
    goal: Vec<Tensor>,
}

fn fixture(normalization: Normalization, seed: u64) -> Fixture {
    let mut rng = StdRng::seed_from_u64(seed);
    let gcfg = GraphConfig { cell_count: 6, act_per_cell: 3, in_count: 2, out_count: 2, ..GraphConfig::default() };
    let cell = Cell::new(CellConfig {
        edge_count: 3,
        state_count: 4,
        hidden_size: 8,
        normalization,
        ..CellConfig::default()
    })
    .unwrap();
    let graph = Graph::random(3, &gcfg, &mut rng).unwrap();
    let params = cell.init_params(&mut rng);
    let inputs = (0..3).map(|_| Tensor::randn(&[3, 2], &mut rng)).collect();
    let targets = (0..3).map(|_| Tensor::randn(&[3, 2], &mut rng)).collect();
    let goal = (0..3).map(|_| Tensor::randn(&[3, 2], &mut rng)).collect();
    Fixture { cell, graph, params, inputs, targets, goal }
}

fn backprop_grads(f: &Fixture, rollout: &RolloutConfig, hook: Option<Arc<dyn GradHook>>) -> ParamSet {
    let objective = RegressionObjective { targets: f.goal.clone(), scale: 1.0 };
    let mut loss = RolloutLoss {
        cell: &f.cell,
        graph: &f.graph,
        rollout,
        inputs: &f.inputs,
        targets: &f.targets,
        objective: &objective,
        act_clipper: hook,
    };
    let mut params = f.params.clone();
    GradientEstimator::Backprop.estimate(&EstimatorSample::Exact, &mut params, &mut loss).unwrap();
    params
}

fn loss_at(f: &Fixture, rollout: &RolloutConfig, params: &ParamSet) -> f32 {
    let objective = RegressionObjective { targets: f.goal.clone(), scale: 1.0 };
    let mut loss = RolloutLoss {
        cell: &f.cell,
        graph: &f.graph,
        rollout,
        inputs: &f.inputs,
        targets: &f.targets,
        objective: &objective,
        act_clipper: None,
    };
    let mut tape = Tape::no_grad();
    loss.evaluate(&mut tape, params, 1, None).unwrap().metrics.scalar(&MetricKey::Loss).unwrap()
}

fn assert_close(a: &[f32], b: &[f32], rel: f32, label: &str) {
    let scale = b.iter().fold(0.0f32, |m, v| m.max(v.abs())).max(1e-6);
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() / scale < rel, "{label}[{i}]: {x} vs {y} (scale {scale})");
    }
}

fn assert_grads_close(a: &ParamSet, b: &ParamSet, rel: f32, label: &str) {
    for name in PARAM_NAMES {
        let ga = &a.get(name).unwrap().grad.as_ref().unwrap().data;
        let gb = &b.get(name).unwrap().grad.as_ref().unwrap().data;
        assert!(gb.iter().any(|v| *v != 0.0), "{label}/{name}: zero gradient");
        assert_close(ga, gb, rel, &format!("{label}/{name}"));
    }
}

// ── Checkpoint vs full unroll ────────────────────────────────────────

#[test]
fn test_checkpoint_matches_full_unroll() {
    for (norm, seed) in [
        (Normalization::None, 1),
        (Normalization::FirstLayer, 2),
        (Normalization::LastLayer, 3),
        (Normalization::LastLayerDimwise, 4),
    ] {
        let f = fixture(norm, seed);
        let full = backprop_grads(&f, &RolloutConfig { checkpoint: false, ..RolloutConfig::default() }, None);
        let ckpt = backprop_grads(&f, &RolloutConfig { checkpoint: true, ..RolloutConfig::default() }, None);
        assert_grads_close(&ckpt, &full, 1e-4, &format!("{norm:?}"));
    }
}

#[test]
fn test_checkpoint_matches_with_reset_acts() {
    let f = fixture(Normalization::None, 5);
    let base = RolloutConfig { reset_acts: true, infer_steps: 2, update_steps: 2, ..RolloutConfig::default() };
    let full = backprop_grads(&f, &RolloutConfig { checkpoint: false, ..base.clone() }, None);
    let ckpt = backprop_grads(&f, &RolloutConfig { checkpoint: true, ..base }, None);
    assert_grads_close(&ckpt, &full, 1e-4, "reset_acts");
}

#[test]
fn test_checkpoint_matches_with_act_clipper() {
    let f = fixture(Normalization::None, 6);
    // A tight cap so that clipping actually engages.
    let run = |checkpoint: bool| {
        let clipper = Arc::new(ActGradClipper::new(1e-3).unwrap());
        let hook: Arc<dyn GradHook> = clipper.clone();
        let grads = backprop_grads(&f, &RolloutConfig { checkpoint, ..RolloutConfig::default() }, Some(hook));
        (grads, clipper.metrics())
    };
    let (full, full_m) = run(false);
    let (ckpt, ckpt_m) = run(true);
    assert_grads_close(&ckpt, &full, 1e-4, "act_clipper");
    let full_frac = full_m.scalar(&MetricKey::ActGradClipFrac).unwrap();
    let ckpt_frac = ckpt_m.scalar(&MetricKey::ActGradClipFrac).unwrap();
    assert!(full_frac > 0.0);
    assert!((full_frac - ckpt_frac).abs() < 0.05, "{full_frac} vs {ckpt_frac}");
}

// ── Finite-difference anchor ─────────────────────────────────────────

#[test]
fn test_backprop_matches_finite_differences() {
    let f = fixture(Normalization::None, 7);
    let rollout = RolloutConfig { infer_steps: 2, update_steps: 1, ..RolloutConfig::default() };
    let grads = backprop_grads(&f, &rollout, None);
    let eps = 1e-2f32;
    for name in [PARAM_NAMES[0], PARAM_NAMES[3], PARAM_NAMES[5]] {
        let analytic = grads.get(name).unwrap().grad.as_ref().unwrap().data.clone();
        for idx in [0, 3, 5] {
            let mut plus = f.params.clone();
            plus.get_mut(name).unwrap().value.as_mut().unwrap().data[idx] += eps;
            let mut minus = f.params.clone();
            minus.get_mut(name).unwrap().value.as_mut().unwrap().data[idx] -= eps;
            let fd = (loss_at(&f, &rollout, &plus) - loss_at(&f, &rollout, &minus)) / (2.0 * eps);
            let tol = 5e-3f32.max(0.05 * fd.abs());
            assert!((analytic[idx] - fd).abs() < tol, "{name}[{idx}]: analytic {} vs fd {fd}", analytic[idx]);
        }
    }
}
