// Trainer tests on the logic-gate task: every estimator completes steps with
// finite metrics, microbatching and the activation-gradient clipper report
// their metrics, and a run restored from a snapshot continues exactly as the
// uninterrupted run.

use cellnet_core::cell::CellConfig;
use cellnet_core::data::{ExampleStream, LogicGateStream};
use cellnet_core::estimator::EstimatorConfig;
use cellnet_core::graph::GraphConfig;
use cellnet_core::metrics::{MetricKey, Metrics};
use cellnet_core::rollout::RolloutConfig;
use cellnet_core::{CellNetError, ParamSet, TrainConfig, Trainer};

fn small_config(estimator: EstimatorConfig) -> TrainConfig {
    TrainConfig {
        cell: CellConfig { edge_count: 4, state_count: 4, hidden_size: 16, ..CellConfig::default() },
        graph: GraphConfig { cell_count: 8, act_per_cell: 4, in_count: 4, out_count: 2, ..GraphConfig::default() },
        rollout: RolloutConfig { infer_steps: 2, update_steps: 2, ..RolloutConfig::default() },
        estimator,
        batch_size: 4,
        examples_per_rollout: 3,
        seed: 17,
        ..TrainConfig::default()
    }
}

fn stream(cfg: &TrainConfig) -> LogicGateStream {
    LogicGateStream::new(cfg.batch_size, cfg.gates.clone(), cfg.seed).unwrap()
}

fn assert_step_metrics(m: &Metrics) {
    for key in [MetricKey::Loss, MetricKey::Accuracy, MetricKey::GradNorm, MetricKey::GradScale] {
        let v = m.scalar(&key).unwrap_or_else(|| panic!("missing {key}"));
        assert!(v.is_finite(), "{key} = {v}");
    }
    let acc = m.scalar(&MetricKey::Accuracy).unwrap();
    assert!((0.0..=1.0 + 1e-6).contains(&acc), "accuracy {acc}");
}

fn assert_params_equal(a: &ParamSet, b: &ParamSet) {
    for ((na, pa), (nb, pb)) in a.iter().zip(b.iter()) {
        assert_eq!(na, nb);
        let (va, vb) = (pa.value.as_ref().unwrap(), pb.value.as_ref().unwrap());
        for (i, (x, y)) in va.data.iter().zip(&vb.data).enumerate() {
            assert!((x - y).abs() <= 1e-6 * y.abs().max(1.0), "{na}[{i}]: {x} vs {y}");
        }
    }
}

// ── Estimators ───────────────────────────────────────────────────────

#[test]
fn test_backprop_steps_update_params() {
    let cfg = small_config(EstimatorConfig::Backprop);
    let mut data = stream(&cfg);
    let mut trainer = Trainer::new(cfg).unwrap();
    let before = trainer.params().flatten();
    for _ in 0..3 {
        assert_step_metrics(&trainer.train_step(&mut data).unwrap());
    }
    assert_eq!(trainer.step_count(), 3);
    assert_ne!(trainer.params().flatten(), before);
    assert!(trainer.params().iter().all(|(_, p)| p.grad.is_none() || p.grad.as_ref().unwrap().data.iter().all(|v| *v == 0.0)));
}

#[test]
fn test_evolution_strategies_step() {
    let cfg = small_config(EstimatorConfig::EvolutionStrategies { eps: 1e-2, population: 8, batch_size: 4 });
    let mut data = stream(&cfg);
    let mut trainer = Trainer::new(cfg).unwrap();
    let m = trainer.train_step(&mut data).unwrap();
    assert_step_metrics(&m);
    assert!(m.contains(&MetricKey::EsDelta));
}

#[test]
fn test_finite_differences_step_keeps_history() {
    let cfg = small_config(EstimatorConfig::FiniteDifferences {
        eps: 1e-2,
        eval_count: 16,
        history_count: 2,
        random_prob: 0.5,
        batch_size: 8,
    });
    let mut data = stream(&cfg);
    let mut trainer = Trainer::new(cfg).unwrap();
    assert_step_metrics(&trainer.train_step(&mut data).unwrap());
    let state = trainer.state(None);
    let json = serde_json::to_value(&state.estimator).unwrap();
    assert_eq!(json["kind"], "finite_differences");
    let history = json["history"].as_array().unwrap();
    assert_eq!(history.len(), trainer.params().axis_count());
    assert!(history.iter().any(|h| !h.as_array().unwrap().is_empty()));
}

// ── Microbatches and clipping ────────────────────────────────────────

#[test]
fn test_microbatched_step() {
    let mut cfg = small_config(EstimatorConfig::Backprop);
    cfg.microbatch = Some(3);
    let mut data = stream(&cfg);
    let mut trainer = Trainer::new(cfg).unwrap();
    // 4 rows in microbatches of 3 and 1.
    assert_step_metrics(&trainer.train_step(&mut data).unwrap());
}

#[test]
fn test_act_clipper_metrics_reported() {
    let mut cfg = small_config(EstimatorConfig::Backprop);
    cfg.act_grad_max_rms = Some(1e-4);
    let mut data = stream(&cfg);
    let mut trainer = Trainer::new(cfg).unwrap();
    let m = trainer.train_step(&mut data).unwrap();
    assert_step_metrics(&m);
    let frac = m.scalar(&MetricKey::ActGradClipFrac).unwrap();
    assert!(frac > 0.0 && frac <= 1.0, "clip fraction {frac}");
    assert!(m.scalar(&MetricKey::ActGradRms).unwrap() >= 0.0);
}

#[test]
fn test_empty_batch_rejected() {
    let cfg = small_config(EstimatorConfig::Backprop);
    let mut data = stream(&cfg);
    let mut trainer = Trainer::new(cfg).unwrap();
    let empty = data.next_rollout(3).slice_rows(0, 0);
    assert!(trainer.step(&empty).is_err());
    assert_eq!(trainer.step_count(), 0);
}

#[test]
fn test_stream_width_mismatch_rejected() {
    let mut cfg = small_config(EstimatorConfig::Backprop);
    cfg.graph.in_count = 3;
    assert!(matches!(cfg.validate(), Err(CellNetError::InvalidConfig(_))));
    assert!(matches!(Trainer::new(cfg), Err(CellNetError::InvalidConfig(_))));

    let mut cfg = small_config(EstimatorConfig::Backprop);
    cfg.graph.out_count = 3;
    assert!(matches!(cfg.validate(), Err(CellNetError::InvalidConfig(_))));
}

// ── Resume ───────────────────────────────────────────────────────────

#[test]
fn test_resume_matches_uninterrupted_run() {
    let cfg = small_config(EstimatorConfig::FiniteDifferences {
        eps: 1e-2,
        eval_count: 12,
        history_count: 2,
        random_prob: 0.5,
        batch_size: 12,
    });

    let mut straight_data = stream(&cfg);
    let mut straight = Trainer::new(cfg.clone()).unwrap();
    for _ in 0..3 {
        straight.train_step(&mut straight_data).unwrap();
    }

    let mut first_data = stream(&cfg);
    let mut first = Trainer::new(cfg.clone()).unwrap();
    for _ in 0..2 {
        first.train_step(&mut first_data).unwrap();
    }
    let snapshot = first.state(Some(first_data.cursor()));

    let mut resumed_data = stream(&cfg);
    let mut resumed = Trainer::new(cfg).unwrap();
    let cursor = resumed.restore(snapshot).unwrap().unwrap();
    resumed_data.restore(&cursor).unwrap();
    assert_eq!(resumed.step_count(), 2);
    resumed.train_step(&mut resumed_data).unwrap();

    assert_eq!(resumed.step_count(), straight.step_count());
    assert_eq!(resumed_data.cursor(), straight_data.cursor());
    assert_params_equal(resumed.params(), straight.params());
}
