// Graph wiring tests: bijection per batch row, topology rejection before any
// sampling, and input population after rewiring.

use cellnet_core::graph::{Graph, GraphConfig, GraphKind};
use cellnet_core::tape::Tape;
use cellnet_core::tensor::Tensor;
use cellnet_core::CellNetError;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn logic_config(kind: GraphKind) -> GraphConfig {
    GraphConfig { cell_count: 16, act_per_cell: 8, in_count: 4, out_count: 2, kind, space_dims: 3 }
}

// ── Bijection ────────────────────────────────────────────────────────

#[test]
fn test_random_wiring_is_bijection_per_row() {
    for kind in [GraphKind::Permutation, GraphKind::Spatial] {
        for seed in 0..20 {
            let mut rng = StdRng::seed_from_u64(seed);
            let g = Graph::random(8, &logic_config(kind), &mut rng).unwrap();
            assert_eq!(g.perm().len(), 8 * 128);
            assert!(g.is_bijection(), "{kind:?} seed {seed}");
        }
    }
}

#[test]
fn test_spatial_small_graphs_stay_bijective() {
    // Tiny graphs exhaust neighbor lists most often.
    let cfg = GraphConfig { cell_count: 3, act_per_cell: 2, in_count: 1, out_count: 1, kind: GraphKind::Spatial, space_dims: 2 };
    for seed in 0..50 {
        let g = Graph::random(4, &cfg, &mut StdRng::seed_from_u64(seed)).unwrap();
        assert!(g.is_bijection(), "seed {seed}");
    }
}

#[test]
fn test_same_seed_same_wiring() {
    let cfg = logic_config(GraphKind::Permutation);
    let a = Graph::random(4, &cfg, &mut StdRng::seed_from_u64(9)).unwrap();
    let b = Graph::random(4, &cfg, &mut StdRng::seed_from_u64(9)).unwrap();
    assert_eq!(a, b);
}

// ── Topology ─────────────────────────────────────────────────────────

#[test]
fn test_topology_violation_rejected() {
    let cfg = GraphConfig { cell_count: 5, in_count: 4, out_count: 2, ..GraphConfig::default() };
    let err = Graph::random(8, &cfg, &mut StdRng::seed_from_u64(0)).unwrap_err();
    match err {
        CellNetError::GraphTopology { cell_count, in_count, out_count } => {
            assert_eq!((cell_count, in_count, out_count), (5, 4, 2));
        }
        other => panic!("expected topology error, got {other}"),
    }
}

#[test]
fn test_exact_fit_accepted() {
    let cfg = GraphConfig { cell_count: 6, in_count: 4, out_count: 2, ..GraphConfig::default() };
    assert!(Graph::random(1, &cfg, &mut StdRng::seed_from_u64(0)).is_ok());
}

// ── Rewiring and population ──────────────────────────────────────────

#[test]
fn test_rewire_gathers_by_permutation() {
    let cfg = GraphConfig { cell_count: 3, act_per_cell: 1, in_count: 1, out_count: 1, ..GraphConfig::default() };
    let g = Graph::from_perm(&cfg, 2, vec![2, 0, 1, 1, 2, 0]).unwrap();
    let mut tape = Tape::no_grad();
    let acts = tape.register_input(&[10.0, 11.0, 12.0, 20.0, 21.0, 22.0], vec![6, 1]);
    let next = g.step_out_to_step_in(&mut tape, acts);
    assert_eq!(tape.buf_data(next), &[12.0, 10.0, 11.0, 21.0, 22.0, 20.0]);
}

#[test]
fn test_population_ignores_prior_activations() {
    let cfg = logic_config(GraphKind::Permutation);
    let mut rng = StdRng::seed_from_u64(5);
    let g = Graph::random(2, &cfg, &mut rng).unwrap();
    let inputs = Tensor::randn(&[2, 4], &mut rng);

    let first = g.populate_inputs(&inputs);
    let mut tape = Tape::no_grad();
    let acts = tape.register_input(&Tensor::randn(&[32, 8], &mut rng).data, vec![32, 8]);
    let _ = g.step_out_to_step_in(&mut tape, acts);
    let second = g.populate_inputs(&inputs);
    assert_eq!(first, second);
    for b in 0..2 {
        assert_eq!(&second.data[b * 16..b * 16 + 4], &inputs.data[b * 4..b * 4 + 4]);
        assert!(second.data[b * 16 + 4..(b + 1) * 16].iter().all(|&v| v == 0.0));
    }
}
