//! Example streams feeding the rollout.
//!
//! A stream hands out one `RolloutBatch` per training step and exposes a
//! serializable cursor so a resumed run draws exactly the batches it would
//! have drawn without interruption.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{CellNetError, Result};
use crate::objective::RolloutBatch;
use crate::tensor::Tensor;

/// Input width of a logic-gate example: both operands one-hot encoded.
pub const LOGIC_GATE_IN_COUNT: usize = 4;
/// Output width: one-hot gate result.
pub const LOGIC_GATE_OUT_COUNT: usize = 2;

/// Keeps the data generator apart from other generators keyed on the same seed.
const DATA_SEED_TAG: u64 = 0xd1b5_4a32_d192_ed03;
const ROLLOUT_SEED_MIX: u64 = 0x9e37_79b9_7f4a_7c15;

// ── Types ──────────────────────────────────────────────────────────────

/// Serializable stream position.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamCursor {
    pub seed: u64,
    /// Rollouts handed out so far.
    pub rollouts_drawn: u64,
    /// FNV-1a hash of the last rollout's label indices (integrity canary).
    pub content_hash: u64,
}

/// Resumable source of rollout batches. Object-safe for `Box<dyn ExampleStream>`.
pub trait ExampleStream {
    /// Next batch of `example_count` consecutive examples.
    fn next_rollout(&mut self, example_count: usize) -> RolloutBatch;

    fn cursor(&self) -> StreamCursor;

    fn restore(&mut self, cursor: &StreamCursor) -> Result<()>;
}

// ── FNV-1a hash ────────────────────────────────────────────────────────

fn fnv1a_hash(labels: &[Vec<usize>]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for &label in labels.iter().flatten() {
        for byte in label.to_le_bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(FNV_PRIME);
        }
    }
    hash
}

// ── Logic gates ────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicGate {
    Or,
    And,
    Xor,
}

impl LogicGate {
    pub fn all() -> Vec<LogicGate> {
        vec![LogicGate::Or, LogicGate::And, LogicGate::Xor]
    }

    pub fn apply(self, a: usize, b: usize) -> usize {
        match self {
            LogicGate::Or => a | b,
            LogicGate::And => a & b,
            LogicGate::Xor => a ^ b,
        }
    }
}

/// Each batch row is bound to one gate for a whole rollout; the network has
/// to infer which gate from the targets revealed during update steps.
#[derive(Clone, Debug)]
pub struct LogicGateStream {
    batch_size: usize,
    gates: Vec<LogicGate>,
    seed: u64,
    rollouts_drawn: u64,
    last_hash: u64,
}

impl LogicGateStream {
    pub fn new(batch_size: usize, gates: Vec<LogicGate>, seed: u64) -> Result<Self> {
        if batch_size == 0 || gates.is_empty() {
            return Err(CellNetError::InvalidConfig(format!(
                "logic-gate stream needs batch_size > 0 and at least one gate, got {batch_size} and {:?}",
                gates
            )));
        }
        Ok(LogicGateStream { batch_size, gates, seed, rollouts_drawn: 0, last_hash: 0 })
    }

    /// Each rollout draws from its own generator, keyed by seed and index.
    pub(crate) fn rollout_rng(&self) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ DATA_SEED_TAG ^ self.rollouts_drawn.wrapping_mul(ROLLOUT_SEED_MIX))
    }
}

impl ExampleStream for LogicGateStream {
    fn next_rollout(&mut self, example_count: usize) -> RolloutBatch {
        let mut rng = self.rollout_rng();
        let gates: Vec<LogicGate> = (0..self.batch_size)
            .map(|_| self.gates[rng.gen_range(0..self.gates.len())])
            .collect();

        let mut batch = RolloutBatch { inputs: Vec::new(), labels: Vec::new(), label_indices: Vec::new() };
        for _ in 0..example_count {
            let mut inputs = Vec::with_capacity(self.batch_size * LOGIC_GATE_IN_COUNT);
            let mut one_hot = Vec::with_capacity(self.batch_size * LOGIC_GATE_OUT_COUNT);
            let mut indices = Vec::with_capacity(self.batch_size);
            for gate in &gates {
                let a: usize = rng.gen_range(0..=1);
                let b: usize = rng.gen_range(0..=1);
                let (fa, fb) = (a as f32, b as f32);
                inputs.extend([fa, 1.0 - fa, fb, 1.0 - fb]);
                let out = gate.apply(a, b);
                one_hot.extend(if out == 0 { [1.0, 0.0] } else { [0.0, 1.0] });
                indices.push(out);
            }
            batch.inputs.push(Tensor::from_vec(inputs, &[self.batch_size, LOGIC_GATE_IN_COUNT]));
            batch.labels.push(Tensor::from_vec(one_hot, &[self.batch_size, LOGIC_GATE_OUT_COUNT]));
            batch.label_indices.push(indices);
        }

        self.rollouts_drawn += 1;
        self.last_hash = fnv1a_hash(&batch.label_indices);
        batch
    }

    fn cursor(&self) -> StreamCursor {
        StreamCursor { seed: self.seed, rollouts_drawn: self.rollouts_drawn, content_hash: self.last_hash }
    }

    fn restore(&mut self, cursor: &StreamCursor) -> Result<()> {
        if cursor.seed != self.seed {
            return Err(CellNetError::Restore(format!(
                "stream seed mismatch: configured {}, checkpoint {}",
                self.seed, cursor.seed
            )));
        }
        self.rollouts_drawn = cursor.rollouts_drawn;
        self.last_hash = cursor.content_hash;
        Ok(())
    }
}

// ── Unit tests ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fnv1a_deterministic() {
        let labels = vec![vec![0, 1], vec![1, 1]];
        assert_eq!(fnv1a_hash(&labels), fnv1a_hash(&labels));
        assert_ne!(fnv1a_hash(&labels), fnv1a_hash(&[vec![1, 0], vec![1, 1]]));
    }

    #[test]
    fn test_shapes_and_encoding() {
        let mut s = LogicGateStream::new(6, LogicGate::all(), 3).unwrap();
        let batch = s.next_rollout(4);
        assert_eq!(batch.example_count(), 4);
        assert_eq!(batch.batch_size(), 6);
        for ((x, y), idx) in batch.inputs.iter().zip(&batch.labels).zip(&batch.label_indices) {
            assert_eq!(x.shape, vec![6, 4]);
            assert_eq!(y.shape, vec![6, 2]);
            for r in 0..6 {
                let row = &x.data[r * 4..r * 4 + 4];
                assert_eq!(row[0] + row[1], 1.0);
                assert_eq!(row[2] + row[3], 1.0);
                assert_eq!(y.data[r * 2 + idx[r]], 1.0);
            }
        }
    }

    #[test]
    fn test_xor_only_labels() {
        let mut s = LogicGateStream::new(5, vec![LogicGate::Xor], 9).unwrap();
        let batch = s.next_rollout(3);
        for (x, idx) in batch.inputs.iter().zip(&batch.label_indices) {
            for r in 0..5 {
                let (a, b) = (x.data[r * 4] as usize, x.data[r * 4 + 2] as usize);
                assert_eq!(idx[r], a ^ b);
            }
        }
    }

    #[test]
    fn test_restore_replays_stream() {
        let mut s = LogicGateStream::new(4, LogicGate::all(), 42).unwrap();
        s.next_rollout(2);
        let cursor = s.cursor();
        let expected = s.next_rollout(2);

        let mut resumed = LogicGateStream::new(4, LogicGate::all(), 42).unwrap();
        resumed.restore(&cursor).unwrap();
        assert_eq!(resumed.next_rollout(2), expected);
        assert_eq!(resumed.cursor(), s.cursor());
    }

    #[test]
    fn test_restore_rejects_other_seed() {
        let s = LogicGateStream::new(4, LogicGate::all(), 1).unwrap();
        let mut other = LogicGateStream::new(4, LogicGate::all(), 2).unwrap();
        assert!(matches!(other.restore(&s.cursor()), Err(CellNetError::Restore(_))));
    }
}
