//! Time-stepped rollout of the cell over a sequence of examples.
//!
//! Per example: inject the input, run `infer_steps` cell applications (the
//! last one's output slots are the prediction), then expose the target and
//! run `update_steps` more so memory can absorb the answer. The final
//! example skips its update steps. Every application is rewired through the
//! graph before the next one.
//!
//! With `checkpoint` on, each cell application is a recompute region: the
//! tape keeps only its inputs and outputs and backward re-runs the cell.

use std::rc::Rc;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cell::{interleave_in_out, Cell, CellWeights};
use crate::error::{CellNetError, Result};
use crate::graph::Graph;
use crate::tape::{BufId, GradHook, RegionFn, Tape};
use crate::tensor::Tensor;
use crate::traced;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    pub infer_steps: usize,
    pub update_steps: usize,
    /// Zero activations (not memory) before every example after the first.
    pub reset_acts: bool,
    /// Wrap each cell application in a recompute region.
    pub checkpoint: bool,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        RolloutConfig { infer_steps: 3, update_steps: 3, reset_acts: false, checkpoint: true }
    }
}

impl RolloutConfig {
    pub fn validate(&self) -> Result<()> {
        if self.infer_steps == 0 {
            return Err(CellNetError::InvalidConfig("infer_steps must be > 0".into()));
        }
        Ok(())
    }
}

/// Tape ids of the state carried between cell applications.
#[derive(Clone, Copy, Debug)]
struct StateIds {
    prev_acts: BufId,
    acts: BufId,
    states: BufId,
}

pub struct Rollout<'a> {
    cell: &'a Cell,
    graph: &'a Graph,
    config: &'a RolloutConfig,
    act_clipper: Option<Arc<dyn GradHook>>,
}

impl<'a> Rollout<'a> {
    pub fn new(cell: &'a Cell, graph: &'a Graph, config: &'a RolloutConfig) -> Self {
        Rollout { cell, graph, config, act_clipper: None }
    }

    /// Route the gradient of every cell output through `hook`, per batch row.
    pub fn with_act_clipper(mut self, hook: Arc<dyn GradHook>) -> Self {
        self.act_clipper = Some(hook);
        self
    }

    /// Run over `inputs[t]` `[batch, in_count]` and `targets[t]`
    /// `[batch, out_count]`. Returns one `[batch, out_count]` output id per
    /// example.
    pub fn run(&self, tape: &mut Tape, weights: &CellWeights, inputs: &[Tensor], targets: &[Tensor]) -> Result<Vec<BufId>> {
        self.config.validate()?;
        if inputs.is_empty() || inputs.len() != targets.len() {
            return Err(CellNetError::InvalidConfig(format!(
                "rollout needs matching non-empty example lists, got {} inputs and {} targets",
                inputs.len(),
                targets.len()
            )));
        }
        let batch = self.graph.batch_size();
        for (label, list, width) in [
            ("rollout inputs", inputs, self.graph.in_count()),
            ("rollout targets", targets, self.graph.out_count()),
        ] {
            if let Some(bad) = list.iter().find(|t| t.numel() != batch * width) {
                return Err(CellNetError::ShapeMismatch {
                    label: label.into(),
                    expected: vec![batch, width],
                    got: bad.shape.clone(),
                });
            }
        }

        let cfg = self.cell.config();
        let rows = batch * self.graph.cell_count();
        let zeros_acts = vec![0.0f32; rows * cfg.edge_count];
        let mut state = StateIds {
            prev_acts: tape.register_input(&zeros_acts, vec![rows, cfg.edge_count]),
            acts: tape.register_input(&zeros_acts, vec![rows, cfg.edge_count]),
            states: tape.register_input(&vec![0.0; rows * cfg.state_count], vec![rows, cfg.state_count]),
        };
        let no_targets = Tensor::zeros(&[batch, self.graph.cell_count()]);
        let cell = Rc::new(self.cell.clone());

        let mut outputs = Vec::with_capacity(inputs.len());
        for (t, (input, target)) in inputs.iter().zip(targets).enumerate() {
            if self.config.reset_acts && t > 0 {
                state.prev_acts = tape.register_input(&zeros_acts, vec![rows, cfg.edge_count]);
                state.acts = tape.register_input(&zeros_acts, vec![rows, cfg.edge_count]);
            }
            let node_inputs = self.graph.populate_inputs(input);

            let io = Rc::new(interleave_in_out(&node_inputs, &no_targets));
            for step in 0..self.config.infer_steps {
                let (out, next) = self.apply(tape, &cell, weights, &io, state);
                state = next;
                if step + 1 == self.config.infer_steps {
                    outputs.push(self.graph.gather_outputs(tape, out));
                }
            }

            if t + 1 == inputs.len() {
                break;
            }

            let io = Rc::new(interleave_in_out(&node_inputs, &self.graph.populate_targets(target)));
            for _ in 0..self.config.update_steps {
                let (_, next) = self.apply(tape, &cell, weights, &io, state);
                state = next;
            }
        }
        Ok(outputs)
    }

    /// One cell application followed by rewiring. Returns the per-node
    /// outputs and the next state.
    fn apply(&self, tape: &mut Tape, cell: &Rc<Cell>, weights: &CellWeights, io: &Rc<Vec<f32>>, s: StateIds) -> (BufId, StateIds) {
        let batch = self.graph.batch_size();
        let rows = io.len() / 2;
        let (outputs, mut acts, mut states) = if self.config.checkpoint {
            let mut inputs = vec![s.prev_acts, s.acts, s.states];
            inputs.extend(weights.ids());
            let cell = Rc::clone(cell);
            let io = Rc::clone(io);
            let region: Rc<RegionFn> = Rc::new(move |t: &mut Tape, ids: &[BufId]| {
                let w = CellWeights::from_ids(&ids[3..9]);
                let io_id = t.register_input(&io, vec![rows, 2]);
                let step = cell.step(t, &w, io_id, ids[0], ids[1], ids[2], batch);
                vec![step.outputs, step.activations, step.cell_states]
            });
            let outs = tape.checkpoint(&inputs, region);
            (outs[0], outs[1], outs[2])
        } else {
            let io_id = tape.register_input(io, vec![rows, 2]);
            let step = cell.step(tape, weights, io_id, s.prev_acts, s.acts, s.states, batch);
            (step.outputs, step.activations, step.cell_states)
        };

        if let Some(hook) = &self.act_clipper {
            acts = traced::traced_hook(tape, acts, Arc::clone(hook), batch);
            states = traced::traced_hook(tape, states, Arc::clone(hook), batch);
        }

        let next = StateIds {
            prev_acts: acts,
            acts: self.graph.step_out_to_step_in(tape, acts),
            states,
        };
        (outputs, next)
    }
}

/// Copy rollout outputs off the tape.
pub fn outputs_to_host(tape: &Tape, outputs: &[BufId]) -> Vec<Tensor> {
    outputs
        .iter()
        .map(|&id| Tensor::from_vec(tape.buf_data(id).to_vec(), tape.buf_shape(id)))
        .collect()
}
