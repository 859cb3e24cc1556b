//! Logic-gate training driver.
//!
//! Usage: `cellnet-train [config.json] [state.json]`
//!
//! Without a config the defaults are used. When the state file exists the run
//! resumes from it; it is rewritten every `save_interval` steps. Set
//! `RUST_LOG` to change verbosity (default `info`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cellnet_core::checkpoint::{load_state, save_state};
use cellnet_core::data::{ExampleStream, LogicGateStream};
use cellnet_core::{TrainConfig, Trainer};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn main() -> Result<()> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => TrainConfig::from_json_file(Path::new(&path))
            .with_context(|| format!("loading config from {path}"))?,
        None => TrainConfig::default(),
    };
    let state_path = PathBuf::from(args.next().unwrap_or_else(|| "state.json".into()));
    info!(config = %config_summary(&config), "starting");

    let mut stream = LogicGateStream::new(config.batch_size, config.gates.clone(), config.seed)?;
    let save_interval = config.save_interval;
    let mut trainer = Trainer::new(config)?;

    if state_path.exists() {
        let state = load_state(&state_path)
            .with_context(|| format!("loading state from {}", state_path.display()))?;
        if let Some(cursor) = trainer.restore(state)? {
            stream.restore(&cursor)?;
        }
    }

    loop {
        trainer.train_step(&mut stream)?;
        if trainer.step_count() % save_interval == 0 {
            let state = trainer.state(Some(stream.cursor()));
            save_state(&state_path, &state)
                .with_context(|| format!("saving state to {}", state_path.display()))?;
        }
    }
}

fn config_summary(config: &TrainConfig) -> String {
    format!(
        "cells={} act_per_cell={} batch={} examples={} estimator={:?}",
        config.graph.cell_count,
        config.graph.act_per_cell,
        config.batch_size,
        config.examples_per_rollout,
        config.estimator
    )
}
