// src/env/mod.rs
//
// Environment seam used by the trainer.
// - Env: single environment with reset / step
// - VecEnv: N seeded instances stepped in order
// - PinPadDense: reference grid-world task

use serde::{Deserialize, Serialize};

pub mod pinpad;
pub mod vec_env;

pub use pinpad::{PinPadDense, PinPadLayout, PositionStats};
pub use vec_env::VecEnv;

/// Result of a reset or a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvStep {
    pub obs: Vec<f32>,
    pub reward: f32,
    pub is_first: bool,
    pub is_last: bool,
    pub is_terminal: bool,
}

pub trait Env: Send {
    fn obs_dim(&self) -> usize;

    fn num_actions(&self) -> usize;

    /// Start a new episode, reseeding first when `seed` is given.
    fn reset(&mut self, seed: Option<u64>) -> EnvStep;

    /// Advance one step. After `is_last` the next call starts a new episode
    /// and returns an `is_first` step.
    fn step(&mut self, action: usize) -> EnvStep;

    fn position_stats(&self) -> Option<PositionStats> {
        None
    }
}
