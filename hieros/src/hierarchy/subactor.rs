// src/hierarchy/subactor.rs
//
// One level of the hierarchy: resolved per-layer settings, reward moments
// and the layer's policy. Layer 0 acts in the environment; every layer
// above proposes subgoals for the layer below it.

use super::moments::RewardMoments;
use super::policy::{ActionPolicy, SubgoalPolicy};

/// Per-layer values resolved from scalar-or-sequence config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LayerSettings {
    pub entropy: f64,
    pub epsilon: f64,
    pub subgoal_reward_scale: f64,
    pub extr_reward_scale: f64,
    /// Lower-level steps a proposal from this layer is held for.
    pub horizon: u64,
}

pub enum LayerPolicy {
    Action(Box<dyn ActionPolicy>),
    Subgoal(Box<dyn SubgoalPolicy>),
}

pub struct Subactor {
    index: usize,
    settings: LayerSettings,
    moments: RewardMoments,
    policy: LayerPolicy,
    train_steps: u64,
}

impl Subactor {
    pub fn new(index: usize, settings: LayerSettings, policy: LayerPolicy) -> Self {
        Self {
            index,
            settings,
            moments: RewardMoments::default(),
            policy,
            train_steps: 0,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn settings(&self) -> &LayerSettings {
        &self.settings
    }

    pub fn moments(&self) -> &RewardMoments {
        &self.moments
    }

    pub fn train_steps(&self) -> u64 {
        self.train_steps
    }

    pub fn policy_mut(&mut self) -> &mut LayerPolicy {
        &mut self.policy
    }

    /// Metric name under this layer's namespace.
    pub fn metric(&self, name: &str) -> String {
        format!("subactor-{}/{}", self.index, name)
    }

    pub(crate) fn commit(&mut self, moments: RewardMoments) {
        self.moments = moments;
        self.train_steps += 1;
    }
}
