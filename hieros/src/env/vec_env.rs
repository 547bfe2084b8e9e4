// src/env/vec_env.rs
//
// N independent environments stepped in index order. Environment `i` is
// seeded `base_seed + i`.

use super::{Env, EnvStep, PinPadDense, PinPadLayout, PositionStats};
use crate::error::{HierosError, Result};
use crate::seeding::env_seed;

pub struct VecEnv {
    envs: Vec<Box<dyn Env>>,
}

impl VecEnv {
    pub fn new(envs: Vec<Box<dyn Env>>) -> Result<Self> {
        let Some(first) = envs.first() else {
            return Err(HierosError::InvalidConfig(
                "at least one environment is required".to_string(),
            ));
        };
        let dims = (first.obs_dim(), first.num_actions());
        if envs.iter().any(|e| (e.obs_dim(), e.num_actions()) != dims) {
            return Err(HierosError::InvalidConfig(
                "environments disagree on observation or action size".to_string(),
            ));
        }
        Ok(Self { envs })
    }

    /// `count` PinPad instances; `seed_for(i)` gives each instance's seed.
    pub fn pinpad(
        layout: PinPadLayout,
        length: u64,
        count: usize,
        seed_for: impl Fn(usize) -> u64,
    ) -> Result<Self> {
        let envs = (0..count)
            .map(|i| {
                PinPadDense::new(layout, length, seed_for(i)).map(|e| Box::new(e) as Box<dyn Env>)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::new(envs)
    }

    pub fn num_envs(&self) -> usize {
        self.envs.len()
    }

    pub fn obs_dim(&self) -> usize {
        self.envs[0].obs_dim()
    }

    pub fn num_actions(&self) -> usize {
        self.envs[0].num_actions()
    }

    /// Reset every environment, reseeding env `i` with `base_seed + i`
    /// when a base seed is given.
    pub fn reset_all(&mut self, base_seed: Option<u64>) -> Vec<EnvStep> {
        self.envs
            .iter_mut()
            .enumerate()
            .map(|(i, env)| env.reset(base_seed.map(|s| env_seed(s, i))))
            .collect()
    }

    pub fn step(&mut self, actions: &[usize]) -> Result<Vec<EnvStep>> {
        if actions.len() != self.envs.len() {
            return Err(HierosError::InvalidConfig(format!(
                "got {} actions for {} environments",
                actions.len(),
                self.envs.len()
            )));
        }
        Ok(self
            .envs
            .iter_mut()
            .zip(actions)
            .map(|(env, a)| env.step(*a))
            .collect())
    }

    pub fn position_stats(&self) -> Vec<PositionStats> {
        self.envs.iter().filter_map(|e| e.position_stats()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envs_get_distinct_seeds() {
        let mut v = VecEnv::pinpad(PinPadLayout::Four, 20, 3, |i| env_seed(5, i)).unwrap();
        let first = v.reset_all(None);
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|s| s.is_first));

        let mut again = VecEnv::pinpad(PinPadLayout::Four, 20, 3, |i| env_seed(5, i)).unwrap();
        assert_eq!(again.reset_all(None), first);
    }

    #[test]
    fn test_step_requires_one_action_per_env() {
        let mut v = VecEnv::pinpad(PinPadLayout::Three, 20, 2, |i| i as u64).unwrap();
        v.reset_all(None);
        assert!(v.step(&[0]).is_err());
        assert_eq!(v.step(&[1, 2]).unwrap().len(), 2);
        assert_eq!(v.position_stats().len(), 2);
    }

    #[test]
    fn test_empty_rejected() {
        assert!(VecEnv::new(Vec::new()).is_err());
    }
}
