// src/world_model.rs
//
// World-model seam. The learned model is external; ProjectionWorldModel is
// a fixed, seeded stand-in that produces latents with the right layout:
// a tanh recurrence for `deter` and one-hot groups for `stoch`.

use ndarray::{concatenate, s, Array2, ArrayView2, Axis};
use rand_distr::{Distribution, Normal};

use crate::error::{HierosError, Result, ShapeMismatchError, ShapeStage};
use crate::latent::{FeatureLayout, LatentState};
use crate::seeding::component_rng;

pub trait WorldModel: Send {
    fn layout(&self) -> FeatureLayout;

    fn feature_size(&self) -> usize {
        self.layout().feature_size()
    }

    fn initial(&self, batch: usize) -> LatentState {
        LatentState::zeros(batch, self.layout())
    }

    /// Posterior step for a batch of environments. Rows with `is_first`
    /// start from the initial state and ignore `action`.
    fn observe(
        &self,
        prev: &LatentState,
        obs: ArrayView2<'_, f32>,
        action: &[usize],
        is_first: &[bool],
    ) -> Result<LatentState>;
}

pub struct ProjectionWorldModel {
    layout: FeatureLayout,
    obs_dim: usize,
    num_actions: usize,
    /// `[obs_dim + num_actions, deter]`
    w_in: Array2<f32>,
    /// `[deter, deter]`
    w_rec: Array2<f32>,
    /// `[deter, stoch * classes]`
    w_stoch: Array2<f32>,
}

impl ProjectionWorldModel {
    pub fn new(layout: FeatureLayout, obs_dim: usize, num_actions: usize, seed: u64) -> Result<Self> {
        if layout.deter == 0 || layout.stoch == 0 || layout.classes == 0 {
            return Err(HierosError::InvalidConfig(format!(
                "world_model sizes must be > 0, got {layout:?}"
            )));
        }
        let mut rng = component_rng(seed, "world_model");
        let mut init = |rows: usize, cols: usize| -> Result<Array2<f32>> {
            let normal = Normal::new(0.0, (1.0 / rows.max(1) as f64).sqrt())
                .map_err(|e| HierosError::InvalidConfig(format!("world model init: {e}")))?;
            Ok(Array2::from_shape_fn((rows, cols), |_| normal.sample(&mut rng) as f32))
        };
        let w_in = init(obs_dim + num_actions, layout.deter)?;
        let w_rec = init(layout.deter, layout.deter)?;
        let w_stoch = init(layout.deter, layout.stoch_flat())?;
        Ok(Self {
            layout,
            obs_dim,
            num_actions,
            w_in,
            w_rec,
            w_stoch,
        })
    }
}

impl WorldModel for ProjectionWorldModel {
    fn layout(&self) -> FeatureLayout {
        self.layout
    }

    fn observe(
        &self,
        prev: &LatentState,
        obs: ArrayView2<'_, f32>,
        action: &[usize],
        is_first: &[bool],
    ) -> Result<LatentState> {
        let batch = prev.batch();
        if obs.dim() != (batch, self.obs_dim) || action.len() != batch || is_first.len() != batch {
            return Err(ShapeMismatchError::new(
                ShapeStage::Validate,
                format!(
                    "observe expects obs [{batch}, {}] and {batch} actions/flags, got {} actions",
                    self.obs_dim,
                    action.len()
                ),
                obs.shape(),
                prev.deter.shape(),
            )
            .into());
        }

        let mut deter_prev = prev.deter.clone();
        let mut onehot = Array2::<f32>::zeros((batch, self.num_actions));
        for (i, first) in is_first.iter().enumerate() {
            if *first {
                deter_prev.row_mut(i).fill(0.0);
            } else if action[i] < self.num_actions {
                onehot[[i, action[i]]] = 1.0;
            }
        }
        let input = concatenate(Axis(1), &[obs.view(), onehot.view()]).map_err(|e| {
            ShapeMismatchError::new(ShapeStage::Validate, e.to_string(), obs.shape(), &[batch])
        })?;
        let deter = (deter_prev.dot(&self.w_rec) + input.dot(&self.w_in)).mapv(f32::tanh);

        let logits = deter.dot(&self.w_stoch);
        let (groups, classes) = (self.layout.stoch, self.layout.classes);
        let mut stoch = Array2::<f32>::zeros((batch, groups * classes));
        for b in 0..batch {
            for g in 0..groups {
                let group = logits.slice(s![b, g * classes..(g + 1) * classes]);
                let mut best = 0;
                for (k, v) in group.iter().enumerate() {
                    if *v > group[best] {
                        best = k;
                    }
                }
                stoch[[b, g * classes + best]] = 1.0;
            }
        }
        Ok(LatentState { deter, stoch })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> ProjectionWorldModel {
        ProjectionWorldModel::new(FeatureLayout::new(6, 3, 4), 5, 5, 0).unwrap()
    }

    #[test]
    fn test_observe_shapes_and_one_hot() {
        let m = model();
        let prev = m.initial(2);
        let obs = Array2::from_shape_fn((2, 5), |(b, i)| (b + i) as f32 * 0.2);
        let next = m.observe(&prev, obs.view(), &[1, 3], &[false, true]).unwrap();
        assert_eq!(next.deter.shape(), &[2, 6]);
        assert_eq!(next.stoch.shape(), &[2, 12]);
        assert_eq!(next.stoch.sum(), 2.0 * 3.0);
        assert!(next.deter.iter().all(|v| v.abs() <= 1.0));
        assert_eq!(m.feature_size(), 18);
    }

    #[test]
    fn test_is_first_ignores_history() {
        let m = model();
        let obs = Array2::from_elem((1, 5), 0.3);
        let warm = m
            .observe(&m.initial(1), obs.view(), &[2], &[false])
            .unwrap();
        let a = m.observe(&warm, obs.view(), &[4], &[true]).unwrap();
        let b = m.observe(&m.initial(1), obs.view(), &[0], &[true]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_wrong_obs_width_is_rejected() {
        let m = model();
        let obs = Array2::zeros((2, 4));
        assert!(m.observe(&m.initial(2), obs.view(), &[0, 0], &[true, true]).is_err());
    }

    #[test]
    fn test_seeded() {
        let a = ProjectionWorldModel::new(FeatureLayout::new(4, 2, 2), 3, 5, 7).unwrap();
        let b = ProjectionWorldModel::new(FeatureLayout::new(4, 2, 2), 3, 5, 7).unwrap();
        assert_eq!(a.w_in, b.w_in);
        assert_eq!(a.w_stoch, b.w_stoch);
    }
}
