// src/hierarchy/policy.rs
//
// Policy seams for the subactor stack.
// - SubgoalPolicy: layer k > 0 proposes a subgoal code for layer k - 1
// - ActionPolicy:  layer 0 picks environment actions given its subgoal
//
// The learned actors live outside this crate; the reference policies here
// are fixed, seeded and exploration-aware so the loop can run end to end.

use ndarray::{Array2, Array3, ArrayView2, Axis};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::error::{HierosError, Result, ShapeMismatchError};
use crate::subgoal::SubgoalCodec;

pub trait SubgoalPolicy: Send {
    /// Propose `[batch, d1, d2]` codes for the given `[batch, F]` features.
    /// `goal` is the decoded subgoal of the layer above (`[batch, F]`); the
    /// top layer gets `None`.
    fn propose(
        &mut self,
        codec: &SubgoalCodec,
        features: ArrayView2<'_, f32>,
        goal: Option<ArrayView2<'_, f32>>,
        explore: bool,
    ) -> std::result::Result<Array3<f32>, ShapeMismatchError>;
}

pub trait ActionPolicy: Send {
    fn num_actions(&self) -> usize;

    /// One action per row of `features`. `goal` is the decoded subgoal
    /// (`[batch, F]`) when a layer above exists.
    fn act(
        &mut self,
        features: ArrayView2<'_, f32>,
        goal: Option<ArrayView2<'_, f32>>,
        explore: bool,
    ) -> Vec<usize>;
}

/// Greedy code is the codec's encoding of `features + goal` (or of the
/// features alone at the top layer); with probability `epsilon` a row is
/// replaced by a uniformly random code.
pub struct EpsilonSubgoalPolicy {
    epsilon: f64,
    rng: ChaCha8Rng,
}

impl EpsilonSubgoalPolicy {
    pub fn new(epsilon: f64, rng: ChaCha8Rng) -> Self {
        Self {
            epsilon: epsilon.clamp(0.0, 1.0),
            rng,
        }
    }
}

impl SubgoalPolicy for EpsilonSubgoalPolicy {
    fn propose(
        &mut self,
        codec: &SubgoalCodec,
        features: ArrayView2<'_, f32>,
        goal: Option<ArrayView2<'_, f32>>,
        explore: bool,
    ) -> std::result::Result<Array3<f32>, ShapeMismatchError> {
        let input = match goal {
            Some(g) if g.dim() == features.dim() => &features + &g,
            _ => features.to_owned(),
        };
        let mut code = codec.encode(&input)?;
        if !explore || self.epsilon == 0.0 {
            return Ok(code);
        }
        let (_, d1, d2) = code.dim();
        for mut row in code.axis_iter_mut(Axis(0)) {
            if self.rng.gen::<f64>() < self.epsilon {
                row.fill(0.0);
                for g in 0..d1 {
                    row[[g, self.rng.gen_range(0..d2)]] = 1.0;
                }
            }
        }
        Ok(code)
    }
}

/// Scores actions with a fixed random projection of `goal - features`
/// (or `features` without a goal). Exploration is epsilon-random, then a
/// softmax sample at temperature `entropy`; evaluation is greedy.
pub struct SoftmaxActionPolicy {
    weights: Array2<f32>,
    epsilon: f64,
    temperature: f64,
    rng: ChaCha8Rng,
}

impl SoftmaxActionPolicy {
    pub fn new(
        feature_size: usize,
        num_actions: usize,
        epsilon: f64,
        entropy: f64,
        mut rng: ChaCha8Rng,
    ) -> Result<Self> {
        if num_actions == 0 {
            return Err(HierosError::InvalidConfig(
                "action policy needs at least one action".to_string(),
            ));
        }
        let init = Normal::new(0.0, (1.0 / feature_size.max(1) as f64).sqrt())
            .map_err(|e| HierosError::InvalidConfig(format!("action policy init: {e}")))?;
        let weights =
            Array2::from_shape_fn((feature_size, num_actions), |_| init.sample(&mut rng) as f32);
        Ok(Self {
            weights,
            epsilon: epsilon.clamp(0.0, 1.0),
            temperature: entropy.max(0.0),
            rng,
        })
    }

    fn sample_softmax(&mut self, scores: &[f32]) -> usize {
        let greedy = argmax(scores);
        if self.temperature <= 0.0 {
            return greedy;
        }
        let max = scores[greedy] as f64;
        let weights: Vec<f64> = scores
            .iter()
            .map(|s| ((*s as f64 - max) / self.temperature).exp())
            .collect();
        let total: f64 = weights.iter().sum();
        let mut mass = self.rng.gen::<f64>() * total;
        for (i, w) in weights.iter().enumerate() {
            if mass < *w {
                return i;
            }
            mass -= w;
        }
        scores.len() - 1
    }
}

impl ActionPolicy for SoftmaxActionPolicy {
    fn num_actions(&self) -> usize {
        self.weights.ncols()
    }

    fn act(
        &mut self,
        features: ArrayView2<'_, f32>,
        goal: Option<ArrayView2<'_, f32>>,
        explore: bool,
    ) -> Vec<usize> {
        let input = match goal {
            Some(g) if g.dim() == features.dim() => &g - &features,
            _ => features.to_owned(),
        };
        let scores = input.dot(&self.weights);
        let n = self.num_actions();
        scores
            .axis_iter(Axis(0))
            .map(|row| {
                let row = row.to_vec();
                if !explore {
                    argmax(&row)
                } else if self.rng.gen::<f64>() < self.epsilon {
                    self.rng.gen_range(0..n)
                } else {
                    self.sample_softmax(&row)
                }
            })
            .collect()
    }
}

fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subgoal::LinearSubgoalDecoder;
    use rand::SeedableRng;

    fn codec() -> SubgoalCodec {
        SubgoalCodec::new(Box::new(LinearSubgoalDecoder::new((4, 4), 12, 1).unwrap()))
    }

    #[test]
    fn test_greedy_subgoal_matches_encoding() {
        let c = codec();
        let features = Array2::from_shape_fn((3, 12), |(b, f)| (b + f) as f32 * 0.1);
        let mut p = EpsilonSubgoalPolicy::new(1.0, ChaCha8Rng::seed_from_u64(0));
        let greedy = p.propose(&c, features.view(), None, false).unwrap();
        assert_eq!(greedy, c.encode(&features).unwrap());
    }

    #[test]
    fn test_parent_goal_shifts_the_encoding() {
        let c = codec();
        let features = Array2::from_shape_fn((3, 12), |(b, f)| (b + f) as f32 * 0.1);
        let goal = Array2::from_shape_fn((3, 12), |(b, f)| ((b * 5 + f * 7) % 11) as f32 - 5.0);
        let mut p = EpsilonSubgoalPolicy::new(0.0, ChaCha8Rng::seed_from_u64(0));
        let code = p
            .propose(&c, features.view(), Some(goal.view()), false)
            .unwrap();
        assert_eq!(code, c.encode(&(&features + &goal)).unwrap());

        // A goal from another batch size is ignored.
        let other = Array2::ones((2, 12));
        let code = p
            .propose(&c, features.view(), Some(other.view()), false)
            .unwrap();
        assert_eq!(code, c.encode(&features).unwrap());
    }

    #[test]
    fn test_explored_codes_stay_one_hot() {
        let c = codec();
        let features = Array2::zeros((5, 12));
        let mut p = EpsilonSubgoalPolicy::new(1.0, ChaCha8Rng::seed_from_u64(4));
        let code = p.propose(&c, features.view(), None, true).unwrap();
        assert_eq!(code.sum(), 5.0 * 4.0);
    }

    #[test]
    fn test_eval_actions_are_greedy_and_stable() {
        let features = Array2::from_shape_fn((4, 6), |(b, f)| (b * 6 + f) as f32);
        let mut a = SoftmaxActionPolicy::new(6, 5, 0.5, 1.0, ChaCha8Rng::seed_from_u64(2)).unwrap();
        let first = a.act(features.view(), None, false);
        let second = a.act(features.view(), None, false);
        assert_eq!(first, second);
        assert!(first.iter().all(|x| *x < 5));
    }

    #[test]
    fn test_explore_is_seeded() {
        let features = Array2::ones((8, 6));
        let run = || {
            let mut a =
                SoftmaxActionPolicy::new(6, 5, 0.3, 0.5, ChaCha8Rng::seed_from_u64(8)).unwrap();
            (0..10)
                .flat_map(|_| a.act(features.view(), None, true))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }
}
