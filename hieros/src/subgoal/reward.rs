// src/subgoal/reward.rs
//
// Intrinsic reward from latent-space similarity between a decoded subgoal
// and the world-model state.
//
// Each call runs VALIDATE -> ALIGN_RANK -> ALIGN_FEATURES -> REDUCE. A failing
// stage returns a ShapeMismatchError naming the stage; no partial result is
// produced.

use ndarray::{s, Array1, Array2, Array3, ArrayD, ArrayView1, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{ShapeMismatchError, ShapeStage};
use crate::latent::LatentBatch;

const NORM_EPS: f32 = 1e-8;

/// Similarity reduced over the feature axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityMetric {
    /// `g . s / (|g| |s|)`
    #[default]
    Cosine,
    /// `g . s / max(|g|, |s|)^2`: also penalises a norm mismatch.
    CosineMax,
    /// `-mean((g - s)^2)`
    NegativeMse,
}

impl SimilarityMetric {
    fn reduce(&self, g: ArrayView1<'_, f32>, s: ArrayView1<'_, f32>) -> f32 {
        match self {
            SimilarityMetric::Cosine => {
                let denom = (norm(g) * norm(s)).max(NORM_EPS);
                g.dot(&s) / denom
            }
            SimilarityMetric::CosineMax => {
                let m = norm(g).max(norm(s));
                g.dot(&s) / (m * m).max(NORM_EPS)
            }
            SimilarityMetric::NegativeMse => {
                let n = g.len().max(1) as f32;
                -g.iter().zip(s.iter()).map(|(a, b)| (a - b) * (a - b)).sum::<f32>() / n
            }
        }
    }
}

fn norm(v: ArrayView1<'_, f32>) -> f32 {
    v.dot(&v).sqrt()
}

/// What to do when the subgoal has more features than the state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OversizePolicy {
    /// Reject with a ShapeMismatchError.
    #[default]
    Error,
    /// Drop the trailing subgoal features. The state is never truncated.
    TruncateSubgoal,
}

/// One reward per batch element (flat state) or per `(batch, time)` pair.
#[derive(Debug, Clone, PartialEq)]
pub enum SubgoalReward {
    PerBatch(Array1<f32>),
    PerStep(Array2<f32>),
}

impl SubgoalReward {
    pub fn shape(&self) -> Vec<usize> {
        match self {
            SubgoalReward::PerBatch(r) => r.shape().to_vec(),
            SubgoalReward::PerStep(r) => r.shape().to_vec(),
        }
    }

    pub fn rank(&self) -> usize {
        match self {
            SubgoalReward::PerBatch(_) => 1,
            SubgoalReward::PerStep(_) => 2,
        }
    }

    pub fn mean(&self) -> f32 {
        match self {
            SubgoalReward::PerBatch(r) => r.mean().unwrap_or(0.0),
            SubgoalReward::PerStep(r) => r.mean().unwrap_or(0.0),
        }
    }

    pub fn into_dyn(self) -> ArrayD<f32> {
        match self {
            SubgoalReward::PerBatch(r) => r.into_dyn(),
            SubgoalReward::PerStep(r) => r.into_dyn(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubgoalRewardComputer {
    pub metric: SimilarityMetric,
    pub oversize: OversizePolicy,
}

/// Subgoal and state after rank alignment: both `[B, T?, F]`, with the
/// subgoal time axis either 1 or equal to the state's.
struct Aligned {
    subgoal: Array3<f32>,
    state: Array3<f32>,
    flat: bool,
}

impl SubgoalRewardComputer {
    pub fn new(metric: SimilarityMetric, oversize: OversizePolicy) -> Self {
        Self { metric, oversize }
    }

    pub fn reward(
        &self,
        subgoal: &LatentBatch,
        state: &LatentBatch,
    ) -> Result<SubgoalReward, ShapeMismatchError> {
        validate(subgoal, state)?;
        let aligned = align_rank(subgoal, state)?;
        let aligned = self.align_features(aligned)?;
        Ok(self.reduce(aligned))
    }

    /// Tag dynamically shaped inputs, then run [`Self::reward`].
    pub fn reward_dyn(
        &self,
        subgoal: ArrayD<f32>,
        state: ArrayD<f32>,
    ) -> Result<SubgoalReward, ShapeMismatchError> {
        let (sg_shape, st_shape) = (subgoal.shape().to_vec(), state.shape().to_vec());
        let tag = |a: ArrayD<f32>| {
            LatentBatch::from_dyn(a).map_err(|e| {
                ShapeMismatchError::new(ShapeStage::Validate, e.reason, &sg_shape, &st_shape)
            })
        };
        let subgoal = tag(subgoal)?;
        let state = tag(state)?;
        self.reward(&subgoal, &state)
    }

    fn align_features(&self, aligned: Aligned) -> Result<Aligned, ShapeMismatchError> {
        let fg = aligned.subgoal.shape()[2];
        let fs = aligned.state.shape()[2];
        let subgoal = if fg == fs {
            aligned.subgoal
        } else if fg < fs {
            let (b, t, _) = aligned.subgoal.dim();
            let mut padded = Array3::<f32>::zeros((b, t, fs));
            padded.slice_mut(s![.., .., ..fg]).assign(&aligned.subgoal);
            padded
        } else {
            match self.oversize {
                OversizePolicy::Error => {
                    return Err(ShapeMismatchError::new(
                        ShapeStage::AlignFeatures,
                        format!(
                            "subgoal has {fg} features but the state only {fs}; \
                             the state is never truncated"
                        ),
                        aligned.subgoal.shape(),
                        aligned.state.shape(),
                    ))
                }
                OversizePolicy::TruncateSubgoal => {
                    aligned.subgoal.slice(s![.., .., ..fs]).to_owned()
                }
            }
        };
        Ok(Aligned { subgoal, ..aligned })
    }

    fn reduce(&self, aligned: Aligned) -> SubgoalReward {
        let (b, t, _) = aligned.state.dim();
        let tg = aligned.subgoal.shape()[1];
        let out = Array2::from_shape_fn((b, t), |(i, j)| {
            let g = aligned.subgoal.slice(s![i, if tg == 1 { 0 } else { j }, ..]);
            let st = aligned.state.slice(s![i, j, ..]);
            self.metric.reduce(g, st)
        });
        if aligned.flat {
            SubgoalReward::PerBatch(out.index_axis_move(Axis(1), 0))
        } else {
            SubgoalReward::PerStep(out)
        }
    }
}

fn validate(subgoal: &LatentBatch, state: &LatentBatch) -> Result<(), ShapeMismatchError> {
    if subgoal.batch() != state.batch() {
        return Err(ShapeMismatchError::new(
            ShapeStage::Validate,
            format!(
                "subgoal batch {} differs from state batch {}",
                subgoal.batch(),
                state.batch()
            ),
            &subgoal.shape(),
            &state.shape(),
        ));
    }
    if subgoal.features() == 0 || state.features() == 0 {
        return Err(ShapeMismatchError::new(
            ShapeStage::Validate,
            "feature axis is empty",
            &subgoal.shape(),
            &state.shape(),
        ));
    }
    Ok(())
}

fn align_rank(subgoal: &LatentBatch, state: &LatentBatch) -> Result<Aligned, ShapeMismatchError> {
    let err = |reason: String| {
        ShapeMismatchError::new(ShapeStage::AlignRank, reason, &subgoal.shape(), &state.shape())
    };
    match (subgoal, state) {
        (LatentBatch::Flat(g), LatentBatch::Flat(s)) => Ok(Aligned {
            subgoal: g.clone().insert_axis(Axis(1)),
            state: s.clone().insert_axis(Axis(1)),
            flat: true,
        }),
        (LatentBatch::Flat(g), LatentBatch::Sequence(s)) => Ok(Aligned {
            subgoal: g.clone().insert_axis(Axis(1)),
            state: s.clone(),
            flat: false,
        }),
        (LatentBatch::Sequence(g), LatentBatch::Sequence(s)) => {
            let (tg, ts) = (g.shape()[1], s.shape()[1]);
            if tg != 1 && tg != ts {
                return Err(err(format!(
                    "subgoal time axis {tg} cannot be aligned with state time axis {ts}"
                )));
            }
            Ok(Aligned {
                subgoal: g.clone(),
                state: s.clone(),
                flat: false,
            })
        }
        (LatentBatch::Sequence(g), LatentBatch::Flat(s)) => {
            if g.shape()[1] != 1 {
                return Err(err(format!(
                    "subgoal carries {} time steps but the state has no time axis",
                    g.shape()[1]
                )));
            }
            Ok(Aligned {
                subgoal: g.clone(),
                state: s.clone().insert_axis(Axis(1)),
                flat: true,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array};

    fn cosine() -> SubgoalRewardComputer {
        SubgoalRewardComputer::default()
    }

    #[test]
    fn test_flat_state_gives_per_batch() {
        let g = LatentBatch::Flat(Array2::ones((4, 6)));
        let s = LatentBatch::Flat(Array2::ones((4, 6)));
        let r = cosine().reward(&g, &s).unwrap();
        assert_eq!(r.shape(), vec![4]);
        assert!((r.mean() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_sequence_state_gives_per_step() {
        let g = LatentBatch::Flat(Array2::ones((2, 5)));
        let s = LatentBatch::Sequence(Array3::ones((2, 7, 5)));
        let r = cosine().reward(&g, &s).unwrap();
        assert_eq!(r.shape(), vec![2, 7]);
        assert_eq!(r.rank(), 2);
    }

    #[test]
    fn test_per_step_subgoal() {
        let g = LatentBatch::Sequence(Array::from_shape_fn((1, 3, 2), |(_, t, f)| {
            if f == t % 2 {
                1.0
            } else {
                0.0
            }
        }));
        let s = LatentBatch::Sequence(array![[[1.0, 0.0], [1.0, 0.0], [1.0, 0.0]]]);
        match cosine().reward(&g, &s).unwrap() {
            SubgoalReward::PerStep(r) => {
                assert!((r[[0, 0]] - 1.0).abs() < 1e-6);
                assert!(r[[0, 1]].abs() < 1e-6);
                assert!((r[[0, 2]] - 1.0).abs() < 1e-6);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_batch_mismatch_is_rejected() {
        let g = LatentBatch::Flat(Array2::ones((16, 8)));
        let s = LatentBatch::Sequence(Array3::ones((8, 1, 8)));
        let err = cosine().reward(&g, &s).unwrap_err();
        assert_eq!(err.stage, ShapeStage::Validate);
        assert_eq!(err.subgoal_shape, vec![16, 8]);
        assert_eq!(err.state_shape, vec![8, 1, 8]);
    }

    #[test]
    fn test_non_singleton_time_mismatch_fails() {
        let g = LatentBatch::Sequence(Array3::ones((2, 3, 4)));
        let s = LatentBatch::Sequence(Array3::ones((2, 5, 4)));
        let err = cosine().reward(&g, &s).unwrap_err();
        assert_eq!(err.stage, ShapeStage::AlignRank);
    }

    #[test]
    fn test_timed_subgoal_against_flat_state() {
        let s = LatentBatch::Flat(Array2::ones((2, 4)));
        let single = LatentBatch::Sequence(Array3::ones((2, 1, 4)));
        assert_eq!(cosine().reward(&single, &s).unwrap().shape(), vec![2]);
        let multi = LatentBatch::Sequence(Array3::ones((2, 3, 4)));
        assert!(cosine().reward(&multi, &s).is_err());
    }

    #[test]
    fn test_zero_padding_preserves_cosine() {
        let g = LatentBatch::Flat(array![[1.0, 2.0], [3.0, -1.0]]);
        let s = LatentBatch::Flat(array![[2.0, 1.0, 0.0, 0.0], [1.0, 1.0, 0.0, 0.0]]);
        let padded = cosine().reward(&g, &s).unwrap().into_dyn();

        let s_trim = LatentBatch::Flat(array![[2.0, 1.0], [1.0, 1.0]]);
        let direct = cosine().reward(&g, &s_trim).unwrap().into_dyn();
        for (a, b) in padded.iter().zip(direct.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_oversize_policies() {
        let g = LatentBatch::Flat(Array2::ones((4, 10)));
        let s = LatentBatch::Sequence(Array3::ones((4, 1, 6)));
        let err = cosine().reward(&g, &s).unwrap_err();
        assert_eq!(err.stage, ShapeStage::AlignFeatures);

        let truncate =
            SubgoalRewardComputer::new(SimilarityMetric::Cosine, OversizePolicy::TruncateSubgoal);
        let r = truncate.reward(&g, &s).unwrap();
        assert_eq!(r.shape(), vec![4, 1]);
        assert!((r.mean() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_metrics() {
        let g = array![3.0f32, 0.0];
        let s = array![1.0f32, 0.0];
        assert!((SimilarityMetric::Cosine.reduce(g.view(), s.view()) - 1.0).abs() < 1e-6);
        // 3 / max(3, 1)^2
        let cm = SimilarityMetric::CosineMax.reduce(g.view(), s.view());
        assert!((cm - 1.0 / 3.0).abs() < 1e-6);
        // -(2^2 + 0) / 2
        let mse = SimilarityMetric::NegativeMse.reduce(g.view(), s.view());
        assert!((mse + 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_zero_vectors_do_not_produce_nan() {
        let g = LatentBatch::Flat(Array2::zeros((2, 3)));
        let s = LatentBatch::Flat(Array2::ones((2, 3)));
        let r = cosine().reward(&g, &s).unwrap().into_dyn();
        assert!(r.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_rank_four_rejected_by_dyn_entry() {
        let g = ArrayD::<f32>::zeros(vec![2, 1, 1, 4]);
        let s = ArrayD::<f32>::zeros(vec![2, 4]);
        let err = cosine().reward_dyn(g, s).unwrap_err();
        assert_eq!(err.stage, ShapeStage::Validate);
        assert_eq!(err.subgoal_shape, vec![2, 1, 1, 4]);
    }
}
