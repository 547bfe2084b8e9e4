// tests/reward_shape_tests.rs
//
// Shape handling of the subgoal pipeline on the reference sizes:
// an 8x8 code decodes to 1280 features, wider than a 384-feature state.

use ndarray::{Array2, Array3};

use hieros::subgoal::{LinearSubgoalDecoder, SubgoalReward};
use hieros::{
    LatentBatch, OversizePolicy, ShapeStage, SimilarityMetric, SubgoalCodec,
    SubgoalRewardComputer,
};

fn codec() -> SubgoalCodec {
    SubgoalCodec::new(Box::new(LinearSubgoalDecoder::new((8, 8), 1280, 0).unwrap()))
}

fn one_hot_codes(batch: usize) -> Array3<f32> {
    Array3::from_shape_fn((batch, 8, 8), |(b, i, j)| if (b + i) % 8 == j { 1.0 } else { 0.0 })
}

fn state(batch: usize) -> LatentBatch {
    LatentBatch::Sequence(Array3::from_shape_fn((batch, 1, 384), |(b, _, f)| {
        ((b * 7 + f) % 13) as f32 / 13.0 - 0.5
    }))
}

#[test]
fn test_decode_reference_shape() {
    let decoded = codec().decode(&one_hot_codes(4), 4).unwrap();
    assert_eq!(decoded.dim(), (4, 1280));
}

#[test]
fn test_oversize_subgoal_errors_by_default() {
    let decoded = codec().decode(&one_hot_codes(4), 4).unwrap();
    let computer = SubgoalRewardComputer::default();
    let err = computer
        .reward(&LatentBatch::Flat(decoded), &state(4))
        .unwrap_err();
    assert_eq!(err.stage, ShapeStage::AlignFeatures);
    assert_eq!(err.subgoal_shape, vec![4, 1, 1280]);
    assert_eq!(err.state_shape, vec![4, 1, 384]);
}

#[test]
fn test_oversize_subgoal_truncated_when_configured() {
    let decoded = codec().decode(&one_hot_codes(4), 4).unwrap();
    let computer = SubgoalRewardComputer::new(SimilarityMetric::Cosine, OversizePolicy::TruncateSubgoal);
    let reward = computer
        .reward(&LatentBatch::Flat(decoded), &state(4))
        .unwrap();
    // Rank of the reward is the state's rank minus one.
    assert_eq!(reward.shape(), vec![4, 1]);
    assert!(matches!(reward, SubgoalReward::PerStep(_)));
}

#[test]
fn test_batch_mismatch_always_fails() {
    let computer = SubgoalRewardComputer::new(SimilarityMetric::Cosine, OversizePolicy::TruncateSubgoal);
    let subgoal = LatentBatch::Flat(Array2::ones((3, 384)));
    let err = computer.reward(&subgoal, &state(4)).unwrap_err();
    assert_eq!(err.stage, ShapeStage::Validate);

    // A cached code from a different batch is rejected at decode time.
    let err = codec().decode(&one_hot_codes(3), 4).unwrap_err();
    assert_eq!(err.stage, ShapeStage::Decode);
}

#[test]
fn test_zero_padding_preserves_cosine() {
    let computer = SubgoalRewardComputer::default();
    let goal = Array2::from_shape_fn((2, 4), |(b, f)| (b + f + 1) as f32);
    let mut wide = Array2::<f32>::zeros((2, 6));
    wide.slice_mut(ndarray::s![.., ..4]).assign(&goal);
    let padded = computer
        .reward(&LatentBatch::Flat(goal.clone()), &LatentBatch::Flat(wide))
        .unwrap();
    let same = computer
        .reward(&LatentBatch::Flat(goal.clone()), &LatentBatch::Flat(goal))
        .unwrap();
    for (a, b) in padded.into_dyn().iter().zip(same.into_dyn().iter()) {
        assert!((a - b).abs() < 1e-5);
        assert!((a - 1.0).abs() < 1e-5);
    }
}

#[test]
fn test_dynamic_rank_outside_two_or_three_rejected() {
    let computer = SubgoalRewardComputer::default();
    let rank4 = ndarray::ArrayD::<f32>::zeros(vec![2, 1, 1, 4]);
    let ok = ndarray::ArrayD::<f32>::ones(vec![2, 4]);
    let err = computer.reward_dyn(rank4, ok).unwrap_err();
    assert_eq!(err.stage, ShapeStage::Validate);
}
