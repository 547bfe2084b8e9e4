// src/subgoal/mod.rs
//
// Subgoal codec, similarity reward and shape diagnostics.

pub mod codec;
pub mod debug;
pub mod reward;

pub use codec::{LinearSubgoalDecoder, SubgoalCodec, SubgoalDecoder};
pub use debug::SubgoalShapeReport;
pub use reward::{OversizePolicy, SimilarityMetric, SubgoalReward, SubgoalRewardComputer};
