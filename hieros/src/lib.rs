// src/lib.rs
//
// Hieros core: hierarchical subgoal rewards over world-model latents, fed
// by an episodic replay store with time-balanced key selection.

pub mod config;
pub mod env;
pub mod error;
pub mod hierarchy;
pub mod latent;
pub mod logging;
pub mod metrics;
pub mod replay;
pub mod schedule;
pub mod seeding;
pub mod subgoal;
pub mod trainer;
pub mod world_model;

pub use config::{ConfigPreset, HierarchyConfig, HierosConfig};
pub use error::{
    ConfigResolutionError, HierosError, ReplayConsistencyError, Result, ShapeMismatchError,
    ShapeStage,
};
pub use hierarchy::{HierarchyController, PerLayer, SubgoalCache};
pub use latent::{FeatureLayout, LatentBatch, LatentState};
pub use logging::{JsonlSink, MemorySink, MetricsSink, NoopSink};
pub use metrics::{MetricsContext, MetricsRecord};
pub use replay::{Batch, Batcher, ReplayStore, SelectorKind, TrajectoryKey};
pub use subgoal::{OversizePolicy, SimilarityMetric, SubgoalCodec, SubgoalRewardComputer};
pub use trainer::{RunSummary, Trainer, METRICS_FILE};
