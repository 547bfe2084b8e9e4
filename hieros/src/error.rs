// src/error.rs
//
// Error taxonomy for the subgoal reward and replay pipeline.
//
// - ShapeMismatchError: reward/codec shape validation failures (carries both shapes)
// - ReplayConsistencyError: selector parallel-array invariants broken after a mutation
// - ConfigResolutionError: per-layer value requested from an empty sequence
//
// HierosError wraps all of them plus I/O and (de)serialisation failures.

use std::fmt;

use thiserror::Error;

/// Stage of the subgoal pipeline at which a shape check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeStage {
    /// Subgoal code -> feature space decoding.
    Decode,
    /// Batch size and rank validation.
    Validate,
    /// Time-axis alignment between subgoal and state.
    AlignRank,
    /// Feature-axis alignment (zero padding / oversize policy).
    AlignFeatures,
    /// Similarity reduction over the feature axis.
    Reduce,
}

impl ShapeStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShapeStage::Decode => "decode",
            ShapeStage::Validate => "validate",
            ShapeStage::AlignRank => "align_rank",
            ShapeStage::AlignFeatures => "align_features",
            ShapeStage::Reduce => "reduce",
        }
    }
}

impl fmt::Display for ShapeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subgoal / state shape combination that cannot be reconciled.
///
/// Never recovered by a guessed reshape. `dump` holds the debug shape
/// report when debug mode is enabled.
#[derive(Debug, Clone, PartialEq, Error)]
#[error(
    "shape mismatch during {stage}: {reason} (subgoal={subgoal_shape:?}, state={state_shape:?}){}",
    render_dump(.dump)
)]
pub struct ShapeMismatchError {
    pub stage: ShapeStage,
    pub reason: String,
    pub subgoal_shape: Vec<usize>,
    pub state_shape: Vec<usize>,
    pub dump: Option<String>,
}

fn render_dump(dump: &Option<String>) -> String {
    match dump {
        Some(d) => format!("\n{d}"),
        None => String::new(),
    }
}

impl ShapeMismatchError {
    pub fn new(
        stage: ShapeStage,
        reason: impl Into<String>,
        subgoal_shape: &[usize],
        state_shape: &[usize],
    ) -> Self {
        Self {
            stage,
            reason: reason.into(),
            subgoal_shape: subgoal_shape.to_vec(),
            state_shape: state_shape.to_vec(),
            dump: None,
        }
    }

    /// Attach a debug shape dump.
    pub fn with_dump(mut self, dump: impl Into<String>) -> Self {
        self.dump = Some(dump.into());
        self
    }
}

/// Selector parallel arrays (`keys`, `indices`, `key_counts`) disagree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "replay selector inconsistent after {operation}: keys={keys} indices={indices} key_counts={key_counts}: {detail}"
)]
pub struct ReplayConsistencyError {
    pub operation: &'static str,
    pub keys: usize,
    pub indices: usize,
    pub key_counts: usize,
    pub detail: String,
}

/// A per-layer configuration sequence is empty but a layer asked for a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("per-layer config `{name}` is empty but layer {layer} requested a value")]
pub struct ConfigResolutionError {
    pub name: String,
    pub layer: usize,
}

#[derive(Debug, Error)]
pub enum HierosError {
    #[error(transparent)]
    Shape(#[from] ShapeMismatchError),

    #[error(transparent)]
    ReplayConsistency(#[from] ReplayConsistencyError),

    #[error(transparent)]
    ConfigResolution(#[from] ConfigResolutionError),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("replay store has no sampleable trajectories (size={size}, min_length={min_length})")]
    EmptyReplay { size: usize, min_length: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, HierosError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_error_message_carries_both_shapes() {
        let err = ShapeMismatchError::new(
            ShapeStage::Validate,
            "batch sizes differ",
            &[16, 1280],
            &[8, 1, 1280],
        );
        let msg = err.to_string();
        assert!(msg.contains("validate"));
        assert!(msg.contains("[16, 1280]"));
        assert!(msg.contains("[8, 1, 1280]"));
        assert!(!msg.contains('\n'));
    }

    #[test]
    fn test_shape_error_dump_is_appended() {
        let err = ShapeMismatchError::new(ShapeStage::AlignRank, "x", &[1], &[2])
            .with_dump("cached_subgoal: [4, 8, 8]");
        assert!(err.to_string().ends_with("cached_subgoal: [4, 8, 8]"));
    }

    #[test]
    fn test_umbrella_conversion() {
        let err: HierosError = ConfigResolutionError {
            name: "entropy".to_string(),
            layer: 2,
        }
        .into();
        assert!(matches!(err, HierosError::ConfigResolution(_)));
        assert!(err.to_string().contains("entropy"));
    }
}
