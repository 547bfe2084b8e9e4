// src/hierarchy/per_layer.rs
//
// Per-layer hyperparameters: a single scalar broadcast to every layer, or a
// sequence indexed by layer whose last element covers the remaining layers.

use serde::{Deserialize, Serialize};

use crate::error::ConfigResolutionError;

/// A hyperparameter given either once for all layers or per layer.
///
/// Deserialises from either `0.1` or `[0.1, 0.01]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PerLayer<T> {
    Scalar(T),
    Sequence(Vec<T>),
}

impl<T: Clone> PerLayer<T> {
    /// `seq[min(i, len - 1)]` for sequences, the scalar otherwise.
    pub fn value_for_layer(&self, name: &str, layer: usize) -> Result<T, ConfigResolutionError> {
        match self {
            PerLayer::Scalar(v) => Ok(v.clone()),
            PerLayer::Sequence(seq) => match seq.len() {
                0 => Err(ConfigResolutionError {
                    name: name.to_string(),
                    layer,
                }),
                n => Ok(seq[layer.min(n - 1)].clone()),
            },
        }
    }

    /// Resolve one value per layer. Called once at startup.
    pub fn resolve(&self, name: &str, depth: usize) -> Result<Vec<T>, ConfigResolutionError> {
        (0..depth)
            .map(|layer| self.value_for_layer(name, layer))
            .collect()
    }

    /// Number of explicitly given values (1 for a scalar).
    pub fn explicit_len(&self) -> usize {
        match self {
            PerLayer::Scalar(_) => 1,
            PerLayer::Sequence(seq) => seq.len(),
        }
    }
}

impl<T> From<T> for PerLayer<T> {
    fn from(value: T) -> Self {
        PerLayer::Scalar(value)
    }
}
