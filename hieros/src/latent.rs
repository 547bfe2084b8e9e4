// src/latent.rs
//
// World-model latent containers.
//
// - LatentState: per-env deterministic + stochastic components ([batch, D], [batch, S*C])
// - LatentBatch: feature tensor tagged with its layout, decided once at the call
//   boundary instead of re-inferred from the rank at every stage.

use ndarray::{concatenate, Array2, Array3, ArrayD, Axis, Ix2, Ix3};
use serde::{Deserialize, Serialize};

use crate::error::{ShapeMismatchError, ShapeStage};

/// Sizes of the world model's latent feature space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureLayout {
    /// Deterministic (recurrent) state size.
    pub deter: usize,
    /// Number of stochastic groups.
    pub stoch: usize,
    /// Classes per stochastic group.
    pub classes: usize,
}

impl FeatureLayout {
    pub fn new(deter: usize, stoch: usize, classes: usize) -> Self {
        Self {
            deter,
            stoch,
            classes,
        }
    }

    /// Flattened stochastic size (`stoch * classes`).
    pub fn stoch_flat(&self) -> usize {
        self.stoch * self.classes
    }

    /// Full feature size `deter + stoch * classes`.
    pub fn feature_size(&self) -> usize {
        self.deter + self.stoch_flat()
    }
}

impl Default for FeatureLayout {
    fn default() -> Self {
        // 256 + 32 * 32 = 1280
        Self::new(256, 32, 32)
    }
}

/// Latent state for a batch of environments.
#[derive(Debug, Clone, PartialEq)]
pub struct LatentState {
    /// `[batch, deter]`
    pub deter: Array2<f32>,
    /// `[batch, stoch * classes]`
    pub stoch: Array2<f32>,
}

impl LatentState {
    pub fn zeros(batch: usize, layout: FeatureLayout) -> Self {
        Self {
            deter: Array2::zeros((batch, layout.deter)),
            stoch: Array2::zeros((batch, layout.stoch_flat())),
        }
    }

    pub fn batch(&self) -> usize {
        self.deter.nrows()
    }

    /// Concatenate `[deter, stoch]` into a `[batch, F]` feature matrix.
    pub fn features(&self) -> Result<Array2<f32>, ShapeMismatchError> {
        concatenate(Axis(1), &[self.deter.view(), self.stoch.view()]).map_err(|e| {
            ShapeMismatchError::new(
                ShapeStage::Validate,
                format!("deter/stoch batch sizes differ: {e}"),
                self.stoch.shape(),
                self.deter.shape(),
            )
        })
    }

    /// Row `i` as a single-env state.
    pub fn row(&self, i: usize) -> (Vec<f32>, Vec<f32>) {
        (self.deter.row(i).to_vec(), self.stoch.row(i).to_vec())
    }
}

/// How a state/subgoal tensor is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateLayout {
    /// `[batch, features]`: policy time, one step per env.
    WithoutTime,
    /// `[batch, time, features]`: training time, batched sequences.
    WithTime,
}

/// A feature tensor together with its layout.
#[derive(Debug, Clone, PartialEq)]
pub enum LatentBatch {
    Flat(Array2<f32>),
    Sequence(Array3<f32>),
}

impl LatentBatch {
    /// Tag a dynamically shaped tensor. Ranks other than 2 and 3 are rejected.
    pub fn from_dyn(array: ArrayD<f32>) -> Result<Self, ShapeMismatchError> {
        let shape = array.shape().to_vec();
        match array.ndim() {
            2 => array
                .into_dimensionality::<Ix2>()
                .map(LatentBatch::Flat)
                .map_err(|e| rank_error(&shape, e)),
            3 => array
                .into_dimensionality::<Ix3>()
                .map(LatentBatch::Sequence)
                .map_err(|e| rank_error(&shape, e)),
            n => Err(ShapeMismatchError::new(
                ShapeStage::Validate,
                format!("rank {n} is not supported; expected 2 or 3"),
                &[],
                &shape,
            )),
        }
    }

    pub fn layout(&self) -> StateLayout {
        match self {
            LatentBatch::Flat(_) => StateLayout::WithoutTime,
            LatentBatch::Sequence(_) => StateLayout::WithTime,
        }
    }

    pub fn rank(&self) -> usize {
        match self {
            LatentBatch::Flat(_) => 2,
            LatentBatch::Sequence(_) => 3,
        }
    }

    pub fn batch(&self) -> usize {
        match self {
            LatentBatch::Flat(a) => a.shape()[0],
            LatentBatch::Sequence(a) => a.shape()[0],
        }
    }

    /// Time length, if the tensor has a time axis.
    pub fn time(&self) -> Option<usize> {
        match self {
            LatentBatch::Flat(_) => None,
            LatentBatch::Sequence(a) => Some(a.shape()[1]),
        }
    }

    pub fn features(&self) -> usize {
        match self {
            LatentBatch::Flat(a) => a.shape()[1],
            LatentBatch::Sequence(a) => a.shape()[2],
        }
    }

    pub fn shape(&self) -> Vec<usize> {
        match self {
            LatentBatch::Flat(a) => a.shape().to_vec(),
            LatentBatch::Sequence(a) => a.shape().to_vec(),
        }
    }
}

fn rank_error(shape: &[usize], e: ndarray::ShapeError) -> ShapeMismatchError {
    ShapeMismatchError::new(ShapeStage::Validate, e.to_string(), &[], shape)
}
