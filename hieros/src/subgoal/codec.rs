// src/subgoal/codec.rs
//
// Subgoal code <-> latent feature space.
//
// Codes are `[batch, d1, d2]` grids (d1 groups of d2 logits). Decoding maps
// them to `[batch, deter + stoch * classes]`; encoding projects features
// back and discretises each group to a one-hot row. The decoder itself sits
// behind `SubgoalDecoder`.

use ndarray::{Array2, Array3, ArrayView2, Axis};
use rand_distr::{Distribution, Normal};

use crate::error::{HierosError, Result, ShapeMismatchError, ShapeStage};
use crate::seeding::component_rng;

/// Learned (or fixed) map between flattened codes and latent features.
pub trait SubgoalDecoder: Send + Sync {
    /// `(d1, d2)`
    fn code_shape(&self) -> (usize, usize);

    fn feature_size(&self) -> usize;

    /// `[batch, d1 * d2] -> [batch, F]`
    fn decode_flat(&self, code: ArrayView2<'_, f32>) -> Array2<f32>;

    /// `[batch, F] -> [batch, d1 * d2]` logits.
    fn encode_flat(&self, features: ArrayView2<'_, f32>) -> Array2<f32>;
}

/// Fixed random linear decoder/encoder pair.
#[derive(Debug, Clone)]
pub struct LinearSubgoalDecoder {
    code_shape: (usize, usize),
    /// `[d1 * d2, F]`
    decoder: Array2<f32>,
    /// `[F, d1 * d2]`
    encoder: Array2<f32>,
}

impl LinearSubgoalDecoder {
    pub fn new(code_shape: (usize, usize), feature_size: usize, seed: u64) -> Result<Self> {
        let code_size = code_shape.0 * code_shape.1;
        if code_size == 0 || feature_size == 0 {
            return Err(HierosError::InvalidConfig(format!(
                "subgoal code {code_shape:?} and feature size {feature_size} must be non-empty"
            )));
        }
        let mut rng = component_rng(seed, "subgoal_codec");
        let dec = Normal::new(0.0, (1.0 / code_size as f64).sqrt())
            .map_err(|e| HierosError::InvalidConfig(format!("decoder init: {e}")))?;
        let enc = Normal::new(0.0, (1.0 / feature_size as f64).sqrt())
            .map_err(|e| HierosError::InvalidConfig(format!("encoder init: {e}")))?;
        let decoder =
            Array2::from_shape_fn((code_size, feature_size), |_| dec.sample(&mut rng) as f32);
        let encoder =
            Array2::from_shape_fn((feature_size, code_size), |_| enc.sample(&mut rng) as f32);
        Ok(Self {
            code_shape,
            decoder,
            encoder,
        })
    }
}

impl SubgoalDecoder for LinearSubgoalDecoder {
    fn code_shape(&self) -> (usize, usize) {
        self.code_shape
    }

    fn feature_size(&self) -> usize {
        self.decoder.ncols()
    }

    fn decode_flat(&self, code: ArrayView2<'_, f32>) -> Array2<f32> {
        code.dot(&self.decoder)
    }

    fn encode_flat(&self, features: ArrayView2<'_, f32>) -> Array2<f32> {
        features.dot(&self.encoder)
    }
}

pub struct SubgoalCodec {
    decoder: Box<dyn SubgoalDecoder>,
}

impl SubgoalCodec {
    pub fn new(decoder: Box<dyn SubgoalDecoder>) -> Self {
        Self { decoder }
    }

    pub fn code_shape(&self) -> (usize, usize) {
        self.decoder.code_shape()
    }

    pub fn feature_size(&self) -> usize {
        self.decoder.feature_size()
    }

    /// `[batch, d1, d2] -> [batch, F]`.
    ///
    /// `batch_hint` is the batch size the caller expects (the state's batch).
    /// A code cached at a different batch size is rejected rather than
    /// broadcast.
    pub fn decode(
        &self,
        code: &Array3<f32>,
        batch_hint: usize,
    ) -> std::result::Result<Array2<f32>, ShapeMismatchError> {
        let shape = code.shape();
        let (d1, d2) = self.code_shape();
        if shape[0] != batch_hint {
            return Err(ShapeMismatchError::new(
                ShapeStage::Decode,
                format!("subgoal batch {} differs from expected batch {batch_hint}", shape[0]),
                shape,
                &[batch_hint],
            ));
        }
        if (shape[1], shape[2]) != (d1, d2) {
            return Err(ShapeMismatchError::new(
                ShapeStage::Decode,
                format!("code grid {}x{} differs from decoder grid {d1}x{d2}", shape[1], shape[2]),
                shape,
                &[batch_hint, d1, d2],
            ));
        }
        let flat = code
            .as_standard_layout()
            .into_owned()
            .into_shape((batch_hint, d1 * d2))
            .map_err(|e| {
                ShapeMismatchError::new(ShapeStage::Decode, e.to_string(), shape, &[batch_hint])
            })?;
        Ok(self.decoder.decode_flat(flat.view()))
    }

    /// `[batch, F] -> [batch, d1, d2]` one-hot code (argmax per group).
    pub fn encode(
        &self,
        features: &Array2<f32>,
    ) -> std::result::Result<Array3<f32>, ShapeMismatchError> {
        let (d1, d2) = self.code_shape();
        if features.ncols() != self.feature_size() {
            return Err(ShapeMismatchError::new(
                ShapeStage::Decode,
                format!(
                    "features have width {} but the codec expects {}",
                    features.ncols(),
                    self.feature_size()
                ),
                &[features.nrows(), d1, d2],
                features.shape(),
            ));
        }
        let logits = self.decoder.encode_flat(features.view());
        let batch = features.nrows();
        let mut code = Array3::<f32>::zeros((batch, d1, d2));
        for (b, row) in logits.axis_iter(Axis(0)).enumerate() {
            let row = row.to_vec();
            for (g, group) in row.chunks(d2).enumerate() {
                code[[b, g, argmax(group)]] = 1.0;
            }
        }
        Ok(code)
    }
}

/// First index of the maximum; 0 for an empty slice.
fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate() {
        if *v > values[best] {
            best = i;
        }
    }
    best
}
