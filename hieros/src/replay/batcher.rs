// src/replay/batcher.rs
//
// Fixed-length training batches from the replay store.
//
// Keys and offsets are always drawn on the caller thread, so the sampled
// sequence depends only on (seed, store mutations). With `parallelism > 0`
// the windows are materialised on a rayon pool and gathered back in sample
// order; `parallelism == 0` copies them sequentially.

use ndarray::{concatenate, Array2, Array3, Axis};
use rayon::prelude::*;

use super::selectors::TrajectoryKey;
use super::store::{ReplayStore, TrajectoryWindow};
use crate::error::{HierosError, Result, ShapeMismatchError, ShapeStage};
use crate::latent::LatentBatch;

/// A `[batch, time, ...]` training batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub keys: Vec<TrajectoryKey>,
    pub offsets: Vec<usize>,
    /// `[B, T, obs_dim]`
    pub obs: Array3<f32>,
    /// `[B, T]`
    pub action: Array2<usize>,
    /// `[B, T]`
    pub reward: Array2<f32>,
    /// `[B, T]`
    pub is_first: Array2<bool>,
    /// `[B, T]`
    pub is_terminal: Array2<bool>,
    /// `[B, T, deter]`
    pub deter: Array3<f32>,
    /// `[B, T, stoch * classes]`
    pub stoch: Array3<f32>,
}

impl Batch {
    pub fn batch_size(&self) -> usize {
        self.obs.shape()[0]
    }

    pub fn length(&self) -> usize {
        self.obs.shape()[1]
    }

    /// `[B, T, deter + stoch]` latent features, tagged as a sequence.
    pub fn features(&self) -> Result<LatentBatch> {
        let features = concatenate(Axis(2), &[self.deter.view(), self.stoch.view()]).map_err(|e| {
            ShapeMismatchError::new(
                ShapeStage::Validate,
                format!("deter/stoch leading axes differ: {e}"),
                self.stoch.shape(),
                self.deter.shape(),
            )
        })?;
        Ok(LatentBatch::Sequence(features))
    }
}

/// One window copied out of the store.
struct WindowData {
    obs: Vec<f32>,
    action: Vec<usize>,
    reward: Vec<f32>,
    is_first: Vec<bool>,
    is_terminal: Vec<bool>,
    deter: Vec<f32>,
    stoch: Vec<f32>,
    dims: (usize, usize, usize),
}

fn materialise(window: &TrajectoryWindow) -> Result<WindowData> {
    let steps = window.steps();
    let first = steps.first().ok_or_else(|| {
        HierosError::InvalidConfig(format!("empty window from {}", window.key))
    })?;
    let dims = (first.obs.len(), first.deter.len(), first.stoch.len());
    let mut data = WindowData {
        obs: Vec::with_capacity(steps.len() * dims.0),
        action: Vec::with_capacity(steps.len()),
        reward: Vec::with_capacity(steps.len()),
        is_first: Vec::with_capacity(steps.len()),
        is_terminal: Vec::with_capacity(steps.len()),
        deter: Vec::with_capacity(steps.len() * dims.1),
        stoch: Vec::with_capacity(steps.len() * dims.2),
        dims,
    };
    for (t, step) in steps.iter().enumerate() {
        if (step.obs.len(), step.deter.len(), step.stoch.len()) != dims {
            return Err(HierosError::InvalidConfig(format!(
                "{} step {} has inconsistent widths",
                window.key,
                window.offset + t
            )));
        }
        data.obs.extend_from_slice(&step.obs);
        data.action.push(step.action);
        data.reward.push(step.reward);
        // The window start always begins a fresh latent rollout.
        data.is_first.push(step.is_first || t == 0);
        data.is_terminal.push(step.is_terminal);
        data.deter.extend_from_slice(&step.deter);
        data.stoch.extend_from_slice(&step.stoch);
    }
    Ok(data)
}

pub struct Batcher {
    batch_size: usize,
    length: usize,
    pool: Option<rayon::ThreadPool>,
}

impl Batcher {
    pub fn new(batch_size: usize, length: usize, parallelism: usize) -> Result<Self> {
        if batch_size == 0 || length == 0 {
            return Err(HierosError::InvalidConfig(format!(
                "batch size and length must be > 0 (got {batch_size}, {length})"
            )));
        }
        let pool = if parallelism == 0 {
            None
        } else {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(parallelism)
                    .thread_name(|i| format!("hieros-loader-{i}"))
                    .build()
                    .map_err(|e| HierosError::InvalidConfig(format!("data loader pool: {e}")))?,
            )
        };
        Ok(Self {
            batch_size,
            length,
            pool,
        })
    }

    pub fn is_parallel(&self) -> bool {
        self.pool.is_some()
    }

    pub fn next_batch(&self, store: &mut ReplayStore) -> Result<Batch> {
        let windows = (0..self.batch_size)
            .map(|_| store.sample_window(self.length))
            .collect::<Result<Vec<_>>>()?;

        let data: Vec<WindowData> = match &self.pool {
            None => windows.iter().map(materialise).collect::<Result<_>>()?,
            Some(pool) => pool.install(|| {
                windows
                    .par_iter()
                    .map(materialise)
                    .collect::<Result<Vec<_>>>()
            })?,
        };
        self.assemble(&windows, data)
    }

    fn assemble(&self, windows: &[TrajectoryWindow], data: Vec<WindowData>) -> Result<Batch> {
        let (b, t) = (self.batch_size, self.length);
        let dims = data[0].dims;
        if data.iter().any(|d| d.dims != dims) {
            return Err(HierosError::InvalidConfig(
                "replay holds trajectories with different widths".to_string(),
            ));
        }

        let mut obs = Vec::with_capacity(b * t * dims.0);
        let mut action = Vec::with_capacity(b * t);
        let mut reward = Vec::with_capacity(b * t);
        let mut is_first = Vec::with_capacity(b * t);
        let mut is_terminal = Vec::with_capacity(b * t);
        let mut deter = Vec::with_capacity(b * t * dims.1);
        let mut stoch = Vec::with_capacity(b * t * dims.2);
        for d in data {
            obs.extend(d.obs);
            action.extend(d.action);
            reward.extend(d.reward);
            is_first.extend(d.is_first);
            is_terminal.extend(d.is_terminal);
            deter.extend(d.deter);
            stoch.extend(d.stoch);
        }

        let shape_err = |e: ndarray::ShapeError| {
            HierosError::InvalidConfig(format!("batch assembly: {e}"))
        };
        Ok(Batch {
            keys: windows.iter().map(|w| w.key).collect(),
            offsets: windows.iter().map(|w| w.offset).collect(),
            obs: Array3::from_shape_vec((b, t, dims.0), obs).map_err(shape_err)?,
            action: Array2::from_shape_vec((b, t), action).map_err(shape_err)?,
            reward: Array2::from_shape_vec((b, t), reward).map_err(shape_err)?,
            is_first: Array2::from_shape_vec((b, t), is_first).map_err(shape_err)?,
            is_terminal: Array2::from_shape_vec((b, t), is_terminal).map_err(shape_err)?,
            deter: Array3::from_shape_vec((b, t, dims.1), deter).map_err(shape_err)?,
            stoch: Array3::from_shape_vec((b, t, dims.2), stoch).map_err(shape_err)?,
        })
    }
}
