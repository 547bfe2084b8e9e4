// src/replay/trajectory.rs
//
// Episodic trajectories.
//
// - TrajectoryStep: one (obs, action, reward, flags, latent) transition
// - TrajectoryBuilder: per-env accumulator, hands over a Trajectory at is_last
// - TrajectoryWriter / load_trajectories: JSONL records + JSON metadata on disk

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HierosError, Result};
use crate::latent::FeatureLayout;

/// Current trajectory file format version.
pub const TRAJECTORY_VERSION: u32 = 1;

/// A single transition. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryStep {
    /// Compact observation features.
    pub obs: Vec<f32>,
    /// Action taken to reach this step (0 on the first step).
    pub action: usize,
    /// Extrinsic reward received on arrival.
    pub reward: f32,
    pub is_first: bool,
    pub is_last: bool,
    pub is_terminal: bool,
    /// Deterministic latent component.
    pub deter: Vec<f32>,
    /// Flattened stochastic latent component.
    pub stoch: Vec<f32>,
}

/// A finished episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub env_index: usize,
    pub steps: Vec<TrajectoryStep>,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Sum of extrinsic rewards.
    pub fn score(&self) -> f64 {
        self.steps.iter().map(|s| s.reward as f64).sum()
    }
}

/// Accumulates steps for one environment until the episode ends.
#[derive(Debug, Clone)]
pub struct TrajectoryBuilder {
    env_index: usize,
    steps: Vec<TrajectoryStep>,
}

impl TrajectoryBuilder {
    pub fn new(env_index: usize) -> Self {
        Self {
            env_index,
            steps: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Append a step. A step flagged `is_first` discards any unfinished
    /// partial episode. Returns the finished trajectory on `is_last`.
    pub fn push(&mut self, step: TrajectoryStep) -> Option<Trajectory> {
        if step.is_first && !self.steps.is_empty() {
            self.steps.clear();
        }
        let done = step.is_last;
        self.steps.push(step);
        if done {
            Some(Trajectory {
                env_index: self.env_index,
                steps: std::mem::take(&mut self.steps),
            })
        } else {
            None
        }
    }
}

/// Metadata for a persisted replay dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryMetadata {
    pub trajectory_version: u32,
    pub base_seed: u64,
    pub num_episodes: usize,
    pub num_transitions: usize,
    pub obs_dim: usize,
    pub feature_layout: FeatureLayout,
}

/// Writes trajectories as `trajectories.jsonl` plus `metadata.json`.
pub struct TrajectoryWriter {
    output_dir: PathBuf,
}

impl TrajectoryWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// One JSON line per trajectory, in the given order.
    pub fn write(&self, trajectories: &[&Trajectory], metadata: &TrajectoryMetadata) -> Result<()> {
        fs::create_dir_all(&self.output_dir)?;

        let metadata_json = serde_json::to_string_pretty(metadata)?;
        fs::write(self.output_dir.join("metadata.json"), metadata_json)?;

        let file = File::create(self.output_dir.join("trajectories.jsonl"))?;
        let mut writer = BufWriter::new(file);
        for trajectory in trajectories {
            let line = serde_json::to_string(trajectory)?;
            writeln!(writer, "{}", line)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Load a dataset written by [`TrajectoryWriter`], preserving order.
pub fn load_trajectories(dir: &Path) -> Result<(TrajectoryMetadata, Vec<Trajectory>)> {
    let metadata: TrajectoryMetadata =
        serde_json::from_str(&fs::read_to_string(dir.join("metadata.json"))?)?;
    if metadata.trajectory_version != TRAJECTORY_VERSION {
        return Err(HierosError::InvalidConfig(format!(
            "unsupported trajectory_version {} (expected {})",
            metadata.trajectory_version, TRAJECTORY_VERSION
        )));
    }

    let reader = BufReader::new(File::open(dir.join("trajectories.jsonl"))?);
    let mut trajectories = Vec::with_capacity(metadata.num_episodes);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        trajectories.push(serde_json::from_str(&line)?);
    }
    Ok((metadata, trajectories))
}

#[cfg(test)]
pub(crate) fn synthetic_step(i: usize, last: bool, layout: FeatureLayout) -> TrajectoryStep {
    TrajectoryStep {
        obs: vec![i as f32; 4],
        action: i % 5,
        reward: i as f32 * 0.5,
        is_first: i == 0,
        is_last: last,
        is_terminal: false,
        deter: vec![i as f32; layout.deter],
        stoch: vec![0.0; layout.stoch_flat()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> FeatureLayout {
        FeatureLayout::new(3, 2, 2)
    }

    #[test]
    fn test_builder_emits_on_last() {
        let mut b = TrajectoryBuilder::new(2);
        assert!(b.push(synthetic_step(0, false, layout())).is_none());
        assert!(b.push(synthetic_step(1, false, layout())).is_none());
        let traj = b.push(synthetic_step(2, true, layout())).unwrap();
        assert_eq!(traj.len(), 3);
        assert_eq!(traj.env_index, 2);
        assert!(b.is_empty());
        assert!((traj.score() - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_builder_restarts_on_first() {
        let mut b = TrajectoryBuilder::new(0);
        b.push(synthetic_step(0, false, layout()));
        b.push(synthetic_step(1, false, layout()));
        b.push(synthetic_step(0, false, layout()));
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_write_and_load_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let t0 = Trajectory {
            env_index: 0,
            steps: (0..3).map(|i| synthetic_step(i, i == 2, layout())).collect(),
        };
        let t1 = Trajectory {
            env_index: 1,
            steps: (0..5).map(|i| synthetic_step(i, i == 4, layout())).collect(),
        };
        let metadata = TrajectoryMetadata {
            trajectory_version: TRAJECTORY_VERSION,
            base_seed: 7,
            num_episodes: 2,
            num_transitions: 8,
            obs_dim: 4,
            feature_layout: layout(),
        };
        TrajectoryWriter::new(dir.path())
            .write(&[&t0, &t1], &metadata)
            .unwrap();

        let (meta, loaded) = load_trajectories(dir.path()).unwrap();
        assert_eq!(meta, metadata);
        assert_eq!(loaded, vec![t0, t1]);
    }

    #[test]
    fn test_load_rejects_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let metadata = TrajectoryMetadata {
            trajectory_version: TRAJECTORY_VERSION + 1,
            base_seed: 0,
            num_episodes: 0,
            num_transitions: 0,
            obs_dim: 0,
            feature_layout: layout(),
        };
        TrajectoryWriter::new(dir.path()).write(&[], &metadata).unwrap();
        assert!(load_trajectories(dir.path()).is_err());
    }
}
