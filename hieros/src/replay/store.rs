// src/replay/store.rs
//
// Replay store: owns finished trajectories and the key selector.
//
// Single insertion point (`insert`). Keys are assigned in insertion order,
// the oldest trajectories are evicted once the transition count exceeds
// `capacity`, and episodes shorter than `min_length` are ignored.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use super::selectors::{build_selector, Selector, SelectorKind, TrajectoryKey};
use super::trajectory::{
    load_trajectories, Trajectory, TrajectoryMetadata, TrajectoryStep, TrajectoryWriter,
    TRAJECTORY_VERSION,
};
use crate::error::{HierosError, Result};
use crate::latent::FeatureLayout;
use crate::metrics::MetricsContext;
use crate::seeding::component_rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplayStoreConfig {
    /// Maximum number of stored transitions.
    pub capacity: usize,
    /// Episodes shorter than this are dropped at insertion.
    pub min_length: usize,
    pub selector: SelectorKind,
    pub bias_factor: f64,
    /// Run the full selector consistency check after every mutation.
    pub strict: bool,
}

/// A fixed-length slice of a stored trajectory.
#[derive(Debug, Clone)]
pub struct TrajectoryWindow {
    pub key: TrajectoryKey,
    pub offset: usize,
    pub length: usize,
    trajectory: Arc<Trajectory>,
}

impl TrajectoryWindow {
    pub fn steps(&self) -> &[TrajectoryStep] {
        &self.trajectory.steps[self.offset..self.offset + self.length]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub inserts: u64,
    pub ignored: u64,
    pub evictions: u64,
    pub samples: u64,
}

pub struct ReplayStore {
    config: ReplayStoreConfig,
    base_seed: u64,
    trajectories: HashMap<TrajectoryKey, Arc<Trajectory>>,
    order: VecDeque<TrajectoryKey>,
    selector: Box<dyn Selector>,
    window_rng: ChaCha8Rng,
    next_key: u64,
    transitions: usize,
    stats: ReplayStats,
}

impl ReplayStore {
    pub fn new(config: ReplayStoreConfig, base_seed: u64) -> Result<Self> {
        if config.capacity == 0 {
            return Err(HierosError::InvalidConfig(
                "replay.capacity must be > 0".to_string(),
            ));
        }
        Ok(Self {
            selector: build_selector(config.selector, config.bias_factor, base_seed)?,
            window_rng: component_rng(base_seed, "replay/window"),
            config,
            base_seed,
            trajectories: HashMap::new(),
            order: VecDeque::new(),
            next_key: 0,
            transitions: 0,
            stats: ReplayStats::default(),
        })
    }

    /// Number of stored trajectories.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn transitions(&self) -> usize {
        self.transitions
    }

    pub fn stats(&self) -> ReplayStats {
        self.stats
    }

    pub fn selector(&self) -> &dyn Selector {
        self.selector.as_ref()
    }

    pub fn get(&self, key: TrajectoryKey) -> Option<&Trajectory> {
        self.trajectories.get(&key).map(|t| t.as_ref())
    }

    /// Stored trajectories, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Trajectory> + '_ {
        self.order
            .iter()
            .filter_map(|k| self.trajectories.get(k).map(|t| t.as_ref()))
    }

    /// Insert a finished trajectory. Returns its key, or `None` when it is
    /// shorter than `min_length`.
    pub fn insert(&mut self, trajectory: Trajectory) -> Result<Option<TrajectoryKey>> {
        if trajectory.len() < self.config.min_length.max(1) {
            self.stats.ignored += 1;
            return Ok(None);
        }
        let key = TrajectoryKey(self.next_key);
        self.next_key += 1;

        self.selector.insert(key)?;
        self.transitions += trajectory.len();
        self.trajectories.insert(key, Arc::new(trajectory));
        self.order.push_back(key);
        self.stats.inserts += 1;
        self.check("insert")?;

        while self.transitions > self.config.capacity && self.order.len() > 1 {
            self.evict_oldest()?;
        }
        Ok(Some(key))
    }

    fn evict_oldest(&mut self) -> Result<()> {
        let Some(key) = self.order.pop_front() else {
            return Ok(());
        };
        self.selector.remove(key)?;
        if let Some(t) = self.trajectories.remove(&key) {
            self.transitions -= t.len();
        }
        self.stats.evictions += 1;
        tracing::debug!(%key, transitions = self.transitions, "evicted trajectory");
        self.check("remove")
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        if self.config.strict {
            self.selector.check_consistency()?;
        }
        if self.selector.len() != self.order.len() {
            return Err(HierosError::ReplayConsistency(self.selector.table().error(
                operation,
                format!("store holds {} trajectories", self.order.len()),
            )));
        }
        Ok(())
    }

    /// Sample a key from the selector and a window offset from the store's
    /// own generator.
    pub fn sample_window(&mut self, length: usize) -> Result<TrajectoryWindow> {
        let key = self.selector.sample().ok_or(HierosError::EmptyReplay {
            size: self.order.len(),
            min_length: self.config.min_length,
        })?;
        let trajectory = self.trajectories.get(&key).cloned().ok_or_else(|| {
            HierosError::ReplayConsistency(self.selector.table().error(
                "sample",
                format!("selector returned {key} which the store does not hold"),
            ))
        })?;
        if length == 0 || trajectory.len() < length {
            return Err(HierosError::InvalidConfig(format!(
                "window length {length} does not fit trajectory {key} of length {}",
                trajectory.len()
            )));
        }
        let offset = self.window_rng.gen_range(0..=trajectory.len() - length);
        self.stats.samples += 1;
        Ok(TrajectoryWindow {
            key,
            offset,
            length,
            trajectory,
        })
    }

    /// Add `replay/*` gauges to the metrics context.
    pub fn report(&self, metrics: &mut MetricsContext) {
        metrics.scalar("replay/size", self.order.len() as f64);
        metrics.scalar("replay/transitions", self.transitions as f64);
        metrics.scalar("replay/inserts", self.stats.inserts as f64);
        metrics.scalar("replay/evictions", self.stats.evictions as f64);
        metrics.scalar("replay/samples", self.stats.samples as f64);
    }

    /// Persist stored trajectories, oldest first.
    pub fn save(&self, dir: &Path, obs_dim: usize, layout: FeatureLayout) -> Result<()> {
        let trajectories: Vec<&Trajectory> = self.iter().collect();
        let metadata = TrajectoryMetadata {
            trajectory_version: TRAJECTORY_VERSION,
            base_seed: self.base_seed,
            num_episodes: trajectories.len(),
            num_transitions: self.transitions,
            obs_dim,
            feature_layout: layout,
        };
        TrajectoryWriter::new(dir).write(&trajectories, &metadata)
    }

    /// Re-insert a saved dataset in its original order. Returns the number
    /// of trajectories accepted.
    pub fn load(&mut self, dir: &Path) -> Result<usize> {
        let (_, trajectories) = load_trajectories(dir)?;
        let mut accepted = 0;
        for trajectory in trajectories {
            if self.insert(trajectory)?.is_some() {
                accepted += 1;
            }
        }
        tracing::info!(accepted, dir = %dir.display(), "loaded replay");
        Ok(accepted)
    }
}
