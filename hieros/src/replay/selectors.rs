// src/replay/selectors.rs
//
// Replay key selectors.
//
// Every selector keeps three parallel structures in a KeyTable:
// - keys:       live keys by position
// - indices:    key -> position in `keys`
// - key_counts: how often the key at each position has been sampled
//
// Removal mutates all three in one method so a count can never be left
// behind at a stale position. Each selector owns its own seeded ChaCha8Rng.

use std::collections::HashMap;
use std::fmt;

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Beta, Distribution};
use serde::{Deserialize, Serialize};

use super::sum_tree::SumTree;
use crate::error::{HierosError, ReplayConsistencyError, Result};
use crate::seeding::component_rng;

/// Identifier of a stored trajectory. Assigned in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrajectoryKey(pub u64);

impl fmt::Display for TrajectoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "traj-{}", self.0)
    }
}

/// Parallel `keys` / `indices` / `key_counts` arrays.
#[derive(Debug, Clone, Default)]
pub struct KeyTable {
    keys: Vec<TrajectoryKey>,
    indices: HashMap<TrajectoryKey, usize>,
    key_counts: Vec<u64>,
}

/// Outcome of a swap removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapRemoval {
    /// Position the removed key occupied.
    pub position: usize,
    /// Former position of the tail key that now lives at `position`.
    pub moved_from: Option<usize>,
}

impl KeyTable {
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[TrajectoryKey] {
        &self.keys
    }

    pub fn key_counts(&self) -> &[u64] {
        &self.key_counts
    }

    pub fn position(&self, key: TrajectoryKey) -> Option<usize> {
        self.indices.get(&key).copied()
    }

    pub fn count(&self, key: TrajectoryKey) -> Option<u64> {
        self.position(key).map(|i| self.key_counts[i])
    }

    /// Append a key with a zero count. Returns its position.
    pub fn push(&mut self, key: TrajectoryKey) -> std::result::Result<usize, ReplayConsistencyError> {
        if self.indices.contains_key(&key) {
            return Err(self.error("insert", format!("duplicate key {key}")));
        }
        let position = self.keys.len();
        self.keys.push(key);
        self.indices.insert(key, position);
        self.key_counts.push(0);
        self.verify_sizes("insert")?;
        Ok(position)
    }

    /// O(1) removal: the tail moves into the freed slot together with its count.
    pub fn swap_remove(
        &mut self,
        key: TrajectoryKey,
    ) -> std::result::Result<SwapRemoval, ReplayConsistencyError> {
        let position = self
            .indices
            .remove(&key)
            .ok_or_else(|| self.error("remove", format!("unknown key {key}")))?;
        let last = self.keys.len() - 1;
        let moved_from = if position != last {
            let last_key = self.keys[last];
            self.keys[position] = last_key;
            self.key_counts[position] = self.key_counts[last];
            self.indices.insert(last_key, position);
            Some(last)
        } else {
            None
        };
        self.keys.pop();
        self.key_counts.pop();
        self.verify_sizes("remove")?;
        Ok(SwapRemoval {
            position,
            moved_from,
        })
    }

    /// O(n) removal that keeps insertion order.
    pub fn ordered_remove(
        &mut self,
        key: TrajectoryKey,
    ) -> std::result::Result<usize, ReplayConsistencyError> {
        let position = self
            .indices
            .remove(&key)
            .ok_or_else(|| self.error("remove", format!("unknown key {key}")))?;
        self.keys.remove(position);
        self.key_counts.remove(position);
        for (i, k) in self.keys.iter().enumerate().skip(position) {
            self.indices.insert(*k, i);
        }
        self.verify_sizes("remove")?;
        Ok(position)
    }

    /// Record one sample of the key at `position`; returns the new count.
    pub fn bump(&mut self, position: usize) -> (TrajectoryKey, u64) {
        self.key_counts[position] += 1;
        (self.keys[position], self.key_counts[position])
    }

    /// O(1) length check run after every mutation.
    pub fn verify_sizes(&self, operation: &'static str) -> std::result::Result<(), ReplayConsistencyError> {
        if self.keys.len() == self.indices.len() && self.keys.len() == self.key_counts.len() {
            Ok(())
        } else {
            Err(self.error(operation, "parallel arrays have different lengths".to_string()))
        }
    }

    /// Full check: sizes agree and every index points at its own key.
    pub fn verify(&self, operation: &'static str) -> std::result::Result<(), ReplayConsistencyError> {
        self.verify_sizes(operation)?;
        for (key, &i) in &self.indices {
            if self.keys.get(i) != Some(key) {
                return Err(self.error(
                    operation,
                    format!("indices[{key}] = {i} but keys[{i}] = {:?}", self.keys.get(i)),
                ));
            }
        }
        Ok(())
    }

    /// Consistency error carrying the current length of every array.
    pub fn error(&self, operation: &'static str, detail: String) -> ReplayConsistencyError {
        ReplayConsistencyError {
            operation,
            keys: self.keys.len(),
            indices: self.indices.len(),
            key_counts: self.key_counts.len(),
            detail,
        }
    }
}

/// Common capability set of all replay selectors.
pub trait Selector: Send {
    fn kind(&self) -> SelectorKind;

    fn insert(&mut self, key: TrajectoryKey) -> std::result::Result<(), ReplayConsistencyError>;

    fn remove(&mut self, key: TrajectoryKey) -> std::result::Result<(), ReplayConsistencyError>;

    /// Draw a key and record the draw in `key_counts`. `None` when empty.
    fn sample(&mut self) -> Option<TrajectoryKey>;

    fn table(&self) -> &KeyTable;

    fn len(&self) -> usize {
        self.table().len()
    }

    fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    fn check_consistency(&self) -> std::result::Result<(), ReplayConsistencyError> {
        self.table().verify("check")
    }
}

/// Selector variant, as named in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    Uniform,
    TimeBalanced,
    TimeBalancedNaive,
    EfficientTimeBalanced,
}

impl SelectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectorKind::Uniform => "uniform",
            SelectorKind::TimeBalanced => "time_balanced",
            SelectorKind::TimeBalancedNaive => "time_balanced_naive",
            SelectorKind::EfficientTimeBalanced => "efficient_time_balanced",
        }
    }
}

/// Build a selector whose generator is derived from the run seed.
pub fn build_selector(kind: SelectorKind, bias_factor: f64, base_seed: u64) -> Result<Box<dyn Selector>> {
    let rng = component_rng(base_seed, "replay/selector");
    Ok(match kind {
        SelectorKind::Uniform => Box::new(Uniform::new(rng)),
        SelectorKind::TimeBalanced => Box::new(TimeBalanced::new(rng, bias_factor)?),
        SelectorKind::TimeBalancedNaive => Box::new(TimeBalancedNaive::new(rng, bias_factor)?),
        SelectorKind::EfficientTimeBalanced => {
            Box::new(EfficientTimeBalanced::new(rng, bias_factor)?)
        }
    })
}

fn check_bias(bias_factor: f64) -> Result<()> {
    if bias_factor.is_finite() && bias_factor > 0.0 {
        Ok(())
    } else {
        Err(HierosError::InvalidConfig(format!(
            "replay.bias_factor must be finite and > 0, got {bias_factor}"
        )))
    }
}

/// Weight favouring keys that have been sampled less often.
fn undersampled_weight(count: u64, bias_factor: f64) -> f64 {
    (1.0 + count as f64).powf(-bias_factor)
}

/// Uniform over live keys.
pub struct Uniform {
    table: KeyTable,
    rng: ChaCha8Rng,
}

impl Uniform {
    pub fn new(rng: ChaCha8Rng) -> Self {
        Self {
            table: KeyTable::default(),
            rng,
        }
    }
}

impl Selector for Uniform {
    fn kind(&self) -> SelectorKind {
        SelectorKind::Uniform
    }

    fn insert(&mut self, key: TrajectoryKey) -> std::result::Result<(), ReplayConsistencyError> {
        self.table.push(key).map(|_| ())
    }

    fn remove(&mut self, key: TrajectoryKey) -> std::result::Result<(), ReplayConsistencyError> {
        self.table.swap_remove(key).map(|_| ())
    }

    fn sample(&mut self) -> Option<TrajectoryKey> {
        if self.table.is_empty() {
            return None;
        }
        let position = self.rng.gen_range(0..self.table.len());
        Some(self.table.bump(position).0)
    }

    fn table(&self) -> &KeyTable {
        &self.table
    }
}

/// Recency-biased: positions follow insertion order and are drawn from
/// `Beta(bias_factor, 1)`, which puts more mass on newer keys for
/// `bias_factor > 1`.
pub struct TimeBalanced {
    table: KeyTable,
    rng: ChaCha8Rng,
    beta: Beta<f64>,
}

impl TimeBalanced {
    pub fn new(rng: ChaCha8Rng, bias_factor: f64) -> Result<Self> {
        check_bias(bias_factor)?;
        let beta = Beta::new(bias_factor, 1.0)
            .map_err(|e| HierosError::InvalidConfig(format!("beta({bias_factor}, 1): {e}")))?;
        Ok(Self {
            table: KeyTable::default(),
            rng,
            beta,
        })
    }
}

impl Selector for TimeBalanced {
    fn kind(&self) -> SelectorKind {
        SelectorKind::TimeBalanced
    }

    fn insert(&mut self, key: TrajectoryKey) -> std::result::Result<(), ReplayConsistencyError> {
        self.table.push(key).map(|_| ())
    }

    fn remove(&mut self, key: TrajectoryKey) -> std::result::Result<(), ReplayConsistencyError> {
        self.table.ordered_remove(key).map(|_| ())
    }

    fn sample(&mut self) -> Option<TrajectoryKey> {
        let n = self.table.len();
        if n == 0 {
            return None;
        }
        let u = self.beta.sample(&mut self.rng);
        let position = ((u * n as f64) as usize).min(n - 1);
        Some(self.table.bump(position).0)
    }

    fn table(&self) -> &KeyTable {
        &self.table
    }
}

/// Categorical over keys weighted by `1 / (1 + count)^bias_factor`.
/// Linear scan per draw, order-preserving removal.
pub struct TimeBalancedNaive {
    table: KeyTable,
    rng: ChaCha8Rng,
    bias_factor: f64,
}

impl TimeBalancedNaive {
    pub fn new(rng: ChaCha8Rng, bias_factor: f64) -> Result<Self> {
        check_bias(bias_factor)?;
        Ok(Self {
            table: KeyTable::default(),
            rng,
            bias_factor,
        })
    }
}

impl Selector for TimeBalancedNaive {
    fn kind(&self) -> SelectorKind {
        SelectorKind::TimeBalancedNaive
    }

    fn insert(&mut self, key: TrajectoryKey) -> std::result::Result<(), ReplayConsistencyError> {
        self.table.push(key).map(|_| ())
    }

    fn remove(&mut self, key: TrajectoryKey) -> std::result::Result<(), ReplayConsistencyError> {
        self.table.ordered_remove(key).map(|_| ())
    }

    fn sample(&mut self) -> Option<TrajectoryKey> {
        let n = self.table.len();
        if n == 0 {
            return None;
        }
        let weights: Vec<f64> = self
            .table
            .key_counts()
            .iter()
            .map(|&c| undersampled_weight(c, self.bias_factor))
            .collect();
        let total: f64 = weights.iter().sum();
        let mut mass = self.rng.gen::<f64>() * total;
        let mut position = n - 1;
        for (i, w) in weights.iter().enumerate() {
            if mass < *w {
                position = i;
                break;
            }
            mass -= w;
        }
        Some(self.table.bump(position).0)
    }

    fn table(&self) -> &KeyTable {
        &self.table
    }
}

/// Same distribution as [`TimeBalancedNaive`] with O(1) swap removal and
/// O(log n) draws through a sum tree kept aligned with the key table.
pub struct EfficientTimeBalanced {
    table: KeyTable,
    tree: SumTree,
    rng: ChaCha8Rng,
    bias_factor: f64,
}

impl EfficientTimeBalanced {
    pub fn new(rng: ChaCha8Rng, bias_factor: f64) -> Result<Self> {
        check_bias(bias_factor)?;
        Ok(Self {
            table: KeyTable::default(),
            tree: SumTree::default(),
            rng,
            bias_factor,
        })
    }

    fn tree_aligned(&self, operation: &'static str) -> std::result::Result<(), ReplayConsistencyError> {
        if self.tree.len() == self.table.len() {
            Ok(())
        } else {
            Err(self
                .table
                .error(operation, format!("sum tree holds {} leaves", self.tree.len())))
        }
    }
}

impl Selector for EfficientTimeBalanced {
    fn kind(&self) -> SelectorKind {
        SelectorKind::EfficientTimeBalanced
    }

    fn insert(&mut self, key: TrajectoryKey) -> std::result::Result<(), ReplayConsistencyError> {
        self.table.push(key)?;
        self.tree.push(undersampled_weight(0, self.bias_factor));
        self.tree_aligned("insert")
    }

    fn remove(&mut self, key: TrajectoryKey) -> std::result::Result<(), ReplayConsistencyError> {
        let removal = self.table.swap_remove(key)?;
        let tail = self.tree.pop().unwrap_or(0.0);
        if removal.moved_from.is_some() {
            self.tree.set(removal.position, tail);
        }
        self.tree_aligned("remove")
    }

    fn sample(&mut self) -> Option<TrajectoryKey> {
        if self.table.is_empty() {
            return None;
        }
        let mass = self.rng.gen::<f64>() * self.tree.total();
        let position = self.tree.find(mass)?;
        let (key, count) = self.table.bump(position);
        self.tree
            .set(position, undersampled_weight(count, self.bias_factor));
        Some(key)
    }

    fn table(&self) -> &KeyTable {
        &self.table
    }

    fn check_consistency(&self) -> std::result::Result<(), ReplayConsistencyError> {
        self.table.verify("check")?;
        self.tree_aligned("check")?;
        for (i, &c) in self.table.key_counts().iter().enumerate() {
            let expected = undersampled_weight(c, self.bias_factor);
            if (self.tree.get(i) - expected).abs() > 1e-12 {
                return Err(self.table.error(
                    "check",
                    format!("tree weight at {i} does not match key_counts[{i}] = {c}"),
                ));
            }
        }
        Ok(())
    }
}
