// src/config.rs
//
// Run configuration.
//
// Layering (lowest to highest): preset -> YAML file -> HIEROS_* environment
// variables -> CLI flags. The file is merged key by key over the preset, so
// a file only needs the values it changes. `validate` runs once at startup
// and resolves every per-layer value against `hierarchy.depth`.

use std::fs;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;

use crate::env::PinPadLayout;
use crate::error::{HierosError, Result};
use crate::hierarchy::PerLayer;
use crate::latent::FeatureLayout;
use crate::replay::{ReplayStoreConfig, SelectorKind};
use crate::seeding::fnv1a64;
use crate::subgoal::{OversizePolicy, SimilarityMetric};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub seed: u64,
    /// Environment steps (summed over train envs).
    pub steps: u64,
    pub envs: usize,
    pub eval_envs: usize,
    pub logdir: PathBuf,
    /// Shape reports on every subgoal reward, full selector checks.
    pub debug: bool,
    /// Batch fetch workers; 0 fetches sequentially on the loop thread.
    pub data_loaders: usize,
    pub log_every: u64,
    /// 0 disables evaluation.
    pub eval_every: u64,
    pub eval_eps: usize,
    /// Training steps per environment step.
    pub train_ratio: f64,
    /// Environment steps collected before the first training step.
    pub train_fill: u64,
    /// Exploration is on before this step (0: always).
    pub expl_until: u64,
    /// Save the replay store under `logdir/replay` at the end of the run.
    pub save_replay: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            steps: 10_000,
            envs: 4,
            eval_envs: 1,
            logdir: PathBuf::from("logdir/hieros"),
            debug: false,
            data_loaders: 0,
            log_every: 50,
            eval_every: 500,
            eval_eps: 1,
            train_ratio: 0.25,
            train_fill: 500,
            expl_until: 0,
            save_replay: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplayConfig {
    /// Stored transitions before the oldest episodes are evicted.
    pub capacity: usize,
    pub min_length: usize,
    pub selector: SelectorKind,
    pub bias_factor: f64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            min_length: 16,
            selector: SelectorKind::EfficientTimeBalanced,
            bias_factor: 1.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    pub size: usize,
    pub length: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: 16,
            length: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HierarchyConfig {
    pub depth: usize,
    pub subactor_update_every: u64,
    /// `[d1, d2]` subgoal code grid.
    pub subgoal_shape: [usize; 2],
    pub reward_metric: SimilarityMetric,
    pub oversize_policy: OversizePolicy,
    pub entropy: PerLayer<f64>,
    pub epsilon: PerLayer<f64>,
    pub subgoal_reward_scale: PerLayer<f64>,
    pub extr_reward_scale: PerLayer<f64>,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            depth: 3,
            subactor_update_every: 8,
            subgoal_shape: [8, 8],
            reward_metric: SimilarityMetric::Cosine,
            oversize_policy: OversizePolicy::Error,
            entropy: PerLayer::Scalar(3e-4),
            epsilon: PerLayer::Sequence(vec![0.2, 0.1]),
            subgoal_reward_scale: PerLayer::Scalar(1.0),
            extr_reward_scale: PerLayer::Scalar(1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EnvConfig {
    pub task: PinPadLayout,
    pub length: u64,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            task: PinPadLayout::Three,
            length: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HierosConfig {
    pub run: RunConfig,
    pub replay: ReplayConfig,
    pub batch: BatchConfig,
    pub world_model: FeatureLayout,
    pub hierarchy: HierarchyConfig,
    pub env: EnvConfig,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigPreset {
    Default,
    /// Small, fast settings with shape debugging on.
    Debug,
}

impl ConfigPreset {
    pub fn config(&self) -> HierosConfig {
        match self {
            ConfigPreset::Default => HierosConfig::default(),
            ConfigPreset::Debug => HierosConfig {
                run: RunConfig {
                    steps: 200,
                    envs: 2,
                    eval_envs: 1,
                    logdir: PathBuf::from("logdir/hieros-debug"),
                    debug: true,
                    log_every: 50,
                    eval_every: 30,
                    eval_eps: 1,
                    train_ratio: 0.5,
                    train_fill: 40,
                    ..RunConfig::default()
                },
                replay: ReplayConfig {
                    capacity: 5_000,
                    min_length: 8,
                    ..ReplayConfig::default()
                },
                batch: BatchConfig { size: 4, length: 8 },
                world_model: FeatureLayout::new(32, 4, 4),
                hierarchy: HierarchyConfig {
                    depth: 2,
                    subactor_update_every: 4,
                    subgoal_shape: [4, 4],
                    ..HierarchyConfig::default()
                },
                env: EnvConfig {
                    task: PinPadLayout::Three,
                    length: 20,
                },
            },
        }
    }
}

/// Deep-merge `overlay` into `base`: mappings merge key by key, anything
/// else replaces.
fn merge_yaml(base: &mut YamlValue, overlay: YamlValue) {
    match (base, overlay) {
        (YamlValue::Mapping(base), YamlValue::Mapping(overlay)) => {
            for (k, v) in overlay {
                match base.get_mut(&k) {
                    Some(slot) => merge_yaml(slot, v),
                    None => {
                        base.insert(k, v);
                    }
                }
            }
        }
        (slot, v) => *slot = v,
    }
}

impl HierosConfig {
    /// Preset overlaid with an optional YAML file.
    pub fn load(preset: ConfigPreset, path: Option<&Path>) -> Result<Self> {
        let mut value = serde_yaml::to_value(preset.config())?;
        if let Some(path) = path {
            let text = fs::read_to_string(path)?;
            let overlay: YamlValue = serde_yaml::from_str(&text)?;
            if !overlay.is_null() {
                merge_yaml(&mut value, overlay);
            }
        }
        Ok(serde_yaml::from_value(value)?)
    }

    /// Apply `HIEROS_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply `HIEROS_*` overrides from `lookup`. Unparseable values are
    /// ignored with a warning.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        override_parsed(&lookup, "HIEROS_SEED", &mut self.run.seed);
        override_parsed(&lookup, "HIEROS_STEPS", &mut self.run.steps);
        override_parsed(&lookup, "HIEROS_DATA_LOADERS", &mut self.run.data_loaders);
        if let Some(raw) = lookup("HIEROS_DEBUG") {
            match parse_bool(&raw) {
                Some(v) => self.run.debug = v,
                None => tracing::warn!(
                    "could not parse HIEROS_DEBUG = {raw:?} as bool; keeping {}",
                    self.run.debug
                ),
            }
        }
        if let Some(raw) = lookup("HIEROS_LOGDIR") {
            if raw.is_empty() {
                tracing::warn!("empty HIEROS_LOGDIR; keeping {}", self.run.logdir.display());
            } else {
                self.run.logdir = PathBuf::from(raw);
            }
        }
    }

    /// Startup checks. Every per-layer value is resolved here.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(HierosError::InvalidConfig(msg));
        let h = &self.hierarchy;
        if h.depth == 0 {
            return invalid("hierarchy.depth must be >= 1".to_string());
        }
        if h.subactor_update_every == 0 {
            return invalid("hierarchy.subactor_update_every must be >= 1".to_string());
        }
        if h.subgoal_shape.iter().any(|d| *d == 0) {
            return invalid(format!("hierarchy.subgoal_shape {:?} has an empty axis", h.subgoal_shape));
        }
        for (name, value) in [
            ("entropy", &h.entropy),
            ("epsilon", &h.epsilon),
            ("subgoal_reward_scale", &h.subgoal_reward_scale),
            ("extr_reward_scale", &h.extr_reward_scale),
        ] {
            if value.explicit_len() > h.depth {
                return invalid(format!(
                    "hierarchy.{name} has {} values for depth {}",
                    value.explicit_len(),
                    h.depth
                ));
            }
            value.resolve(name, h.depth)?;
        }
        if self.world_model.deter == 0 || self.world_model.stoch == 0 || self.world_model.classes == 0
        {
            return invalid(format!("world_model sizes must be > 0, got {:?}", self.world_model));
        }
        if self.run.envs == 0 {
            return invalid("run.envs must be >= 1".to_string());
        }
        if self.run.eval_every > 0 && (self.run.eval_envs == 0 || self.run.eval_eps == 0) {
            return invalid("evaluation needs run.eval_envs >= 1 and run.eval_eps >= 1".to_string());
        }
        if !(self.run.train_ratio.is_finite() && self.run.train_ratio >= 0.0) {
            return invalid(format!("run.train_ratio must be >= 0, got {}", self.run.train_ratio));
        }
        if self.batch.size == 0 || self.batch.length == 0 {
            return invalid("batch.size and batch.length must be > 0".to_string());
        }
        if self.batch.length > self.replay.min_length {
            return invalid(format!(
                "batch.length {} exceeds replay.min_length {}",
                self.batch.length, self.replay.min_length
            ));
        }
        // An episode stores its reset step plus `length` steps.
        if self.replay.min_length as u64 > self.env.length + 1 {
            return invalid(format!(
                "replay.min_length {} can never be reached with env.length {}",
                self.replay.min_length, self.env.length
            ));
        }
        if self.replay.capacity < self.replay.min_length {
            return invalid("replay.capacity must be >= replay.min_length".to_string());
        }
        if !(self.replay.bias_factor.is_finite() && self.replay.bias_factor > 0.0) {
            return invalid(format!(
                "replay.bias_factor must be > 0, got {}",
                self.replay.bias_factor
            ));
        }
        Ok(())
    }

    pub fn replay_store(&self) -> ReplayStoreConfig {
        ReplayStoreConfig {
            capacity: self.replay.capacity,
            min_length: self.replay.min_length,
            selector: self.replay.selector,
            bias_factor: self.replay.bias_factor,
            strict: self.run.debug,
        }
    }

    /// Stable hash of the resolved config, shown in the run header.
    pub fn config_hash(&self) -> u64 {
        fnv1a64(&format!("{:?}", self))
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

fn override_parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T)
where
    T: std::str::FromStr + std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(v) => {
            tracing::info!("{key} = {v} (overrode config)");
            *slot = v;
        }
        Err(_) => tracing::warn!("could not parse {key} = {raw:?}; keeping {slot}"),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_presets_validate() {
        ConfigPreset::Default.config().validate().unwrap();
        ConfigPreset::Debug.config().validate().unwrap();
    }

    #[test]
    fn test_file_overlays_preset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.yaml");
        fs::write(
            &path,
            "run:\n  seed: 9\nhierarchy:\n  epsilon: 0.3\n  entropy: [0.1, 0.01]\n",
        )
        .unwrap();
        let cfg = HierosConfig::load(ConfigPreset::Debug, Some(&path)).unwrap();
        assert_eq!(cfg.run.seed, 9);
        // Untouched preset values survive.
        assert_eq!(cfg.run.steps, 200);
        assert_eq!(cfg.hierarchy.depth, 2);
        assert_eq!(cfg.hierarchy.epsilon, PerLayer::Scalar(0.3));
        assert_eq!(cfg.hierarchy.entropy, PerLayer::Sequence(vec![0.1, 0.01]));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "run:\n  sede: 1\n").unwrap();
        assert!(HierosConfig::load(ConfigPreset::Default, Some(&path)).is_err());
    }

    #[test]
    fn test_env_overrides_and_bad_values() {
        let mut cfg = HierosConfig::default();
        cfg.apply_overrides_from(lookup(&[
            ("HIEROS_SEED", "42"),
            ("HIEROS_STEPS", "not-a-number"),
            ("HIEROS_DEBUG", "true"),
            ("HIEROS_DATA_LOADERS", "3"),
            ("HIEROS_LOGDIR", "/tmp/x"),
        ]));
        assert_eq!(cfg.run.seed, 42);
        assert_eq!(cfg.run.steps, RunConfig::default().steps);
        assert!(cfg.run.debug);
        assert_eq!(cfg.run.data_loaders, 3);
        assert_eq!(cfg.run.logdir, PathBuf::from("/tmp/x"));
    }

    #[test]
    fn test_empty_per_layer_sequence_fails_validation() {
        let mut cfg = HierosConfig::default();
        cfg.hierarchy.entropy = PerLayer::Sequence(vec![]);
        assert!(matches!(
            cfg.validate(),
            Err(HierosError::ConfigResolution(_))
        ));
    }

    #[test]
    fn test_per_layer_sequence_longer_than_depth_rejected() {
        let mut cfg = HierosConfig::default();
        cfg.hierarchy.epsilon = PerLayer::Sequence(vec![0.1; 4]);
        assert!(matches!(cfg.validate(), Err(HierosError::InvalidConfig(_))));
    }

    #[test]
    fn test_batch_longer_than_min_length_rejected() {
        let mut cfg = HierosConfig::default();
        cfg.batch.length = cfg.replay.min_length + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_config_hash_tracks_changes() {
        let a = HierosConfig::default();
        let mut b = a.clone();
        assert_eq!(a.config_hash(), b.config_hash());
        b.run.seed += 1;
        assert_ne!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn test_yaml_round_trip() {
        let cfg = ConfigPreset::Debug.config();
        let back: HierosConfig = serde_yaml::from_str(&cfg.to_yaml().unwrap()).unwrap();
        assert_eq!(back, cfg);
    }
}
