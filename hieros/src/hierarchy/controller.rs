// src/hierarchy/controller.rs
//
// Owns the subactor stack.
//
// - Policy time: layers re-propose subgoals top-down on their horizon
//   (`subactor_update_every ^ layer` env steps); the cached code of layer
//   k + 1 is decoded and rewarded against layer k's state; layer 0 acts.
// - Training time: hindsight subgoals are proposed once per horizon-sized
//   segment of the window, top-down; every layer's rewards and moments are
//   staged first and committed only when all layers succeeded.
//
// Per-layer metrics go under `subactor-<i>/`.

use ndarray::{s, Array2, Array3, Axis};

use super::per_layer::PerLayer;
use super::policy::{EpsilonSubgoalPolicy, SoftmaxActionPolicy};
use super::subactor::{LayerPolicy, LayerSettings, Subactor};
use crate::config::HierarchyConfig;
use crate::error::{HierosError, Result, ShapeMismatchError, ShapeStage};
use crate::latent::{FeatureLayout, LatentBatch, LatentState};
use crate::metrics::MetricsContext;
use crate::replay::Batch;
use crate::seeding::component_rng;
use crate::subgoal::{
    LinearSubgoalDecoder, SubgoalCodec, SubgoalReward, SubgoalRewardComputer, SubgoalShapeReport,
};

/// Subgoal codes cached between re-proposals, one slot per layer.
///
/// A cache belongs to one set of environments (train or eval); reusing it
/// with a different batch size is rejected by the codec.
#[derive(Debug, Clone, Default)]
pub struct SubgoalCache {
    codes: Vec<Option<Array3<f32>>>,
}

impl SubgoalCache {
    pub fn new(depth: usize) -> Self {
        Self {
            codes: vec![None; depth],
        }
    }

    pub fn code(&self, layer: usize) -> Option<&Array3<f32>> {
        self.codes.get(layer).and_then(|c| c.as_ref())
    }

    pub fn clear(&mut self) {
        self.codes.iter_mut().for_each(|c| *c = None);
    }
}

/// Effective horizon of `layer`: `update_every ^ layer` lower-level steps.
pub fn horizon(update_every: u64, layer: usize) -> u64 {
    update_every
        .max(1)
        .saturating_pow(u32::try_from(layer).unwrap_or(u32::MAX))
}

pub struct HierarchyController {
    subactors: Vec<Subactor>,
    codec: SubgoalCodec,
    computer: SubgoalRewardComputer,
    debug: bool,
}

impl HierarchyController {
    /// Build the stack with the reference policies. Every per-layer value is
    /// resolved here, so an unresolvable config fails at startup.
    pub fn new(
        config: &HierarchyConfig,
        layout: FeatureLayout,
        num_actions: usize,
        seed: u64,
        debug: bool,
    ) -> Result<Self> {
        let depth = config.depth;
        if depth == 0 {
            return Err(HierosError::InvalidConfig(
                "hierarchy.depth must be >= 1".to_string(),
            ));
        }
        let settings = resolve_settings(config)?;
        let decoder = LinearSubgoalDecoder::new(
            (config.subgoal_shape[0], config.subgoal_shape[1]),
            layout.feature_size(),
            seed,
        )?;

        let mut subactors = Vec::with_capacity(depth);
        for (i, s) in settings.into_iter().enumerate() {
            let rng = component_rng(seed, &format!("policy/layer-{i}"));
            let policy = if i == 0 {
                LayerPolicy::Action(Box::new(SoftmaxActionPolicy::new(
                    layout.feature_size(),
                    num_actions,
                    s.epsilon,
                    s.entropy,
                    rng,
                )?))
            } else {
                LayerPolicy::Subgoal(Box::new(EpsilonSubgoalPolicy::new(s.epsilon, rng)))
            };
            subactors.push(Subactor::new(i, s, policy));
        }

        tracing::info!(
            depth,
            update_every = config.subactor_update_every,
            metric = ?config.reward_metric,
            oversize = ?config.oversize_policy,
            "hierarchy ready"
        );
        Ok(Self::from_parts(
            subactors,
            SubgoalCodec::new(Box::new(decoder)),
            SubgoalRewardComputer::new(config.reward_metric, config.oversize_policy),
            debug,
        ))
    }

    /// Assemble a controller around externally provided policies and codec.
    pub fn from_parts(
        subactors: Vec<Subactor>,
        codec: SubgoalCodec,
        computer: SubgoalRewardComputer,
        debug: bool,
    ) -> Self {
        Self {
            subactors,
            codec,
            computer,
            debug,
        }
    }

    pub fn depth(&self) -> usize {
        self.subactors.len()
    }

    pub fn subactor(&self, layer: usize) -> Option<&Subactor> {
        self.subactors.get(layer)
    }

    pub fn codec(&self) -> &SubgoalCodec {
        &self.codec
    }

    pub fn new_cache(&self) -> SubgoalCache {
        SubgoalCache::new(self.depth())
    }

    /// One acting step for a batch of environments. Layers run top-down:
    /// a due layer proposes with the decoded subgoal of the layer above as
    /// its goal, then its own code is decoded for the layer below. Returns
    /// layer 0's actions.
    pub fn policy_step(
        &mut self,
        cache: &mut SubgoalCache,
        state: &LatentState,
        step: u64,
        explore: bool,
        metrics: &mut MetricsContext,
    ) -> Result<Vec<usize>> {
        let depth = self.depth();
        if cache.codes.len() != depth {
            *cache = self.new_cache();
        }
        let features = state.features()?;
        let flat = LatentBatch::Flat(features.clone());
        let shapes = (state.deter.shape().to_vec(), state.stoch.shape().to_vec());

        let mut parent: Option<Array2<f32>> = None;
        for layer in (1..depth).rev() {
            let sub = &mut self.subactors[layer];
            if cache.codes[layer].is_none() || step % sub.settings().horizon == 0 {
                let metric = sub.metric("subgoal_updates");
                let LayerPolicy::Subgoal(policy) = sub.policy_mut() else {
                    return Err(layer_policy_error(layer, "subgoal"));
                };
                let code = policy
                    .propose(
                        &self.codec,
                        features.view(),
                        parent.as_ref().map(|g| g.view()),
                        explore,
                    )
                    .map_err(|e| record_failure(layer, e, metrics))?;
                cache.codes[layer] = Some(code);
                metrics.sum(&metric, 1.0);
            }
            let Some(code) = cache.codes[layer].as_ref() else {
                continue;
            };
            let (decoded, reward) = self
                .decode_and_reward(layer - 1, code, &flat, &shapes)
                .map_err(|e| record_failure(layer - 1, e, metrics))?;
            metrics.add(
                &self.subactors[layer - 1].metric("policy_subgoal_reward"),
                reward.mean() as f64,
            );
            parent = Some(decoded);
        }

        let LayerPolicy::Action(policy) = self.subactors[0].policy_mut() else {
            return Err(layer_policy_error(0, "action"));
        };
        Ok(policy.act(features.view(), parent.as_ref().map(|g| g.view()), explore))
    }

    /// One training step over a `[B, T]` batch. All layers commit together;
    /// on error nothing is committed and the failure is recorded under the
    /// offending layer.
    pub fn train_step(&mut self, batch: &Batch, metrics: &mut MetricsContext) -> Result<()> {
        let depth = self.depth();
        let seq = match batch.features()? {
            LatentBatch::Sequence(s) => s,
            LatentBatch::Flat(f) => f.insert_axis(Axis(1)),
        };
        let state = LatentBatch::Sequence(seq.clone());
        let shapes = (batch.deter.shape().to_vec(), batch.stoch.shape().to_vec());

        // Hindsight targets, top-down so every proposal sees its parent's goal.
        let mut goals: Vec<Option<Array3<f32>>> = vec![None; depth];
        for layer in (0..depth.saturating_sub(1)).rev() {
            let goal =
                self.hindsight_goals(layer, &seq, goals[layer + 1].as_ref(), &shapes, metrics)?;
            goals[layer] = Some(goal);
        }

        let mut staged = Vec::with_capacity(depth);
        for (layer, goal) in goals.iter().enumerate() {
            let settings = *self.subactors[layer].settings();
            let extr = batch.reward.mapv(|r| r * settings.extr_reward_scale as f32);

            let subgoal_reward = match goal {
                Some(goal) => {
                    let reward = self
                        .reward_sequence(layer, goal, &state, &shapes)
                        .map_err(|e| record_failure(layer, e, metrics))?;
                    match reward {
                        SubgoalReward::PerStep(r) => Some(r),
                        SubgoalReward::PerBatch(r) => {
                            let e = ShapeMismatchError::new(
                                ShapeStage::Reduce,
                                "sequence state produced a per-batch reward",
                                r.shape(),
                                &shapes.0,
                            );
                            return Err(record_failure(layer, e, metrics));
                        }
                    }
                }
                None => None,
            };

            let total = match &subgoal_reward {
                Some(r) => &extr + &r.mapv(|v| v * settings.subgoal_reward_scale as f32),
                None => extr.clone(),
            };
            let moments = self.subactors[layer]
                .moments()
                .staged(total.iter().copied());
            staged.push(StagedLayer {
                moments,
                extr,
                subgoal_reward,
                total,
            });
        }

        for (sub, layer) in self.subactors.iter_mut().zip(staged) {
            sub.commit(layer.moments);
            let s = *sub.settings();
            metrics.add(&sub.metric("extr_reward"), mean(&layer.extr));
            if let Some(r) = &layer.subgoal_reward {
                metrics.add(&sub.metric("subgoal_reward"), mean(r));
            }
            metrics.add(&sub.metric("reward"), mean(&layer.total));
            metrics.max(
                &sub.metric("reward_max"),
                layer.total.iter().fold(f32::NEG_INFINITY, |a, b| a.max(*b)) as f64,
            );
            metrics.add(
                &sub.metric("normed_reward"),
                mean(&layer.total) / layer.moments.scale(),
            );
            metrics.scalar(&sub.metric("return_low"), layer.moments.low);
            metrics.scalar(&sub.metric("return_high"), layer.moments.high);
            metrics.scalar(&sub.metric("return_scale"), layer.moments.scale());
            metrics.scalar(&sub.metric("epsilon"), s.epsilon);
            metrics.scalar(&sub.metric("entropy"), s.entropy);
            metrics.scalar(&sub.metric("horizon"), s.horizon as f64);
            metrics.scalar(&sub.metric("train_steps"), sub.train_steps() as f64);
        }
        Ok(())
    }

    /// Decoded `[B, T, F]` hindsight subgoal for `layer`.
    ///
    /// The window is cut into segments of the proposing layer's horizon.
    /// Each segment gets one greedy proposal made from its last state (and
    /// the parent goal at that step), held over the whole segment the way
    /// the cache holds it while acting.
    pub(crate) fn hindsight_goals(
        &mut self,
        layer: usize,
        seq: &Array3<f32>,
        parent: Option<&Array3<f32>>,
        shapes: &(Vec<usize>, Vec<usize>),
        metrics: &mut MetricsContext,
    ) -> Result<Array3<f32>> {
        let proposer = layer + 1;
        let (b, t, _) = seq.dim();
        let segment = usize::try_from(self.subactors[proposer].settings().horizon)
            .unwrap_or(usize::MAX)
            .max(1);
        let report = self.report(layer, shapes);
        let LayerPolicy::Subgoal(policy) = self.subactors[proposer].policy_mut() else {
            return Err(layer_policy_error(proposer, "subgoal"));
        };

        let mut goals = Array3::<f32>::zeros((b, t, self.codec.feature_size()));
        for start in (0..t).step_by(segment) {
            let end = start.saturating_add(segment).min(t);
            let last = seq.index_axis(Axis(1), end - 1);
            let parent_goal = parent.map(|p| p.index_axis(Axis(1), end - 1));
            let code = policy
                .propose(&self.codec, last, parent_goal, false)
                .map_err(|e| record_failure(layer, e, metrics))?;
            let decoded = self.codec.decode(&code, b).map_err(|e| {
                let report = report.clone().map(|r| r.cached_subgoal(code.shape()));
                record_failure(layer, attach_report(e, report), metrics)
            })?;
            goals
                .slice_mut(s![.., start..end, ..])
                .assign(&decoded.insert_axis(Axis(1)));
        }
        Ok(goals)
    }

    /// Decode `code` for `layer` and reward it against `state`.
    fn decode_and_reward(
        &self,
        layer: usize,
        code: &Array3<f32>,
        state: &LatentBatch,
        shapes: &(Vec<usize>, Vec<usize>),
    ) -> std::result::Result<(Array2<f32>, SubgoalReward), ShapeMismatchError> {
        let report = self
            .report(layer, shapes)
            .map(|r| r.cached_subgoal(code.shape()));
        let decoded = match self.codec.decode(code, state.batch()) {
            Ok(d) => d,
            Err(e) => return Err(attach_report(e, report)),
        };
        let report = report.map(|r| {
            let (b, f) = decoded.dim();
            r.decoded_subgoal(decoded.shape())
                .aligned(&[b, 1, f], &time_shape(state))
        });
        let reward = self.reward_with_report(&LatentBatch::Flat(decoded.clone()), state, report)?;
        Ok((decoded, reward))
    }

    /// Reward a `[B, T, F]` subgoal held per step against `state`.
    fn reward_sequence(
        &self,
        layer: usize,
        goal: &Array3<f32>,
        state: &LatentBatch,
        shapes: &(Vec<usize>, Vec<usize>),
    ) -> std::result::Result<SubgoalReward, ShapeMismatchError> {
        let report = self.report(layer, shapes).map(|r| {
            let (b, _, f) = goal.dim();
            r.decoded_subgoal(&[b, f])
                .aligned(goal.shape(), &time_shape(state))
        });
        self.reward_with_report(&LatentBatch::Sequence(goal.clone()), state, report)
    }

    fn reward_with_report(
        &self,
        subgoal: &LatentBatch,
        state: &LatentBatch,
        report: Option<SubgoalShapeReport>,
    ) -> std::result::Result<SubgoalReward, ShapeMismatchError> {
        match self.computer.reward(subgoal, state) {
            Ok(reward) => {
                if let Some(r) = report {
                    r.check().emit();
                }
                Ok(reward)
            }
            Err(e) => Err(attach_report(e, report)),
        }
    }

    fn report(
        &self,
        layer: usize,
        shapes: &(Vec<usize>, Vec<usize>),
    ) -> Option<SubgoalShapeReport> {
        self.debug
            .then(|| SubgoalShapeReport::new(layer).state(&shapes.0, &shapes.1))
    }
}

fn attach_report(
    error: ShapeMismatchError,
    report: Option<SubgoalShapeReport>,
) -> ShapeMismatchError {
    match report {
        Some(r) => {
            let r = r.check();
            r.emit();
            error.with_dump(r.render())
        }
        None => error,
    }
}

fn time_shape(state: &LatentBatch) -> Vec<usize> {
    match state {
        LatentBatch::Flat(s) => vec![s.nrows(), 1, s.ncols()],
        LatentBatch::Sequence(s) => s.shape().to_vec(),
    }
}

fn record_failure(
    layer: usize,
    error: ShapeMismatchError,
    metrics: &mut MetricsContext,
) -> HierosError {
    metrics.sum(&format!("subactor-{layer}/shape_mismatch"), 1.0);
    tracing::warn!(subactor = layer, stage = %error.stage, "{}", error.reason);
    error.into()
}

struct StagedLayer {
    moments: super::moments::RewardMoments,
    extr: Array2<f32>,
    subgoal_reward: Option<Array2<f32>>,
    total: Array2<f32>,
}

fn mean(a: &Array2<f32>) -> f64 {
    a.mean().unwrap_or(0.0) as f64
}

fn layer_policy_error(layer: usize, expected: &str) -> HierosError {
    HierosError::InvalidConfig(format!("subactor-{layer} needs a {expected} policy"))
}

fn resolve_settings(config: &HierarchyConfig) -> Result<Vec<LayerSettings>> {
    let depth = config.depth;
    let resolve = |name: &str, v: &PerLayer<f64>| v.resolve(name, depth);
    let entropy = resolve("entropy", &config.entropy)?;
    let epsilon = resolve("epsilon", &config.epsilon)?;
    let subgoal = resolve("subgoal_reward_scale", &config.subgoal_reward_scale)?;
    let extr = resolve("extr_reward_scale", &config.extr_reward_scale)?;
    Ok((0..depth)
        .map(|i| LayerSettings {
            entropy: entropy[i],
            epsilon: epsilon[i],
            subgoal_reward_scale: subgoal[i],
            extr_reward_scale: extr[i],
            horizon: horizon(config.subactor_update_every, i),
        })
        .collect())
}
