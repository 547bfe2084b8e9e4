// src/trainer.rs
//
// Single-threaded acting and learning loop.
//
// Each iteration:
//   1) evaluation / logging cadences (one metrics record per logged step)
//   2) world model observe -> controller policy step -> env step, all train envs
//   3) finished episodes enter the replay store
//   4) `train_ratio` training steps: batcher -> controller train step
//
// `step` counts environment steps summed over the train envs. Subgoal
// horizons count loop iterations. On any error the pending metrics are
// flushed at the current step before the error is returned, unless that
// step already has a record.

use std::path::Path;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::config::HierosConfig;
use crate::env::{EnvStep, PositionStats, VecEnv};
use crate::error::{HierosError, Result};
use crate::hierarchy::{HierarchyController, SubgoalCache};
use crate::latent::LatentState;
use crate::logging::{JsonlSink, MetricsSink};
use crate::metrics::{MetricsContext, MetricsRecord};
use crate::replay::{Batcher, ReplayStats, ReplayStore, TrajectoryBuilder, TrajectoryStep};
use crate::schedule::{Every, Ratio, Until};
use crate::seeding::{env_seed, eval_env_seed};
use crate::world_model::{ProjectionWorldModel, WorldModel};

/// Name of the metrics log inside `run.logdir`.
pub const METRICS_FILE: &str = "metrics.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub env_steps: u64,
    pub train_steps: u64,
    pub episodes: u64,
    pub eval_episodes: u64,
    pub replay: ReplayCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplayCounts {
    pub trajectories: usize,
    pub transitions: usize,
    pub inserts: u64,
    pub evictions: u64,
}

/// Acting state for one set of environments.
struct Rollout {
    envs: VecEnv,
    current: Vec<EnvStep>,
    latent: LatentState,
    prev_actions: Vec<usize>,
    cache: SubgoalCache,
}

impl Rollout {
    fn new(mut envs: VecEnv, model: &dyn WorldModel, cache: SubgoalCache) -> Self {
        let n = envs.num_envs();
        let current = envs.reset_all(None);
        Self {
            envs,
            current,
            latent: model.initial(n),
            prev_actions: vec![0; n],
            cache,
        }
    }

    fn restart(&mut self, model: &dyn WorldModel) {
        let n = self.envs.num_envs();
        self.current = self.envs.reset_all(None);
        self.latent = model.initial(n);
        self.prev_actions = vec![0; n];
        self.cache.clear();
    }

    /// Posterior latents for the current observations.
    fn observe(&mut self, model: &dyn WorldModel) -> Result<()> {
        let obs = stack_obs(&self.current, self.envs.obs_dim())?;
        let is_first: Vec<bool> = self.current.iter().map(|s| s.is_first).collect();
        self.latent = model.observe(&self.latent, obs.view(), &self.prev_actions, &is_first)?;
        Ok(())
    }

    fn advance(&mut self, actions: Vec<usize>) -> Result<()> {
        self.current = self.envs.step(&actions)?;
        self.prev_actions = actions;
        Ok(())
    }
}

fn stack_obs(steps: &[EnvStep], obs_dim: usize) -> Result<Array2<f32>> {
    let mut flat = Vec::with_capacity(steps.len() * obs_dim);
    for (i, s) in steps.iter().enumerate() {
        if s.obs.len() != obs_dim {
            return Err(HierosError::InvalidConfig(format!(
                "env {i} returned {} observation features, expected {obs_dim}",
                s.obs.len()
            )));
        }
        flat.extend_from_slice(&s.obs);
    }
    Array2::from_shape_vec((steps.len(), obs_dim), flat)
        .map_err(|e| HierosError::InvalidConfig(format!("observation batch: {e}")))
}

pub struct Trainer {
    config: HierosConfig,
    model: Box<dyn WorldModel>,
    controller: HierarchyController,
    store: ReplayStore,
    batcher: Batcher,
    metrics: MetricsContext,
    sink: Box<dyn MetricsSink>,

    train: Rollout,
    eval: Option<Rollout>,
    builders: Vec<TrajectoryBuilder>,

    log_every: Every,
    eval_every: Every,
    train_ratio: Ratio,
    explore: Until,

    step: u64,
    iterations: u64,
    last_flush: Option<u64>,
    summary: RunSummary,
}

impl Trainer {
    /// Build every component from a validated config. Metrics go to `sink`.
    pub fn new(config: HierosConfig, sink: Box<dyn MetricsSink>) -> Result<Self> {
        config.validate()?;
        let seed = config.run.seed;
        let run = &config.run;

        let envs = VecEnv::pinpad(config.env.task, config.env.length, run.envs, |i| {
            env_seed(seed, i)
        })?;
        let eval_envs = if run.eval_every > 0 {
            Some(VecEnv::pinpad(
                config.env.task,
                config.env.length,
                run.eval_envs,
                |i| eval_env_seed(seed, i),
            )?)
        } else {
            None
        };

        let model: Box<dyn WorldModel> = Box::new(ProjectionWorldModel::new(
            config.world_model,
            envs.obs_dim(),
            envs.num_actions(),
            seed,
        )?);
        let controller = HierarchyController::new(
            &config.hierarchy,
            config.world_model,
            envs.num_actions(),
            seed,
            run.debug,
        )?;
        let store = ReplayStore::new(config.replay_store(), seed)?;
        let batcher = Batcher::new(config.batch.size, config.batch.length, run.data_loaders)?;

        let builders = (0..envs.num_envs()).map(TrajectoryBuilder::new).collect();
        let train = Rollout::new(envs, model.as_ref(), controller.new_cache());
        let eval = eval_envs.map(|e| Rollout::new(e, model.as_ref(), controller.new_cache()));

        tracing::info!(
            seed,
            envs = run.envs,
            eval_envs = eval.as_ref().map_or(0, |e| e.envs.num_envs()),
            data_loaders = run.data_loaders,
            selector = config.replay.selector.as_str(),
            "trainer ready"
        );

        Ok(Self {
            log_every: Every::new(run.log_every),
            eval_every: Every::new(run.eval_every),
            train_ratio: Ratio::new(run.train_ratio),
            explore: Until::new(run.expl_until),
            config,
            model,
            controller,
            store,
            batcher,
            metrics: MetricsContext::new(),
            sink,
            train,
            eval,
            builders,
            step: 0,
            iterations: 0,
            last_flush: None,
            summary: RunSummary::default(),
        })
    }

    /// Trainer writing `metrics.jsonl` under `run.logdir`.
    pub fn with_logdir(config: HierosConfig) -> Result<Self> {
        let path = config.run.logdir.join(METRICS_FILE);
        Self::new(config, Box::new(JsonlSink::new(path)))
    }

    pub fn config(&self) -> &HierosConfig {
        &self.config
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn store(&self) -> &ReplayStore {
        &self.store
    }

    pub fn controller(&self) -> &HierarchyController {
        &self.controller
    }

    /// Insert previously saved trajectories before training starts.
    pub fn preload_replay(&mut self, dir: &Path) -> Result<usize> {
        self.store.load(dir)
    }

    /// Run until `run.steps` environment steps.
    pub fn run(&mut self) -> Result<RunSummary> {
        self.run_until(self.config.run.steps)
    }

    pub fn run_until(&mut self, steps: u64) -> Result<RunSummary> {
        match self.run_inner(steps) {
            Ok(()) => {
                self.log_stats();
                self.flush()?;
                if self.config.run.save_replay {
                    let dir = self.config.run.logdir.join("replay");
                    self.store
                        .save(&dir, self.train.envs.obs_dim(), self.config.world_model)?;
                }
                self.summary.env_steps = self.step;
                self.summary.replay = self.replay_counts();
                tracing::info!(
                    env_steps = self.summary.env_steps,
                    train_steps = self.summary.train_steps,
                    episodes = self.summary.episodes,
                    "run finished"
                );
                Ok(self.summary)
            }
            Err(e) => {
                tracing::error!(step = self.step, error = %e, "run aborted");
                if let Err(flush_err) = self.flush() {
                    tracing::warn!(error = %flush_err, "could not flush metrics after failure");
                }
                Err(e)
            }
        }
    }

    fn run_inner(&mut self, steps: u64) -> Result<()> {
        while self.step < steps {
            let eval_due = self.eval.is_some() && self.eval_every.due(self.step);
            let log_due = self.log_every.due(self.step);
            if eval_due {
                self.evaluate()?;
            }
            if log_due {
                self.log_stats();
            }
            if eval_due || log_due {
                self.flush()?;
            }

            self.act()?;

            if self.step >= self.config.run.train_fill && !self.store.is_empty() {
                for _ in 0..self.train_ratio.owed(self.step) {
                    self.train_once()?;
                }
            }
        }
        Ok(())
    }

    fn act(&mut self) -> Result<()> {
        let explore = self.explore.active(self.step);
        self.train.observe(self.model.as_ref())?;
        let actions = self.controller.policy_step(
            &mut self.train.cache,
            &self.train.latent,
            self.iterations,
            explore,
            &mut self.metrics,
        )?;

        for (i, builder) in self.builders.iter_mut().enumerate() {
            let env_step = &self.train.current[i];
            let (deter, stoch) = self.train.latent.row(i);
            let finished = builder.push(TrajectoryStep {
                obs: env_step.obs.clone(),
                action: if env_step.is_first { 0 } else { self.train.prev_actions[i] },
                reward: env_step.reward,
                is_first: env_step.is_first,
                is_last: env_step.is_last,
                is_terminal: env_step.is_terminal,
                deter,
                stoch,
            });
            if let Some(trajectory) = finished {
                self.metrics.add("episode/score", trajectory.score());
                self.metrics.add("episode/length", trajectory.len() as f64);
                self.summary.episodes += 1;
                self.store.insert(trajectory)?;
            }
        }

        let n = self.train.envs.num_envs() as u64;
        self.train.advance(actions)?;
        self.step += n;
        self.iterations += 1;
        Ok(())
    }

    fn train_once(&mut self) -> Result<()> {
        let batch = self.batcher.next_batch(&mut self.store)?;
        self.controller.train_step(&batch, &mut self.metrics)?;
        self.summary.train_steps += 1;
        self.metrics
            .scalar("train/steps", self.summary.train_steps as f64);
        Ok(())
    }

    /// Run `eval_eps` greedy episodes on the eval envs.
    fn evaluate(&mut self) -> Result<()> {
        let Some(eval) = self.eval.as_mut() else {
            return Ok(());
        };
        eval.restart(self.model.as_ref());
        let n = eval.envs.num_envs();
        let wanted = self.config.run.eval_eps;
        // Policy diagnostics from evaluation are not part of the train log.
        let mut scratch = MetricsContext::new();
        let mut scores = vec![0.0f64; n];
        let mut lengths = vec![0u64; n];
        let mut done = 0usize;
        let mut t = 0u64;

        while done < wanted {
            eval.observe(self.model.as_ref())?;
            let actions = match self.controller.policy_step(
                &mut eval.cache,
                &eval.latent,
                t,
                false,
                &mut scratch,
            ) {
                Ok(actions) => actions,
                Err(e) => {
                    // Failure counters still belong in the train log.
                    self.metrics.absorb_counters(&scratch, "/shape_mismatch");
                    return Err(e);
                }
            };
            for (i, s) in eval.current.iter().enumerate() {
                if s.is_first {
                    scores[i] = 0.0;
                    lengths[i] = 0;
                }
                scores[i] += s.reward as f64;
                lengths[i] += 1;
                if s.is_last && done < wanted {
                    self.metrics.add("eval_episode/score", scores[i]);
                    self.metrics.add("eval_episode/length", lengths[i] as f64);
                    self.metrics.max("eval_episode/score_max", scores[i]);
                    done += 1;
                }
            }
            if done >= wanted {
                break;
            }
            eval.advance(actions)?;
            t += 1;
        }
        self.metrics.scalar("eval_episode/count", done as f64);
        self.summary.eval_episodes += done as u64;
        tracing::info!(
            step = self.step,
            score = self.metrics.peek("eval_episode/score").unwrap_or(0.0),
            "evaluation"
        );
        Ok(())
    }

    fn log_stats(&mut self) {
        self.store.report(&mut self.metrics);
        let stats = self.train.envs.position_stats();
        if !stats.is_empty() {
            add_position_stats(&mut self.metrics, &stats);
        }
        self.metrics.scalar("train/env_steps", self.step as f64);
    }

    /// At most one record per step. Anything recorded after a step was
    /// written stays pending for the next logged step.
    fn flush(&mut self) -> Result<Option<MetricsRecord>> {
        if self.last_flush == Some(self.step) {
            return Ok(None);
        }
        let record = self.metrics.flush(self.step, self.sink.as_mut())?;
        if record.is_some() {
            self.last_flush = Some(self.step);
        }
        Ok(record)
    }

    fn replay_counts(&self) -> ReplayCounts {
        let ReplayStats {
            inserts, evictions, ..
        } = self.store.stats();
        ReplayCounts {
            trajectories: self.store.len(),
            transitions: self.store.transitions(),
            inserts,
            evictions,
        }
    }
}

fn add_position_stats(metrics: &mut MetricsContext, stats: &[PositionStats]) {
    let n = stats.len() as f64;
    let mean = |f: fn(&PositionStats) -> f64| stats.iter().map(f).sum::<f64>() / n;
    metrics.scalar("env/coverage_ratio", mean(|s| s.coverage_ratio));
    metrics.scalar(
        "env/unique_positions_visited",
        mean(|s| s.unique_positions_visited as f64),
    );
    metrics.scalar(
        "env/mean_visits_per_visited_position",
        mean(|s| s.mean_visits_per_visited_position),
    );
    metrics.scalar(
        "env/max_visits_single_position",
        stats
            .iter()
            .map(|s| s.max_visits_single_position as f64)
            .fold(0.0, f64::max),
    );
}
