// src/main.rs
//
// CLI entrypoint.
//
// - `hieros run`: resolve the config (CLI > HIEROS_* env > --config file >
//   --preset), print a run header with the config hash, train.
// - `hieros check-determinism`: two runs with the same seed and sequential
//   batch fetching; compares SHA-256 digests of their metrics logs.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{ArgAction, Args, Parser, Subcommand};
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

use hieros::{ConfigPreset, HierosConfig, Trainer, METRICS_FILE};

#[derive(Debug, Parser)]
#[command(
    name = "hieros",
    about = "Hierarchical subgoal reward and replay pipeline",
    version
)]
struct Cli {
    /// Verbosity: -v, -vv (RUST_LOG takes precedence)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Train for the configured number of environment steps.
    Run {
        #[command(flatten)]
        opts: RunOpts,

        /// Preload trajectories saved by an earlier run.
        #[arg(long)]
        replay_from: Option<PathBuf>,
    },
    /// Run twice with the same seed and compare metrics digests.
    CheckDeterminism {
        #[command(flatten)]
        opts: RunOpts,
    },
}

#[derive(Debug, Args)]
struct RunOpts {
    /// YAML file merged over the preset.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ConfigPreset::Default)]
    preset: ConfigPreset,

    #[arg(long)]
    seed: Option<u64>,

    /// Environment steps.
    #[arg(long)]
    steps: Option<u64>,

    #[arg(long)]
    logdir: Option<PathBuf>,

    /// Batch fetch workers (0 = sequential).
    #[arg(long)]
    data_loaders: Option<usize>,

    /// Shape reports and strict replay checks.
    #[arg(long)]
    debug: bool,
}

impl RunOpts {
    fn resolve(&self) -> anyhow::Result<HierosConfig> {
        let mut cfg = HierosConfig::load(self.preset, self.config.as_deref())
            .with_context(|| match &self.config {
                Some(p) => format!("loading config {}", p.display()),
                None => format!("building preset {:?}", self.preset),
            })?;
        cfg.apply_env_overrides();
        if let Some(seed) = self.seed {
            cfg.run.seed = seed;
        }
        if let Some(steps) = self.steps {
            cfg.run.steps = steps;
        }
        if let Some(logdir) = &self.logdir {
            cfg.run.logdir = logdir.clone();
        }
        if let Some(n) = self.data_loaders {
            cfg.run.data_loaders = n;
        }
        if self.debug {
            cfg.run.debug = true;
        }
        cfg.validate().context("invalid configuration")?;
        Ok(cfg)
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn print_header(cfg: &HierosConfig) {
    println!(
        "hieros | cfg_hash=0x{:016x} | seed={} | steps={} | envs={} | depth={} | selector={} | data_loaders={} | logdir={}",
        cfg.config_hash(),
        cfg.run.seed,
        cfg.run.steps,
        cfg.run.envs,
        cfg.hierarchy.depth,
        cfg.replay.selector.as_str(),
        cfg.run.data_loaders,
        cfg.run.logdir.display(),
    );
}

fn run(cfg: HierosConfig, replay_from: Option<&Path>) -> anyhow::Result<()> {
    print_header(&cfg);
    fs::create_dir_all(&cfg.run.logdir)
        .with_context(|| format!("creating logdir {}", cfg.run.logdir.display()))?;
    fs::write(cfg.run.logdir.join("config.yaml"), cfg.to_yaml()?)
        .context("writing resolved config")?;

    let mut trainer = Trainer::with_logdir(cfg).context("building trainer")?;
    if let Some(dir) = replay_from {
        trainer
            .preload_replay(dir)
            .with_context(|| format!("preloading replay from {}", dir.display()))?;
    }
    let summary = trainer.run().context("training run failed")?;
    println!("{}", serde_json::to_string(&summary)?);
    Ok(())
}

fn metrics_digest(logdir: &Path) -> anyhow::Result<String> {
    let path = logdir.join(METRICS_FILE);
    let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    Ok(format!("{:x}", Sha256::digest(&bytes)))
}

fn check_determinism(mut cfg: HierosConfig) -> anyhow::Result<()> {
    if cfg.run.data_loaders != 0 {
        tracing::warn!(
            data_loaders = cfg.run.data_loaders,
            "determinism check uses sequential batch fetching"
        );
        cfg.run.data_loaders = 0;
    }
    cfg.run.save_replay = false;
    print_header(&cfg);

    let root = std::env::temp_dir().join(format!("hieros-determinism-{}", std::process::id()));
    let mut digests = Vec::with_capacity(2);
    for i in 0..2 {
        let mut run_cfg = cfg.clone();
        run_cfg.run.logdir = root.join(format!("run-{i}"));
        let mut trainer = Trainer::with_logdir(run_cfg.clone())
            .with_context(|| format!("building trainer for run {i}"))?;
        trainer
            .run()
            .with_context(|| format!("determinism run {i} failed"))?;
        digests.push(metrics_digest(&run_cfg.run.logdir)?);
    }
    if let Err(e) = fs::remove_dir_all(&root) {
        tracing::warn!(dir = %root.display(), error = %e, "could not remove temp runs");
    }

    println!("run-0 sha256={}", digests[0]);
    println!("run-1 sha256={}", digests[1]);
    if digests[0] != digests[1] {
        bail!("metrics logs differ between runs with seed {}", cfg.run.seed);
    }
    println!("deterministic: metrics logs are byte-identical");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Run { opts, replay_from } => run(opts.resolve()?, replay_from.as_deref()),
        Command::CheckDeterminism { opts } => check_determinism(opts.resolve()?),
    }
}
