// src/main.rs
//
// Research-harness CLI for pwnet.
//
// - Preset precedence: --preset, then PWNET_PRESET, then LunarLander.
// - PWNET_* environment overrides are applied before CLI flags.
// - `run` performs the full experiment on the synthetic environment;
//   `collect` only collects and persists the dataset.

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};

use pwnet::config::{resolve_effective_preset, Preset, WrapperConfig};
use pwnet::experiment::synthetic_experiment;

#[derive(Copy, Clone, Debug, ValueEnum)]
enum PresetArg {
    BipedalWalker,
    CarRacing,
    LunarLander,
}

impl From<PresetArg> for Preset {
    fn from(p: PresetArg) -> Self {
        match p {
            PresetArg::BipedalWalker => Preset::BipedalWalker,
            PresetArg::CarRacing => Preset::CarRacing,
            PresetArg::LunarLander => Preset::LunarLander,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "pwnet",
    about = "Prototype wrapper networks for black-box RL policies (research harness)",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Collect (if absent), train, project and evaluate every iteration.
    Run {
        /// Experiment preset (optional).
        /// If omitted, uses PWNET_PRESET (default lunar-lander).
        #[arg(long, value_enum)]
        preset: Option<PresetArg>,

        #[arg(long)]
        iterations: Option<usize>,

        #[arg(long)]
        epochs: Option<usize>,

        /// Base training seed; iteration i trains with seed + i.
        #[arg(long)]
        seed: Option<u64>,

        /// Episodes to collect if no dataset is stored yet.
        #[arg(long)]
        collect_episodes: Option<usize>,

        #[arg(long, default_value = ".")]
        output_dir: PathBuf,

        /// Verbosity: -v, -vv
        #[arg(short, long, action = ArgAction::Count)]
        verbose: u8,
    },
    /// Collect and persist a dataset only.
    Collect {
        #[arg(long, value_enum)]
        preset: Option<PresetArg>,

        #[arg(long)]
        episodes: Option<usize>,

        #[arg(long, default_value = ".")]
        output_dir: PathBuf,

        #[arg(short, long, action = ArgAction::Count)]
        verbose: u8,
    },
}

fn build_config(preset: Option<PresetArg>) -> WrapperConfig {
    let effective = resolve_effective_preset(preset.map(Preset::from));
    effective.log_startup();
    WrapperConfig::from_env_or_preset(effective.preset)
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Run {
            preset,
            iterations,
            epochs,
            seed,
            collect_episodes,
            output_dir,
            verbose,
        } => {
            let mut cfg = build_config(preset);
            if let Some(n) = iterations {
                cfg.iterations = n;
            }
            if let Some(n) = epochs {
                cfg.train.epochs = n;
            }
            if let Some(s) = seed {
                cfg.train.seed = s;
            }
            if let Some(n) = collect_episodes {
                cfg.collect.episodes = n;
            }

            println!(
                "pwnet | cfg={} | preset={} | run={} | iterations={} | epochs={} | seed={}",
                cfg.version,
                cfg.preset.as_str(),
                cfg.run_name,
                cfg.iterations,
                cfg.train.epochs,
                cfg.train.seed
            );

            let mut experiment = synthetic_experiment(cfg, &output_dir)?.with_verbosity(verbose);
            let summary = experiment.run()?;
            println!("reward {}", summary.reward);
            println!("error  {}", summary.error);
            if let Some(acc) = summary.accuracy {
                println!("accuracy {acc}");
            }
        }
        Command::Collect {
            preset,
            episodes,
            output_dir,
            verbose,
        } => {
            let mut cfg = build_config(preset);
            if let Some(n) = episodes {
                cfg.collect.episodes = n;
            }
            let mut experiment = synthetic_experiment(cfg, &output_dir)?.with_verbosity(verbose);
            let (_, metadata) = experiment.collect_dataset()?;
            println!(
                "collected {} examples ({} episodes, mean reward {:.3}) into {}",
                metadata.num_examples,
                metadata.collection.episodes,
                metadata.collection.mean_episode_reward,
                experiment.paths().dataset_dir().display()
            );
        }
    }

    Ok(())
}
