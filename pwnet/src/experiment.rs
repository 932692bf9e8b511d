// src/experiment.rs
//
// Experiment runner: collect-if-absent, then per iteration
//   train -> restore best -> project -> save -> export exemplars -> evaluate,
// and finally the mean ± standard error of the per-iteration results.
//
// Output layout under the experiment root:
//   data/<preset>/                         collected dataset
//   weights/<run>/iter_<i>.json            best-epoch checkpoint
//   weights/<run>/iter_<i>_projected.json  checkpoint after projection
//   results/<run>_results.txt              append-only results log
//   prototypes/<run>/iter_<i>/p<k>.ppm     exemplar frames
//   runs/<run>/iteration_<i>/scalars.jsonl scalar summaries
//   runs/<run>/summary.json                final summary

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::checkpoint::save_checkpoint;
use crate::config::{Preset, WrapperConfig};
use crate::dataset::{DatasetMetadata, DatasetStore, TrainingSet};
use crate::io::persist;
use crate::logging::{JsonlScalarSink, ResultsLog, ScalarSink};
use crate::metrics::MeanStdErr;
use crate::model::output::OutputActivation;
use crate::projection::{export_exemplars, project_prototypes};
use crate::rl::{
    BlackBoxPolicy, DatasetCollector, Environment, EvaluationHarness, SyntheticEnv, SyntheticPolicy,
};
use crate::trainer::TrainerState;

/// Observation width of the synthetic environment.
pub const SYNTHETIC_OBSERVATION_SIZE: usize = 8;
/// Episode horizon of the synthetic environment.
pub const SYNTHETIC_HORIZON: usize = 200;
const SYNTHETIC_POLICY_SEED: u64 = 7;

#[derive(Debug, Clone)]
pub struct ExperimentPaths {
    root: PathBuf,
    run_name: String,
    preset: Preset,
}

impl ExperimentPaths {
    pub fn new(root: impl Into<PathBuf>, config: &WrapperConfig) -> Self {
        Self {
            root: root.into(),
            run_name: config.run_name.clone(),
            preset: config.preset,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dataset_dir(&self) -> PathBuf {
        self.root.join("data").join(self.preset.as_str())
    }

    pub fn checkpoint(&self, iteration: usize) -> PathBuf {
        self.root
            .join("weights")
            .join(&self.run_name)
            .join(format!("iter_{iteration}.json"))
    }

    pub fn projected_checkpoint(&self, iteration: usize) -> PathBuf {
        self.root
            .join("weights")
            .join(&self.run_name)
            .join(format!("iter_{iteration}_projected.json"))
    }

    pub fn results_log(&self) -> PathBuf {
        self.root
            .join("results")
            .join(format!("{}_results.txt", self.run_name))
    }

    pub fn prototypes_dir(&self, iteration: usize) -> PathBuf {
        self.root
            .join("prototypes")
            .join(&self.run_name)
            .join(format!("iter_{iteration}"))
    }

    pub fn scalars(&self, iteration: usize) -> PathBuf {
        self.root
            .join("runs")
            .join(&self.run_name)
            .join(format!("iteration_{iteration}"))
            .join("scalars.jsonl")
    }

    pub fn summary(&self) -> PathBuf {
        self.root.join("runs").join(&self.run_name).join("summary.json")
    }
}

/// Outcome of one train/project/evaluate iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    pub iteration: usize,
    pub best_epoch: Option<usize>,
    /// Training metric of the best-epoch model.
    pub best_metric: Option<f64>,
    /// Training metric after prototype projection.
    pub projected_metric: f64,
    pub mean_projection_distance: f64,
    pub exemplars_written: usize,
    pub mean_reward: f64,
    pub mean_error: f64,
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub config_version: String,
    pub preset: Preset,
    pub run_name: String,
    pub iterations: Vec<IterationResult>,
    pub reward: MeanStdErr,
    pub error: MeanStdErr,
    pub accuracy: Option<MeanStdErr>,
}

pub struct Experiment<E, P> {
    config: WrapperConfig,
    paths: ExperimentPaths,
    env: E,
    policy: P,
    verbosity: u8,
}

impl<E: Environment, P: BlackBoxPolicy> Experiment<E, P> {
    pub fn new(config: WrapperConfig, root: impl Into<PathBuf>, env: E, policy: P) -> Result<Self> {
        config.validate()?;
        if policy.latent_size() != config.model.latent_size {
            bail!(
                "policy latent width {} does not match model latent size {}",
                policy.latent_size(),
                config.model.latent_size
            );
        }
        if policy.action_kind() != config.model.action_kind || env.action_kind() != config.model.action_kind {
            bail!(
                "action spaces disagree: model {:?}, policy {:?}, environment {:?}",
                config.model.action_kind,
                policy.action_kind(),
                env.action_kind()
            );
        }
        let paths = ExperimentPaths::new(root, &config);
        Ok(Self {
            config,
            paths,
            env,
            policy,
            verbosity: 0,
        })
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn config(&self) -> &WrapperConfig {
        &self.config
    }

    pub fn paths(&self) -> &ExperimentPaths {
        &self.paths
    }

    /// Roll out the black box and persist a fresh dataset.
    pub fn collect_dataset(&mut self) -> Result<(TrainingSet, DatasetMetadata)> {
        let collector = DatasetCollector::from_config(&self.config.collect).with_verbosity(self.verbosity);
        let (set, info) = collector.collect(&mut self.env, &mut self.policy)?;
        let store = DatasetStore::new(self.paths.dataset_dir());
        let metadata = store.write(&set, self.config.model.action_kind, &info)?;
        if self.verbosity > 0 {
            eprintln!(
                "[collector] wrote {} examples to {}",
                metadata.num_examples,
                store.dir().display()
            );
        }
        Ok((set, metadata))
    }

    /// Load the stored dataset, collecting it first if absent, truncated to
    /// `train.max_samples`.
    pub fn ensure_dataset(&mut self) -> Result<TrainingSet> {
        let store = DatasetStore::new(self.paths.dataset_dir());
        let set = if store.exists() {
            let (set, metadata) = store.load()?;
            if metadata.latent_size != self.config.model.latent_size
                || metadata.action_kind != self.config.model.action_kind
            {
                bail!(
                    "dataset at {} was collected for latent {} / {:?}, config needs {} / {:?}",
                    store.dir().display(),
                    metadata.latent_size,
                    metadata.action_kind,
                    self.config.model.latent_size,
                    self.config.model.action_kind
                );
            }
            set
        } else {
            self.collect_dataset()?.0
        };
        Ok(match self.config.train.max_samples {
            Some(n) => set.truncated(n),
            None => set,
        })
    }

    pub fn run_iteration(&mut self, iteration: usize, dataset: &TrainingSet) -> Result<IterationResult> {
        let log = ResultsLog::new(self.paths.results_log());
        let mut sink = JsonlScalarSink::new(self.paths.scalars(iteration));
        log.append(&format!("===== Iteration {iteration}"))?;

        let seed = self.config.train.seed + iteration as u64;
        let mut trainer = TrainerState::new(&self.config, seed)?
            .with_checkpoint_path(self.paths.checkpoint(iteration))
            .with_verbosity(self.verbosity);
        trainer.run(dataset, self.config.train.epochs, &mut sink, Some(&log))?;
        let outcome = trainer.finalize();
        let metric = outcome.metric;
        let mut model = outcome.model;

        let before = metric.evaluate(&model, dataset)?;
        let report = project_prototypes(&mut model, dataset)?;
        let after = metric.evaluate(&model, dataset)?;
        if self.verbosity > 0 {
            eprintln!(
                "[projection] iteration {iteration}: {} {before:.6} -> {after:.6}, sources {:?}",
                metric.name(),
                report.sources()
            );
        }
        log.append(&format!(
            "Projection: {} before {before}, after {after}, sources {:?}",
            metric.name(),
            report.sources()
        ))?;
        save_checkpoint(
            &self.paths.projected_checkpoint(iteration),
            &model,
            outcome.best_epoch,
            Some(after),
        )?;

        let exemplars = if self.config.train.export_exemplars {
            export_exemplars(&report, dataset, &self.paths.prototypes_dir(iteration))?
        } else {
            Vec::new()
        };

        let harness = EvaluationHarness::from_config(&self.config.eval).with_verbosity(self.verbosity);
        let eval = harness.evaluate(&mut self.env, &mut self.policy, &model)?;

        let step = iteration as u64;
        sink.add_scalar("Reward", step, eval.mean_reward);
        sink.add_scalar("Error", step, eval.mean_error);
        if let Some(acc) = eval.accuracy {
            sink.add_scalar("Accuracy", step, acc);
        }
        sink.flush();

        let accuracy = eval
            .accuracy
            .map(|a| format!(", Accuracy: {a}"))
            .unwrap_or_default();
        log.append(&format!(
            "Reward: {}, Error: {}{accuracy}",
            eval.mean_reward, eval.mean_error
        ))?;

        Ok(IterationResult {
            iteration,
            best_epoch: outcome.best_epoch,
            best_metric: outcome.best_metric,
            projected_metric: after,
            mean_projection_distance: report.mean_distance(),
            exemplars_written: exemplars.len(),
            mean_reward: eval.mean_reward,
            mean_error: eval.mean_error,
            accuracy: eval.accuracy,
        })
    }

    /// Run every configured iteration and write the summary.
    pub fn run(&mut self) -> Result<ExperimentSummary> {
        let dataset = self.ensure_dataset()?;
        if self.verbosity > 0 {
            eprintln!(
                "[experiment] {} ({}): {} examples, {} iterations",
                self.config.run_name,
                self.config.preset.as_str(),
                dataset.len(),
                self.config.iterations
            );
        }

        let mut iterations = Vec::with_capacity(self.config.iterations);
        for i in 0..self.config.iterations {
            iterations.push(self.run_iteration(i, &dataset)?);
        }

        let rewards: Vec<f64> = iterations.iter().map(|r| r.mean_reward).collect();
        let errors: Vec<f64> = iterations.iter().map(|r| r.mean_error).collect();
        let accuracies: Vec<f64> = iterations.iter().filter_map(|r| r.accuracy).collect();
        let summary = ExperimentSummary {
            config_version: self.config.version.clone(),
            preset: self.config.preset,
            run_name: self.config.run_name.clone(),
            reward: MeanStdErr::of("iteration reward", &rewards)?,
            error: MeanStdErr::of("iteration error", &errors)?,
            accuracy: if accuracies.is_empty() {
                None
            } else {
                Some(MeanStdErr::of("iteration accuracy", &accuracies)?)
            },
            iterations,
        };

        let log = ResultsLog::new(self.paths.results_log());
        log.append("")?;
        if let Some(acc) = &summary.accuracy {
            log.append(&format!(
                "===== Data Accuracy:\nAccuracy: {accuracies:?}\nMean: {}\nStandard Error: {}",
                acc.mean, acc.standard_error
            ))?;
        }
        log.append(&format!(
            "===== Data Error:\nError: {errors:?}\nMean: {}\nStandard Error: {}",
            summary.error.mean, summary.error.standard_error
        ))?;
        log.append(&format!(
            "===== Data Reward:\nRewards: {rewards:?}\nMean: {}\nStandard Error: {}",
            summary.reward.mean, summary.reward.standard_error
        ))?;

        let json = serde_json::to_vec_pretty(&summary).context("Failed to serialize summary")?;
        persist(&self.paths.summary(), &json)?;
        if self.verbosity > 0 {
            eprintln!("[experiment] reward {} / error {}", summary.reward, summary.error);
        }
        Ok(summary)
    }
}

/// Experiment on the synthetic environment and policy, sized from `config`.
pub fn synthetic_experiment(
    config: WrapperConfig,
    root: impl Into<PathBuf>,
) -> Result<Experiment<SyntheticEnv, SyntheticPolicy>> {
    let kind = config.model.action_kind;
    let env = SyntheticEnv::new(SYNTHETIC_OBSERVATION_SIZE, kind, SYNTHETIC_HORIZON)?;
    let output = if kind.is_discrete() {
        OutputActivation::Softmax
    } else {
        config.model.output.clone()
    };
    let policy = SyntheticPolicy::new(
        SYNTHETIC_OBSERVATION_SIZE,
        config.model.latent_size,
        kind,
        output,
        SYNTHETIC_POLICY_SEED,
    )?;
    Experiment::new(config, root, env, policy)
}
