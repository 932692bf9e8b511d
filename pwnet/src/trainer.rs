// src/trainer.rs
//
// Training loop for the surrogate.
//
// Lifecycle: `TrainerState::new` (construct) -> `run` (N epochs) -> `finalize`.
//
// Per epoch:
//   1. set the soft-slot temperature from the schedule,
//   2. evaluate the training metric on the full training set (eval mode),
//   3. snapshot (and checkpoint) the model when the metric improves,
//   4. project prototypes if the periodic projection schedule is due,
//   5. one Adam step per shuffled mini-batch,
//   6. decay the learning rate.
//
// `finalize` restores the best snapshot.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::checkpoint::save_checkpoint;
use crate::config::WrapperConfig;
use crate::dataset::{shuffled_batches, Labels, TrainingSet};
use crate::logging::{ResultsLog, ScalarSink};
use crate::loss::{composite_loss, LossBreakdown};
use crate::model::output::argmax;
use crate::model::projection_net::Mode;
use crate::model::SurrogateModel;
use crate::optim::{Adam, ExponentialDecay};
use crate::projection::project_prototypes;
use crate::types::ActionKind;

/// Model-selection metric evaluated once per epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingMetric {
    /// Mean squared error of continuous outputs; lower is better.
    MeanSquaredError,
    /// Fraction of argmax predictions matching the label; higher is better.
    Accuracy,
}

impl TrainingMetric {
    pub fn for_kind(kind: ActionKind) -> Self {
        if kind.is_discrete() {
            TrainingMetric::Accuracy
        } else {
            TrainingMetric::MeanSquaredError
        }
    }

    /// Tag used in logs and scalar summaries.
    pub fn name(&self) -> &'static str {
        match self {
            TrainingMetric::MeanSquaredError => "Train_error",
            TrainingMetric::Accuracy => "Current_accuracy",
        }
    }

    /// Strict improvement over the best value so far.
    pub fn improves(&self, candidate: f64, best: Option<f64>) -> bool {
        if !candidate.is_finite() {
            return false;
        }
        match best {
            None => true,
            Some(best) => match self {
                TrainingMetric::MeanSquaredError => candidate < best,
                TrainingMetric::Accuracy => candidate > best,
            },
        }
    }

    /// Metric of `model` over the full set in evaluation mode.
    pub fn evaluate(&self, model: &SurrogateModel, dataset: &TrainingSet) -> Result<f64> {
        let outputs = model.predict(dataset.embeddings())?;
        self.compute(&outputs, dataset.labels())
    }

    fn compute(&self, outputs: &Array2<f64>, labels: &Labels) -> Result<f64> {
        let n = outputs.nrows();
        if n == 0 {
            bail!("cannot evaluate a metric on an empty set");
        }
        match (self, labels) {
            (TrainingMetric::Accuracy, Labels::Discrete(y)) => {
                let hits = outputs
                    .rows()
                    .into_iter()
                    .zip(y)
                    .filter(|(row, &label)| argmax(row.view()) == label)
                    .count();
                Ok(hits as f64 / n as f64)
            }
            (TrainingMetric::MeanSquaredError, Labels::Continuous(y)) => {
                if y.dim() != outputs.dim() {
                    bail!("targets {:?} vs outputs {:?}", y.shape(), outputs.shape());
                }
                let diff = outputs - y;
                Ok(diff.mapv(|v| v * v).sum() / diff.len() as f64)
            }
            _ => bail!("{} does not apply to these labels", self.name()),
        }
    }
}

/// Summary of one training epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    /// Training metric measured before this epoch's updates.
    pub train_metric: f64,
    pub improved: bool,
    /// Mean composite loss over the epoch's mini-batches.
    pub running_loss: f64,
    pub breakdown: LossBreakdown,
    pub learning_rate: f64,
    pub temperature: f64,
    /// Mean projection distance if prototypes were projected this epoch.
    pub projection_distance: Option<f64>,
}

#[derive(Debug, Clone)]
struct BestSnapshot {
    epoch: usize,
    metric: f64,
    model: SurrogateModel,
}

/// Result of a finished training run.
#[derive(Debug, Clone)]
pub struct TrainingOutcome {
    /// The best-epoch model (or the last one if no epoch ran).
    pub model: SurrogateModel,
    pub metric: TrainingMetric,
    pub best_epoch: Option<usize>,
    pub best_metric: Option<f64>,
    pub history: Vec<EpochRecord>,
}

pub struct TrainerState {
    config: WrapperConfig,
    model: SurrogateModel,
    optimizer: Adam,
    lr_decay: ExponentialDecay,
    rng: ChaCha8Rng,
    metric: TrainingMetric,
    epoch: usize,
    best: Option<BestSnapshot>,
    history: Vec<EpochRecord>,
    checkpoint_path: Option<PathBuf>,
    verbosity: u8,
}

impl TrainerState {
    /// Build a fresh model from `config.model`, seeded with `seed`.
    pub fn new(config: &WrapperConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let model = SurrogateModel::new(&config.model, &mut rng)?;
        Ok(Self::assemble(config, model, rng))
    }

    /// Continue training an existing model.
    pub fn from_model(config: &WrapperConfig, model: SurrogateModel, seed: u64) -> Result<Self> {
        config.validate()?;
        if model.config() != &config.model {
            bail!("model was built for a different model configuration");
        }
        Ok(Self::assemble(config, model, ChaCha8Rng::seed_from_u64(seed)))
    }

    fn assemble(config: &WrapperConfig, model: SurrogateModel, rng: ChaCha8Rng) -> Self {
        Self {
            optimizer: Adam::new(config.train.learning_rate, config.train.weight_decay),
            lr_decay: ExponentialDecay {
                gamma: config.train.lr_decay_gamma,
            },
            metric: TrainingMetric::for_kind(config.model.action_kind),
            config: config.clone(),
            model,
            rng,
            epoch: 0,
            best: None,
            history: Vec::new(),
            checkpoint_path: None,
            verbosity: 0,
        }
    }

    /// Write a checkpoint here whenever the training metric improves.
    pub fn with_checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(path.into());
        self
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn model(&self) -> &SurrogateModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut SurrogateModel {
        &mut self.model
    }

    pub fn metric(&self) -> TrainingMetric {
        self.metric
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn history(&self) -> &[EpochRecord] {
        &self.history
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    fn classes(&self, labels: &Labels) -> Result<Vec<usize>> {
        labels.classes(self.config.model.label_derivation)
    }

    /// Training metric over the full set in evaluation mode.
    pub fn evaluate_metric(&self, dataset: &TrainingSet) -> Result<f64> {
        self.metric.evaluate(&self.model, dataset)
    }

    /// Composite loss over the full set in evaluation mode (no Gumbel noise,
    /// frozen normalization statistics).
    pub fn evaluate_loss(&self, dataset: &TrainingSet) -> Result<LossBreakdown> {
        let pass = self.model.forward_eval(dataset.embeddings())?;
        let classes = self.classes(dataset.labels())?;
        let out = composite_loss(&self.model, &pass, dataset.labels(), &classes, &self.config.loss)?;
        Ok(out.breakdown)
    }

    /// One optimizer step on a mini-batch.
    pub fn train_step(&mut self, x: &Array2<f64>, labels: &Labels) -> Result<LossBreakdown> {
        self.model.ensure_trainable()?;
        let classes = self.classes(labels)?;
        let rng = if self.model.soft_assignment().is_some() {
            Some(&mut self.rng)
        } else {
            None
        };
        let pass = self.model.forward(x, Mode::Train, rng)?;
        let loss = composite_loss(&self.model, &pass, labels, &classes, &self.config.loss)?;
        if !loss.breakdown.total.is_finite() {
            bail!(
                "non-finite loss at epoch {}: {:?}",
                self.epoch,
                loss.breakdown
            );
        }
        let mut grads = self
            .model
            .backward(&pass, &loss.d_logits, &loss.d_distances, &loss.d_prototypes)?;
        grads.merge(loss.param_grads);
        self.optimizer
            .step(self.model.trainable_params_mut(), &grads)
            .context("optimizer step")?;
        Ok(loss.breakdown)
    }

    pub fn run_epoch(
        &mut self,
        dataset: &TrainingSet,
        sink: &mut dyn ScalarSink,
        results: Option<&ResultsLog>,
    ) -> Result<EpochRecord> {
        if dataset.is_empty() {
            bail!("training set is empty");
        }
        let epoch = self.epoch;
        if let Some(schedule) = self.config.model.temperature_schedule() {
            self.model.set_temperature(schedule.temperature(epoch));
        }

        let train_metric = self.evaluate_metric(dataset)?;
        let improved = self
            .metric
            .improves(train_metric, self.best.as_ref().map(|b| b.metric));
        if improved {
            self.best = Some(BestSnapshot {
                epoch,
                metric: train_metric,
                model: self.model.clone(),
            });
            if let Some(path) = &self.checkpoint_path {
                save_checkpoint(path, &self.model, Some(epoch), Some(train_metric))?;
            }
        }

        let mut projection_distance = None;
        if let Some(schedule) = self.config.train.periodic_projection {
            if schedule.is_due(epoch) {
                let report = project_prototypes(&mut self.model, dataset)?;
                self.model.resume_training();
                projection_distance = Some(report.mean_distance());
                if self.verbosity > 0 {
                    eprintln!(
                        "[projection] epoch {epoch}: projected {} prototypes (mean distance {:.6})",
                        report.matches.len(),
                        report.mean_distance()
                    );
                }
            }
        }

        let batches = shuffled_batches(dataset.len(), self.config.train.batch_size, &mut self.rng);
        let mut breakdown = LossBreakdown::default();
        for idx in &batches {
            let (x, labels) = dataset.batch(idx);
            let step = self.train_step(&x, &labels)?;
            breakdown.accumulate_mean(&step, batches.len());
        }

        let learning_rate = self.optimizer.learning_rate();
        self.lr_decay.step(&mut self.optimizer);

        let record = EpochRecord {
            epoch,
            train_metric,
            improved,
            running_loss: breakdown.total,
            breakdown,
            learning_rate,
            temperature: self.model.temperature(),
            projection_distance,
        };

        let step = epoch as u64;
        sink.add_scalar("Running_loss", step, record.running_loss);
        sink.add_scalar(self.metric.name(), step, train_metric);
        sink.add_scalar("Loss/imitation", step, breakdown.imitation);
        sink.add_scalar("Loss/clustering", step, breakdown.clustering);
        sink.add_scalar("Loss/separation", step, breakdown.separation);
        sink.add_scalar("Learning_rate", step, learning_rate);
        if self.model.soft_assignment().is_some() {
            sink.add_scalar("Loss/orthogonality", step, breakdown.orthogonality);
            sink.add_scalar("Loss/sparsity", step, breakdown.sparsity);
            sink.add_scalar("Temperature", step, record.temperature);
        }

        if let Some(log) = results {
            log.append(&format!(
                "Epoch: {epoch}, Loss: {}, {}: {train_metric}",
                record.running_loss,
                self.metric.name()
            ))?;
        }
        if self.verbosity > 0 {
            eprintln!(
                "[trainer] epoch {epoch} loss={:.6} {}={:.6} lr={:.6}{}",
                record.running_loss,
                self.metric.name(),
                train_metric,
                learning_rate,
                if improved { " *" } else { "" }
            );
        }

        self.history.push(record.clone());
        self.epoch += 1;
        Ok(record)
    }

    pub fn run(
        &mut self,
        dataset: &TrainingSet,
        epochs: usize,
        sink: &mut dyn ScalarSink,
        results: Option<&ResultsLog>,
    ) -> Result<()> {
        for _ in 0..epochs {
            self.run_epoch(dataset, sink, results)?;
        }
        sink.flush();
        Ok(())
    }

    /// Consume the trainer, restoring the best snapshot.
    pub fn finalize(self) -> TrainingOutcome {
        let (model, best_epoch, best_metric) = match self.best {
            Some(best) => (best.model, Some(best.epoch), Some(best.metric)),
            None => (self.model, None, None),
        };
        TrainingOutcome {
            model,
            metric: self.metric,
            best_epoch,
            best_metric,
            history: self.history,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_direction() {
        let mse = TrainingMetric::MeanSquaredError;
        assert!(mse.improves(0.5, None));
        assert!(mse.improves(0.4, Some(0.5)));
        assert!(!mse.improves(0.5, Some(0.5)));
        let acc = TrainingMetric::Accuracy;
        assert!(acc.improves(0.6, Some(0.5)));
        assert!(!acc.improves(0.4, Some(0.5)));
        assert!(!acc.improves(f64::NAN, None));
    }

    #[test]
    fn accuracy_counts_argmax_hits() {
        let out = ndarray::array![[0.9, 0.1], [0.2, 0.8], [0.6, 0.4]];
        let acc = TrainingMetric::Accuracy
            .compute(&out, &Labels::Discrete(vec![0, 1, 1]))
            .unwrap();
        assert!((acc - 2.0 / 3.0).abs() < 1e-12);
    }
}
