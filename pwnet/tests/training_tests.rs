// tests/training_tests.rs
//
// TrainerState lifecycle: loss descent, frozen structural weights, phase
// enforcement, periodic projection, checkpoints and scalar output.


use ndarray::array;

use pwnet::checkpoint::load_checkpoint;
use pwnet::config::{AssignmentConfig, Preset, PrototypeSpace, WrapperConfig};
use pwnet::dataset::{LabelDerivation, Labels, TrainingSet};
use pwnet::logging::{JsonlScalarSink, NoopScalarSink, ResultsLog};
use pwnet::loss::{ClusterMode, SeparationMode};
use pwnet::model::assignment::StrictLayout;
use pwnet::model::output::OutputActivation;
use pwnet::model::ModelPhase;
use pwnet::projection::project_prototypes;
use pwnet::schedule::ProjectionSchedule;
use pwnet::trainer::{TrainerState, TrainingMetric};
use pwnet::types::ActionKind;

use wrapper_testkit::{dataset_for, small_config};

/// Four 2-d embeddings, two classes, strict blocks, no projection network.
fn toy_config() -> (WrapperConfig, TrainingSet) {
    let mut cfg = WrapperConfig::for_preset(Preset::LunarLander);
    cfg.model.latent_size = 2;
    cfg.model.prototype_size = 2;
    cfg.model.num_prototypes = 2;
    cfg.model.action_kind = ActionKind::Discrete { num_actions: 2 };
    cfg.model.prototype_space = PrototypeSpace::Comparison;
    cfg.model.projection_net = None;
    cfg.model.assignment = AssignmentConfig::Strict {
        layout: StrictLayout::Blocks,
        incorrect_weight: 0.0,
    };
    cfg.model.output = OutputActivation::Softmax;
    cfg.model.label_derivation = LabelDerivation::Identity;
    cfg.loss.clustering = ClusterMode::OwnClass;
    cfg.loss.separation = SeparationMode::OtherClasses;
    cfg.train.learning_rate = 1e-3;
    cfg.train.batch_size = 4;
    cfg.train.periodic_projection = None;
    cfg.validate().unwrap();

    let x = array![[1.0, 0.0], [0.9, 0.1], [0.0, 1.0], [0.1, 0.9]];
    let set = TrainingSet::new(x, Labels::Discrete(vec![0, 0, 1, 1]), None).unwrap();
    (cfg, set)
}

#[test]
fn one_epoch_on_toy_set_does_not_increase_loss() {
    for seed in 0..5 {
        let (cfg, set) = toy_config();
        let mut trainer = TrainerState::new(&cfg, seed).unwrap();
        let before = trainer.evaluate_loss(&set).unwrap().total;
        trainer.run(&set, 1, &mut NoopScalarSink, None).unwrap();
        let after = trainer.evaluate_loss(&set).unwrap().total;
        assert!(
            after <= before,
            "seed {seed}: loss went from {before} to {after}"
        );
    }
}

#[test]
fn strict_weights_are_bit_identical_after_training() {
    for preset in [Preset::LunarLander, Preset::BipedalWalker] {
        let cfg = small_config(preset);
        let set = dataset_for(&cfg, 40, 11);
        let mut trainer = TrainerState::new(&cfg, 5).unwrap();
        let before = trainer.model().strict_assignment().unwrap().weights().clone();
        let protos_before = trainer.model().prototypes().clone();

        trainer.run(&set, 3, &mut NoopScalarSink, None).unwrap();

        let after = trainer.model().strict_assignment().unwrap().weights();
        assert_eq!(&before, after, "{preset:?}: structural weights moved");
        assert_ne!(&protos_before, trainer.model().prototypes(), "{preset:?}: nothing trained");
        if preset == Preset::LunarLander {
            for col in after.columns() {
                assert_eq!(col.iter().filter(|&&w| w == 1.0).count(), 1);
            }
        }
    }
}

#[test]
fn projected_model_rejects_gradient_steps_until_resumed() {
    let cfg = small_config(Preset::LunarLander);
    let set = dataset_for(&cfg, 16, 2);
    let mut trainer = TrainerState::new(&cfg, 1).unwrap();
    project_prototypes(trainer.model_mut(), &set).unwrap();
    assert!(matches!(trainer.model().phase(), ModelPhase::Projected { .. }));

    let (x, y) = set.batch(&[0, 1, 2, 3]);
    assert!(trainer.train_step(&x, &y).is_err());
    trainer.model_mut().resume_training();
    assert!(trainer.train_step(&x, &y).is_ok());
}

#[test]
fn periodic_projection_runs_on_schedule_and_resumes() {
    let mut cfg = small_config(Preset::LunarLander);
    cfg.train.periodic_projection = Some(ProjectionSchedule { min_epoch: 1, every: 2 });
    let set = dataset_for(&cfg, 24, 3);
    let mut trainer = TrainerState::new(&cfg, 4).unwrap();
    trainer.run(&set, 4, &mut NoopScalarSink, None).unwrap();

    let projected: Vec<bool> = trainer
        .history()
        .iter()
        .map(|r| r.projection_distance.is_some())
        .collect();
    assert_eq!(projected, vec![false, false, true, false]);
    assert_eq!(trainer.model().phase(), &ModelPhase::Trained);
}

#[test]
fn soft_slot_temperature_follows_schedule() {
    let cfg = small_config(Preset::CarRacing);
    let schedule = cfg.model.temperature_schedule().unwrap();
    let set = dataset_for(&cfg, 20, 8);
    let mut trainer = TrainerState::new(&cfg, 9).unwrap();
    trainer.run(&set, 3, &mut NoopScalarSink, None).unwrap();

    let temps: Vec<f64> = trainer.history().iter().map(|r| r.temperature).collect();
    let expected: Vec<f64> = (0..3).map(|e| schedule.temperature(e)).collect();
    assert_eq!(temps, expected);
    assert!(trainer
        .history()
        .iter()
        .all(|r| r.running_loss.is_finite() && r.train_metric.is_finite()));
    assert_eq!(trainer.metric(), TrainingMetric::MeanSquaredError);
}

#[test]
fn learning_rate_decays_once_per_epoch() {
    let cfg = small_config(Preset::LunarLander);
    let set = dataset_for(&cfg, 16, 1);
    let mut trainer = TrainerState::new(&cfg, 0).unwrap();
    trainer.run(&set, 3, &mut NoopScalarSink, None).unwrap();
    let lr: Vec<f64> = trainer.history().iter().map(|r| r.learning_rate).collect();
    assert_eq!(lr[0], cfg.train.learning_rate);
    assert!((lr[2] - cfg.train.learning_rate * 0.95 * 0.95).abs() < 1e-15);
}

#[test]
fn best_epoch_is_checkpointed_and_restored() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt = dir.path().join("weights/toy/iter_0.json");
    let cfg = small_config(Preset::BipedalWalker);
    let set = dataset_for(&cfg, 32, 6);

    let mut trainer = TrainerState::new(&cfg, 2).unwrap().with_checkpoint_path(&ckpt);
    trainer.run(&set, 4, &mut NoopScalarSink, None).unwrap();
    let outcome = trainer.finalize();

    let best_epoch = outcome.best_epoch.unwrap();
    let best_metric = outcome.best_metric.unwrap();
    let recorded = outcome
        .history
        .iter()
        .map(|r| r.train_metric)
        .fold(f64::INFINITY, f64::min);
    assert_eq!(best_metric, recorded);

    let saved = load_checkpoint(&ckpt).unwrap();
    assert_eq!(saved.epoch, Some(best_epoch));
    assert_eq!(saved.metric, Some(best_metric));
    assert_eq!(saved.model.prototypes(), outcome.model.prototypes());
}

#[test]
fn scalars_and_results_are_written_per_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = small_config(Preset::LunarLander);
    let set = dataset_for(&cfg, 16, 4);
    let log = ResultsLog::new(dir.path().join("results/toy_results.txt"));
    let scalars = dir.path().join("runs/toy/iteration_0/scalars.jsonl");
    {
        let mut sink = JsonlScalarSink::new(&scalars);
        let mut trainer = TrainerState::new(&cfg, 0).unwrap();
        trainer.run(&set, 2, &mut sink, Some(&log)).unwrap();
    }

    let text = std::fs::read_to_string(log.path()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("Epoch: 0, Loss: "));
    assert!(lines[1].contains("Current_accuracy"));

    let tags: Vec<String> = std::fs::read_to_string(&scalars)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["tag"].as_str().unwrap().to_string())
        .collect();
    assert!(tags.iter().any(|t| t == "Running_loss"));
    assert!(tags.iter().any(|t| t == "Current_accuracy"));
    assert!(!tags.iter().any(|t| t == "Temperature"));
}

#[test]
fn mismatched_model_is_rejected() {
    let cfg = small_config(Preset::LunarLander);
    let other = small_config(Preset::BipedalWalker);
    let model = wrapper_testkit::build_model(&other, 0);
    assert!(TrainerState::from_model(&cfg, model, 0).is_err());
}
