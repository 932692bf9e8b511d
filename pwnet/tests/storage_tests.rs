// tests/storage_tests.rs
//
// Persistence: dataset directories with digest verification, and model
// checkpoints.


use pwnet::checkpoint::{load_checkpoint, save_checkpoint};
use pwnet::config::Preset;
use ndarray::{Array1, Array2, Array4};
use ndarray_npy::ReadNpyExt;

use pwnet::dataset::{CollectionInfo, DatasetStore, ACTIONS_FILE, EMBEDDINGS_FILE, FRAMES_FILE};
use pwnet::logging::NoopScalarSink;
use pwnet::model::ModelPhase;
use pwnet::projection::project_prototypes;
use pwnet::trainer::TrainerState;
use pwnet::types::ActionKind;

use wrapper_testkit::{dataset_for, small_config, toy_dataset};

fn info() -> CollectionInfo {
    CollectionInfo {
        policy_version: "test-policy".to_string(),
        episodes: 2,
        mean_episode_reward: -1.25,
        seed: 17,
    }
}

#[test]
fn dataset_roundtrip_is_exact() {
    let dir = tempfile::tempdir().unwrap();
    for (i, kind) in [
        ActionKind::Discrete { num_actions: 4 },
        ActionKind::Continuous { dim: 3 },
    ]
    .into_iter()
    .enumerate()
    {
        let store = DatasetStore::new(dir.path().join(format!("set_{i}")));
        assert!(!store.exists());
        let set = toy_dataset(kind, 9, 5, 31, true);
        let written = store.write(&set, kind, &info()).unwrap();
        assert!(store.exists());

        let (loaded, metadata) = store.load().unwrap();
        assert_eq!(metadata, written);
        assert_eq!(metadata.num_examples, 9);
        assert_eq!(metadata.frame_shape, Some((2, 2)));
        assert_eq!(loaded.embeddings(), set.embeddings());
        assert_eq!(loaded.labels(), set.labels());
        assert_eq!(loaded.frames(), set.frames());
    }
}

#[test]
fn dataset_without_frames_has_no_frame_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = DatasetStore::new(dir.path());
    let kind = ActionKind::Discrete { num_actions: 2 };
    let set = toy_dataset(kind, 4, 3, 1, false);
    let metadata = store.write(&set, kind, &info()).unwrap();
    assert!(!metadata.files.contains_key(FRAMES_FILE));
    assert!(!dir.path().join(FRAMES_FILE).exists());
    let (loaded, _) = store.load().unwrap();
    assert!(loaded.frames().is_none());
}

#[test]
fn tampered_dataset_fails_digest_check() {
    let dir = tempfile::tempdir().unwrap();
    let store = DatasetStore::new(dir.path());
    let kind = ActionKind::Continuous { dim: 2 };
    let set = toy_dataset(kind, 6, 4, 2, false);
    store.write(&set, kind, &info()).unwrap();

    let path = dir.path().join(EMBEDDINGS_FILE);
    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&path, bytes).unwrap();

    let err = store.load().unwrap_err();
    assert!(format!("{err:#}").contains("digest mismatch"));
}

#[test]
fn stored_arrays_are_plain_npy_files() {
    let dir = tempfile::tempdir().unwrap();
    let store = DatasetStore::new(dir.path());
    let open = |name: &str| std::fs::File::open(dir.path().join(name)).unwrap();

    let kind = ActionKind::Discrete { num_actions: 4 };
    let set = toy_dataset(kind, 7, 3, 12, true);
    store.write(&set, kind, &info()).unwrap();

    let x = Array2::<f64>::read_npy(open(EMBEDDINGS_FILE)).unwrap();
    assert_eq!(&x, set.embeddings());
    let a = Array1::<i64>::read_npy(open(ACTIONS_FILE)).unwrap();
    assert_eq!(a.len(), 7);
    let obs = Array4::<u8>::read_npy(open(FRAMES_FILE)).unwrap();
    assert_eq!(obs.dim(), (7, 2, 2, 3));
    assert_eq!(obs[[3, 0, 0, 0]], set.frames().unwrap()[3].rgb[0]);

    let kind = ActionKind::Continuous { dim: 3 };
    let set = toy_dataset(kind, 5, 3, 13, false);
    store.write(&set, kind, &info()).unwrap();
    let a = Array2::<f64>::read_npy(open(ACTIONS_FILE)).unwrap();
    assert_eq!(a.dim(), (5, 3));
    assert!(!dir.path().join(FRAMES_FILE).exists());
}

#[test]
fn missing_dataset_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let store = DatasetStore::new(dir.path().join("absent"));
    assert!(!store.exists());
    assert!(store.load().is_err());
}

#[test]
fn checkpoint_roundtrip_restores_parameters_and_phase() {
    let dir = tempfile::tempdir().unwrap();
    for preset in [Preset::LunarLander, Preset::CarRacing] {
        let cfg = small_config(preset);
        let set = dataset_for(&cfg, 16, 5);
        let mut trainer = TrainerState::new(&cfg, 3).unwrap();
        trainer.run(&set, 2, &mut NoopScalarSink, None).unwrap();
        let mut model = trainer.finalize().model;
        project_prototypes(&mut model, &set).unwrap();

        let path = dir.path().join(format!("weights/{}/iter_0_projected.json", preset.as_str()));
        save_checkpoint(&path, &model, Some(1), Some(0.5)).unwrap();
        let ckpt = load_checkpoint(&path).unwrap();

        assert_eq!(ckpt.epoch, Some(1));
        assert_eq!(ckpt.metric, Some(0.5));
        assert_eq!(ckpt.model.config(), model.config());
        assert_eq!(ckpt.model.prototypes(), model.prototypes());
        assert_eq!(ckpt.model.temperature(), model.temperature());
        assert!(matches!(ckpt.model.phase(), ModelPhase::Projected { .. }));
        assert_eq!(ckpt.model.phase(), model.phase());
        assert_eq!(
            ckpt.model.predict(set.embeddings()).unwrap(),
            model.predict(set.embeddings()).unwrap()
        );
    }
}

#[test]
fn corrupt_checkpoint_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(&path, b"{\"format_version\": \"pwnet-checkpoint-v1\"").unwrap();
    assert!(load_checkpoint(&path).is_err());
}
