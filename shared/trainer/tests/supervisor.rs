use anyhow::bail;
use kiln_checkpoint::{
    CheckpointError, CheckpointStore, GradScalerState, SafetensorsStore, SeedWeights, Tensor,
};
use kiln_core::{
    ConfigResolver, Device, HostProfile, RawRunConfig, ResolvedRunConfig, TrainingHorizon,
    WorkerIdentity,
};
use kiln_trainer::{
    get_dummy_parameters, Collaborators, DummyCollaborators, DummyTrainingLoop,
    ExperimentTracker, FileTracker, Placement, RunSupervisor, SupervisorError, TrackerRun,
};
use pretty_assertions::assert_eq;
use std::{path::Path, sync::Arc, thread, time::Duration};
use tokio_util::sync::CancellationToken;

const FEATURES: usize = 8;

fn raw_config(results: &Path) -> RawRunConfig {
    let mut raw = RawRunConfig::default();
    raw.common.results_loc = results.to_path_buf();
    raw.scheduler.max_epochs = Some(2);
    raw
}

fn resolve(raw: &RawRunConfig) -> ResolvedRunConfig {
    ConfigResolver::resolve(raw, &HostProfile::cpu_only(4)).unwrap()
}

fn collaborators(tracker: Option<Box<dyn ExperimentTracker>>) -> Collaborators {
    let dummy = DummyCollaborators::default();
    Collaborators {
        models: Box::new(dummy.clone()),
        components: Box::new(dummy.clone()),
        data: Box::new(dummy),
        tracker,
        checkpoints: Arc::new(SafetensorsStore),
        training_loop: Box::new(DummyTrainingLoop),
    }
}

fn leader() -> WorkerIdentity {
    WorkerIdentity::new(0, None, 1, Device::Cpu)
}

struct BrokenTracker;

impl ExperimentTracker for BrokenTracker {
    fn init(
        &self,
        _project: &str,
        _config: &ResolvedRunConfig,
        _run_id: &str,
        _tags: &[String],
    ) -> anyhow::Result<Box<dyn TrackerRun>> {
        bail!("tracking backend unreachable")
    }
}

#[test_log::test]
fn fresh_run_trains_and_checkpoints() {
    let dir = tempfile::tempdir().unwrap();
    let config = resolve(&raw_config(dir.path()));
    let checkpoint_path = config.checkpoint_path();

    RunSupervisor::new(leader(), config, collaborators(None))
        .run()
        .unwrap();

    // 512 samples in batches of 32, two epochs
    let checkpoint = SafetensorsStore.load(&checkpoint_path).unwrap();
    assert_eq!(checkpoint.epoch, 1);
    assert_eq!(checkpoint.iterations, 31);
    assert!(checkpoint.best_metric.is_finite());
    assert_eq!(checkpoint.ema_weights, None);
    assert_ne!(checkpoint.weights, get_dummy_parameters(FEATURES));
}

#[test]
fn resume_continues_from_the_saved_counters() {
    let dir = tempfile::tempdir().unwrap();
    let config = resolve(&raw_config(dir.path()));
    let checkpoint_path = config.checkpoint_path();
    RunSupervisor::new(leader(), config, collaborators(None))
        .run()
        .unwrap();
    let saved = SafetensorsStore.load(&checkpoint_path).unwrap();

    let mut raw = raw_config(dir.path());
    raw.common.resume = Some(checkpoint_path);
    raw.scheduler.max_epochs = Some(3);
    let (session, _) = RunSupervisor::new(leader(), resolve(&raw), collaborators(None))
        .prepare()
        .unwrap();

    assert_eq!(session.start_epoch, 2);
    assert_eq!(session.start_iteration, 32);
    assert_eq!(session.best_metric, saved.best_metric);
    assert_eq!(session.model.parameters(), &saved.weights);
    assert_eq!(session.optimizer.state().unwrap(), saved.optimizer_state);
    assert_eq!(session.horizon, TrainingHorizon::EpochBased { max_epochs: 3 });
}

#[test]
fn auto_resume_picks_up_where_the_last_run_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let mut raw = raw_config(dir.path());
    raw.common.auto_resume = true;

    let (fresh, _) = RunSupervisor::new(leader(), resolve(&raw), collaborators(None))
        .prepare()
        .unwrap();
    assert_eq!((fresh.start_epoch, fresh.start_iteration), (0, 0));
    assert_eq!(fresh.best_metric, f64::INFINITY);
    drop(fresh);

    RunSupervisor::new(leader(), resolve(&raw), collaborators(None))
        .run()
        .unwrap();

    raw.scheduler.max_epochs = Some(4);
    let (resumed, _) = RunSupervisor::new(leader(), resolve(&raw), collaborators(None))
        .prepare()
        .unwrap();
    assert_eq!((resumed.start_epoch, resumed.start_iteration), (2, 32));
}

#[test]
fn fine_tune_seeds_model_and_ema_but_not_counters() {
    let dir = tempfile::tempdir().unwrap();
    let seed_path = dir.path().join("seed.safetensors");
    let seed_weights: kiln_checkpoint::StateDict = get_dummy_parameters(FEATURES)
        .into_iter()
        .map(|(name, t)| (name, Tensor::full(t.shape().to_vec(), 0.7)))
        .collect();
    SafetensorsStore
        .save_weights(
            &seed_path,
            &SeedWeights {
                weights: seed_weights.clone(),
                ema_weights: None,
            },
        )
        .unwrap();

    let mut raw = raw_config(dir.path());
    raw.common.finetune = Some(seed_path);
    raw.ema.enable = true;
    raw.stats.checkpoint_metric_max = true;
    let (session, _) = RunSupervisor::new(leader(), resolve(&raw), collaborators(None))
        .prepare()
        .unwrap();

    assert_eq!(session.model.parameters(), &seed_weights);
    assert_eq!(session.ema.as_ref().unwrap().state(), &seed_weights);
    assert_eq!((session.start_epoch, session.start_iteration), (0, 0));
    assert_eq!(session.best_metric, 0.0);
    assert_eq!(session.scaler, GradScalerState::new(false));
}

#[test]
fn corrupt_checkpoint_aborts_before_training() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.safetensors");
    std::fs::write(&path, b"\x08\x00\x00\x00\x00\x00\x00\x00{garbage").unwrap();

    let mut raw = raw_config(dir.path());
    raw.common.resume = Some(path);
    let err = RunSupervisor::new(leader(), resolve(&raw), collaborators(None))
        .run()
        .unwrap_err();
    assert!(
        matches!(
            err,
            SupervisorError::Checkpoint(CheckpointError::Format { .. })
        ),
        "{err}"
    );
}

#[test_log::test]
fn tracker_failure_does_not_stop_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut raw = raw_config(dir.path());
    raw.tracker.enable = true;
    let (session, _) = RunSupervisor::new(
        leader(),
        resolve(&raw),
        collaborators(Some(Box::new(BrokenTracker))),
    )
    .prepare()
    .unwrap();
    assert!(session.tracker.is_none());
}

#[test]
fn leader_tracks_into_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut raw = raw_config(dir.path());
    raw.tracker.enable = true;
    raw.scheduler.max_epochs = Some(1);
    let config = resolve(&raw);
    let tracker_root = config.exp_dir.join("tracker");
    RunSupervisor::new(
        leader(),
        config,
        collaborators(Some(Box::new(FileTracker::new(&tracker_root)))),
    )
    .run()
    .unwrap();

    let metrics =
        std::fs::read_to_string(tracker_root.join("kiln/run_1/metrics.jsonl")).unwrap();
    assert_eq!(metrics.lines().count(), 1);
}

#[test]
fn workers_leave_side_effects_to_the_leader() {
    let dir = tempfile::tempdir().unwrap();
    let mut raw = raw_config(dir.path());
    raw.tracker.enable = true;
    let config = resolve(&raw);
    let exp_dir = config.exp_dir.clone();
    let worker = WorkerIdentity::new(1, None, 2, Device::Cpu);

    let (session, _) = RunSupervisor::new(
        worker,
        config,
        collaborators(Some(Box::new(FileTracker::new(dir.path().join("tracker"))))),
    )
    .prepare()
    .unwrap();
    assert!(session.tracker.is_none());
    assert!(!exp_dir.exists());
    assert!(!dir.path().join("tracker").exists());
    assert_eq!(
        session.placement,
        Placement::Host {
            memory_format: kiln_trainer::MemoryFormat::Contiguous
        }
    );
}

#[test]
fn iteration_horizon_stops_mid_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let mut raw = raw_config(dir.path());
    raw.scheduler.is_iteration_based = true;
    raw.scheduler.max_iterations = Some(5);
    let config = resolve(&raw);
    let checkpoint_path = config.checkpoint_path();
    RunSupervisor::new(leader(), config, collaborators(None))
        .run()
        .unwrap();

    let checkpoint = SafetensorsStore.load(&checkpoint_path).unwrap();
    assert_eq!(checkpoint.epoch, 0);
    assert_eq!(checkpoint.iterations, 4);
}

#[test_log::test]
fn cancelled_run_fails_without_training() {
    let dir = tempfile::tempdir().unwrap();
    let mut raw = raw_config(dir.path());
    raw.scheduler.max_epochs = Some(1_000_000);
    let config = resolve(&raw);
    let checkpoint_path = config.checkpoint_path();

    let token = CancellationToken::new();
    token.cancel();
    let err = RunSupervisor::new(leader(), config, collaborators(None))
        .with_cancellation(token)
        .run()
        .unwrap_err();
    assert!(matches!(err, SupervisorError::Interrupted), "{err}");
    assert!(!checkpoint_path.exists());
}

#[test_log::test]
fn interrupt_stops_a_long_run_between_steps() {
    let dir = tempfile::tempdir().unwrap();
    let mut raw = raw_config(dir.path());
    raw.scheduler.max_epochs = Some(1_000_000);
    let config = resolve(&raw);
    let checkpoint_path = config.checkpoint_path();

    let token = CancellationToken::new();
    let interrupt = {
        let token = token.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            token.cancel();
        })
    };
    let err = RunSupervisor::new(leader(), config, collaborators(None))
        .with_cancellation(token)
        .run()
        .unwrap_err();
    interrupt.join().unwrap();
    assert!(matches!(err, SupervisorError::Interrupted), "{err}");

    if checkpoint_path.exists() {
        let checkpoint = SafetensorsStore.load(&checkpoint_path).unwrap();
        assert!(checkpoint.epoch < 999_999);
    }
}
