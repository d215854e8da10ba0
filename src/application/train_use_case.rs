// ============================================================
// Layer 2 — Train / Test / Finetune Use Cases
// ============================================================
// The three entry points of the command surface:
//
//   run_train(config)
//     Step 1: Build the dataset index (subject-level folds)  (Layer 4)
//     Step 2: Fit or reload the normalisation statistics     (Layer 4)
//     Step 3: Build fold loaders                             (Layer 4)
//     Step 4: Initialise or resume the orchestrator          (Layer 5)
//     Step 5: Run to completion or stop                      (Layer 5)
//
//   run_test(config) -> metrics
//     Reopens the checkpoint's own fold assignment and frozen
//     statistics, evaluates the best model on the test fold.
//
//   run_finetune(config, checkpoint) -> metrics
//     New assignment from config, parameters from checkpoint.
//
// A checkpoint directory that already holds an experiment is
// resumed, never overwritten. The config is stored next to the
// checkpoint so every later run can check it rebuilds the same
// architecture before loading parameters into it.
//
// Reference: Burn Book §5 (Training)

use anyhow::{anyhow, Context, Result};
use burn::{
    backend::{ndarray::NdArrayDevice, Autodiff, NdArray},
    optim::AdamConfig,
};
use std::{path::Path, sync::Arc};

use crate::application::config::{ExperimentConfig, CONFIG_FILE};
use crate::data::{
    index::DatasetIndex,
    loader::WindowLoader,
    normalizer::ChannelNormalizer,
    store::CanonicalStore,
};
use crate::domain::{
    error::{PipelineError, PipelineResult},
    fold::Fold,
    traits::Persistable,
};
use crate::infra::checkpoint::CheckpointManager;
use crate::ml::{
    baseline::LinearBaseline,
    metrics::EvaluationMetrics,
    registry::ModelKind,
    state::{ExperimentIdentity, ExperimentState},
    trainer::{evaluate, ExperimentSetup, FoldLoaders, Orchestrator, RunReport, StopSignal},
};

/// Training runs on the CPU ndarray backend with autodiff.
pub type TrainBackend = Autodiff<NdArray>;
/// Evaluation needs no gradients.
pub type EvalBackend = NdArray;

// ─── run_train ────────────────────────────────────────────────────────────────

pub fn run_train(config: &ExperimentConfig) -> Result<RunReport> {
    run_train_until(config, &StopSignal::new())
}

/// `run_train` honouring an external stop signal.
pub fn run_train_until(config: &ExperimentConfig, stop: &StopSignal) -> Result<RunReport> {
    config.validate()?;
    let device = NdArrayDevice::default();

    // ── Step 1: Dataset index ────────────────────────────────────────────────
    let index = Arc::new(build_index(config)?);

    // ── Step 2: Normalisation ────────────────────────────────────────────────
    let checkpoints = CheckpointManager::new(&config.checkpoint_path)?;
    let resuming    = checkpoints.exists();
    if resuming {
        check_saved_config(&checkpoints, config)?;
    }
    let normalizer = normalizer_for(&checkpoints, &index, resuming)?;

    // ── Step 3: Loaders ──────────────────────────────────────────────────────
    let setup = experiment_setup(config, &index, &normalizer, checkpoints, device)?;
    if !resuming {
        config.save(&setup.checkpoints.dir().join(CONFIG_FILE))?;
    }

    // ── Steps 4-5: Orchestrate ───────────────────────────────────────────────
    let report = match config.model {
        ModelKind::Linear => {
            let model = linear_model(config, &index, &device);
            let optim = AdamConfig::new().init::<TrainBackend, LinearBaseline<TrainBackend>>();
            let mut orchestrator = if resuming {
                Orchestrator::resume(setup, model, optim)?
            } else {
                Orchestrator::initialize(setup, model, optim)?
            };
            orchestrator.run(stop)?
        }
    };

    tracing::info!(
        "Training finished in phase {} after {} epoch(s); best epoch {}",
        report.phase,
        report.epochs,
        report.best_epoch
    );
    Ok(report)
}

// ─── run_test ─────────────────────────────────────────────────────────────────

pub fn run_test(config: &ExperimentConfig) -> Result<EvaluationMetrics> {
    let trained = TrainedExperiment::open(config)?;
    let loader  = trained.loader(Fold::Test)?;
    let metrics = evaluate::<EvalBackend, _>(&trained.model, &loader, &trained.device, config.prefetch_depth)?;
    tracing::info!("Test fold: {}", metrics);
    Ok(metrics)
}

// ─── run_finetune ─────────────────────────────────────────────────────────────

/// Finetune the model in `checkpoint` on the data selected by `config`,
/// writing a new experiment to `config.checkpoint_path`.
pub fn run_finetune(config: &ExperimentConfig, checkpoint: &Path) -> Result<EvaluationMetrics> {
    config.validate()?;
    let device = NdArrayDevice::default();
    let source = CheckpointManager::open(checkpoint)?;
    check_saved_config(&source, config)?;

    let index       = Arc::new(build_index(config)?);
    let checkpoints = CheckpointManager::new(&config.checkpoint_path)?;
    let resuming    = checkpoints.exists();
    if resuming {
        check_saved_config(&checkpoints, config)?;
    }
    let normalizer = normalizer_for(&checkpoints, &index, resuming)?;
    let setup      = experiment_setup(config, &index, &normalizer, checkpoints, device)?;
    if !resuming {
        config.save(&setup.checkpoints.dir().join(CONFIG_FILE))?;
    }

    let report = match config.model {
        ModelKind::Linear => {
            let model = linear_model(config, &index, &device);
            let optim = AdamConfig::new().init::<TrainBackend, LinearBaseline<TrainBackend>>();
            let mut orchestrator = if resuming {
                Orchestrator::resume(setup, model, optim)?
            } else {
                Orchestrator::finetune(setup, model, optim, &source)?
            };
            orchestrator.run(&StopSignal::new())?
        }
    };

    report
        .test
        .or(report.validation)
        .ok_or_else(|| anyhow!("finetuning stopped before any epoch completed"))
}

// ─── Trained experiment access ────────────────────────────────────────────────

/// A committed experiment reopened for evaluation: its own fold
/// assignment, frozen statistics and best parameters.
pub struct TrainedExperiment {
    pub checkpoints: CheckpointManager,
    pub state:       ExperimentState,
    pub index:       Arc<DatasetIndex>,
    pub normalizer:  Arc<ChannelNormalizer>,
    pub model:       LinearBaseline<EvalBackend>,
    pub device:      NdArrayDevice,
    config:          ExperimentConfig,
}

impl TrainedExperiment {
    pub fn open(config: &ExperimentConfig) -> Result<Self> {
        let checkpoints = CheckpointManager::open(&config.checkpoint_path)?;
        check_saved_config(&checkpoints, config)?;
        let state = checkpoints.load_state()?;
        if state.identity.seed != config.seed || state.identity.ratios != config.fold_ratios {
            tracing::warn!(
                "Config asks for seed {} / {:?}; using the checkpoint's assignment (seed {})",
                config.seed,
                config.fold_ratios,
                state.identity.seed
            );
        }

        let store = CanonicalStore::new(&config.store_path);
        let index = Arc::new(
            DatasetIndex::from_assignment(&store, state.identity.assignment.clone())
                .context("Cannot reopen the experiment's subjects in the canonical store")?,
        );
        let normalizer = Arc::new(
            checkpoints
                .load_normalizer()?
                .unwrap_or_else(|| ChannelNormalizer::identity(index.shape().channels)),
        );

        let device = NdArrayDevice::default();
        let model  = match config.model {
            ModelKind::Linear => {
                let template = config
                    .model
                    .linear_config(config.loader_config().sequence_length(), index.shape())
                    .init::<EvalBackend>(&device);
                checkpoints.load_best_or_latest::<EvalBackend, _>(template, &state, &device)?
            }
        };

        tracing::info!(
            "Opened experiment '{}': phase {}, {} epoch(s), best epoch {}",
            checkpoints.dir().display(),
            state.phase,
            state.epoch,
            state.early_stopping.best_epoch
        );
        Ok(Self { checkpoints, state, index, normalizer, model, device, config: config.clone() })
    }

    /// Normalised loader over `fold` with the experiment's context settings.
    pub fn loader(&self, fold: Fold) -> PipelineResult<WindowLoader> {
        WindowLoader::new(self.index.clone(), fold, self.config.loader_config())?
            .with_normalizer(self.normalizer.clone())
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn build_index(config: &ExperimentConfig) -> Result<DatasetIndex> {
    let store = CanonicalStore::new(&config.store_path);
    let index = DatasetIndex::build(&store, &config.datasets, config.fold_ratios, config.seed)
        .with_context(|| format!("Cannot index canonical store '{}'", config.store_path.display()))?;

    let expected = config.canonical_spec().shape()?;
    if index.shape() != expected {
        return Err(PipelineError::InvalidConfig(format!(
            "store windows are {} but the config describes {}; re-run prepare",
            index.shape(),
            expected
        ))
        .into());
    }

    let assignment = index.assignment();
    tracing::info!(
        "Folds (seed {}): {} train / {} validation / {} test subjects",
        config.seed,
        assignment.count(Fold::Train),
        assignment.count(Fold::Validation),
        assignment.count(Fold::Test)
    );
    Ok(index)
}

/// Frozen statistics of a resumed experiment, or fresh ones from
/// the training fold.
fn normalizer_for(checkpoints: &CheckpointManager, index: &DatasetIndex, resuming: bool) -> Result<Arc<ChannelNormalizer>> {
    if resuming {
        let saved = checkpoints
            .load_normalizer()?
            .ok_or_else(|| anyhow!("'{}' has no normalization statistics", checkpoints.dir().display()))?;
        return Ok(Arc::new(saved));
    }
    let fitted = ChannelNormalizer::fit(index, Fold::Train)?;
    checkpoints.save_normalizer(&fitted)?;
    Ok(Arc::new(fitted))
}

fn experiment_setup(
    config:      &ExperimentConfig,
    index:       &Arc<DatasetIndex>,
    normalizer:  &Arc<ChannelNormalizer>,
    checkpoints: CheckpointManager,
    device:      NdArrayDevice,
) -> PipelineResult<ExperimentSetup<TrainBackend>> {
    let loader = |fold: Fold| -> PipelineResult<WindowLoader> {
        WindowLoader::new(index.clone(), fold, config.loader_config())?.with_normalizer(normalizer.clone())
    };
    let test = if config.fold_ratios.test > 0.0 {
        Some(loader(Fold::Test)?)
    } else {
        None
    };
    let loaders = FoldLoaders {
        train:      loader(Fold::Train)?,
        validation: loader(Fold::Validation)?,
        test,
    };

    Ok(ExperimentSetup {
        plan:     config.plan(),
        loaders,
        checkpoints,
        identity: ExperimentIdentity::new(config.datasets.clone(), config.model.as_str(), index.assignment().clone()),
        device,
    })
}

fn linear_model(config: &ExperimentConfig, index: &DatasetIndex, device: &NdArrayDevice) -> LinearBaseline<TrainBackend> {
    config
        .model
        .linear_config(config.loader_config().sequence_length(), index.shape())
        .init::<TrainBackend>(device)
}

/// The architecture stored with a checkpoint must match the one
/// `config` would build.
fn check_saved_config(checkpoints: &CheckpointManager, config: &ExperimentConfig) -> Result<()> {
    let path  = checkpoints.dir().join(CONFIG_FILE);
    let saved = ExperimentConfig::load(&path)?;

    let mut diffs = Vec::new();
    if saved.model != config.model {
        diffs.push(format!("model {} vs {}", saved.model, config.model));
    }
    if saved.context_length != config.context_length {
        diffs.push(format!("context_length {} vs {}", saved.context_length, config.context_length));
    }
    let (a, b) = (saved.canonical_spec().shape()?, config.canonical_spec().shape()?);
    if a != b {
        diffs.push(format!("window shape {a} vs {b}"));
    }

    if diffs.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::CheckpointMismatch { path, reason: diffs.join("; ") }.into())
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::canonicalizer::RolePolicy;
    use crate::domain::fold::FoldRatios;
    use crate::domain::signal::ChannelRole;
    use crate::domain::subject::SourceDataset;
    use crate::ml::state::Phase;
    use crate::testutil::populate_store;

    /// Matches the synthetic store: 10 Hz, 3 s windows, EEG + EOG.
    fn config(root: &Path, source: SourceDataset, ckpt: &str) -> ExperimentConfig {
        ExperimentConfig {
            datasets:        vec![source],
            fold_ratios:     FoldRatios::new(2.0, 1.0, 1.0),
            seed:            5,
            batch_size:      2,
            context_length:  1,
            max_epochs:      2,
            patience:        0,
            learning_rate:   1e-3,
            prefetch_depth:  2,
            checkpoint_path: root.join(ckpt),
            store_path:      root.join("store"),
            target_rate:     10.0,
            epoch_duration:  3.0,
            channels:        vec![RolePolicy::required(ChannelRole::Eeg), RolePolicy::required(ChannelRole::Eog)],
            ..Default::default()
        }
    }

    #[test]
    fn test_train_then_test() {
        let dir = tempfile::tempdir().unwrap();
        populate_store(&dir.path().join("store"), &[(SourceDataset::Hmc, 4)], 6);
        let cfg = config(dir.path(), SourceDataset::Hmc, "ckpt");

        let report = run_train(&cfg).unwrap();
        assert_eq!(report.phase, Phase::Completed);
        assert_eq!(report.epochs, 2);
        assert!(cfg.checkpoint_path.join("normalization.json").is_file());
        assert!(cfg.checkpoint_path.join(CONFIG_FILE).is_file());

        // One test subject, 6 windows, context 1 each side → 4 targets
        let metrics = run_test(&cfg).unwrap();
        assert_eq!(metrics.windows, 4);
        assert_eq!(report.test.unwrap().windows, 4);
    }

    #[test]
    fn test_rerun_resumes_and_extends() {
        let dir = tempfile::tempdir().unwrap();
        populate_store(&dir.path().join("store"), &[(SourceDataset::Hmc, 4)], 6);
        let mut cfg = config(dir.path(), SourceDataset::Hmc, "ckpt");
        cfg.max_epochs = 1;
        assert_eq!(run_train(&cfg).unwrap().epochs, 1);

        cfg.max_epochs = 3;
        let report = run_train(&cfg).unwrap();
        assert_eq!(report.epochs, 3);
        let state = CheckpointManager::open(&cfg.checkpoint_path).unwrap().load_state().unwrap();
        assert_eq!(state.history.len(), 3);
    }

    #[test]
    fn test_changed_architecture_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        populate_store(&dir.path().join("store"), &[(SourceDataset::Hmc, 4)], 6);
        let mut cfg = config(dir.path(), SourceDataset::Hmc, "ckpt");
        cfg.max_epochs = 1;
        run_train(&cfg).unwrap();

        cfg.context_length = 2;
        let err = run_test(&cfg).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::CheckpointMismatch { .. })
        ));
    }

    #[test]
    fn test_empty_test_fold_is_reported() {
        // 2 subjects × 4 windows, ratios {1, 1, 0}
        let dir = tempfile::tempdir().unwrap();
        populate_store(&dir.path().join("store"), &[(SourceDataset::Svuh, 2)], 4);
        let mut cfg = config(dir.path(), SourceDataset::Svuh, "ckpt");
        cfg.fold_ratios    = FoldRatios::new(1.0, 1.0, 0.0);
        cfg.context_length = 0;
        cfg.max_epochs     = 1;

        let report = run_train(&cfg).unwrap();
        assert!(report.test.is_none());

        let err = run_test(&cfg).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::EmptyFold { fold, total_subjects }) => {
                assert_eq!(*fold, Fold::Test);
                assert_eq!(*total_subjects, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_finetune_on_new_dataset() {
        let dir = tempfile::tempdir().unwrap();
        populate_store(&dir.path().join("store"), &[(SourceDataset::Hmc, 4), (SourceDataset::Mass, 4)], 6);
        let base = config(dir.path(), SourceDataset::Hmc, "base");
        run_train(&base).unwrap();

        let mut tuned = config(dir.path(), SourceDataset::Mass, "tuned");
        tuned.learning_rate = 1e-4;
        tuned.max_epochs    = 1;
        let metrics = run_finetune(&tuned, &base.checkpoint_path).unwrap();
        assert_eq!(metrics.windows, 4);

        let state = CheckpointManager::open(&tuned.checkpoint_path).unwrap().load_state().unwrap();
        let origin = state.origin.unwrap();
        assert_eq!(origin.datasets, vec![SourceDataset::Hmc]);
        assert_eq!(origin.epoch, 2);
        assert!(state
            .identity
            .assignment
            .entries()
            .iter()
            .all(|e| e.subject.source == SourceDataset::Mass));
    }
}
