// ============================================================
// Layer 5 — Experiment Orchestrator
// ============================================================
// One training loop for any ModelAdapter, driven as a state
// machine:
//
//   Initializing ─┐
//   Finetuning ───┴─► Training ◄──────────┐
//                        │ epoch done     │ improved / patience left
//                        ▼                │
//                    Validating ──────────┘
//                        │ patience exhausted      max epochs reached
//                        ▼                               │
//                   EarlyStopped ──────► Completed ◄─────┘
//                                        (test fold evaluated)
//   any error during forward/loss/checkpoint ──► Failed
//
// Every epoch ends with a committed checkpoint. A stop request is
// honoured only between batches and produces a mid-epoch
// checkpoint; resuming continues at the next batch with the same
// shuffle order, so the result matches an uninterrupted run.
//
// Training runs on the autodiff backend B; validation and test
// passes run on model.valid() over B::InnerBackend, without
// gradient tracking.
//
// Reference: Burn Book §5 (Custom Training Loop)
//            Kingma & Ba (2015) Adam
//            Prechelt (1998) Early Stopping — But When?

use burn::{
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
};
use std::{
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use crate::data::{
    batcher::SignalBatcher,
    loader::WindowLoader,
    prefetch::Prefetcher,
};
use crate::domain::error::{PipelineError, PipelineResult};
use crate::domain::fold::Fold;
use crate::infra::{
    checkpoint::CheckpointManager,
    metrics::{EpochMetrics, MetricsLogger},
};
use crate::ml::{
    adapter::ModelAdapter,
    early_stopping::{EarlyStopping, Verdict},
    metrics::{ConfusionMatrix, EvaluationMetrics, Monitor},
    state::{EpochCursor, EpochRecord, ExperimentIdentity, ExperimentState, FinetuneOrigin, Phase},
};

// ─── Stop Signal ──────────────────────────────────────────────────────────────

/// Cooperative stop request, shared between the caller and the loop.
///
/// Clones share the same flag. A batch budget requests the stop
/// automatically once that many training batches have run.
#[derive(Debug, Clone)]
pub struct StopSignal {
    requested: Arc<AtomicBool>,
    budget:    Arc<AtomicUsize>,
}

impl Default for StopSignal {
    fn default() -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            budget:    Arc::new(AtomicUsize::new(usize::MAX)),
        }
    }
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_budget(batches: usize) -> Self {
        let signal = Self::default();
        signal.budget.store(batches, Ordering::SeqCst);
        if batches == 0 {
            signal.request();
        }
        signal
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    fn batch_done(&self) {
        let left = self.budget.load(Ordering::SeqCst);
        if left == usize::MAX {
            return;
        }
        let left = left.saturating_sub(1);
        self.budget.store(left, Ordering::SeqCst);
        if left == 0 {
            self.request();
        }
    }
}

// ─── Setup ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TrainingPlan {
    pub max_epochs:     usize,
    /// 0 disables early stopping
    pub patience:       usize,
    pub monitor:        Monitor,
    pub learning_rate:  f64,
    /// Drives the per-epoch shuffle order
    pub seed:           u64,
    pub prefetch_depth: usize,
}

#[derive(Debug, Clone)]
pub struct FoldLoaders {
    pub train:      WindowLoader,
    pub validation: WindowLoader,
    /// None when the experiment has no test fold
    pub test:       Option<WindowLoader>,
}

/// Everything an orchestrator is bound to besides model and optimiser.
#[derive(Debug, Clone)]
pub struct ExperimentSetup<B: Backend> {
    pub plan:        TrainingPlan,
    pub loaders:     FoldLoaders,
    pub checkpoints: CheckpointManager,
    pub identity:    ExperimentIdentity,
    pub device:      B::Device,
}

/// Outcome of one `run` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub phase:            Phase,
    pub epochs:           usize,
    pub early_stopped_at: Option<usize>,
    pub best_epoch:       usize,
    pub best_value:       Option<f64>,
    pub validation:       Option<EvaluationMetrics>,
    pub test:             Option<EvaluationMetrics>,
}

impl RunReport {
    /// A stop request interrupted the run before completion.
    pub fn interrupted(&self) -> bool {
        self.phase != Phase::Completed
    }
}

/// Shuffle seed of one training epoch.
pub fn epoch_seed(seed: u64, epoch: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(epoch as u64)
}

// ─── Evaluation ───────────────────────────────────────────────────────────────

/// One pass over `loader` in index order, without parameter updates.
/// Loss is the mean cross-entropy per window.
pub fn evaluate<B: Backend, M: ModelAdapter<B>>(
    model:          &M,
    loader:         &WindowLoader,
    device:         &B::Device,
    prefetch_depth: usize,
) -> PipelineResult<EvaluationMetrics> {
    let batcher = SignalBatcher::<B>::new(device.clone(), loader.config().sequence_length(), loader.shape());

    let mut confusion = ConfusionMatrix::new();
    let mut loss_sum  = 0.0f64;
    let mut windows   = 0usize;

    for batch in Prefetcher::spawn(loader.batches(None), prefetch_depth) {
        let batch   = batch?;
        let tensors = batcher.from_batch(&batch);
        let scores  = model.forward(&tensors);

        let loss: f64 = model
            .loss(scores.clone(), tensors.labels.clone())
            .into_scalar()
            .elem::<f64>();
        loss_sum += loss * batch.len() as f64;
        windows  += batch.len();

        let predicted: Vec<i64> = scores.argmax(1).into_data().iter::<i64>().collect();
        for (truth, p) in batch.labels().iter().zip(predicted) {
            confusion.record(truth.index(), p as usize);
        }
    }

    let loss = if windows > 0 { loss_sum / windows as f64 } else { f64::NAN };
    Ok(EvaluationMetrics::from_confusion(&confusion, loss))
}

// ─── Orchestrator ─────────────────────────────────────────────────────────────

pub struct Orchestrator<B: AutodiffBackend, M, O> {
    model:       M,
    optim:       O,
    state:       ExperimentState,
    plan:        TrainingPlan,
    loaders:     FoldLoaders,
    checkpoints: CheckpointManager,
    metrics:     MetricsLogger,
    device:      B::Device,
    _backend:    PhantomData<B>,
}

impl<B, M, O> Orchestrator<B, M, O>
where
    B: AutodiffBackend,
    M: ModelAdapter<B> + AutodiffModule<B>,
    M::InnerModule: ModelAdapter<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    /// Bind a freshly initialised model to a new experiment.
    pub fn initialize(setup: ExperimentSetup<B>, model: M, optim: O) -> PipelineResult<Self> {
        if setup.checkpoints.exists() {
            return Err(PipelineError::InvalidConfig(format!(
                "'{}' already holds an experiment; resume it or choose another checkpoint path",
                setup.checkpoints.dir().display()
            )));
        }
        let stopper = EarlyStopping::new(setup.plan.monitor, setup.plan.patience);
        let state   = ExperimentState::new(setup.identity.clone(), stopper);

        tracing::info!(
            "Initialising experiment: seed={}, {} subjects, {} parameters",
            state.identity.seed,
            state.identity.assignment.len(),
            model.parameter_count()
        );
        Self::bind(setup, model, optim, state)
    }

    /// Continue the experiment committed in `setup.checkpoints`.
    /// `model` and `optim` are templates of the checkpointed architecture.
    pub fn resume(setup: ExperimentSetup<B>, model: M, optim: O) -> PipelineResult<Self> {
        let mut state = setup.checkpoints.load_state()?;
        state.identity.verify(&setup.identity, &setup.checkpoints.state_path())?;

        let tag   = state.tag();
        let model = setup.checkpoints.load_model::<B, M>(model, &tag, &setup.device)?;
        let optim = setup.checkpoints.load_optimizer::<B, M, O>(optim, &tag, &setup.device)?;

        if state.early_stopping.monitor != setup.plan.monitor {
            tracing::warn!(
                "Checkpoint monitors {}, keeping it (requested {})",
                state.early_stopping.monitor,
                setup.plan.monitor
            );
        }
        state.early_stopping.patience = setup.plan.patience;

        match state.cursor {
            Some(c) => tracing::info!(
                "Resuming from '{}': epoch {} after batch {}",
                setup.checkpoints.dir().display(),
                c.epoch,
                c.batches_done
            ),
            None => tracing::info!(
                "Resuming from '{}': {} epoch(s) completed, phase {}",
                setup.checkpoints.dir().display(),
                state.epoch,
                state.phase
            ),
        }

        let mut orchestrator = Self::bind(setup, model, optim, state)?;
        let committed = orchestrator.state.epoch;
        let path = orchestrator.checkpoints.metrics_path();
        orchestrator
            .checkpoints
            .retry()
            .run(&path, || orchestrator.metrics.truncate_after(committed))?;
        Ok(orchestrator)
    }

    /// Start a new lifecycle from the parameters of `source`.
    ///
    /// Only parameters carry over (best epoch if one was recorded).
    /// Optimiser, early stopping and fold assignment are new, and
    /// the new assignment is committed immediately.
    pub fn finetune(setup: ExperimentSetup<B>, model: M, optim: O, source: &CheckpointManager) -> PipelineResult<Self> {
        if source.dir() == setup.checkpoints.dir() {
            return Err(PipelineError::InvalidConfig(
                "finetuning must write to a different checkpoint path than its source".into(),
            ));
        }
        let origin_state = source.load_state()?;
        if origin_state.identity.model != setup.identity.model {
            return Err(PipelineError::CheckpointMismatch {
                path:   source.state_path(),
                reason: format!(
                    "checkpoint holds model '{}', finetuning requested '{}'",
                    origin_state.identity.model, setup.identity.model
                ),
            });
        }
        let model = source.load_best_or_latest::<B, M>(model, &origin_state, &setup.device)?;

        let reused = origin_state
            .identity
            .assignment
            .subjects(Fold::Train)
            .filter(|s| {
                matches!(setup.identity.assignment.fold_of(s), Some(Fold::Validation | Fold::Test))
            })
            .count();
        if reused > 0 {
            tracing::warn!(
                "{} subject(s) trained on in the source experiment are evaluated in the new assignment",
                reused
            );
        }

        let mut orchestrator = Self::initialize(setup, model, optim)?;
        orchestrator.state.origin = Some(FinetuneOrigin {
            checkpoint: source.dir().to_path_buf(),
            epoch:      origin_state.epoch,
            seed:       origin_state.identity.seed,
            ratios:     origin_state.identity.ratios,
            datasets:   origin_state.identity.datasets.clone(),
        });
        orchestrator.state.phase = Phase::Finetuning;
        orchestrator.checkpoint()?;

        tracing::info!(
            "Finetuning from '{}' (epoch {}) on {} new subjects",
            source.dir().display(),
            origin_state.epoch,
            orchestrator.state.identity.assignment.len()
        );
        Ok(orchestrator)
    }

    fn bind(setup: ExperimentSetup<B>, model: M, optim: O, state: ExperimentState) -> PipelineResult<Self> {
        if setup.plan.max_epochs == 0 {
            return Err(PipelineError::InvalidConfig("max_epochs must be at least 1".into()));
        }
        if setup.loaders.train.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "training fold yields no target windows (recordings shorter than the context?)".into(),
            ));
        }
        let path    = setup.checkpoints.metrics_path();
        let metrics = setup.checkpoints.retry().run(&path, || MetricsLogger::new(&path))?;

        Ok(Self {
            model,
            optim,
            state,
            plan:        setup.plan,
            loaders:     setup.loaders,
            checkpoints: setup.checkpoints,
            metrics,
            device:      setup.device,
            _backend:    PhantomData,
        })
    }

    // ─── Accessors ──────────────────────────────────────────────────────────

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn state(&self) -> &ExperimentState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    // ─── Lifecycle ──────────────────────────────────────────────────────────

    /// Drive the experiment until completion or a honoured stop.
    /// Any error moves the experiment to Failed; the last committed
    /// checkpoint stays resumable.
    pub fn run(&mut self, stop: &StopSignal) -> PipelineResult<RunReport> {
        match self.drive(stop) {
            Ok(report) => Ok(report),
            Err(e) => {
                self.transition(Phase::Failed);
                tracing::error!(
                    "Experiment failed during {}: {} (last checkpoint: epoch {})",
                    e.stage().map(|s| s.to_string()).unwrap_or_else(|| "setup".into()),
                    e,
                    self.state.epoch
                );
                Err(e)
            }
        }
    }

    fn drive(&mut self, stop: &StopSignal) -> PipelineResult<RunReport> {
        let pending = self.state.early_stopped_at.is_none() && self.state.epoch < self.plan.max_epochs;
        if !pending && self.state.phase == Phase::Completed {
            tracing::info!("Experiment already completed at epoch {}", self.state.epoch);
            return Ok(self.report());
        }

        if pending {
            self.transition(Phase::Training);
            // Fresh experiments commit their initial weights as e0000
            if self.state.epoch == 0 && self.state.cursor.is_none() {
                self.checkpoint()?;
            }
        }

        // ── Epoch loop ────────────────────────────────────────────────────────
        while self.state.early_stopped_at.is_none() && self.state.epoch < self.plan.max_epochs {
            let epoch = self.state.epoch + 1;

            // ── Training phase ────────────────────────────────────────────────
            // None: a stop was honoured and a mid-epoch checkpoint written
            let Some(train_loss) = self.train_epoch(epoch, stop)? else {
                return Ok(self.report());
            };

            // ── Validation phase ──────────────────────────────────────────────
            // model.valid() → the same model on the inner (non-autodiff)
            // backend, so no graph is recorded while evaluating
            self.transition(Phase::Validating);
            let validation = evaluate::<B::InnerBackend, M::InnerModule>(
                &self.model.valid(),
                &self.loaders.validation,
                &self.device,
                self.plan.prefetch_depth,
            )?;
            let monitored = self.state.early_stopping.monitor.value(&validation);
            let verdict   = self.state.early_stopping.observe(epoch, monitored);

            tracing::info!(
                "Epoch {}/{} | train_loss={:.4} | val {} | {}",
                epoch,
                self.plan.max_epochs,
                train_loss,
                validation,
                match verdict {
                    Verdict::Improved      => "improved".to_string(),
                    Verdict::NoImprovement => format!("no improvement ({}/{})", self.state.early_stopping.counter, self.plan.patience),
                    Verdict::Stop          => "patience exhausted".to_string(),
                }
            );

            if verdict == Verdict::Improved {
                self.checkpoints.save_best::<B, M>(&self.model)?;
            }

            // ── Commit ────────────────────────────────────────────────────────
            // experiment.json is written last, so a crash before this point
            // resumes from the previous epoch
            let record = EpochRecord { epoch, train_loss, validation, improved: verdict == Verdict::Improved };
            self.state.history.push(record);
            self.state.epoch  = epoch;
            self.state.cursor = None;

            if verdict == Verdict::Stop {
                self.state.early_stopped_at = Some(epoch);
                self.transition(Phase::EarlyStopped);
            } else if epoch < self.plan.max_epochs {
                self.transition(Phase::Training);
            }
            self.checkpoint()?;
            self.log_epoch()?;
        }

        self.complete()
    }

    /// One training epoch from the cursor on. `None` when a stop was honoured.
    fn train_epoch(&mut self, epoch: usize, stop: &StopSignal) -> PipelineResult<Option<f64>> {
        // Resume mid-epoch from the committed cursor, if it belongs here
        let (start, mut loss_sum) = match self.state.cursor {
            Some(c) if c.epoch == epoch => (c.batches_done, c.loss_sum),
            _ => (0, 0.0),
        };

        // Same seed + epoch → same order, so skipping `start` batches
        // lands exactly where the interrupted pass stopped
        let batches = self
            .loaders
            .train
            .batches(Some(epoch_seed(self.plan.seed, epoch)))
            .skip_batches(start);
        let batcher = SignalBatcher::<B>::new(
            self.device.clone(),
            self.loaders.train.config().sequence_length(),
            self.loaders.train.shape(),
        );

        let mut done = start;
        for batch in Prefetcher::spawn(batches, self.plan.prefetch_depth) {
            // Stops are only honoured between batches
            if stop.is_requested() {
                self.state.cursor = Some(EpochCursor { epoch, batches_done: done, loss_sum });
                self.checkpoint()?;
                tracing::info!("Stop honoured in epoch {} after {} batch(es); checkpoint written", epoch, done);
                return Ok(None);
            }

            // Forward pass: [N, L, C, S] → scores [N, classes]
            let batch   = batch?;
            let tensors = batcher.from_batch(&batch);
            let scores  = self.model.forward(&tensors);
            let loss    = self.model.loss(scores, tensors.labels.clone());

            // A NaN/inf loss would poison every later step; fail before
            // the optimizer touches the weights
            let value: f64 = loss.clone().into_scalar().elem::<f64>();
            if !value.is_finite() {
                return Err(PipelineError::TrainingDiverged { epoch, batch: done + 1, loss: value });
            }

            // Backward pass + Adam update
            let grads  = loss.backward();
            let grads  = GradientsParams::from_grads(grads, &self.model);
            self.model = self.optim.step(self.plan.learning_rate, self.model.clone(), grads);

            loss_sum += value;
            done     += 1;
            tracing::debug!("Epoch {} batch {}/{}: loss={:.4}", epoch, done, self.loaders.train.num_batches(), value);
            stop.batch_done();
        }

        Ok(Some(if done > 0 { loss_sum / done as f64 } else { f64::NAN }))
    }

    fn complete(&mut self) -> PipelineResult<RunReport> {
        self.state.test = match &self.loaders.test {
            Some(loader) => {
                let best = self
                    .checkpoints
                    .load_best_or_latest::<B, M>(self.model.clone(), &self.state, &self.device)?;
                let metrics = evaluate::<B::InnerBackend, M::InnerModule>(
                    &best.valid(),
                    loader,
                    &self.device,
                    self.plan.prefetch_depth,
                )?;
                tracing::info!("Test (best epoch {}): {}", self.state.early_stopping.best_epoch, metrics);
                Some(metrics)
            }
            None => {
                tracing::info!("No test fold in this experiment; skipping test evaluation");
                None
            }
        };

        self.transition(Phase::Completed);
        self.checkpoint()?;
        Ok(self.report())
    }

    fn transition(&mut self, next: Phase) {
        if self.state.phase != next {
            tracing::debug!("Phase {} → {}", self.state.phase, next);
            self.state.phase = next;
        }
    }

    fn checkpoint(&self) -> PipelineResult<()> {
        self.checkpoints.save::<B, M, O>(&self.state, &self.model, &self.optim)
    }

    fn log_epoch(&self) -> PipelineResult<()> {
        let Some(record) = self.state.history.last() else { return Ok(()) };
        let row  = EpochMetrics::from(record);
        let path = self.metrics.csv_path().to_path_buf();
        self.checkpoints.retry().run(&path, || self.metrics.log(&row))
    }

    fn report(&self) -> RunReport {
        RunReport {
            phase:            self.state.phase,
            epochs:           self.state.epoch,
            early_stopped_at: self.state.early_stopped_at,
            best_epoch:       self.state.early_stopping.best_epoch,
            best_value:       self.state.early_stopping.best,
            validation:       self.state.history.last().map(|r| r.validation.clone()),
            test:             self.state.test.clone(),
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{
        index::DatasetIndex,
        loader::{ContextBoundary, LoaderConfig},
        normalizer::ChannelNormalizer,
    };
    use crate::domain::fold::FoldRatios;
    use crate::domain::subject::SourceDataset;
    use crate::infra::retry::RetryPolicy;
    use crate::ml::baseline::{LinearBaseline, LinearBaselineConfig};
    use crate::testutil::populate_store;
    use burn::optim::AdamConfig;
    use std::path::Path;
    use tempfile::TempDir;

    type B = burn::backend::Autodiff<burn::backend::NdArray>;

    /// 4 subjects × 6 windows of 2 × 30; folds 2 / 1 / 1 subjects.
    fn dataset(source: SourceDataset) -> (TempDir, Arc<DatasetIndex>) {
        let dir   = tempfile::tempdir().unwrap();
        let store = populate_store(&dir.path().join("store"), &[(source, 4)], 6);
        let index = DatasetIndex::build(&store, &[source], FoldRatios::new(2.0, 1.0, 1.0), 11).unwrap();
        (dir, Arc::new(index))
    }

    fn setup(index: &Arc<DatasetIndex>, ckpt: &Path, max_epochs: usize, patience: usize, lr: f64) -> ExperimentSetup<B> {
        let config = LoaderConfig { batch_size: 2, context_length: 0, boundary: ContextBoundary::Exclude };
        let norm   = Arc::new(ChannelNormalizer::fit(index, Fold::Train).unwrap());
        let loader = |fold| {
            WindowLoader::new(index.clone(), fold, config)
                .unwrap()
                .with_normalizer(norm.clone())
                .unwrap()
        };
        let datasets = vec![index.assignment().entries()[0].subject.source];
        ExperimentSetup {
            plan: TrainingPlan {
                max_epochs,
                patience,
                monitor:        Monitor::ValLoss,
                learning_rate:  lr,
                seed:           11,
                prefetch_depth: 2,
            },
            loaders: FoldLoaders {
                train:      loader(Fold::Train),
                validation: loader(Fold::Validation),
                test:       Some(loader(Fold::Test)),
            },
            checkpoints: CheckpointManager::with_retry(ckpt, RetryPolicy::immediate(1)).unwrap(),
            identity:    ExperimentIdentity::new(datasets, "linear", index.assignment().clone()),
            device:      Default::default(),
        }
    }

    fn model() -> LinearBaseline<B> {
        LinearBaselineConfig::new(1, 2, 30).init(&Default::default())
    }

    fn adam() -> impl Optimizer<LinearBaseline<B>, B> {
        AdamConfig::new().init::<B, LinearBaseline<B>>()
    }

    fn weights(m: &LinearBaseline<B>) -> Vec<f32> {
        m.head.weight.val().into_data().iter::<f32>().collect()
    }

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-5, "{x} vs {y}");
        }
    }

    #[test]
    fn test_full_run_completes_with_test_metrics() {
        let (dir, index) = dataset(SourceDataset::Hmc);
        let mut orch = Orchestrator::initialize(setup(&index, &dir.path().join("a"), 2, 5, 1e-3), model(), adam()).unwrap();
        let report = orch.run(&StopSignal::new()).unwrap();

        assert_eq!(report.phase, Phase::Completed);
        assert_eq!(report.epochs, 2);
        assert_eq!(report.test.as_ref().unwrap().windows, 6);
        assert_eq!(orch.state().history.len(), 2);

        let saved = CheckpointManager::open(dir.path().join("a")).unwrap().load_state().unwrap();
        assert_eq!(saved.phase, Phase::Completed);
        assert_eq!(saved.epoch, 2);
        let csv = std::fs::read_to_string(dir.path().join("a").join("metrics.csv")).unwrap();
        assert_eq!(csv.lines().count(), 3);
    }

    #[test]
    fn test_resume_matches_uninterrupted_run() {
        let (dir, index) = dataset(SourceDataset::Hmc);
        let initial = model();

        let mut full = Orchestrator::initialize(setup(&index, &dir.path().join("full"), 2, 0, 1e-3), initial.clone(), adam()).unwrap();
        full.run(&StopSignal::new()).unwrap();

        let split = dir.path().join("split");
        let mut first = Orchestrator::initialize(setup(&index, &split, 1, 0, 1e-3), initial.clone(), adam()).unwrap();
        assert_eq!(first.run(&StopSignal::new()).unwrap().epochs, 1);

        let mut second = Orchestrator::resume(setup(&index, &split, 2, 0, 1e-3), model(), adam()).unwrap();
        let report = second.run(&StopSignal::new()).unwrap();
        assert_eq!(report.epochs, 2);
        assert_eq!(second.state().history.len(), 2);

        assert_close(&weights(second.model()), &weights(full.model()));
        let (a, b) = (&full.state().history[1], &second.state().history[1]);
        assert!((a.train_loss - b.train_loss).abs() < 1e-6);
    }

    #[test]
    fn test_mid_epoch_stop_then_resume_matches() {
        let (dir, index) = dataset(SourceDataset::Hmc);
        let initial = model();

        let mut full = Orchestrator::initialize(setup(&index, &dir.path().join("full"), 2, 0, 1e-3), initial.clone(), adam()).unwrap();
        full.run(&StopSignal::new()).unwrap();

        // 12 train targets / batch 2 = 6 batches per epoch; stop 3 batches into epoch 2
        let ckpt = dir.path().join("stopped");
        let mut first = Orchestrator::initialize(setup(&index, &ckpt, 2, 0, 1e-3), initial.clone(), adam()).unwrap();
        let report = first.run(&StopSignal::with_batch_budget(9)).unwrap();
        assert!(report.interrupted());
        assert_eq!(report.epochs, 1);
        assert_eq!(
            first.state().cursor.map(|c| (c.epoch, c.batches_done)),
            Some((2, 3))
        );

        let mut second = Orchestrator::resume(setup(&index, &ckpt, 2, 0, 1e-3), model(), adam()).unwrap();
        assert_eq!(second.run(&StopSignal::new()).unwrap().phase, Phase::Completed);
        assert_close(&weights(second.model()), &weights(full.model()));
    }

    #[test]
    fn test_plateau_stops_after_patience() {
        // lr = 0 keeps the parameters fixed, so validation loss never improves after epoch 1
        let (dir, index) = dataset(SourceDataset::Hmc);
        let mut orch = Orchestrator::initialize(setup(&index, &dir.path().join("es"), 10, 2, 0.0), model(), adam()).unwrap();
        let report = orch.run(&StopSignal::new()).unwrap();

        assert_eq!(report.early_stopped_at, Some(3));
        assert_eq!(report.epochs, 3);
        assert_eq!(report.best_epoch, 1);
        assert_eq!(report.phase, Phase::Completed);
    }

    #[test]
    fn test_resume_rejects_other_experiment() {
        let (dir, index) = dataset(SourceDataset::Hmc);
        let ckpt = dir.path().join("c");
        let mut orch = Orchestrator::initialize(setup(&index, &ckpt, 1, 0, 1e-3), model(), adam()).unwrap();
        orch.run(&StopSignal::new()).unwrap();

        let mut other = setup(&index, &ckpt, 2, 0, 1e-3);
        other.identity.seed = 99;
        match Orchestrator::resume(other, model(), adam()) {
            Err(PipelineError::CheckpointMismatch { reason, .. }) => assert!(reason.contains("seed")),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("resume accepted a different seed"),
        }
    }

    #[test]
    fn test_initialize_refuses_existing_checkpoint() {
        let (dir, index) = dataset(SourceDataset::Hmc);
        let ckpt = dir.path().join("c");
        Orchestrator::initialize(setup(&index, &ckpt, 1, 0, 1e-3), model(), adam())
            .unwrap()
            .run(&StopSignal::new())
            .unwrap();
        assert!(matches!(
            Orchestrator::initialize(setup(&index, &ckpt, 1, 0, 1e-3), model(), adam()),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_divergence_fails_without_new_checkpoint() {
        let (dir, index) = dataset(SourceDataset::Hmc);
        let ckpt = dir.path().join("nan");
        let mut orch = Orchestrator::initialize(setup(&index, &ckpt, 2, 0, f64::INFINITY), model(), adam()).unwrap();

        match orch.run(&StopSignal::new()) {
            Err(PipelineError::TrainingDiverged { epoch, .. }) => assert_eq!(epoch, 1),
            other => panic!("unexpected {:?}", other.map(|r| r.phase)),
        }
        assert_eq!(orch.phase(), Phase::Failed);
        let saved = CheckpointManager::open(&ckpt).unwrap().load_state().unwrap();
        assert_eq!(saved.epoch, 0);
    }

    #[test]
    fn test_finetune_records_new_assignment_and_origin() {
        let (dir_a, index_a) = dataset(SourceDataset::Hmc);
        let source = dir_a.path().join("source");
        Orchestrator::initialize(setup(&index_a, &source, 1, 0, 1e-3), model(), adam())
            .unwrap()
            .run(&StopSignal::new())
            .unwrap();

        let (dir_b, index_b) = dataset(SourceDataset::Dcsm);
        let target  = dir_b.path().join("tuned");
        let origin  = CheckpointManager::open(&source).unwrap();
        let mut orch = Orchestrator::finetune(setup(&index_b, &target, 1, 0, 1e-4), model(), adam(), &origin).unwrap();
        assert_eq!(orch.phase(), Phase::Finetuning);
        orch.run(&StopSignal::new()).unwrap();

        let saved = CheckpointManager::open(&target).unwrap().load_state().unwrap();
        assert_eq!(&saved.identity.assignment, index_b.assignment());
        assert!(saved
            .identity
            .assignment
            .entries()
            .iter()
            .all(|e| e.subject.source == SourceDataset::Dcsm));
        let recorded = saved.origin.unwrap();
        assert_eq!(recorded.checkpoint, source);
        assert_eq!(recorded.datasets, vec![SourceDataset::Hmc]);
        assert_eq!(recorded.epoch, 1);
    }

    #[test]
    fn test_stop_signal_budget() {
        let stop = StopSignal::with_batch_budget(2);
        assert!(!stop.is_requested());
        stop.batch_done();
        assert!(!stop.is_requested());
        stop.batch_done();
        assert!(stop.is_requested());

        let unlimited = StopSignal::new();
        (0..100).for_each(|_| unlimited.batch_done());
        assert!(!unlimited.is_requested());
        assert_ne!(epoch_seed(1, 1), epoch_seed(1, 2));
    }
}
