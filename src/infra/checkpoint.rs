// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// Saves and restores the complete experiment state using Burn's
// NamedMpkFileRecorder at full precision, so a resumed run sees
// bit-identical parameters and optimiser moments.
//
// Directory layout:
//   checkpoints/
//     experiment.json        ← ExperimentState, the commit point
//     model_e0003.mpk        ← parameters named by the state tag
//     optim_e0003.mpk        ← optimiser state (Adam moments, step)
//     model_best.mpk         ← best validation epoch so far
//     normalization.json     ← frozen per-channel statistics
//     metrics.csv            ← per-epoch learning curve
//
// Write order for one checkpoint:
//   1. model_<tag>.mpk, optim_<tag>.mpk
//   2. experiment.json.tmp  ─rename─►  experiment.json
//   3. delete records of older tags
//
// A crash before step 2 leaves the previous experiment.json and
// its records intact; a crash after it only leaves stale files.
// Every file operation goes through the RetryPolicy.
//
// Reference: Burn Book §5 (Records and Checkpointing)

use burn::{
    module::{AutodiffModule, Module},
    optim::Optimizer,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder},
    tensor::backend::{AutodiffBackend, Backend},
};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::data::normalizer::ChannelNormalizer;
use crate::domain::error::{PipelineError, PipelineResult};
use crate::domain::traits::Persistable;
use crate::infra::retry::RetryPolicy;
use crate::ml::state::ExperimentState;

pub const STATE_FILE:         &str = "experiment.json";
pub const NORMALIZATION_FILE: &str = "normalization.json";
pub const METRICS_FILE:       &str = "metrics.csv";
const BEST_TAG:               &str = "best";

type FileRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Owns one checkpoint directory.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir:   PathBuf,
    retry: RetryPolicy,
}

impl CheckpointManager {
    /// Create the directory (like `mkdir -p`) if it doesn't exist.
    pub fn new(dir: impl Into<PathBuf>) -> PipelineResult<Self> {
        Self::with_retry(dir, RetryPolicy::default())
    }

    pub fn with_retry(dir: impl Into<PathBuf>, retry: RetryPolicy) -> PipelineResult<Self> {
        let dir = dir.into();
        retry.run(&dir, || fs::create_dir_all(&dir))?;
        Ok(Self { dir, retry })
    }

    /// Open an existing checkpoint directory without creating anything.
    pub fn open(dir: impl Into<PathBuf>) -> PipelineResult<Self> {
        let manager = Self { dir: dir.into(), retry: RetryPolicy::default() };
        if !manager.exists() {
            return Err(PipelineError::CheckpointIo {
                path:     manager.state_path(),
                attempts: 0,
                reason:   "no experiment state found; has this experiment been trained?".into(),
            });
        }
        Ok(manager)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn retry(&self) -> RetryPolicy {
        self.retry
    }

    pub fn exists(&self) -> bool {
        self.state_path().is_file()
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.dir.join(METRICS_FILE)
    }

    /// Path without extension; the recorder appends `.mpk`.
    fn record_path(&self, kind: &str, tag: &str) -> PathBuf {
        self.dir.join(format!("{kind}_{tag}"))
    }

    // ─── Full checkpoint ────────────────────────────────────────────────────

    /// Persist model, optimiser and state as one checkpoint.
    pub fn save<B, M, O>(&self, state: &ExperimentState, model: &M, optim: &O) -> PipelineResult<()>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let tag      = state.tag();
        let recorder = FileRecorder::new();

        let model_path = self.record_path("model", &tag);
        self.retry.run(&model_path, || {
            Recorder::<B>::record(&recorder, model.clone().into_record(), model_path.clone())
        })?;

        let optim_path = self.record_path("optim", &tag);
        self.retry.run(&optim_path, || {
            Recorder::<B>::record(&recorder, optim.to_record(), optim_path.clone())
        })?;

        self.write_state(state)?;
        self.remove_stale(&tag);

        tracing::debug!("Checkpoint '{}' committed (phase {}, epoch {})", tag, state.phase, state.epoch);
        Ok(())
    }

    fn write_state(&self, state: &ExperimentState) -> PipelineResult<()> {
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| PipelineError::InvalidConfig(format!("cannot serialise experiment state: {e}")))?;
        let path = self.state_path();
        let tmp  = self.dir.join(format!("{STATE_FILE}.tmp"));

        self.retry.run(&path, || -> std::io::Result<()> {
            fs::write(&tmp, &json)?;
            fs::File::open(&tmp)?.sync_all()?;
            fs::rename(&tmp, &path)
        })
    }

    /// Delete model/optimiser records not belonging to `keep`.
    /// Failures are only logged; stale files never affect correctness.
    fn remove_stale(&self, keep: &str) {
        let Ok(entries) = fs::read_dir(&self.dir) else { return };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(stem) = name.strip_suffix(".mpk") else { continue };
            let tag = stem
                .strip_prefix("model_")
                .or_else(|| stem.strip_prefix("optim_"));
            match tag {
                Some(t) if t != keep && t != BEST_TAG => {
                    if let Err(e) = fs::remove_file(entry.path()) {
                        tracing::warn!("Cannot remove stale record '{}': {}", entry.path().display(), e);
                    }
                }
                _ => {}
            }
        }
    }

    pub fn load_state(&self) -> PipelineResult<ExperimentState> {
        let path = self.state_path();
        let json = self.retry.run(&path, || fs::read_to_string(&path))?;
        serde_json::from_str(&json).map_err(|e| PipelineError::CheckpointMismatch {
            path,
            reason: format!("unreadable experiment state: {e}"),
        })
    }

    // ─── Records ────────────────────────────────────────────────────────────

    /// Load parameters saved under `tag` into `template`.
    /// The template must have the saved architecture.
    pub fn load_model<B: Backend, M: Module<B>>(&self, template: M, tag: &str, device: &B::Device) -> PipelineResult<M> {
        let path = self.record_path("model", tag);
        let record: M::Record = self
            .retry
            .run(&path, || Recorder::<B>::load(&FileRecorder::new(), path.clone(), device))?;
        Ok(template.load_record(record))
    }

    pub fn load_optimizer<B, M, O>(&self, optim: O, tag: &str, device: &B::Device) -> PipelineResult<O>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let path = self.record_path("optim", tag);
        let record: O::Record = self
            .retry
            .run(&path, || Recorder::<B>::load(&FileRecorder::new(), path.clone(), device))?;
        Ok(optim.load_record(record))
    }

    pub fn save_best<B: Backend, M: Module<B>>(&self, model: &M) -> PipelineResult<()> {
        let path = self.record_path("model", BEST_TAG);
        self.retry.run(&path, || {
            Recorder::<B>::record(&FileRecorder::new(), model.clone().into_record(), path.clone())
        })
    }

    pub fn has_best(&self) -> bool {
        self.record_path("model", BEST_TAG).with_extension("mpk").is_file()
    }

    pub fn load_best<B: Backend, M: Module<B>>(&self, template: M, device: &B::Device) -> PipelineResult<M> {
        self.load_model(template, BEST_TAG, device)
    }

    /// Best parameters if an epoch ever improved, else the latest.
    pub fn load_best_or_latest<B: Backend, M: Module<B>>(
        &self,
        template: M,
        state:    &ExperimentState,
        device:   &B::Device,
    ) -> PipelineResult<M> {
        if self.has_best() {
            self.load_best(template, device)
        } else {
            self.load_model(template, &state.tag(), device)
        }
    }

    // ─── Normalisation ──────────────────────────────────────────────────────

    pub fn save_normalizer(&self, normalizer: &ChannelNormalizer) -> PipelineResult<()> {
        let path = self.dir.join(NORMALIZATION_FILE);
        self.retry.run(&path, || normalizer.save(&path))
    }

    /// None when the experiment ran without normalisation.
    pub fn load_normalizer(&self) -> PipelineResult<Option<ChannelNormalizer>> {
        let path = self.dir.join(NORMALIZATION_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        self.retry.run(&path, || ChannelNormalizer::load(&path)).map(Some)
    }
}
