// ============================================================
// Layer 2 — Explain Session
// ============================================================
// Read access for explainability tooling: a trained model plus
// the loader of any fold, both rebuilt from the checkpoint so
// windows are normalised exactly as they were during training.
//
//   let session = ExplainSession::open(&config)?;
//   let loader  = session.loader(Fold::Test)?;
//   let attr    = session.explain_batch(Fold::Test, 0)?;
//
// Visualisation is left to the caller.

use anyhow::{anyhow, Result};

use crate::application::config::ExperimentConfig;
use crate::application::train_use_case::{EvalBackend, TrainedExperiment};
use crate::data::{
    batcher::SignalBatcher,
    dataset::{FoldDataset, SequenceDataset},
    loader::WindowLoader,
};
use crate::domain::{error::PipelineResult, fold::Fold};
use crate::ml::{adapter::Attribution, adapter::ModelAdapter, baseline::LinearBaseline, state::ExperimentState};

pub struct ExplainSession {
    trained: TrainedExperiment,
}

impl ExplainSession {
    pub fn open(config: &ExperimentConfig) -> Result<Self> {
        Ok(Self { trained: TrainedExperiment::open(config)? })
    }

    pub fn model(&self) -> &LinearBaseline<EvalBackend> {
        &self.trained.model
    }

    pub fn state(&self) -> &ExperimentState {
        &self.trained.state
    }

    pub fn loader(&self, fold: Fold) -> PipelineResult<WindowLoader> {
        self.trained.loader(fold)
    }

    /// Raw (un-normalised) canonical windows of `fold`.
    pub fn windows(&self, fold: Fold) -> FoldDataset {
        FoldDataset::new(self.trained.index.clone(), fold)
    }

    /// Loader targets of `fold` as a burn dataset.
    pub fn sequences(&self, fold: Fold) -> PipelineResult<SequenceDataset> {
        Ok(SequenceDataset::new(self.loader(fold)?))
    }

    /// Attribution for batch `batch` of `fold` in index order.
    pub fn explain_batch(&self, fold: Fold, batch: usize) -> Result<Attribution<EvalBackend>> {
        let loader = self.loader(fold)?;
        let total  = loader.num_batches();
        let items  = loader
            .batches(None)
            .nth(batch)
            .ok_or_else(|| anyhow!("{fold} fold has {total} batches, asked for #{batch}"))??;

        let batcher = SignalBatcher::<EvalBackend>::new(
            self.trained.device.clone(),
            loader.config().sequence_length(),
            loader.shape(),
        );
        let tensors = batcher.from_batch(&items);
        self.model()
            .explain(&tensors)
            .ok_or_else(|| anyhow!("model '{}' has no attribution", self.trained.state.identity.model))
    }
}
