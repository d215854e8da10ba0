// ============================================================
// Layer 5 — Experiment State
// ============================================================
// Everything the orchestrator owns besides the model and the
// optimiser, persisted as experiment.json with every checkpoint:
//
//   identity        seed, fold ratios, datasets, fold assignment,
//                   architecture; checked on resume
//   origin          where a finetuning run took its parameters from
//   phase / epoch   lifecycle position (completed epochs)
//   early_stopping  best monitored value and patience counter
//   cursor          mid-epoch position when a stop was honoured
//   history         per-epoch train loss and validation metrics
//
// The `tag` names the model/optimiser record files that belong
// to this state, so experiment.json is the single commit point.

use serde::{Deserialize, Serialize};
use std::{fmt, path::{Path, PathBuf}};

use crate::domain::error::{PipelineError, PipelineResult};
use crate::domain::fold::{FoldAssignment, FoldRatios};
use crate::domain::subject::SourceDataset;
use crate::ml::early_stopping::EarlyStopping;
use crate::ml::metrics::EvaluationMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Initializing,
    Training,
    Validating,
    EarlyStopped,
    Finetuning,
    Completed,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Initializing => "initializing",
            Phase::Training     => "training",
            Phase::Validating   => "validating",
            Phase::EarlyStopped => "early-stopped",
            Phase::Finetuning   => "finetuning",
            Phase::Completed    => "completed",
            Phase::Failed       => "failed",
        })
    }
}

/// What makes two runs "the same experiment".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentIdentity {
    pub seed:       u64,
    pub ratios:     FoldRatios,
    pub datasets:   Vec<SourceDataset>,
    pub model:      String,
    pub assignment: FoldAssignment,
}

impl ExperimentIdentity {
    /// Seed and ratios are taken from the assignment they produced.
    pub fn new(datasets: Vec<SourceDataset>, model: impl Into<String>, assignment: FoldAssignment) -> Self {
        Self {
            seed:   assignment.seed,
            ratios: assignment.ratios,
            datasets,
            model:  model.into(),
            assignment,
        }
    }

    /// Fails with CheckpointMismatch naming every field that differs.
    pub fn verify(&self, current: &ExperimentIdentity, path: &Path) -> PipelineResult<()> {
        let mut diffs = Vec::new();
        if self.seed != current.seed {
            diffs.push(format!("seed {} vs {}", self.seed, current.seed));
        }
        if self.ratios != current.ratios {
            diffs.push(format!("fold ratios {:?} vs {:?}", self.ratios, current.ratios));
        }
        let (mut a, mut b) = (self.datasets.clone(), current.datasets.clone());
        a.sort();
        b.sort();
        if a != b {
            diffs.push(format!("datasets {:?} vs {:?}", self.datasets, current.datasets));
        }
        if self.model != current.model {
            diffs.push(format!("model '{}' vs '{}'", self.model, current.model));
        }
        if self.assignment != current.assignment {
            diffs.push("fold assignment differs (subject set changed?)".to_string());
        }

        if diffs.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::CheckpointMismatch { path: path.to_path_buf(), reason: diffs.join("; ") })
        }
    }
}

/// Provenance of a finetuning run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinetuneOrigin {
    pub checkpoint: PathBuf,
    pub epoch:      usize,
    pub seed:       u64,
    pub ratios:     FoldRatios,
    pub datasets:   Vec<SourceDataset>,
}

/// Position inside an interrupted training epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochCursor {
    pub epoch:        usize,
    pub batches_done: usize,
    /// Sum of the batch losses seen so far in this epoch
    pub loss_sum:     f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch:      usize,
    pub train_loss: f64,
    pub validation: EvaluationMetrics,
    pub improved:   bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentState {
    pub identity:         ExperimentIdentity,
    pub origin:           Option<FinetuneOrigin>,
    pub phase:            Phase,
    /// Completed training epochs
    pub epoch:            usize,
    pub early_stopping:   EarlyStopping,
    pub early_stopped_at: Option<usize>,
    pub cursor:           Option<EpochCursor>,
    pub history:          Vec<EpochRecord>,
    pub test:             Option<EvaluationMetrics>,
}

impl ExperimentState {
    pub fn new(identity: ExperimentIdentity, early_stopping: EarlyStopping) -> Self {
        Self {
            identity,
            origin:           None,
            phase:            Phase::Initializing,
            epoch:            0,
            early_stopping,
            early_stopped_at: None,
            cursor:           None,
            history:          Vec::new(),
            test:             None,
        }
    }

    /// Record-file tag for this state.
    pub fn tag(&self) -> String {
        match &self.cursor {
            Some(c) => format!("e{:04}-b{:06}", c.epoch, c.batches_done),
            None    => format!("e{:04}", self.epoch),
        }
    }
}
