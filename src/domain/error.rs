// ============================================================
// Layer 3 — Error Taxonomy
// ============================================================
// One enum for every failure the core can surface. Each variant
// names the pipeline stage it happened in and, when there is
// one, the offending subject — so a fatal error always tells
// the user WHERE (stage) and WHO (source/subject).
//
//   input-data defects     SourceFormat, ChannelMissing, LabelMismatch
//   contract violations    EmptyFold, ShapeMismatch, StoreFormat
//   numeric failure        TrainingDiverged
//   persistence            CheckpointIo, CheckpointMismatch, Io
//   configuration          InvalidConfig
//
// Reference: thiserror crate documentation
//            Rust Book §9 (Recoverable Errors with Result)

use std::{fmt, io, path::PathBuf};
use thiserror::Error;

use crate::domain::fold::Fold;
use crate::domain::signal::ChannelRole;
use crate::domain::subject::SubjectKey;
use crate::domain::window::WindowShape;

/// Where in the pipeline an error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Reading,
    Canonicalizing,
    Indexing,
    Loading,
    Training,
    Checkpointing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Reading        => "reading",
            Stage::Canonicalizing => "canonicalizing",
            Stage::Indexing       => "indexing",
            Stage::Loading        => "loading",
            Stage::Training       => "training",
            Stage::Checkpointing  => "checkpointing",
        })
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    /// A raw source file could not be parsed
    #[error("[reading] {subject}: cannot parse '{}': {reason}", path.display())]
    SourceFormat {
        subject: SubjectKey,
        path:    PathBuf,
        reason:  String,
    },

    /// A required physiological channel is absent
    #[error("[{stage}] {subject}: required {role} channel not found (available: {available:?})")]
    ChannelMissing {
        stage:     Stage,
        subject:   SubjectKey,
        role:      ChannelRole,
        available: Vec<String>,
    },

    /// Label count disagrees with the signal duration
    #[error("[{stage}] {subject}: {labels} labels for {epochs} signal epochs")]
    LabelMismatch {
        stage:   Stage,
        subject: SubjectKey,
        labels:  usize,
        epochs:  usize,
    },

    /// A requested fold received no subjects
    #[error("[indexing] fold '{fold}' has no subjects ({total_subjects} subjects assigned in total); check fold ratios against dataset size")]
    EmptyFold {
        fold:           Fold,
        total_subjects: usize,
    },

    /// Windows of different shapes met where one shape is required
    #[error("[{stage}] {subject}: window shape {found} does not match dataset shape {expected}")]
    ShapeMismatch {
        stage:    Stage,
        subject:  SubjectKey,
        expected: WindowShape,
        found:    WindowShape,
    },

    /// A canonical store file is truncated or not self-consistent
    #[error("[{stage}] {subject}: corrupt canonical store file '{}': {reason}", path.display())]
    StoreFormat {
        stage:   Stage,
        subject: SubjectKey,
        path:    PathBuf,
        reason:  String,
    },

    /// Loss became NaN or infinite
    #[error("[training] loss diverged to {loss} at epoch {epoch}, batch {batch}")]
    TrainingDiverged {
        epoch: usize,
        batch: usize,
        loss:  f64,
    },

    /// Checkpoint read/write failed after all retries
    #[error("[checkpointing] '{}' failed after {attempts} attempt(s): {reason}", path.display())]
    CheckpointIo {
        path:     PathBuf,
        attempts: u32,
        reason:   String,
    },

    /// A checkpoint belongs to a different experiment
    #[error("[checkpointing] '{}' belongs to a different experiment: {reason}", path.display())]
    CheckpointMismatch {
        path:   PathBuf,
        reason: String,
    },

    #[error("[{stage}] I/O error on '{}': {source}", path.display())]
    Io {
        stage:  Stage,
        path:   PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PipelineError {
    pub fn io(stage: Stage, path: impl Into<PathBuf>, source: io::Error) -> Self {
        PipelineError::Io { stage, path: path.into(), source }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::SourceFormat { .. }           => Some(Stage::Reading),
            PipelineError::ChannelMissing { stage, .. }  => Some(*stage),
            PipelineError::LabelMismatch { stage, .. }   => Some(*stage),
            PipelineError::EmptyFold { .. }              => Some(Stage::Indexing),
            PipelineError::ShapeMismatch { stage, .. }   => Some(*stage),
            PipelineError::StoreFormat { stage, .. }     => Some(*stage),
            PipelineError::TrainingDiverged { .. }       => Some(Stage::Training),
            PipelineError::CheckpointIo { .. }           => Some(Stage::Checkpointing),
            PipelineError::CheckpointMismatch { .. }     => Some(Stage::Checkpointing),
            PipelineError::Io { stage, .. }              => Some(*stage),
            PipelineError::InvalidConfig(_)              => None,
        }
    }

    pub fn subject(&self) -> Option<&SubjectKey> {
        match self {
            PipelineError::SourceFormat { subject, .. }
            | PipelineError::ChannelMissing { subject, .. }
            | PipelineError::LabelMismatch { subject, .. }
            | PipelineError::ShapeMismatch { subject, .. }
            | PipelineError::StoreFormat { subject, .. } => Some(subject),
            _ => None,
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::subject::SourceDataset;

    #[test]
    fn test_display_names_stage_and_subject() {
        let err = PipelineError::ChannelMissing {
            stage:     Stage::Canonicalizing,
            subject:   SubjectKey::new(SourceDataset::Isruc, "12"),
            role:      ChannelRole::Eog,
            available: vec!["C3-A2".into()],
        };
        let text = err.to_string();
        assert!(text.starts_with("[canonicalizing] isruc/12"));
        assert!(text.contains("eog"));
        assert_eq!(err.stage(), Some(Stage::Canonicalizing));
        assert_eq!(err.subject().map(|s| s.subject.as_str()), Some("12"));
    }

    #[test]
    fn test_empty_fold_is_indexing_stage() {
        let err = PipelineError::EmptyFold { fold: Fold::Test, total_subjects: 2 };
        assert_eq!(err.stage(), Some(Stage::Indexing));
        assert!(err.to_string().contains("'test'"));
    }
}
