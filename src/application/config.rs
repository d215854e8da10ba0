// ============================================================
// Layer 2 — Experiment Configuration
// ============================================================
// The single configuration object threaded into every use case.
// Nothing is read from globals: the same config always produces
// the same canonical data, folds and shuffle order.
//
// Serialisable so it can be loaded from a JSON file, overridden
// by CLI flags, and stored next to the checkpoint so later runs
// can check they rebuild the same architecture.
//
// Reference: Rust Book §5 (Structs), serde documentation

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::data::{
    canonicalizer::{CanonicalSpec, RolePolicy},
    loader::{ContextBoundary, LoaderConfig},
};
use crate::domain::{
    error::{PipelineError, PipelineResult},
    fold::FoldRatios,
    signal::ChannelRole,
    subject::SourceDataset,
    traits::Persistable,
};
use crate::ml::{metrics::Monitor, registry::ModelKind, trainer::TrainingPlan};

/// File name of the config copy stored in a checkpoint directory.
pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub datasets:         Vec<SourceDataset>,
    pub model:            ModelKind,
    pub fold_ratios:      FoldRatios,
    pub seed:             u64,
    pub batch_size:       usize,
    /// Windows on each side of the target
    pub context_length:   usize,
    pub context_boundary: ContextBoundary,
    pub max_epochs:       usize,
    /// 0 disables early stopping
    pub patience:         usize,
    pub learning_rate:    f64,
    pub monitor:          Monitor,
    pub prefetch_depth:   usize,
    pub checkpoint_path:  PathBuf,
    pub store_path:       PathBuf,
    /// Canonical sampling rate in Hz
    pub target_rate:      f64,
    /// Seconds per window
    pub epoch_duration:   f64,
    /// Output channel order and per-role missing-channel policy
    pub channels:         Vec<RolePolicy>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            datasets:         vec![SourceDataset::SleepEdf],
            model:            ModelKind::Linear,
            fold_ratios:      FoldRatios::default(),
            seed:             42,
            batch_size:       32,
            context_length:   10,
            context_boundary: ContextBoundary::Exclude,
            max_epochs:       20,
            patience:         5,
            learning_rate:    1e-4,
            monitor:          Monitor::ValLoss,
            prefetch_depth:   4,
            checkpoint_path:  PathBuf::from("checkpoints"),
            store_path:       PathBuf::from("data/canonical"),
            target_rate:      100.0,
            epoch_duration:   30.0,
            channels:         vec![RolePolicy::required(ChannelRole::Eeg)],
        }
    }
}

impl ExperimentConfig {
    pub fn canonical_spec(&self) -> CanonicalSpec {
        CanonicalSpec {
            target_rate:    self.target_rate,
            epoch_duration: self.epoch_duration,
            roles:          self.channels.clone(),
        }
    }

    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            batch_size:     self.batch_size,
            context_length: self.context_length,
            boundary:       self.context_boundary,
        }
    }

    pub fn plan(&self) -> TrainingPlan {
        TrainingPlan {
            max_epochs:     self.max_epochs,
            patience:       self.patience,
            monitor:        self.monitor,
            learning_rate:  self.learning_rate,
            seed:           self.seed,
            prefetch_depth: self.prefetch_depth,
        }
    }

    /// Reject values no run could use.
    pub fn validate(&self) -> PipelineResult<()> {
        let fail = |msg: String| Err(PipelineError::InvalidConfig(msg));

        if self.datasets.is_empty() {
            return fail("no datasets selected".into());
        }
        if self.batch_size == 0 {
            return fail("batch_size must be at least 1".into());
        }
        if self.max_epochs == 0 {
            return fail("max_epochs must be at least 1".into());
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return fail(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if !self.fold_ratios.is_valid() {
            return fail(format!("fold ratios {:?} must be non-negative and not all zero", self.fold_ratios));
        }
        if self.fold_ratios.train <= 0.0 || self.fold_ratios.validation <= 0.0 {
            return fail("train and validation folds need a positive ratio".into());
        }
        if self.channels.is_empty() {
            return fail("at least one channel role is required".into());
        }
        let mut roles: Vec<ChannelRole> = self.channels.iter().map(|c| c.role).collect();
        roles.sort_by_key(|r| r.as_str());
        roles.dedup();
        if roles.len() != self.channels.len() {
            return fail("a channel role is listed twice".into());
        }
        self.canonical_spec().samples_per_window()?;
        Ok(())
    }
}

impl Persistable for ExperimentConfig {
    fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .with_context(|| format!("Cannot write config to '{}'", path.display()))?;
        tracing::debug!("Saved experiment config to '{}'", path.display());
        Ok(())
    }

    fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .with_context(|| format!("Cannot read config from '{}'", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Malformed config '{}'", path.display()))
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = ExperimentConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.loader_config().sequence_length(), 21);
        assert_eq!(cfg.canonical_spec().samples_per_window().unwrap(), 3000);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: ExperimentConfig =
            serde_json::from_str(r#"{ "datasets": ["hmc", "isruc"], "seed": 7, "monitor": "macro-f1" }"#).unwrap();
        assert_eq!(cfg.datasets, vec![SourceDataset::Hmc, SourceDataset::Isruc]);
        assert_eq!(cfg.seed, 7);
        assert_eq!(cfg.monitor, Monitor::MacroF1);
        assert_eq!(cfg.batch_size, 32);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad = [
            ExperimentConfig { batch_size: 0, ..Default::default() },
            ExperimentConfig { max_epochs: 0, ..Default::default() },
            ExperimentConfig { learning_rate: 0.0, ..Default::default() },
            ExperimentConfig { fold_ratios: FoldRatios::new(0.0, 0.0, 0.0), ..Default::default() },
            ExperimentConfig { target_rate: 33.3, ..Default::default() },
            ExperimentConfig { datasets: vec![], ..Default::default() },
        ];
        for cfg in bad {
            assert!(matches!(cfg.validate(), Err(PipelineError::InvalidConfig(_))), "{cfg:?}");
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let cfg  = ExperimentConfig { seed: 3, context_length: 2, ..Default::default() };
        cfg.save(&path).unwrap();
        assert_eq!(ExperimentConfig::load(&path).unwrap(), cfg);
    }
}
