// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Defines the four subcommands and their flags:
//
//   prepare   raw recordings → canonical store
//   train     train (or resume) an experiment
//   test      evaluate a trained experiment on its test fold
//   finetune  continue training a checkpoint on new data
//
// Every command accepts the same experiment flags. They override
// the values of an optional `--config` JSON file, which in turn
// overrides the built-in defaults.
//
// Reference: Rust Book §12 (Building a CLI Program)

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::application::config::ExperimentConfig;
use crate::data::loader::ContextBoundary;
use crate::domain::{fold::FoldRatios, subject::SourceDataset, traits::Persistable};
use crate::ml::{metrics::Monitor, registry::ModelKind};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Canonicalize raw recordings (<raw-dir>/<dataset>/<subject>.edf + .txt)
    Prepare(PrepareArgs),

    /// Train a model, resuming if the checkpoint directory holds an experiment
    Train(ExperimentArgs),

    /// Evaluate the best model of a checkpoint on its test fold
    Test(ExperimentArgs),

    /// Finetune a trained checkpoint on the selected datasets
    Finetune(FinetuneArgs),
}

#[derive(Args, Debug)]
pub struct PrepareArgs {
    /// Directory with one sub-directory per dataset
    #[arg(long, default_value = "data/raw")]
    pub raw_dir: PathBuf,

    #[command(flatten)]
    pub experiment: ExperimentArgs,
}

#[derive(Args, Debug)]
pub struct FinetuneArgs {
    /// Checkpoint directory of the experiment to start from
    #[arg(long = "from")]
    pub from: PathBuf,

    #[command(flatten)]
    pub experiment: ExperimentArgs,
}

/// Experiment flags shared by all commands. Unset flags keep the
/// value from `--config` (or the default).
#[derive(Args, Debug, Default)]
pub struct ExperimentArgs {
    /// JSON experiment config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Comma-separated datasets (sleep-edf, shhs, mass, dcsm, hmc, isruc, svuh)
    #[arg(long, value_delimiter = ',')]
    pub datasets: Vec<SourceDataset>,

    /// Registered architecture name
    #[arg(long)]
    pub model: Option<ModelKind>,

    /// Train,validation,test ratios, e.g. 0.7,0.15,0.15
    #[arg(long, value_delimiter = ',')]
    pub fold_ratios: Vec<f64>,

    #[arg(long)]
    pub seed: Option<u64>,

    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Windows of context on each side of the target
    #[arg(long)]
    pub context_length: Option<usize>,

    /// exclude | zero-pad
    #[arg(long)]
    pub context_boundary: Option<ContextBoundary>,

    #[arg(long)]
    pub max_epochs: Option<usize>,

    /// Epochs without improvement before stopping (0 = never)
    #[arg(long)]
    pub patience: Option<usize>,

    #[arg(long)]
    pub lr: Option<f64>,

    /// val-loss | accuracy | macro-f1 | kappa
    #[arg(long)]
    pub monitor: Option<Monitor>,

    #[arg(long)]
    pub checkpoint_path: Option<PathBuf>,

    #[arg(long)]
    pub store_path: Option<PathBuf>,
}

impl ExperimentArgs {
    /// Defaults ← config file ← flags.
    pub fn resolve(self) -> Result<ExperimentConfig> {
        let mut cfg = match &self.config {
            Some(path) => ExperimentConfig::load(path)?,
            None       => ExperimentConfig::default(),
        };

        if !self.datasets.is_empty() {
            cfg.datasets = self.datasets;
        }
        if !self.fold_ratios.is_empty() {
            let [train, validation, test] = self.fold_ratios[..] else {
                bail!("--fold-ratios needs exactly three values");
            };
            cfg.fold_ratios = FoldRatios::new(train, validation, test);
        }
        if let Some(v) = self.model            { cfg.model = v; }
        if let Some(v) = self.seed             { cfg.seed = v; }
        if let Some(v) = self.batch_size       { cfg.batch_size = v; }
        if let Some(v) = self.context_length   { cfg.context_length = v; }
        if let Some(v) = self.context_boundary { cfg.context_boundary = v; }
        if let Some(v) = self.max_epochs       { cfg.max_epochs = v; }
        if let Some(v) = self.patience         { cfg.patience = v; }
        if let Some(v) = self.lr               { cfg.learning_rate = v; }
        if let Some(v) = self.monitor          { cfg.monitor = v; }
        if let Some(v) = self.checkpoint_path  { cfg.checkpoint_path = v; }
        if let Some(v) = self.store_path       { cfg.store_path = v; }

        cfg.validate()?;
        Ok(cfg)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Cli;
    use clap::Parser;

    fn experiment(cli: Cli) -> ExperimentArgs {
        match cli.command {
            Commands::Train(args) | Commands::Test(args) => args,
            Commands::Prepare(args) => args.experiment,
            Commands::Finetune(args) => args.experiment,
        }
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "sleep-pipeline", "train",
            "--datasets", "hmc,isruc",
            "--fold-ratios", "0.6,0.2,0.2",
            "--context-boundary", "zero-pad",
            "--monitor", "kappa",
            "--lr", "0.001",
        ])
        .unwrap();

        let cfg = experiment(cli).resolve().unwrap();
        assert_eq!(cfg.datasets, vec![SourceDataset::Hmc, SourceDataset::Isruc]);
        assert_eq!(cfg.fold_ratios, FoldRatios::new(0.6, 0.2, 0.2));
        assert_eq!(cfg.context_boundary, ContextBoundary::ZeroPad);
        assert_eq!(cfg.monitor, Monitor::Kappa);
        assert_eq!(cfg.learning_rate, 0.001);
        assert_eq!(cfg.batch_size, ExperimentConfig::default().batch_size);
    }

    #[test]
    fn test_flags_override_config_file() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("exp.json");
        ExperimentConfig { seed: 3, batch_size: 8, ..Default::default() }.save(&path).unwrap();

        let cli = Cli::try_parse_from([
            "sleep-pipeline", "finetune",
            "--from", "old",
            "--config", path.to_str().unwrap(),
            "--seed", "9",
        ])
        .unwrap();

        let cfg = experiment(cli).resolve().unwrap();
        assert_eq!(cfg.seed, 9);
        assert_eq!(cfg.batch_size, 8);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(Cli::try_parse_from(["sleep-pipeline", "train", "--datasets", "nope"]).is_err());
        let cli = Cli::try_parse_from(["sleep-pipeline", "train", "--fold-ratios", "1,1"]).unwrap();
        assert!(experiment(cli).resolve().is_err());

        let cli = Cli::try_parse_from(["sleep-pipeline", "test", "--batch-size", "0"]).unwrap();
        assert!(experiment(cli).resolve().is_err());
    }
}
