// ============================================================
// Layer 6 — Metrics Logger
// ============================================================
// Records training metrics to a CSV file after each epoch.
//
// Metrics recorded per epoch:
//   - epoch:      the epoch number (1, 2, 3, ...)
//   - train_loss: average cross-entropy over all training batches
//   - val_loss:   average cross-entropy per validation window
//   - val_acc:    validation accuracy
//   - val_f1:     validation macro-F1
//   - val_kappa:  validation Cohen's kappa
//
// Output file: checkpoints/metrics.csv
//
//   epoch,train_loss,val_loss,val_acc,val_f1,val_kappa
//   1,1.602100,1.580300,0.312000,0.211000,0.081000
//   2,1.410500,1.422900,0.455000,0.372000,0.260000
//
// Rows are appended only after the checkpoint for that epoch has
// been committed, so a resumed run never repeats a row. When a
// resumed run finds rows beyond its committed epoch (crash between
// commit and a later epoch), those rows are dropped.
//
// Reference: Rust Book §12 (I/O and File Handling)

use anyhow::Result;
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};
use serde::{Deserialize, Serialize};

use crate::ml::state::EpochRecord;

const HEADER: &str = "epoch,train_loss,val_loss,val_acc,val_f1,val_kappa";

/// One row of metrics data for a single training epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch:      usize,
    pub train_loss: f64,
    pub val_loss:   f64,
    pub val_acc:    f64,
    pub val_f1:     f64,
    pub val_kappa:  f64,
}

impl From<&EpochRecord> for EpochMetrics {
    fn from(r: &EpochRecord) -> Self {
        Self {
            epoch:      r.epoch,
            train_loss: r.train_loss,
            val_loss:   r.validation.loss,
            val_acc:    r.validation.accuracy,
            val_f1:     r.validation.macro_f1,
            val_kappa:  r.validation.kappa,
        }
    }
}

/// Logs epoch metrics to a CSV file for later analysis.
#[derive(Debug, Clone)]
pub struct MetricsLogger {
    csv_path: PathBuf,
}

impl MetricsLogger {
    /// Writes the CSV header if the file doesn't exist yet.
    pub fn new(csv_path: impl AsRef<Path>) -> Result<Self> {
        let csv_path = csv_path.as_ref().to_path_buf();
        if let Some(dir) = csv_path.parent() {
            fs::create_dir_all(dir)?;
        }

        if !csv_path.exists() {
            let mut f = fs::File::create(&csv_path)?;
            writeln!(f, "{HEADER}")?;
            tracing::debug!("Created metrics CSV: '{}'", csv_path.display());
        }

        Ok(Self { csv_path })
    }

    /// Drop rows for epochs after `epoch`.
    pub fn truncate_after(&self, epoch: usize) -> Result<()> {
        let text = fs::read_to_string(&self.csv_path)?;
        let mut kept = Vec::new();
        let mut dropped = 0usize;
        for line in text.lines() {
            let row_epoch = line.split(',').next().and_then(|e| e.parse::<usize>().ok());
            match row_epoch {
                Some(e) if e > epoch => dropped += 1,
                _ => kept.push(line),
            }
        }
        if dropped > 0 {
            fs::write(&self.csv_path, format!("{}\n", kept.join("\n")))?;
            tracing::debug!("Dropped {} uncommitted metrics row(s)", dropped);
        }
        Ok(())
    }

    /// Append one epoch's metrics as a new row in the CSV.
    pub fn log(&self, m: &EpochMetrics) -> Result<()> {
        let mut f = OpenOptions::new()
            .append(true)
            .open(&self.csv_path)?;

        writeln!(
            f,
            "{},{:.6},{:.6},{:.6},{:.6},{:.6}",
            m.epoch,
            m.train_loss,
            m.val_loss,
            m.val_acc,
            m.val_f1,
            m.val_kappa,
        )?;

        tracing::debug!(
            "Logged epoch {} metrics: train_loss={:.4}, val_loss={:.4}",
            m.epoch,
            m.train_loss,
            m.val_loss,
        );

        Ok(())
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }
}
