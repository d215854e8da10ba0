// ============================================================
// Layer 5 — Classification Metrics
// ============================================================
// Aggregates predictions of one evaluation pass into a 5×5
// confusion matrix (rows = truth, columns = prediction) and
// derives the sleep-staging metrics from it:
//
//   accuracy    trace / total
//   precision   tp / column sum          (per class)
//   recall      tp / row sum             (per class)
//   macro-F1    mean of per-class F1     (classes with no truth
//                                         and no prediction skipped)
//   kappa       (p_o − p_e) / (1 − p_e)  Cohen's kappa
//
// Reference: Cohen (1960), "A coefficient of agreement for
//            nominal scales"

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::domain::signal::SleepStage;

const K: usize = SleepStage::COUNT;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    counts: [[u64; K]; K],
}

impl ConfusionMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, truth: usize, predicted: usize) {
        if truth < K && predicted < K {
            self.counts[truth][predicted] += 1;
        }
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().flatten().sum()
    }

    fn row(&self, c: usize) -> u64 {
        self.counts[c].iter().sum()
    }

    fn col(&self, c: usize) -> u64 {
        self.counts.iter().map(|r| r[c]).sum()
    }

    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        (0..K).map(|c| self.counts[c][c]).sum::<u64>() as f64 / total as f64
    }

    pub fn precision(&self, c: usize) -> f64 {
        ratio(self.counts[c][c], self.col(c))
    }

    pub fn recall(&self, c: usize) -> f64 {
        ratio(self.counts[c][c], self.row(c))
    }

    pub fn f1(&self, c: usize) -> f64 {
        let (p, r) = (self.precision(c), self.recall(c));
        if p + r == 0.0 { 0.0 } else { 2.0 * p * r / (p + r) }
    }

    pub fn macro_f1(&self) -> f64 {
        let present: Vec<usize> = (0..K).filter(|&c| self.row(c) + self.col(c) > 0).collect();
        if present.is_empty() {
            return 0.0;
        }
        present.iter().map(|&c| self.f1(c)).sum::<f64>() / present.len() as f64
    }

    pub fn kappa(&self) -> f64 {
        let total = self.total() as f64;
        if total == 0.0 {
            return 0.0;
        }
        let p_o = self.accuracy();
        let p_e: f64 = (0..K)
            .map(|c| (self.row(c) as f64 / total) * (self.col(c) as f64 / total))
            .sum();
        if (1.0 - p_e).abs() < f64::EPSILON {
            // Every window in one class on both sides
            return if p_o == 1.0 { 1.0 } else { 0.0 };
        }
        (p_o - p_e) / (1.0 - p_e)
    }

    pub fn rows(&self) -> Vec<Vec<u64>> {
        self.counts.iter().map(|r| r.to_vec()).collect()
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 { 0.0 } else { num as f64 / den as f64 }
}

// ─── EvaluationMetrics ────────────────────────────────────────────────────────
/// Everything reported for one evaluation pass over a fold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    pub windows:   u64,
    pub loss:      f64,
    pub accuracy:  f64,
    pub macro_f1:  f64,
    pub kappa:     f64,
    /// Indexed by SleepStage
    pub precision: Vec<f64>,
    pub recall:    Vec<f64>,
    pub confusion: Vec<Vec<u64>>,
}

impl EvaluationMetrics {
    pub fn from_confusion(cm: &ConfusionMatrix, loss: f64) -> Self {
        Self {
            windows:   cm.total(),
            loss,
            accuracy:  cm.accuracy(),
            macro_f1:  cm.macro_f1(),
            kappa:     cm.kappa(),
            precision: (0..K).map(|c| cm.precision(c)).collect(),
            recall:    (0..K).map(|c| cm.recall(c)).collect(),
            confusion: cm.rows(),
        }
    }
}

impl fmt::Display for EvaluationMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loss={:.4} acc={:.1}% macro_f1={:.3} kappa={:.3} ({} windows)",
            self.loss,
            self.accuracy * 100.0,
            self.macro_f1,
            self.kappa,
            self.windows
        )
    }
}

// ─── Monitor ──────────────────────────────────────────────────────────────────
/// Validation quantity that drives early stopping and best-model selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Monitor {
    #[default]
    ValLoss,
    Accuracy,
    MacroF1,
    Kappa,
}

impl Monitor {
    pub fn value(&self, m: &EvaluationMetrics) -> f64 {
        match self {
            Monitor::ValLoss  => m.loss,
            Monitor::Accuracy => m.accuracy,
            Monitor::MacroF1  => m.macro_f1,
            Monitor::Kappa    => m.kappa,
        }
    }

    pub fn lower_is_better(&self) -> bool {
        matches!(self, Monitor::ValLoss)
    }

    /// Strict improvement of `value` over `best`.
    pub fn improves(&self, value: f64, best: f64) -> bool {
        if self.lower_is_better() { value < best } else { value > best }
    }
}

impl fmt::Display for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Monitor::ValLoss  => "val-loss",
            Monitor::Accuracy => "accuracy",
            Monitor::MacroF1  => "macro-f1",
            Monitor::Kappa    => "kappa",
        })
    }
}

impl FromStr for Monitor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "val-loss" | "loss" => Ok(Monitor::ValLoss),
            "accuracy" | "acc"  => Ok(Monitor::Accuracy),
            "macro-f1" | "f1"   => Ok(Monitor::MacroF1),
            "kappa"             => Ok(Monitor::Kappa),
            other => Err(format!("unknown monitor '{other}'")),
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn matrix(pairs: &[(usize, usize)]) -> ConfusionMatrix {
        let mut cm = ConfusionMatrix::new();
        pairs.iter().for_each(|&(t, p)| cm.record(t, p));
        cm
    }

    #[test]
    fn test_perfect_predictions() {
        let cm = matrix(&[(0, 0), (1, 1), (2, 2), (3, 3), (4, 4), (2, 2)]);
        assert_eq!(cm.accuracy(), 1.0);
        assert_eq!(cm.macro_f1(), 1.0);
        assert!((cm.kappa() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_known_values() {
        // truth W W N2 N2, predicted W N2 N2 N2
        let cm = matrix(&[(0, 0), (0, 2), (2, 2), (2, 2)]);
        assert_eq!(cm.accuracy(), 0.75);
        assert_eq!(cm.precision(2), 2.0 / 3.0);
        assert_eq!(cm.recall(0), 0.5);
        // p_o = 0.75, p_e = 0.5·0.25 + 0.5·0.75 = 0.5
        assert!((cm.kappa() - 0.5).abs() < 1e-12);
        // F1(W) = 2/3, F1(N2) = 0.8
        assert!((cm.macro_f1() - (2.0 / 3.0 + 0.8) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_empty_matrix_is_zero() {
        let cm = ConfusionMatrix::new();
        assert_eq!(cm.accuracy(), 0.0);
        assert_eq!(cm.kappa(), 0.0);
        assert_eq!(cm.macro_f1(), 0.0);
    }

    #[test]
    fn test_monitor_direction() {
        assert!(Monitor::ValLoss.improves(0.4, 0.5));
        assert!(!Monitor::ValLoss.improves(0.5, 0.5));
        assert!(Monitor::Kappa.improves(0.6, 0.5));
        assert_eq!("macro_f1".parse::<Monitor>(), Ok(Monitor::MacroF1));
    }
}
