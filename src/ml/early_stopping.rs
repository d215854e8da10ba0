// ============================================================
// Layer 5 — Early Stopping
// ============================================================
// Tracks the best monitored validation value and how many
// consecutive epochs have passed without a STRICT improvement.
// Once that count reaches `patience`, training stops.
//
//   patience = 2, values: 0.9 0.7 0.5 0.5 0.5
//   epoch:                 1   2   3   4   5
//   counter:               0   0   0   1   2  → stop after epoch 5
//
// patience = 0 disables early stopping.
//
// The tracker is part of the persisted experiment state so a
// resumed run continues the same count.

use serde::{Deserialize, Serialize};

use crate::ml::metrics::Monitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Improved,
    NoImprovement,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStopping {
    pub monitor:    Monitor,
    pub patience:   usize,
    pub best:       Option<f64>,
    pub best_epoch: usize,
    /// Consecutive epochs without improvement
    pub counter:    usize,
}

impl EarlyStopping {
    pub fn new(monitor: Monitor, patience: usize) -> Self {
        Self { monitor, patience, best: None, best_epoch: 0, counter: 0 }
    }

    pub fn observe(&mut self, epoch: usize, value: f64) -> Verdict {
        let improved = match self.best {
            None       => value.is_finite(),
            Some(best) => self.monitor.improves(value, best),
        };

        if improved {
            self.best       = Some(value);
            self.best_epoch = epoch;
            self.counter    = 0;
            return Verdict::Improved;
        }

        self.counter += 1;
        if self.patience > 0 && self.counter >= self.patience {
            Verdict::Stop
        } else {
            Verdict::NoImprovement
        }
    }
}
