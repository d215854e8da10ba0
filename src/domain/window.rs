// ============================================================
// Layer 3 — Canonical Window
// ============================================================
// The atomic training unit: one epoch of one subject, every
// channel resampled to the canonical rate. All windows in a
// dataset share one WindowShape so they can be stacked into
// batches without padding or truncation.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::signal::SleepStage;
use crate::domain::subject::SubjectKey;

/// channels × samples of a single window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowShape {
    pub channels: usize,
    pub samples:  usize,
}

impl WindowShape {
    pub fn new(channels: usize, samples: usize) -> Self {
        Self { channels, samples }
    }

    /// Total f32 values in one window.
    pub fn len(&self) -> usize {
        self.channels * self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for WindowShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.channels, self.samples)
    }
}

/// One canonical epoch. `samples` is channel-major:
/// `[ch0 s0..sN, ch1 s0..sN, ...]`.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalWindow {
    pub subject: SubjectKey,
    /// Position inside the subject; adjacency for sequence context
    pub index:   usize,
    pub shape:   WindowShape,
    pub samples: Vec<f32>,
    pub label:   SleepStage,
}

impl CanonicalWindow {
    /// Samples of one channel.
    pub fn channel(&self, channel: usize) -> &[f32] {
        let start = channel * self.shape.samples;
        &self.samples[start..start + self.shape.samples]
    }

    /// True when the sample buffer agrees with the declared shape.
    pub fn is_consistent(&self) -> bool {
        self.samples.len() == self.shape.len()
    }
}
