// ============================================================
// Layer 4 — Per-Channel Z-Score Normaliser
// ============================================================
// Statistics are computed ONCE over the training fold and then
// frozen: validation, test and explain sessions reuse them, so
// no information from held-out subjects leaks into the inputs.
//
//   x' = (x − mean[c]) / std[c]
//
// Mean and variance are accumulated with Welford's algorithm in
// f64, one accumulator per channel, visiting subjects in key
// order (the result is bit-reproducible). A channel whose std
// is below STD_FLOOR (e.g. a zero-filled role) is only centred.
//
// Reference: Welford (1962), "Note on a method for calculating
//            corrected sums of squares and products"

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::domain::error::PipelineResult;
use crate::domain::fold::Fold;
use crate::domain::traits::Persistable;
use crate::domain::window::WindowShape;
use crate::data::index::DatasetIndex;

const STD_FLOOR: f64 = 1e-6;

#[derive(Debug, Clone, Copy, Default)]
struct Welford {
    n:    u64,
    mean: f64,
    m2:   f64,
}

impl Welford {
    fn push(&mut self, x: f64) {
        self.n += 1;
        let delta = x - self.mean;
        self.mean += delta / self.n as f64;
        self.m2 += delta * (x - self.mean);
    }

    fn std(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            (self.m2 / self.n as f64).sqrt()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelNormalizer {
    pub mean: Vec<f32>,
    pub std:  Vec<f32>,
}

impl ChannelNormalizer {
    /// Statistics over every window of `fold` (normally `Fold::Train`).
    pub fn fit(index: &DatasetIndex, fold: Fold) -> PipelineResult<Self> {
        let shape = index.shape();
        let mut acc = vec![Welford::default(); shape.channels];

        for (slot, (_, count)) in index.subjects(fold)?.into_iter().enumerate() {
            for window in index.subject_windows(fold, slot, 0, count)? {
                for (c, stats) in acc.iter_mut().enumerate() {
                    for &v in window.channel(c) {
                        stats.push(v as f64);
                    }
                }
            }
        }

        let norm = Self {
            mean: acc.iter().map(|w| w.mean as f32).collect(),
            std:  acc
                .iter()
                .map(|w| {
                    let s = w.std();
                    if s < STD_FLOOR { 1.0 } else { s as f32 }
                })
                .collect(),
        };
        tracing::info!("Normalisation fitted on {} fold: mean={:?} std={:?}", fold, norm.mean, norm.std);
        Ok(norm)
    }

    /// Identity transform for `channels` channels.
    pub fn identity(channels: usize) -> Self {
        Self { mean: vec![0.0; channels], std: vec![1.0; channels] }
    }

    pub fn channels(&self) -> usize {
        self.mean.len()
    }

    /// Normalise one channel-major window in place.
    pub fn apply(&self, samples: &mut [f32], shape: WindowShape) {
        for (c, chunk) in samples.chunks_mut(shape.samples).take(shape.channels).enumerate() {
            let (mean, std) = (self.mean[c], self.std[c]);
            for v in chunk {
                *v = (*v - mean) / std;
            }
        }
    }
}

impl Persistable for ChannelNormalizer {
    fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Cannot write '{}'", path.display()))?;
        tracing::debug!("Normalisation saved to '{}'", path.display());
        Ok(())
    }

    fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path).with_context(|| format!("Cannot read '{}'", path.display()))?;
        let norm: Self = serde_json::from_str(&json).with_context(|| format!("Malformed '{}'", path.display()))?;
        Ok(norm)
    }
}
