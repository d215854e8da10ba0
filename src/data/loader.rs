// ============================================================
// Layer 4 — Window Loader
// ============================================================
// Turns one fold of the Dataset Index into a lazy, finite,
// restartable sequence of batches.
//
// Each sample is a target window plus `context_length` windows
// on either side from the SAME subject:
//
//   context_length = 2, sequence length L = 5
//
//   subject A: [a0][a1][a2][a3][a4][a5]   subject B: [b0][b1] ...
//                       ▲
//               target a2 → [a0 a1 a2 a3 a4]
//
// Context never crosses a subject boundary. Near the edges the
// ContextBoundary policy decides:
//
//   Exclude  targets without full context are not served
//            (n − 2k targets per subject of n windows)
//   ZeroPad  every window is a target; slots outside the subject
//            are zeros and carry mask 0
//
// Shuffling permutes TARGETS with a ChaCha8 generator seeded by
// the caller, so a given seed always yields the same batches.
// Calling `batches` again restarts from the beginning.
//
// Batches are transient: the loader reads the windows it needs
// from the index for one batch and drops them afterwards.
//
// Reference: Rust Book §13 (Iterators)

use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc};

use crate::data::index::DatasetIndex;
use crate::data::normalizer::ChannelNormalizer;
use crate::domain::error::{PipelineError, PipelineResult, Stage};
use crate::domain::fold::Fold;
use crate::domain::signal::SleepStage;
use crate::domain::subject::SubjectKey;
use crate::domain::window::WindowShape;

// ─── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextBoundary {
    #[default]
    Exclude,
    ZeroPad,
}

impl fmt::Display for ContextBoundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContextBoundary::Exclude => "exclude",
            ContextBoundary::ZeroPad => "zero-pad",
        })
    }
}

impl FromStr for ContextBoundary {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exclude"                          => Ok(ContextBoundary::Exclude),
            "zero-pad" | "zeropad" | "zero_pad" => Ok(ContextBoundary::ZeroPad),
            other => Err(format!("unknown context boundary '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    pub batch_size:     usize,
    /// Windows on EACH side of the target
    pub context_length: usize,
    pub boundary:       ContextBoundary,
}

impl LoaderConfig {
    pub fn sequence_length(&self) -> usize {
        2 * self.context_length + 1
    }
}

// ─── Batch ────────────────────────────────────────────────────────────────────

/// One target window with its context, flattened `[L][C][S]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceSample {
    pub subject:  SubjectKey,
    /// Index of the target window inside its subject
    pub position: usize,
    pub inputs:   Vec<f32>,
    /// 1.0 for real windows, 0.0 for padding; length L
    pub mask:     Vec<f32>,
    /// Label of the target (centre) window
    pub label:    SleepStage,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub samples: Vec<SequenceSample>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn labels(&self) -> Vec<SleepStage> {
        self.samples.iter().map(|s| s.label).collect()
    }
}

// ─── WindowLoader ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WindowLoader {
    index:      Arc<DatasetIndex>,
    fold:       Fold,
    config:     LoaderConfig,
    normalizer: Option<Arc<ChannelNormalizer>>,
    shape:      WindowShape,
    /// Per subject slot: (first target local index, target count, windows)
    targets:    Vec<(usize, usize, usize)>,
    /// Cumulative target offsets, one trailing total
    offsets:    Vec<usize>,
}

impl WindowLoader {
    pub fn new(index: Arc<DatasetIndex>, fold: Fold, config: LoaderConfig) -> PipelineResult<Self> {
        if config.batch_size == 0 {
            return Err(PipelineError::InvalidConfig("batch size must be at least 1".into()));
        }

        let k = config.context_length;
        let mut targets = Vec::new();
        let mut offsets = vec![0usize];
        for (_, n) in index.subjects(fold)? {
            let t = match config.boundary {
                ContextBoundary::ZeroPad => (0, n, n),
                ContextBoundary::Exclude => (k, n.saturating_sub(2 * k), n),
            };
            targets.push(t);
            offsets.push(offsets[offsets.len() - 1] + t.1);
        }

        let shape = index.shape();
        tracing::debug!(
            "Loader on {} fold: {} targets, L={}, boundary={}",
            fold,
            offsets[offsets.len() - 1],
            config.sequence_length(),
            config.boundary
        );
        Ok(Self { index, fold, config, normalizer: None, shape, targets, offsets })
    }

    /// Apply frozen per-channel statistics to every window served.
    pub fn with_normalizer(mut self, normalizer: Arc<ChannelNormalizer>) -> PipelineResult<Self> {
        if normalizer.channels() != self.shape.channels {
            return Err(PipelineError::InvalidConfig(format!(
                "normaliser has {} channels, dataset windows have {}",
                normalizer.channels(),
                self.shape.channels
            )));
        }
        self.normalizer = Some(normalizer);
        Ok(self)
    }

    pub fn fold(&self) -> Fold {
        self.fold
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn shape(&self) -> WindowShape {
        self.shape
    }

    pub fn index(&self) -> &Arc<DatasetIndex> {
        &self.index
    }

    /// Number of target windows served per pass.
    pub fn len(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.config.batch_size)
    }

    /// A fresh pass over the fold. `shuffle_seed = None` keeps index order.
    pub fn batches(&self, shuffle_seed: Option<u64>) -> BatchIter {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if let Some(seed) = shuffle_seed {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            order.shuffle(&mut rng);
        }
        BatchIter { loader: self.clone(), order: Arc::new(order), cursor: 0 }
    }

    /// (subject slot, local index) of the t-th target.
    fn target(&self, t: usize) -> (usize, usize) {
        let slot = self.offsets.partition_point(|&o| o <= t) - 1;
        (slot, self.targets[slot].0 + (t - self.offsets[slot]))
    }

    /// The t-th target of a pass in index order.
    pub fn sample(&self, t: usize) -> PipelineResult<SequenceSample> {
        if t >= self.len() {
            return Err(PipelineError::InvalidConfig(format!(
                "target {t} out of range for {} fold ({} targets)",
                self.fold,
                self.len()
            )));
        }
        let (slot, local) = self.target(t);
        let k     = self.config.context_length;
        let l     = self.config.sequence_length();
        let n     = self.targets[slot].2;
        let lo    = local.saturating_sub(k);
        let hi    = (local + k + 1).min(n);
        let block = self.shape.len();

        let windows = self.index.subject_windows(self.fold, slot, lo, hi - lo)?;

        let mut inputs = vec![0.0f32; l * block];
        let mut mask   = vec![0.0f32; l];
        let mut label  = None;
        let mut subject = None;
        for mut w in windows {
            if w.shape != self.shape || !w.is_consistent() {
                return Err(PipelineError::ShapeMismatch {
                    stage:    Stage::Loading,
                    subject:  w.subject,
                    expected: self.shape,
                    found:    w.shape,
                });
            }
            if let Some(norm) = &self.normalizer {
                norm.apply(&mut w.samples, w.shape);
            }
            // Slot of this window inside the sequence
            let pos = w.index + k - local;
            inputs[pos * block..(pos + 1) * block].copy_from_slice(&w.samples);
            mask[pos] = 1.0;
            if w.index == local {
                label = Some(w.label);
            }
            subject.get_or_insert(w.subject);
        }

        match (label, subject) {
            (Some(label), Some(subject)) => Ok(SequenceSample { subject, position: local, inputs, mask, label }),
            _ => Err(PipelineError::InvalidConfig(format!(
                "target window {local} of subject slot {slot} was not returned by the index"
            ))),
        }
    }
}

// ─── BatchIter ────────────────────────────────────────────────────────────────

/// Lazy, finite sequence of batches for one pass. The last batch may be
/// shorter than `batch_size`.
#[derive(Debug, Clone)]
pub struct BatchIter {
    loader: WindowLoader,
    order:  Arc<Vec<usize>>,
    cursor: usize,
}

impl BatchIter {
    /// Skip the first `n` batches (resuming a pass mid-epoch).
    pub fn skip_batches(mut self, n: usize) -> Self {
        self.cursor = (n * self.loader.config.batch_size).min(self.order.len());
        self
    }

    pub fn remaining_batches(&self) -> usize {
        (self.order.len() - self.cursor).div_ceil(self.loader.config.batch_size)
    }
}

impl Iterator for BatchIter {
    type Item = PipelineResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.loader.config.batch_size).min(self.order.len());
        let ids = &self.order[self.cursor..end];
        self.cursor = end;

        let samples: PipelineResult<Vec<SequenceSample>> =
            ids.iter().map(|&t| self.loader.sample(t)).collect();
        Some(samples.map(|samples| Batch { samples }))
    }
}
