// ============================================================
// Layer 3 — Signals, Stages and Recordings
// ============================================================
// A Recording is what a Signal Reader hands to the
// Canonicalizer: raw per-channel samples at their native rate
// plus one sleep-stage label per epoch.
//
// Invariant: labels.len() == number of whole epochs in the
// shortest channel (checked by `Recording::check_labels`).

use serde::{Deserialize, Serialize};
use std::{fmt, path::PathBuf, str::FromStr};

use crate::domain::subject::{SourceDataset, SubjectKey};

// ─── ChannelRole ──────────────────────────────────────────────────────────────
/// Physiological role of a channel, independent of montage naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelRole {
    Eeg,
    Eog,
    Emg,
    Ecg,
}

impl ChannelRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelRole::Eeg => "eeg",
            ChannelRole::Eog => "eog",
            ChannelRole::Emg => "emg",
            ChannelRole::Ecg => "ecg",
        }
    }
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eeg" => Ok(ChannelRole::Eeg),
            "eog" => Ok(ChannelRole::Eog),
            "emg" => Ok(ChannelRole::Emg),
            "ecg" => Ok(ChannelRole::Ecg),
            other => Err(format!("unknown channel role '{other}'")),
        }
    }
}

// ─── SleepStage ───────────────────────────────────────────────────────────────
/// Canonical five-class AASM label. The discriminant is the class index
/// used by models and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SleepStage {
    Wake = 0,
    N1   = 1,
    N2   = 2,
    N3   = 3,
    Rem  = 4,
}

impl SleepStage {
    pub const COUNT: usize = 5;

    pub const ALL: [SleepStage; 5] = [
        SleepStage::Wake,
        SleepStage::N1,
        SleepStage::N2,
        SleepStage::N3,
        SleepStage::Rem,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

// ─── ChannelSignal ────────────────────────────────────────────────────────────
/// One raw channel as read from the source file.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSignal {
    pub role:        ChannelRole,
    /// Native label in the source file, kept for traceability
    pub label:       String,
    /// Native sampling rate in Hz
    pub sample_rate: f64,
    pub samples:     Vec<f32>,
}

impl ChannelSignal {
    /// Number of samples one epoch spans at this channel's native rate.
    pub fn samples_per_epoch(&self, epoch_duration: f64) -> f64 {
        self.sample_rate * epoch_duration
    }

    /// Whole epochs contained in this channel.
    pub fn whole_epochs(&self, epoch_duration: f64) -> usize {
        let per_epoch = self.samples_per_epoch(epoch_duration);
        if per_epoch <= 0.0 {
            return 0;
        }
        (self.samples.len() as f64 / per_epoch).floor() as usize
    }
}

// ─── Recording ────────────────────────────────────────────────────────────────
/// One subject's raw multi-channel signal plus its per-epoch labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Recording {
    pub subject:        SubjectKey,
    pub channels:       Vec<ChannelSignal>,
    /// Epoch duration in seconds (30 s for every supported source)
    pub epoch_duration: f64,
    pub labels:         Vec<SleepStage>,
}

impl Recording {
    pub fn channel(&self, role: ChannelRole) -> Option<&ChannelSignal> {
        self.channels.iter().find(|c| c.role == role)
    }

    /// Whole epochs derivable from the shortest channel.
    pub fn whole_epochs(&self) -> usize {
        self.channels
            .iter()
            .map(|c| c.whole_epochs(self.epoch_duration))
            .min()
            .unwrap_or(0)
    }

    /// Returns `(labels, epochs)` when the label sequence disagrees with the
    /// signal duration.
    pub fn check_labels(&self) -> Result<usize, (usize, usize)> {
        let epochs = self.whole_epochs();
        if epochs == self.labels.len() {
            Ok(epochs)
        } else {
            Err((self.labels.len(), epochs))
        }
    }
}

// ─── RecordingLocator ─────────────────────────────────────────────────────────
/// Where one subject's raw files live, plus the declared source schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingLocator {
    pub source:      SourceDataset,
    pub subject:     String,
    pub signal_path: PathBuf,
    pub labels_path: PathBuf,
}

impl RecordingLocator {
    pub fn key(&self) -> SubjectKey {
        SubjectKey::new(self.source, self.subject.clone())
    }
}
