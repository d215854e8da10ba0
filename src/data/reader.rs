// ============================================================
// Layer 4 — Signal Readers (one schema per source dataset)
// ============================================================
// Each public sleep study has its own quirks:
//   - montage naming (ISRUC "C3-A2" vs "C3-M2", SHHS "EEG")
//   - hypnogram codes (R&K stage 4, "movement", "unscored")
//   - label files that run an epoch longer or shorter than
//     the signal
//
// All of that lives in a static SourceSchema. One generic
// reading routine applies the schema, so every source yields
// the same Recording contract and nothing downstream ever
// branches on source identity.
//
// Reading steps for one subject:
//   1. open the EDF file and pick channels by alias, per role
//   2. decode the picked channels to physical units
//   3. read the hypnogram (one integer code per line)
//   4. reconcile label count with whole signal epochs
//   5. splice out epochs whose code means "unscored"
//
// Reference: Rust Book §6 (Enums and Pattern Matching)
//            Rust Book §13 (Iterators)

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::data::edf::EdfReader;
use crate::domain::error::{PipelineError, PipelineResult, Stage};
use crate::domain::signal::{ChannelRole, ChannelSignal, Recording, RecordingLocator, SleepStage};
use crate::domain::subject::{SourceDataset, SubjectKey};
use crate::domain::traits::SignalSource;

/// What a raw hypnogram code means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelCode {
    Stage(SleepStage),
    /// Movement / artefact / not scored: the epoch is removed
    Unscored,
}

/// Static per-source reading rules.
#[derive(Debug, Clone, Copy)]
pub struct SourceSchema {
    pub source:         SourceDataset,
    pub epoch_duration: f64,
    /// Channel aliases per role, tried in order
    pub aliases:        &'static [(ChannelRole, &'static [&'static str])],
    /// Roles whose absence makes the recording unusable
    pub required:       &'static [ChannelRole],
    /// Raw code → label; `None` means the code is invalid
    pub decode:         fn(u32) -> Option<LabelCode>,
    /// Epochs of label/signal length disagreement tolerated (truncated away)
    pub label_slack:    usize,
}

// ─── Hypnogram code tables ────────────────────────────────────────────────────
use LabelCode::{Stage as S, Unscored};

/// Rechtschaffen & Kales: 0 W, 1-4 sleep stages, 5 REM, 6 movement, 9 unscored.
fn decode_rk(code: u32) -> Option<LabelCode> {
    match code {
        0     => Some(S(SleepStage::Wake)),
        1     => Some(S(SleepStage::N1)),
        2     => Some(S(SleepStage::N2)),
        3 | 4 => Some(S(SleepStage::N3)),
        5     => Some(S(SleepStage::Rem)),
        6 | 9 => Some(Unscored),
        _     => None,
    }
}

/// AASM exports already in W, N1, N2, N3, REM order; 5+ are unscored.
fn decode_aasm(code: u32) -> Option<LabelCode> {
    match code {
        0..=4 => SleepStage::from_index(code as usize).map(S),
        5..=9 => Some(Unscored),
        _     => None,
    }
}

/// ISRUC uses the same scheme as SVUH: 0 W, 1 REM, 2 N1, 3 N2,
/// 4 and 5 N3; 6 and 7 are dropped.
fn decode_isruc(code: u32) -> Option<LabelCode> {
    decode_svuh(code)
}

/// St Vincent's (SVUH): 0 W, 1 REM, 2 S1, 3 S2, 4 S3, 5 S4, 6 artefact, 7 indeterminate.
fn decode_svuh(code: u32) -> Option<LabelCode> {
    match code {
        0     => Some(S(SleepStage::Wake)),
        1     => Some(S(SleepStage::Rem)),
        2     => Some(S(SleepStage::N1)),
        3     => Some(S(SleepStage::N2)),
        4 | 5 => Some(S(SleepStage::N3)),
        6 | 7 => Some(Unscored),
        _     => None,
    }
}

use ChannelRole::{Ecg, Emg, Eeg, Eog};

const SLEEP_EDF: SourceSchema = SourceSchema {
    source:         SourceDataset::SleepEdf,
    epoch_duration: 30.0,
    aliases: &[
        (Eeg, &["EEG Fpz-Cz", "EEG Pz-Oz"]),
        (Eog, &["EOG horizontal"]),
        (Emg, &["EMG submental"]),
    ],
    required:    &[Eeg],
    decode:      decode_rk,
    label_slack: 0,
};

const SHHS: SourceSchema = SourceSchema {
    source:         SourceDataset::Shhs,
    epoch_duration: 30.0,
    aliases: &[
        (Eeg, &["EEG", "EEG(sec)", "EEG2", "EEG 2"]),
        (Eog, &["EOG(L)", "EOG(R)"]),
        (Emg, &["EMG"]),
        (Ecg, &["ECG", "EKG"]),
    ],
    required:    &[Eeg],
    decode:      decode_rk,
    label_slack: 0,
};

const MASS: SourceSchema = SourceSchema {
    source:         SourceDataset::Mass,
    epoch_duration: 30.0,
    aliases: &[
        (Eeg, &["EEG C4-LER", "EEG C4-CLE", "EEG C3-LER", "EEG C3-CLE"]),
        (Eog, &["EOG Left Horiz", "EOG Right Horiz"]),
        (Emg, &["EMG Chin1", "EMG Chin2", "EMG Chin3"]),
        (Ecg, &["ECG I"]),
    ],
    required:    &[Eeg],
    decode:      decode_rk,
    label_slack: 0,
};

const DCSM: SourceSchema = SourceSchema {
    source:         SourceDataset::Dcsm,
    epoch_duration: 30.0,
    aliases: &[
        (Eeg, &["C3-M2", "C4-M1", "F3-M2"]),
        (Eog, &["E1-M2", "E2-M2"]),
        (Emg, &["CHIN"]),
        (Ecg, &["ECG-II"]),
    ],
    required:    &[Eeg],
    decode:      decode_aasm,
    label_slack: 0,
};

const HMC: SourceSchema = SourceSchema {
    source:         SourceDataset::Hmc,
    epoch_duration: 30.0,
    aliases: &[
        (Eeg, &["EEG C4-M1", "EEG C3-M2", "EEG F4-M1"]),
        (Eog, &["EOG E1-M2", "EOG E2-M2"]),
        (Emg, &["EMG chin"]),
        (Ecg, &["ECG"]),
    ],
    required:    &[Eeg],
    decode:      decode_aasm,
    label_slack: 0,
};

const ISRUC: SourceSchema = SourceSchema {
    source:         SourceDataset::Isruc,
    epoch_duration: 30.0,
    aliases: &[
        (Eeg, &["C3-A2", "C3-M2"]),
        (Eog, &["LOC-A2", "E1-M2"]),
        (Emg, &["X1", "Chin1-Chin2"]),
        (Ecg, &["X2", "ECG"]),
    ],
    required:    &[Eeg],
    decode:      decode_isruc,
    // Exports disagree with the signals by arbitrary amounts; keep the shorter
    label_slack: usize::MAX,
};

const SVUH: SourceSchema = SourceSchema {
    source:         SourceDataset::Svuh,
    epoch_duration: 30.0,
    aliases: &[
        (Eeg, &["C3A2", "C4A1", "C3-A2", "C4-A1"]),
        (Eog, &["Lefteye", "RightEye"]),
        (Emg, &["EMG"]),
        (Ecg, &["ECG"]),
    ],
    required:    &[Eeg],
    decode:      decode_svuh,
    label_slack: 0,
};

impl SourceDataset {
    pub fn schema(&self) -> &'static SourceSchema {
        match self {
            SourceDataset::SleepEdf => &SLEEP_EDF,
            SourceDataset::Shhs     => &SHHS,
            SourceDataset::Mass     => &MASS,
            SourceDataset::Dcsm     => &DCSM,
            SourceDataset::Hmc      => &HMC,
            SourceDataset::Isruc    => &ISRUC,
            SourceDataset::Svuh     => &SVUH,
        }
    }
}

/// Implement the SignalSource trait so the application layer can call
/// parse() without knowing which study it is reading.
impl SignalSource for SourceDataset {
    fn parse(&self, locator: &RecordingLocator) -> PipelineResult<Recording> {
        if locator.source != *self {
            return Err(PipelineError::InvalidConfig(format!(
                "locator for '{}' handed to the '{}' reader",
                locator.key(),
                self
            )));
        }
        self.schema().read(locator)
    }
}

impl SourceSchema {
    /// Apply this schema to one subject's files.
    pub fn read(&self, locator: &RecordingLocator) -> PipelineResult<Recording> {
        let subject = locator.key();
        let format_err = |path: &Path, reason: String| PipelineError::SourceFormat {
            subject: subject.clone(),
            path:    path.to_path_buf(),
            reason,
        };

        // ── Step 1: open the signal file and resolve channel roles ────────────
        let edf = EdfReader::open(&locator.signal_path)
            .map_err(|e| format_err(&locator.signal_path, e.to_string()))?;

        let mut picked: Vec<(ChannelRole, usize)> = Vec::new();
        for (role, names) in self.aliases {
            match edf.find_signal(names) {
                Some(i) => picked.push((*role, i)),
                None if self.required.contains(role) => {
                    return Err(PipelineError::ChannelMissing {
                        stage:     Stage::Reading,
                        subject:   subject.clone(),
                        role:      *role,
                        available: edf.labels(),
                    });
                }
                None => tracing::debug!("{}: no {} channel, skipping role", subject, role),
            }
        }

        // ── Step 2: decode the picked channels ────────────────────────────────
        let indices: Vec<usize> = picked.iter().map(|(_, i)| *i).collect();
        let decoded = edf
            .read_signals(&indices)
            .map_err(|e| format_err(&locator.signal_path, e.to_string()))?;

        let header = edf.header();
        let mut channels = Vec::with_capacity(picked.len());
        for ((role, i), samples) in picked.iter().zip(decoded) {
            let sig = &header.signals[*i];
            let sample_rate = sig.sample_rate(header.record_duration);
            let per_epoch = sample_rate * self.epoch_duration;
            if sample_rate <= 0.0 || per_epoch.fract() != 0.0 {
                return Err(format_err(
                    &locator.signal_path,
                    format!(
                        "channel '{}' at {} Hz does not hold a whole number of samples per {}s epoch",
                        sig.label, sample_rate, self.epoch_duration
                    ),
                ));
            }
            channels.push(ChannelSignal { role: *role, label: sig.label.clone(), sample_rate, samples });
        }

        // ── Step 3: read and decode the hypnogram ─────────────────────────────
        let codes = read_hypnogram(&locator.labels_path)
            .map_err(|reason| format_err(&locator.labels_path, reason))?;
        let mut labels = Vec::with_capacity(codes.len());
        for (epoch, code) in codes.iter().enumerate() {
            match (self.decode)(*code) {
                Some(label) => labels.push(label),
                None => {
                    return Err(format_err(
                        &locator.labels_path,
                        format!("unknown stage code {code} at epoch {epoch}"),
                    ))
                }
            }
        }

        // ── Step 4: reconcile label count with whole signal epochs ───────────
        let epochs = channels
            .iter()
            .map(|c| c.whole_epochs(self.epoch_duration))
            .min()
            .unwrap_or(0);
        if labels.len() != epochs {
            if labels.len().abs_diff(epochs) > self.label_slack {
                return Err(PipelineError::LabelMismatch {
                    stage:   Stage::Reading,
                    subject,
                    labels:  labels.len(),
                    epochs,
                });
            }
            tracing::debug!(
                "{}: truncating to {} epochs ({} labels, {} signal epochs)",
                subject,
                labels.len().min(epochs),
                labels.len(),
                epochs
            );
        }
        let kept = labels.len().min(epochs);
        labels.truncate(kept);

        // ── Step 5: splice out unscored epochs (signal and label together) ────
        let keep: Vec<bool> = labels.iter().map(|l| matches!(l, LabelCode::Stage(_))).collect();
        for ch in &mut channels {
            let per_epoch = ch.samples_per_epoch(self.epoch_duration) as usize;
            ch.samples = splice_epochs(&ch.samples, per_epoch, &keep);
        }
        let stages: Vec<SleepStage> = labels
            .into_iter()
            .filter_map(|l| match l {
                LabelCode::Stage(s) => Some(s),
                LabelCode::Unscored => None,
            })
            .collect();

        if stages.len() < kept {
            tracing::debug!("{}: dropped {} unscored epochs", subject, kept - stages.len());
        }

        Ok(Recording {
            subject,
            channels,
            epoch_duration: self.epoch_duration,
            labels: stages,
        })
    }
}

/// Keep only the epochs flagged in `keep`; anything past the last flagged
/// epoch (trailing partial epoch included) is dropped.
fn splice_epochs(samples: &[f32], per_epoch: usize, keep: &[bool]) -> Vec<f32> {
    let mut out = Vec::with_capacity(per_epoch * keep.iter().filter(|k| **k).count());
    for (epoch, _) in keep.iter().enumerate().filter(|(_, k)| **k) {
        let start = epoch * per_epoch;
        out.extend_from_slice(&samples[start..start + per_epoch]);
    }
    out
}

/// One integer stage code per line; lines that are not plain digits
/// (headers, blank lines) are ignored. Skipped non-blank lines are
/// reported once per file.
pub fn read_hypnogram(path: &Path) -> Result<Vec<u32>, String> {
    let text = fs::read_to_string(path).map_err(|e| e.to_string())?;
    let (codes, skipped) = parse_hypnogram(&text);
    if let Some(first) = skipped.first() {
        tracing::warn!(
            "'{}': ignored {} non-numeric line(s), first at line {}",
            path.display(),
            skipped.len(),
            first
        );
    }
    Ok(codes)
}

/// Stage codes plus the 1-based numbers of non-blank lines that were skipped.
fn parse_hypnogram(text: &str) -> (Vec<u32>, Vec<usize>) {
    let mut codes   = Vec::new();
    let mut skipped = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.bytes().all(|b| b.is_ascii_digit()).then(|| line.parse::<u32>().ok()).flatten() {
            Some(code) => codes.push(code),
            None       => skipped.push(n + 1),
        }
    }
    (codes, skipped)
}

/// Pair every `<subject>.edf` in `dir` with its `<subject>.txt` hypnogram.
/// Subjects without a hypnogram are skipped with a warning.
pub fn discover_recordings(source: SourceDataset, dir: &Path) -> PipelineResult<Vec<RecordingLocator>> {
    let entries = fs::read_dir(dir).map_err(|e| PipelineError::io(Stage::Reading, dir, e))?;

    let mut locators = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| PipelineError::io(Stage::Reading, dir, e))?.path();
        let is_edf = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("edf"))
            .unwrap_or(false);
        if !is_edf {
            continue;
        }
        let Some(subject) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        let labels_path: PathBuf = path.with_extension("txt");
        if !labels_path.exists() {
            tracing::warn!("Skipping '{}': no hypnogram '{}'", path.display(), labels_path.display());
            continue;
        }
        locators.push(RecordingLocator { source, subject, signal_path: path, labels_path });
    }

    locators.sort_by(|a, b| a.subject.cmp(&b.subject));
    tracing::info!("Discovered {} {} recordings in '{}'", locators.len(), source, dir.display());
    Ok(locators)
}

/// Convenience for callers that only hold a key.
pub fn locator_for(key: &SubjectKey, dir: &Path) -> RecordingLocator {
    RecordingLocator {
        source:      key.source,
        subject:     key.subject.clone(),
        signal_path: dir.join(format!("{}.edf", key.subject)),
        labels_path: dir.join(format!("{}.txt", key.subject)),
    }
}
