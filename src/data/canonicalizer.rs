// ============================================================
// Layer 4 — Canonicalizer
// ============================================================
// Turns a Recording (native rates, source montage) into the
// canonical representation every later stage consumes:
//
//   Recording                       CanonicalWindow × n_epochs
//   ┌──────────────────────┐        ┌─────────────────────────┐
//   │ EEG  200 Hz ........ │  ──►   │ [EEG | EOG] 2 × 3000    │
//   │ EOG   50 Hz ........ │        │ label                   │
//   │ EMG  200 Hz ........ │        └─────────────────────────┘
//   └──────────────────────┘
//
//   - channels are reordered to the configured role list
//   - channels not in the role list are dropped
//   - a missing role either fails, is zero-filled, or is
//     copied from another role, per its RolePolicy
//   - every epoch is resampled on its own (see resample.rs)
//   - exactly one window per label, in label order
//
// Output is persisted per (source, subject) through the
// CanonicalStore. A subject whose stored header already
// carries the same spec and recording digest is skipped, so
// the expensive step runs at most once per subject.
//
// Reference: Rust Book §8 (Vectors and Slices)

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::data::resample::resample_epoch;
use crate::data::store::{CanonicalStore, StoreOutcome};
use crate::domain::error::{PipelineError, PipelineResult, Stage};
use crate::domain::signal::{ChannelRole, Recording};
use crate::domain::window::{CanonicalWindow, WindowShape};

// ─── Policies ─────────────────────────────────────────────────────────────────

/// What to do when a recording lacks a configured role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MissingPolicy {
    /// Abort with ChannelMissing
    Fail,
    /// Synthesize an all-zero channel
    ZeroFill,
    /// Duplicate another role's channel
    CopyFrom(ChannelRole),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolePolicy {
    pub role:       ChannelRole,
    pub on_missing: MissingPolicy,
}

impl RolePolicy {
    pub fn required(role: ChannelRole) -> Self {
        Self { role, on_missing: MissingPolicy::Fail }
    }

    pub fn zero_fill(role: ChannelRole) -> Self {
        Self { role, on_missing: MissingPolicy::ZeroFill }
    }

    pub fn copy_from(role: ChannelRole, from: ChannelRole) -> Self {
        Self { role, on_missing: MissingPolicy::CopyFrom(from) }
    }
}

/// Canonical parameters shared by every subject of a dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalSpec {
    /// Canonical sampling rate in Hz
    pub target_rate:    f64,
    /// Seconds per window (must equal the recording's label epoch)
    pub epoch_duration: f64,
    /// Output channel order
    pub roles:          Vec<RolePolicy>,
}

impl Default for CanonicalSpec {
    /// 100 Hz, 30 s epochs, EEG only.
    fn default() -> Self {
        Self {
            target_rate:    100.0,
            epoch_duration: 30.0,
            roles:          vec![RolePolicy::required(ChannelRole::Eeg)],
        }
    }
}

impl CanonicalSpec {
    /// Canonical samples per window; rejects rates that do not give a
    /// whole number of samples per epoch.
    pub fn samples_per_window(&self) -> PipelineResult<usize> {
        let n = self.target_rate * self.epoch_duration;
        if !(n.is_finite() && n >= 1.0 && n.fract() == 0.0) {
            return Err(PipelineError::InvalidConfig(format!(
                "{} Hz × {} s is not a whole number of samples per window",
                self.target_rate, self.epoch_duration
            )));
        }
        Ok(n as usize)
    }

    pub fn shape(&self) -> PipelineResult<WindowShape> {
        if self.roles.is_empty() {
            return Err(PipelineError::InvalidConfig("no channel roles configured".into()));
        }
        Ok(WindowShape::new(self.roles.len(), self.samples_per_window()?))
    }

    pub fn role_list(&self) -> Vec<ChannelRole> {
        self.roles.iter().map(|p| p.role).collect()
    }
}

// ─── Pure transformation ──────────────────────────────────────────────────────

/// Source samples for one output channel.
enum Plan<'a> {
    Native { samples: &'a [f32], per_epoch: f64 },
    Zeros,
}

/// Canonicalize a recording in memory. Deterministic: the same recording
/// and spec always give bit-identical windows.
pub fn canonicalize_windows(rec: &Recording, spec: &CanonicalSpec) -> PipelineResult<Vec<CanonicalWindow>> {
    let shape = spec.shape()?;

    if (rec.epoch_duration - spec.epoch_duration).abs() > 1e-9 {
        return Err(PipelineError::InvalidConfig(format!(
            "{}: recording epochs are {} s but canonical windows are {} s",
            rec.subject, rec.epoch_duration, spec.epoch_duration
        )));
    }

    // Every label needs a whole epoch of signal on every channel
    let epochs = rec.check_labels().map_err(|(labels, epochs)| PipelineError::LabelMismatch {
        stage:   Stage::Canonicalizing,
        subject: rec.subject.clone(),
        labels,
        epochs,
    })?;

    // ── Resolve each output channel to a source, per role policy ─────────────
    let missing = |role: ChannelRole| PipelineError::ChannelMissing {
        stage:     Stage::Canonicalizing,
        subject:   rec.subject.clone(),
        role,
        available: rec
            .channels
            .iter()
            .map(|c| format!("{}:{}", c.role, c.label))
            .collect(),
    };

    let mut plans = Vec::with_capacity(spec.roles.len());
    for policy in &spec.roles {
        // Native channel first, then the configured substitute
        let found = rec.channel(policy.role).or_else(|| match policy.on_missing {
            MissingPolicy::CopyFrom(from) => rec.channel(from),
            _ => None,
        });
        let plan = match (found, policy.on_missing) {
            (Some(ch), _) => Plan::Native {
                samples:   &ch.samples,
                per_epoch: ch.samples_per_epoch(rec.epoch_duration),
            },
            (None, MissingPolicy::ZeroFill) => {
                tracing::debug!("{}: zero-filling missing {} channel", rec.subject, policy.role);
                Plan::Zeros
            }
            (None, _) => return Err(missing(policy.role)),
        };
        plans.push(plan);
    }

    // ── One window per epoch, channel-major ───────────────────────────────────
    let mut windows = Vec::with_capacity(epochs);
    for (index, label) in rec.labels.iter().enumerate() {
        let mut samples = Vec::with_capacity(shape.len());
        for plan in &plans {
            match plan {
                Plan::Native { samples: src, per_epoch } => {
                    // Epoch bounds in native samples; rounding keeps
                    // fractional rates from drifting across epochs
                    let start = (index as f64 * per_epoch).round() as usize;
                    let end   = ((index + 1) as f64 * per_epoch).round() as usize;
                    samples.extend(resample_epoch(&src[start..end.min(src.len())], shape.samples));
                }
                Plan::Zeros => samples.extend(std::iter::repeat(0.0f32).take(shape.samples)),
            }
        }
        windows.push(CanonicalWindow {
            subject: rec.subject.clone(),
            index,
            shape,
            samples,
            label: *label,
        });
    }

    Ok(windows)
}

// ─── Persisting entry point ───────────────────────────────────────────────────

/// Canonicalize one recording into the store, skipping the work when the
/// stored output was produced from the same recording with the same spec.
pub fn canonicalize(rec: &Recording, spec: &CanonicalSpec, store: &CanonicalStore) -> PipelineResult<StoreOutcome> {
    let digest = recording_digest(rec);
    store.persist(&rec.subject, spec, &digest, || canonicalize_windows(rec, spec))
}

/// SHA-256 over everything that influences canonical output, hex-encoded.
pub fn recording_digest(rec: &Recording) -> String {
    let mut hasher = Sha256::new();

    hasher.update(rec.epoch_duration.to_le_bytes());
    for ch in &rec.channels {
        hasher.update(ch.role.as_str().as_bytes());
        hasher.update(ch.sample_rate.to_le_bytes());
        hasher.update((ch.samples.len() as u64).to_le_bytes());
        for v in &ch.samples {
            hasher.update(v.to_bits().to_le_bytes());
        }
    }
    let labels: Vec<u8> = rec.labels.iter().map(|l| l.index() as u8).collect();
    hasher.update(&labels);

    hex::encode(hasher.finalize())
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::signal::SleepStage;
    use crate::domain::subject::{SourceDataset, SubjectKey};
    use crate::testutil::{small_spec, synthetic_recording};

    fn key() -> SubjectKey {
        SubjectKey::new(SourceDataset::Hmc, "SN001")
    }

    #[test]
    fn test_one_window_per_epoch_in_order() {
        let rec = synthetic_recording(&key(), 6, 0.0);
        let w   = canonicalize_windows(&rec, &small_spec()).unwrap();
        assert_eq!(w.len(), 6);
        for (i, win) in w.iter().enumerate() {
            assert_eq!(win.index, i);
            assert_eq!(win.label, rec.labels[i]);
            assert_eq!(win.shape, WindowShape::new(2, 30));
            assert!(win.is_consistent());
        }
        // EOG is the second channel and carries the +100 offset
        assert!(w[2].channel(1)[0] > 100.0);
        assert!(w[2].channel(0)[0] < 100.0);
    }

    #[test]
    fn test_downsamples_to_target_rate() {
        let rec  = synthetic_recording(&key(), 2, 0.0);
        let mut spec = small_spec();
        spec.target_rate = 5.0;
        let w = canonicalize_windows(&rec, &spec).unwrap();
        assert_eq!(w[0].shape.samples, 15);
        assert_eq!(w[0].samples.len(), 30);
    }

    #[test]
    fn test_missing_required_role_fails() {
        let mut rec = synthetic_recording(&key(), 2, 0.0);
        rec.channels.retain(|c| c.role == ChannelRole::Eeg);
        let err = canonicalize_windows(&rec, &small_spec()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ChannelMissing { role: ChannelRole::Eog, stage: Stage::Canonicalizing, .. }
        ));
    }

    #[test]
    fn test_zero_fill_and_copy_from_policies() {
        let mut rec = synthetic_recording(&key(), 2, 0.0);
        rec.channels.retain(|c| c.role == ChannelRole::Eeg);

        let mut spec = small_spec();
        spec.roles[1] = RolePolicy::zero_fill(ChannelRole::Eog);
        let w = canonicalize_windows(&rec, &spec).unwrap();
        assert!(w[0].channel(1).iter().all(|v| *v == 0.0));

        spec.roles[1] = RolePolicy::copy_from(ChannelRole::Eog, ChannelRole::Eeg);
        let w = canonicalize_windows(&rec, &spec).unwrap();
        assert_eq!(w[1].channel(0), w[1].channel(1));
    }

    #[test]
    fn test_unlisted_channels_are_dropped() {
        let rec  = synthetic_recording(&key(), 2, 0.0);
        let mut spec = small_spec();
        spec.roles.truncate(1);
        let w = canonicalize_windows(&rec, &spec).unwrap();
        assert_eq!(w[0].shape.channels, 1);
    }

    #[test]
    fn test_label_mismatch_is_reported_at_canonicalizing() {
        let mut rec = synthetic_recording(&key(), 3, 0.0);
        rec.labels.push(SleepStage::N2);
        let err = canonicalize_windows(&rec, &small_spec()).unwrap_err();
        assert!(matches!(err, PipelineError::LabelMismatch { labels: 4, epochs: 3, .. }));
    }

    #[test]
    fn test_fractional_samples_per_window_rejected() {
        let mut spec = small_spec();
        spec.target_rate = 10.1;
        assert!(matches!(spec.samples_per_window(), Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_idempotent_store_output() {
        let dir   = tempfile::tempdir().unwrap();
        let store = CanonicalStore::new(dir.path());
        let rec   = synthetic_recording(&key(), 5, 1.5);
        let spec  = small_spec();

        let first = canonicalize(&rec, &spec, &store).unwrap();
        assert!(first.written);
        let path  = store.path_for(&rec.subject);
        let bytes = std::fs::read(&path).unwrap();

        // Same parameters → skipped, file untouched
        let second = canonicalize(&rec, &spec, &store).unwrap();
        assert!(!second.written);
        assert_eq!(std::fs::read(&path).unwrap(), bytes);

        // Forced recomputation → byte-identical
        std::fs::remove_file(&path).unwrap();
        let third = canonicalize(&rec, &spec, &store).unwrap();
        assert!(third.written);
        assert_eq!(std::fs::read(&path).unwrap(), bytes);
    }

    #[test]
    fn test_changed_spec_rewrites() {
        let dir   = tempfile::tempdir().unwrap();
        let store = CanonicalStore::new(dir.path());
        let rec   = synthetic_recording(&key(), 2, 0.0);
        canonicalize(&rec, &small_spec(), &store).unwrap();

        let mut spec = small_spec();
        spec.target_rate = 5.0;
        assert!(canonicalize(&rec, &spec, &store).unwrap().written);
    }

    #[test]
    fn test_digest_tracks_content() {
        let a = synthetic_recording(&key(), 2, 0.0);
        let mut b = a.clone();
        assert_eq!(recording_digest(&a), recording_digest(&b));
        b.channels[0].samples[3] += 1.0;
        assert_ne!(recording_digest(&a), recording_digest(&b));
    }

    #[test]
    fn test_digest_is_sha256_hex_and_covers_labels() {
        let a = synthetic_recording(&key(), 2, 0.0);
        let digest = recording_digest(&a);
        assert_eq!(digest.len(), 64);
        assert!(digest.bytes().all(|b| b.is_ascii_hexdigit()));

        let mut b = a.clone();
        b.labels.swap(0, 1);
        assert_ne!(recording_digest(&b), digest);
    }
}
