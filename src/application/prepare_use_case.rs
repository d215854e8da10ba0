// ============================================================
// Layer 2 — PrepareUseCase
// ============================================================
// Turns raw recordings into the canonical store:
//
//   Step 1: Discover <subject>.edf + <subject>.txt pairs   (Layer 4 - data)
//           under <raw_dir>/<source>/ for every dataset
//   Step 2: Parse each with its source schema              (Layer 4 - data)
//   Step 3: Canonicalize and persist, subjects in parallel (Layer 4 - data)
//
// Subjects are independent, so rayon fans them out over all
// cores; the store serialises writers per subject. The first
// failing subject aborts the run with its stage and key.
//
// Reference: rayon documentation (parallel iterators)

use anyhow::{Context, Result};
use rayon::prelude::*;
use std::path::Path;

use crate::application::config::ExperimentConfig;
use crate::data::{
    canonicalizer::{canonicalize, CanonicalSpec},
    reader::discover_recordings,
    store::{CanonicalStore, StoreOutcome},
};
use crate::domain::{
    error::PipelineResult,
    signal::RecordingLocator,
    traits::SignalSource,
};

/// Summary of one prepare run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrepareReport {
    pub subjects: usize,
    /// Subjects whose canonical file was (re)written
    pub written:  usize,
    pub windows:  usize,
}

/// Parse and canonicalize one recording with its declared schema.
pub fn canonicalize_locator(
    locator: &RecordingLocator,
    spec:    &CanonicalSpec,
    store:   &CanonicalStore,
) -> PipelineResult<StoreOutcome> {
    let recording = locator.source.parse(locator)?;
    canonicalize(&recording, spec, store)
}

pub fn run_prepare(config: &ExperimentConfig, raw_dir: &Path) -> Result<PrepareReport> {
    config.validate()?;
    let spec  = config.canonical_spec();
    let store = CanonicalStore::new(&config.store_path);

    // ── Step 1: Discover recordings per source ───────────────────────────────
    let mut locators = Vec::new();
    for source in &config.datasets {
        let dir = raw_dir.join(source.as_str());
        let found = discover_recordings(*source, &dir)
            .with_context(|| format!("Cannot list raw recordings for '{source}'"))?;
        locators.extend(found);
    }
    tracing::info!(
        "Canonicalizing {} recordings at {} Hz, {} s windows into '{}'",
        locators.len(),
        spec.target_rate,
        spec.epoch_duration,
        store.root().display()
    );

    // ── Steps 2-3: Parse + canonicalize in parallel ──────────────────────────
    let outcomes: Vec<StoreOutcome> = locators
        .par_iter()
        .map(|loc| canonicalize_locator(loc, &spec, &store))
        .collect::<PipelineResult<_>>()?;

    let report = PrepareReport {
        subjects: outcomes.len(),
        written:  outcomes.iter().filter(|o| o.written).count(),
        windows:  outcomes.iter().map(|o| o.windows).sum(),
    };
    tracing::info!(
        "Prepared {} subjects ({} written, {} up to date), {} windows",
        report.subjects,
        report.written,
        report.subjects - report.written,
        report.windows
    );
    Ok(report)
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::canonicalizer::RolePolicy;
    use crate::data::reader::locator_for;
    use crate::domain::error::PipelineError;
    use crate::domain::signal::ChannelRole;
    use crate::domain::subject::{SourceDataset, SubjectKey};
    use crate::testutil::{write_edf, write_hypnogram, EdfTestSignal};

    /// HMC-style recording: 100 Hz EEG + EOG, 1 s records, `epochs` × 30 s.
    fn hmc_subject(dir: &Path, subject: &str, epochs: usize) {
        let loc = locator_for(&SubjectKey::new(SourceDataset::Hmc, subject), dir);
        let n   = epochs * 3000;
        let eeg: Vec<f32> = (0..n).map(|i| ((i % 50) as f32) - 25.0).collect();
        let eog: Vec<f32> = (0..n).map(|i| ((i % 20) as f32) * 2.0).collect();
        write_edf(
            &loc.signal_path,
            1.0,
            &[EdfTestSignal::new("EEG C4-M1", 100, eeg), EdfTestSignal::new("EOG E1-M2", 100, eog)],
        );
        let codes: Vec<u32> = (0..epochs as u32).map(|e| e % 5).collect();
        write_hypnogram(&loc.labels_path, &codes);
    }

    fn config(root: &Path) -> ExperimentConfig {
        ExperimentConfig {
            datasets:    vec![SourceDataset::Hmc],
            store_path:  root.join("store"),
            target_rate: 10.0,
            channels:    vec![RolePolicy::required(ChannelRole::Eeg), RolePolicy::required(ChannelRole::Eog)],
            ..Default::default()
        }
    }

    #[test]
    fn test_prepare_writes_then_skips() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        std::fs::create_dir_all(raw.join("hmc")).unwrap();
        hmc_subject(&raw.join("hmc"), "SN001", 3);
        hmc_subject(&raw.join("hmc"), "SN002", 4);

        let cfg   = config(dir.path());
        let first = run_prepare(&cfg, &raw).unwrap();
        assert_eq!(first, PrepareReport { subjects: 2, written: 2, windows: 7 });

        let again = run_prepare(&cfg, &raw).unwrap();
        assert_eq!(again.written, 0);
        assert_eq!(again.windows, 7);

        let store  = CanonicalStore::new(&cfg.store_path);
        let reader = store.open(&SubjectKey::new(SourceDataset::Hmc, "SN002")).unwrap();
        assert_eq!(reader.window_count(), 4);
        assert_eq!(reader.header.shape().samples, 300);
    }

    #[test]
    fn test_prepare_aborts_on_bad_subject() {
        let dir = tempfile::tempdir().unwrap();
        let hmc = dir.path().join("raw").join("hmc");
        std::fs::create_dir_all(&hmc).unwrap();
        hmc_subject(&hmc, "SN001", 2);
        // EEG present, EOG missing while required
        let loc = locator_for(&SubjectKey::new(SourceDataset::Hmc, "SN009"), &hmc);
        write_edf(&loc.signal_path, 1.0, &[EdfTestSignal::new("EEG C4-M1", 100, vec![0.0; 6000])]);
        write_hypnogram(&loc.labels_path, &[0, 1]);

        let err = run_prepare(&config(dir.path()), &dir.path().join("raw")).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::ChannelMissing { subject, role, .. }) => {
                assert_eq!(subject.subject, "SN009");
                assert_eq!(*role, ChannelRole::Eog);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
