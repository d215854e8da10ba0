// ─── Shared test fixtures ─────────────────────────────────────────────────────
// Synthetic EDF files, hypnograms and canonical stores so every
// layer can be tested without the real (licensed) sleep studies.

use std::{fs, path::Path};

use crate::data::canonicalizer::{CanonicalSpec, RolePolicy};
use crate::data::store::CanonicalStore;
use crate::domain::signal::{ChannelRole, ChannelSignal, Recording, SleepStage};
use crate::domain::subject::{SourceDataset, SubjectKey};

/// One signal to write with `write_edf`.
pub struct EdfTestSignal {
    pub label:              String,
    pub samples_per_record: usize,
    pub values:             Vec<f32>,
}

impl EdfTestSignal {
    pub fn new(label: &str, samples_per_record: usize, values: Vec<f32>) -> Self {
        Self { label: label.to_string(), samples_per_record, values }
    }
}

fn field(out: &mut Vec<u8>, value: &str, width: usize) {
    let mut bytes: Vec<u8> = value.bytes().take(width).collect();
    bytes.resize(width, b' ');
    out.extend_from_slice(&bytes);
}

/// Write a minimal, valid EDF file. Values are quantised to 16 bits over
/// an integer physical range that encloses the data.
pub fn write_edf(path: &Path, record_duration: f64, signals: &[EdfTestSignal]) {
    let ns = signals.len();
    let records = signals
        .iter()
        .map(|s| s.values.len().div_ceil(s.samples_per_record))
        .max()
        .unwrap_or(0);

    let ranges: Vec<(f64, f64)> = signals
        .iter()
        .map(|s| {
            let lo = s.values.iter().cloned().fold(f32::INFINITY, f32::min);
            let hi = s.values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            if lo.is_finite() && hi.is_finite() {
                ((lo as f64).floor() - 1.0, (hi as f64).ceil() + 1.0)
            } else {
                (-1.0, 1.0)
            }
        })
        .collect();
    let (dig_min, dig_max) = (-32768i32, 32767i32);

    let mut out = Vec::new();
    field(&mut out, "0", 8);
    field(&mut out, "X X X X", 80);
    field(&mut out, "Startdate X X X X", 80);
    field(&mut out, "01.01.01", 8);
    field(&mut out, "00.00.00", 8);
    field(&mut out, &(256 + ns * 256).to_string(), 8);
    field(&mut out, "", 44);
    field(&mut out, &records.to_string(), 8);
    field(&mut out, &record_duration.to_string(), 8);
    field(&mut out, &ns.to_string(), 4);

    for s in signals { field(&mut out, &s.label, 16); }
    for _ in signals { field(&mut out, "", 80); }
    for _ in signals { field(&mut out, "uV", 8); }
    for (lo, _) in &ranges { field(&mut out, &lo.to_string(), 8); }
    for (_, hi) in &ranges { field(&mut out, &hi.to_string(), 8); }
    for _ in signals { field(&mut out, &dig_min.to_string(), 8); }
    for _ in signals { field(&mut out, &dig_max.to_string(), 8); }
    for _ in signals { field(&mut out, "", 80); }
    for s in signals { field(&mut out, &s.samples_per_record.to_string(), 8); }
    for _ in signals { field(&mut out, "", 32); }

    let dig_span = (dig_max - dig_min) as f64;
    for r in 0..records {
        for (s, (lo, hi)) in signals.iter().zip(&ranges) {
            for k in 0..s.samples_per_record {
                let v = s.values.get(r * s.samples_per_record + k).copied().unwrap_or(0.0) as f64;
                let d = ((v - lo) / (hi - lo) * dig_span + dig_min as f64).round();
                let d = d.clamp(dig_min as f64, dig_max as f64) as i16;
                out.extend_from_slice(&d.to_le_bytes());
            }
        }
    }
    fs::write(path, out).unwrap();
}

pub fn write_hypnogram(path: &Path, codes: &[u32]) {
    let text: String = codes.iter().map(|c| format!("{c}\n")).collect();
    fs::write(path, text).unwrap();
}

// ─── Canonical fixtures ───────────────────────────────────────────────────────

/// Canonical spec used across tests: 10 Hz, 3-second epochs, EEG + EOG.
/// Windows are 2 × 30 so stores stay tiny.
pub fn small_spec() -> CanonicalSpec {
    CanonicalSpec {
        target_rate:    10.0,
        epoch_duration: 3.0,
        roles: vec![
            RolePolicy::required(ChannelRole::Eeg),
            RolePolicy::required(ChannelRole::Eog),
        ],
    }
}

/// A recording whose samples encode (subject seed, epoch, channel) so
/// tests can tell windows apart. Labels cycle through the five stages.
pub fn synthetic_recording(key: &SubjectKey, epochs: usize, seed: f32) -> Recording {
    let rate = 10.0;
    let epoch_duration = 3.0;
    let per_epoch = 30;
    let make = |role: ChannelRole, offset: f32| ChannelSignal {
        role,
        label:       role.as_str().to_uppercase(),
        sample_rate: rate,
        samples:     (0..epochs * per_epoch)
            .map(|i| seed + offset + (i / per_epoch) as f32 + ((i % 7) as f32) * 0.1)
            .collect(),
    };
    Recording {
        subject:  key.clone(),
        channels: vec![make(ChannelRole::Eeg, 0.0), make(ChannelRole::Eog, 100.0)],
        epoch_duration,
        labels:   (0..epochs)
            .map(|e| SleepStage::ALL[e % SleepStage::COUNT])
            .collect(),
    }
}

/// Canonicalize `subjects` synthetic recordings per source into `root`.
pub fn populate_store(root: &Path, sources: &[(SourceDataset, usize)], epochs: usize) -> CanonicalStore {
    let store = CanonicalStore::new(root);
    let spec  = small_spec();
    for (source, count) in sources {
        for i in 0..*count {
            let key = SubjectKey::new(*source, format!("s{i:02}"));
            let rec = synthetic_recording(&key, epochs, i as f32);
            crate::data::canonicalizer::canonicalize(&rec, &spec, &store).unwrap();
        }
    }
    store
}
