// ============================================================
// Layer 4 — EDF / EDF+ Signal File Parser
// ============================================================
// Every supported polysomnography source ships its signals as
// European Data Format files:
//
//   [ 256-byte fixed header ]
//   [ ns × 256-byte signal header block ]
//   [ data record 0 ][ data record 1 ] ... [ data record N-1 ]
//
// All header fields are left-aligned, space-padded ASCII.
// Each data record holds, signal after signal, that signal's
// `samples_per_record` little-endian i16 digital values.
// Digital values map to physical units linearly:
//
//   physical = (digital - dig_min) * (phys_max - phys_min)
//              / (dig_max - dig_min) + phys_min
//
// Only the signals a caller asks for are decoded, in one
// sequential pass over the records.
//
// Reference: Kemp et al. (1992) "A simple format for exchange of
//            digitized polygraphic recordings"
//            Rust Book §9 (Error Handling)

use std::{
    fs::File,
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

const FIXED_HEADER_LEN: usize = 256;
const SIGNAL_HEADER_LEN: usize = 256;

#[derive(Error, Debug)]
pub enum EdfError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed header field '{field}': {value:?}")]
    Field { field: &'static str, value: String },

    #[error("file ends inside data record {record} (expected {expected} records)")]
    Truncated { record: usize, expected: usize },

    #[error("signal index {0} out of range")]
    NoSuchSignal(usize),
}

/// Per-signal header block.
#[derive(Debug, Clone, PartialEq)]
pub struct EdfSignalHeader {
    pub label:              String,
    pub physical_dimension: String,
    pub physical_min:       f64,
    pub physical_max:       f64,
    pub digital_min:        i32,
    pub digital_max:        i32,
    pub samples_per_record: usize,
}

impl EdfSignalHeader {
    /// Native sampling rate in Hz.
    pub fn sample_rate(&self, record_duration: f64) -> f64 {
        if record_duration > 0.0 {
            self.samples_per_record as f64 / record_duration
        } else {
            0.0
        }
    }

    fn to_physical(&self, digital: i16) -> f32 {
        let dig_span = (self.digital_max - self.digital_min) as f64;
        if dig_span == 0.0 {
            return digital as f32;
        }
        let gain = (self.physical_max - self.physical_min) / dig_span;
        ((digital as f64 - self.digital_min as f64) * gain + self.physical_min) as f32
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdfHeader {
    pub header_bytes:    usize,
    pub data_records:    usize,
    /// Seconds covered by one data record
    pub record_duration: f64,
    pub signals:         Vec<EdfSignalHeader>,
}

impl EdfHeader {
    /// Bytes occupied by one data record.
    pub fn record_bytes(&self) -> usize {
        self.signals.iter().map(|s| s.samples_per_record * 2).sum()
    }
}

/// An opened EDF file; the header is parsed eagerly, samples lazily.
#[derive(Debug)]
pub struct EdfReader {
    path:   PathBuf,
    header: EdfHeader,
}

impl EdfReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EdfError> {
        let path = path.as_ref().to_path_buf();
        let file_len = std::fs::metadata(&path)?.len() as usize;
        let mut reader = BufReader::new(File::open(&path)?);

        let mut fixed = [0u8; FIXED_HEADER_LEN];
        reader.read_exact(&mut fixed)?;

        let header_bytes: usize = parse_field(&fixed[184..192], "header bytes")?;
        let raw_records:    i64 = parse_field(&fixed[236..244], "number of data records")?;
        let record_duration: f64 = parse_field(&fixed[244..252], "record duration")?;
        let ns:            usize = parse_field(&fixed[252..256], "number of signals")?;

        let expected_header = ns
            .checked_mul(SIGNAL_HEADER_LEN)
            .and_then(|b| b.checked_add(FIXED_HEADER_LEN));
        if expected_header != Some(header_bytes) || header_bytes > file_len {
            return Err(EdfError::Field {
                field: "header bytes",
                value: header_bytes.to_string(),
            });
        }

        let mut block = vec![0u8; ns * SIGNAL_HEADER_LEN];
        reader.read_exact(&mut block)?;

        // Signal header fields are stored column-wise: all labels, then all
        // transducers, and so on.
        let column = |offset: usize, width: usize, i: usize| -> &[u8] {
            let start = offset * ns + i * width;
            &block[start..start + width]
        };

        let mut signals = Vec::with_capacity(ns);
        for i in 0..ns {
            signals.push(EdfSignalHeader {
                label:              ascii(column(0, 16, i)),
                physical_dimension: ascii(column(96, 8, i)),
                physical_min:       parse_field(column(104, 8, i), "physical minimum")?,
                physical_max:       parse_field(column(112, 8, i), "physical maximum")?,
                digital_min:        parse_field(column(120, 8, i), "digital minimum")?,
                digital_max:        parse_field(column(128, 8, i), "digital maximum")?,
                samples_per_record: parse_field(column(216, 8, i), "samples per record")?,
            });
        }

        // Every size below comes from untrusted text, so it is checked
        // against the bytes actually present before anything is allocated.
        let record_bytes = signals
            .iter()
            .try_fold(0usize, |acc, s| s.samples_per_record.checked_mul(2).and_then(|b| acc.checked_add(b)))
            .ok_or_else(|| EdfError::Field { field: "samples per record", value: "overflow".into() })?;
        let available = file_len - header_bytes;

        // -1 means "unknown" (recording was still running); derive from size.
        let data_records = if raw_records >= 0 {
            let declared = usize::try_from(raw_records).map_err(|_| EdfError::Field {
                field: "number of data records",
                value: raw_records.to_string(),
            })?;
            let needed = declared.checked_mul(record_bytes).ok_or_else(|| EdfError::Field {
                field: "number of data records",
                value: raw_records.to_string(),
            })?;
            if record_bytes == 0 && declared > 0 {
                return Err(EdfError::Field { field: "samples per record", value: "0".into() });
            }
            if needed > available {
                return Err(EdfError::Truncated {
                    record:   available.checked_div(record_bytes).unwrap_or(0),
                    expected: declared,
                });
            }
            declared
        } else if record_bytes > 0 {
            available / record_bytes
        } else {
            0
        };

        let header = EdfHeader { header_bytes, data_records, record_duration, signals };

        tracing::debug!(
            "EDF '{}': {} signals, {} records of {}s",
            path.display(),
            ns,
            header.data_records,
            header.record_duration
        );

        Ok(Self { path, header })
    }

    pub fn header(&self) -> &EdfHeader {
        &self.header
    }

    pub fn labels(&self) -> Vec<String> {
        self.header.signals.iter().map(|s| s.label.clone()).collect()
    }

    /// First signal whose label matches one of `names`, tried in order.
    /// Matching ignores case and whitespace (`"EEG Fpz-Cz"` == `"eeg fpz-cz "`).
    pub fn find_signal(&self, names: &[&str]) -> Option<usize> {
        names.iter().find_map(|name| {
            let wanted = normalise_label(name);
            self.header
                .signals
                .iter()
                .position(|s| normalise_label(&s.label) == wanted)
        })
    }

    /// Decode the requested signals to physical units, one Vec per index.
    pub fn read_signals(&self, indices: &[usize]) -> Result<Vec<Vec<f32>>, EdfError> {
        let signals = &self.header.signals;
        if let Some(&bad) = indices.iter().find(|&&i| i >= signals.len()) {
            return Err(EdfError::NoSuchSignal(bad));
        }

        // Byte offset of each signal inside one record
        let mut offsets = Vec::with_capacity(signals.len());
        let mut acc = 0usize;
        for s in signals {
            offsets.push(acc);
            acc += s.samples_per_record * 2;
        }
        let record_bytes = acc;

        let mut out: Vec<Vec<f32>> = indices
            .iter()
            .map(|&i| Vec::with_capacity(signals[i].samples_per_record * self.header.data_records))
            .collect();

        let mut reader = BufReader::new(File::open(&self.path)?);
        let mut skip = vec![0u8; self.header.header_bytes];
        reader.read_exact(&mut skip)?;

        let mut record = vec![0u8; record_bytes];
        for r in 0..self.header.data_records {
            if let Err(e) = reader.read_exact(&mut record) {
                return Err(match e.kind() {
                    io::ErrorKind::UnexpectedEof => EdfError::Truncated {
                        record:   r,
                        expected: self.header.data_records,
                    },
                    _ => EdfError::Io(e),
                });
            }
            for (slot, &i) in indices.iter().enumerate() {
                let sig = &signals[i];
                let bytes = &record[offsets[i]..offsets[i] + sig.samples_per_record * 2];
                out[slot].extend(
                    bytes
                        .chunks_exact(2)
                        .map(|b| sig.to_physical(i16::from_le_bytes([b[0], b[1]]))),
                );
            }
        }

        Ok(out)
    }
}

fn ascii(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

fn normalise_label(label: &str) -> String {
    label
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

fn parse_field<T: FromStr>(bytes: &[u8], field: &'static str) -> Result<T, EdfError> {
    let value = ascii(bytes);
    value
        .parse::<T>()
        .map_err(|_| EdfError::Field { field, value })
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{write_edf, EdfTestSignal};

    #[test]
    fn test_reads_header_and_signals() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.edf");
        let eeg: Vec<f32> = (0..400).map(|i| (i % 50) as f32 - 25.0).collect();
        let emg: Vec<f32> = (0..200).map(|i| i as f32 * 0.5).collect();
        write_edf(
            &path,
            1.0,
            &[
                EdfTestSignal::new("C3-M2", 100, eeg.clone()),
                EdfTestSignal::new("EMG Chin", 50, emg.clone()),
            ],
        );

        let edf = EdfReader::open(&path).unwrap();
        assert_eq!(edf.header().data_records, 4);
        assert_eq!(edf.header().signals.len(), 2);
        assert_eq!(edf.header().signals[0].sample_rate(1.0), 100.0);
        assert_eq!(edf.labels(), vec!["C3-M2".to_string(), "EMG Chin".to_string()]);

        let read = edf.read_signals(&[1, 0]).unwrap();
        assert_eq!(read[0].len(), 200);
        assert_eq!(read[1].len(), 400);
        for (a, b) in read[1].iter().zip(&eeg) {
            assert!((a - b).abs() < 0.05, "{a} vs {b}");
        }
    }

    #[test]
    fn test_find_signal_ignores_case_and_spaces() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.edf");
        write_edf(&path, 1.0, &[EdfTestSignal::new("EEG Fpz-Cz", 10, vec![0.0; 10])]);
        let edf = EdfReader::open(&path).unwrap();
        assert_eq!(edf.find_signal(&["C4-A1", "eeg fpz-cz"]), Some(0));
        assert_eq!(edf.find_signal(&["C4-A1"]), None);
    }

    #[test]
    fn test_truncated_file_is_reported() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.edf");
        write_edf(&path, 1.0, &[EdfTestSignal::new("EEG", 100, vec![1.0; 300])]);
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 50]).unwrap();

        // 3 records of 200 bytes declared, 550 bytes present
        assert!(matches!(
            EdfReader::open(&path),
            Err(EdfError::Truncated { record: 2, expected: 3 })
        ));
    }

    /// Overwrite a fixed-width ASCII header field in place.
    fn patch_field(path: &Path, offset: usize, width: usize, value: &str) {
        let mut bytes = std::fs::read(path).unwrap();
        let padded = format!("{value:<width$}");
        bytes[offset..offset + width].copy_from_slice(padded.as_bytes());
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_oversized_header_counts_are_rejected() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.edf");
        write_edf(&path, 1.0, &[EdfTestSignal::new("EEG", 100, vec![1.0; 300])]);

        // Huge record count: more records than the file holds
        patch_field(&path, 236, 8, "99999999");
        assert!(matches!(
            EdfReader::open(&path),
            Err(EdfError::Truncated { record: 3, expected: 99_999_999 })
        ));

        // Huge record count and samples per record (signal block at 256,
        // samples-per-record column at 216 for a single signal)
        patch_field(&path, 256 + 216, 8, "99999999");
        assert!(EdfReader::open(&path).is_err());

        // Header length that does not match the signal count
        write_edf(&path, 1.0, &[EdfTestSignal::new("EEG", 100, vec![1.0; 300])]);
        patch_field(&path, 184, 8, "99999999");
        assert!(matches!(
            EdfReader::open(&path),
            Err(EdfError::Field { field: "header bytes", .. })
        ));
    }

    #[test]
    fn test_unknown_record_count_uses_file_size() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.edf");
        write_edf(&path, 1.0, &[EdfTestSignal::new("EEG", 100, vec![1.0; 300])]);
        patch_field(&path, 236, 8, "-1");

        let edf = EdfReader::open(&path).unwrap();
        assert_eq!(edf.header().data_records, 3);
        assert_eq!(edf.read_signals(&[0]).unwrap()[0].len(), 300);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let dir  = tempfile::tempdir().unwrap();
        let path = dir.path().join("rec.edf");
        std::fs::write(&path, vec![b'x'; 600]).unwrap();
        assert!(EdfReader::open(&path).is_err());
    }
}
