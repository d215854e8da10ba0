// ============================================================
// Layer 4 — Canonical Store
// ============================================================
// One self-describing file per (source, subject):
//
//   <root>/<source>/<subject>.pxw
//
//   ┌──────────┬──────────┬────────────┬──────────────────────┐
//   │ "SLPW"   │ version  │ header_len │ header (JSON)        │
//   │ 4 bytes  │ u32 LE   │ u32 LE     │ header_len bytes     │
//   ├──────────┴──────────┴────────────┴──────────────────────┤
//   │ record 0: label u8 │ C × S f32 LE (channel-major)       │
//   │ record 1: ...                                          │
//   └────────────────────────────────────────────────────────┘
//
// Every record has the same size, so window i lives at
//   data_start + i × (1 + 4·C·S)
// and can be read without touching the rest of the file.
//
// Writes go to a temporary sibling and are renamed into place,
// under a per-subject lock, so a reader never sees a partial
// file and two writers never race on one subject.
//
// Reference: Rust Book §16 (Shared-State Concurrency)

use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs::{self, File},
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::data::canonicalizer::CanonicalSpec;
use crate::domain::error::{PipelineError, PipelineResult, Stage};
use crate::domain::signal::{ChannelRole, SleepStage};
use crate::domain::subject::{SourceDataset, SubjectKey};
use crate::domain::window::{CanonicalWindow, WindowShape};

const MAGIC: &[u8; 4] = b"SLPW";
const VERSION: u32 = 1;
const PREAMBLE_LEN: u64 = 12;
pub const EXTENSION: &str = "pxw";

/// Self-describing header of one subject file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreHeader {
    pub subject:          SubjectKey,
    pub spec:             CanonicalSpec,
    pub channels:         usize,
    pub samples:          usize,
    pub window_count:     usize,
    /// Digest of the recording this file was produced from
    pub recording_digest: String,
}

impl StoreHeader {
    pub fn shape(&self) -> WindowShape {
        WindowShape::new(self.channels, self.samples)
    }

    pub fn roles(&self) -> Vec<ChannelRole> {
        self.spec.role_list()
    }

    /// Bytes per window record.
    pub fn record_len(&self) -> u64 {
        1 + 4 * self.shape().len() as u64
    }
}

/// Result of a `persist` call.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreOutcome {
    pub subject: SubjectKey,
    pub windows: usize,
    /// False when an up-to-date file was already present
    pub written: bool,
}

// ─── CanonicalStore ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CanonicalStore {
    root:  PathBuf,
    /// At most one writer per subject key
    locks: Arc<Mutex<HashMap<SubjectKey, Arc<Mutex<()>>>>>,
}

impl CanonicalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), locks: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &SubjectKey) -> PathBuf {
        self.root
            .join(key.source.as_str())
            .join(format!("{}.{}", key.subject, EXTENSION))
    }

    fn subject_lock(&self, key: &SubjectKey) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(key.clone()).or_default().clone()
    }

    /// Drop the map entry once no other writer holds or waits on it.
    /// Handles are only cloned under the map mutex, so the count is
    /// stable while it is held.
    fn release_lock(&self, key: &SubjectKey, lock: Arc<Mutex<()>>) {
        let mut map = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if Arc::strong_count(&lock) <= 2 {
            map.remove(key);
        }
    }

    /// Write `produce()`'s windows for `key` unless the stored file already
    /// matches `spec` and `digest`.
    pub fn persist<F>(&self, key: &SubjectKey, spec: &CanonicalSpec, digest: &str, produce: F) -> PipelineResult<StoreOutcome>
    where
        F: FnOnce() -> PipelineResult<Vec<CanonicalWindow>>,
    {
        let lock    = self.subject_lock(key);
        let outcome = {
            let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
            self.persist_locked(key, spec, digest, produce)
        };
        self.release_lock(key, lock);
        outcome
    }

    fn persist_locked<F>(&self, key: &SubjectKey, spec: &CanonicalSpec, digest: &str, produce: F) -> PipelineResult<StoreOutcome>
    where
        F: FnOnce() -> PipelineResult<Vec<CanonicalWindow>>,
    {
        let path = self.path_for(key);
        if path.exists() {
            match StoreReader::open(key.clone(), &path) {
                Ok(r) if r.header.spec == *spec && r.header.recording_digest == digest => {
                    tracing::debug!("{}: canonical file up to date, skipping", key);
                    return Ok(StoreOutcome { subject: key.clone(), windows: r.header.window_count, written: false });
                }
                Ok(_)  => tracing::debug!("{}: parameters changed, rewriting", key),
                Err(e) => tracing::warn!("{}: replacing unreadable canonical file ({})", key, e),
            }
        }

        let windows = produce()?;
        let shape   = spec.shape()?;
        if let Some(bad) = windows.iter().find(|w| w.shape != shape || !w.is_consistent()) {
            return Err(PipelineError::ShapeMismatch {
                stage:    Stage::Canonicalizing,
                subject:  key.clone(),
                expected: shape,
                found:    bad.shape,
            });
        }

        let header = StoreHeader {
            subject:          key.clone(),
            spec:             spec.clone(),
            channels:         shape.channels,
            samples:          shape.samples,
            window_count:     windows.len(),
            recording_digest: digest.to_string(),
        };
        write_file(&path, &header, &windows)?;

        tracing::debug!("{}: wrote {} windows to '{}'", key, windows.len(), path.display());
        Ok(StoreOutcome { subject: key.clone(), windows: windows.len(), written: true })
    }

    pub fn open(&self, key: &SubjectKey) -> PipelineResult<StoreReader> {
        StoreReader::open(key.clone(), &self.path_for(key))
    }

    /// Every stored subject of the given sources, sorted by key.
    pub fn list(&self, sources: &[SourceDataset]) -> PipelineResult<Vec<SubjectKey>> {
        let mut keys = Vec::new();
        for source in sources {
            let dir = self.root.join(source.as_str());
            if !dir.is_dir() {
                tracing::warn!("No canonical data for '{}' under '{}'", source, self.root.display());
                continue;
            }
            let entries = fs::read_dir(&dir).map_err(|e| PipelineError::io(Stage::Indexing, &dir, e))?;
            for entry in entries {
                let path = entry.map_err(|e| PipelineError::io(Stage::Indexing, &dir, e))?.path();
                if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    keys.push(SubjectKey::new(*source, stem));
                }
            }
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

fn write_file(path: &Path, header: &StoreHeader, windows: &[CanonicalWindow]) -> PipelineResult<()> {
    let io_err = |p: &Path, e| PipelineError::io(Stage::Canonicalizing, p, e);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let tmp = path.with_extension(format!("{EXTENSION}.tmp"));

    let json = serde_json::to_vec(header).map_err(|e| PipelineError::StoreFormat {
        stage:   Stage::Canonicalizing,
        subject: header.subject.clone(),
        path:    path.to_path_buf(),
        reason:  e.to_string(),
    })?;

    let file = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
    let mut out = BufWriter::new(file);
    let mut write = |bytes: &[u8]| out.write_all(bytes).map_err(|e| io_err(&tmp, e));

    write(MAGIC)?;
    write(&VERSION.to_le_bytes())?;
    write(&(json.len() as u32).to_le_bytes())?;
    write(&json)?;
    for w in windows {
        write(&[w.label.index() as u8])?;
        for v in &w.samples {
            write(&v.to_le_bytes())?;
        }
    }

    let file = out.into_inner().map_err(|e| io_err(&tmp, e.into_error()))?;
    file.sync_all().map_err(|e| io_err(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| io_err(path, e))
}

// ─── StoreReader ──────────────────────────────────────────────────────────────

/// Validated view of one subject file. Holds no open handle; each read
/// opens, seeks and reads only the requested records.
#[derive(Debug, Clone)]
pub struct StoreReader {
    pub key:    SubjectKey,
    pub path:   PathBuf,
    pub header: StoreHeader,
    data_start: u64,
}

impl StoreReader {
    pub fn open(key: SubjectKey, path: &Path) -> PipelineResult<Self> {
        let corrupt = |reason: String| PipelineError::StoreFormat {
            stage:   Stage::Indexing,
            subject: key.clone(),
            path:    path.to_path_buf(),
            reason,
        };

        let file = File::open(path).map_err(|e| PipelineError::io(Stage::Indexing, path, e))?;
        let file_len = file
            .metadata()
            .map_err(|e| PipelineError::io(Stage::Indexing, path, e))?
            .len();
        let mut reader = BufReader::new(file);

        let mut preamble = [0u8; PREAMBLE_LEN as usize];
        reader
            .read_exact(&mut preamble)
            .map_err(|_| corrupt("file shorter than preamble".into()))?;
        if &preamble[0..4] != MAGIC {
            return Err(corrupt("bad magic".into()));
        }
        let version = u32::from_le_bytes([preamble[4], preamble[5], preamble[6], preamble[7]]);
        if version != VERSION {
            return Err(corrupt(format!("unsupported version {version}")));
        }
        let header_len = u32::from_le_bytes([preamble[8], preamble[9], preamble[10], preamble[11]]) as u64;
        if PREAMBLE_LEN + header_len > file_len {
            return Err(corrupt("header runs past end of file".into()));
        }

        let mut json = vec![0u8; header_len as usize];
        reader
            .read_exact(&mut json)
            .map_err(|e| corrupt(format!("reading header: {e}")))?;
        let header: StoreHeader =
            serde_json::from_slice(&json).map_err(|e| corrupt(format!("header: {e}")))?;

        if header.subject != key {
            return Err(corrupt(format!("file belongs to {}", header.subject)));
        }
        let data_start = PREAMBLE_LEN + header_len;
        let expected   = data_start + header.window_count as u64 * header.record_len();
        if file_len != expected {
            return Err(corrupt(format!(
                "{} bytes on disk, header describes {} ({} windows of {})",
                file_len,
                expected,
                header.window_count,
                header.shape()
            )));
        }

        Ok(Self { key, path: path.to_path_buf(), header, data_start })
    }

    pub fn window_count(&self) -> usize {
        self.header.window_count
    }

    pub fn read_window(&self, index: usize) -> PipelineResult<CanonicalWindow> {
        let mut out = self.read_windows(index, 1)?;
        out.pop().ok_or_else(|| self.corrupt(Stage::Loading, format!("window {index} missing")))
    }

    /// Read `count` consecutive windows starting at `start`.
    pub fn read_windows(&self, start: usize, count: usize) -> PipelineResult<Vec<CanonicalWindow>> {
        if start + count > self.header.window_count {
            return Err(self.corrupt(
                Stage::Loading,
                format!("windows {}..{} requested, {} stored", start, start + count, self.header.window_count),
            ));
        }
        let io_err = |e| PipelineError::io(Stage::Loading, &self.path, e);

        let record_len = self.header.record_len() as usize;
        let mut file = File::open(&self.path).map_err(io_err)?;
        file.seek(SeekFrom::Start(self.data_start + (start * record_len) as u64))
            .map_err(io_err)?;
        let mut buf = vec![0u8; count * record_len];
        file.read_exact(&mut buf).map_err(io_err)?;

        let shape = self.header.shape();
        buf.chunks_exact(record_len)
            .enumerate()
            .map(|(k, rec)| {
                let label = SleepStage::from_index(rec[0] as usize).ok_or_else(|| {
                    self.corrupt(Stage::Loading, format!("invalid label byte {} in window {}", rec[0], start + k))
                })?;
                let samples = rec[1..]
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect();
                Ok(CanonicalWindow { subject: self.key.clone(), index: start + k, shape, samples, label })
            })
            .collect()
    }

    fn corrupt(&self, stage: Stage, reason: String) -> PipelineError {
        PipelineError::StoreFormat { stage, subject: self.key.clone(), path: self.path.clone(), reason }
    }
}
