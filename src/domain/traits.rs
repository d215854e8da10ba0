// ============================================================
// Layer 3 — Core Traits (Abstractions)
// ============================================================
// Programming against traits lets the rest of the pipeline stay
// ignorant of which study a recording came from or where an
// artefact is stored:
//   - every SourceDataset implements SignalSource
//   - the application layer only sees SignalSource::parse
//     and never branches on source identity
//
// Reference: Rust Book §10 (Traits: Defining Shared Behaviour)
//            Rust Book §17 (Object Oriented Patterns)

use anyhow::Result;
use std::path::Path;

use crate::domain::error::PipelineResult;
use crate::domain::signal::{Recording, RecordingLocator};

// ─── SignalSource ─────────────────────────────────────────────────────────────
/// Anything that can turn a recording locator into a uniform Recording.
///
/// Implementations:
///   - SourceDataset → one schema per public sleep study
pub trait SignalSource {
    /// Parse one subject's raw files. Pure: no side effects besides reading.
    fn parse(&self, locator: &RecordingLocator) -> PipelineResult<Recording>;
}

// ─── Persistable ──────────────────────────────────────────────────────────────
/// Any small artefact whose state can be saved and restored from disk.
///
/// Implementations:
///   - ExperimentConfig  → experiment options as JSON
///   - ChannelNormalizer → frozen training-fold statistics
pub trait Persistable: Sized {
    /// Save this component's state to the given path
    fn save(&self, path: &Path) -> Result<()>;

    /// Load a component's state from the given path.
    fn load(path: &Path) -> Result<Self>;
}
