// ============================================================
// Layer 3 — Source Datasets and Subject Identity
// ============================================================
// Every recording belongs to exactly one source study and one
// subject inside it. The pair is the key used by the canonical
// store, the dataset index and the fold assignment.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// The public sleep studies the readers understand.
///
/// Each variant selects a fixed `SourceSchema` (channel aliases,
/// label codes) in the data layer. Sources are always picked by this
/// explicit identifier, never by inspecting files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceDataset {
    SleepEdf,
    Shhs,
    Mass,
    Dcsm,
    Hmc,
    Isruc,
    Svuh,
}

impl SourceDataset {
    pub const ALL: [SourceDataset; 7] = [
        SourceDataset::SleepEdf,
        SourceDataset::Shhs,
        SourceDataset::Mass,
        SourceDataset::Dcsm,
        SourceDataset::Hmc,
        SourceDataset::Isruc,
        SourceDataset::Svuh,
    ];

    /// Stable lowercase identifier, also the store sub-directory name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceDataset::SleepEdf => "sleep-edf",
            SourceDataset::Shhs     => "shhs",
            SourceDataset::Mass     => "mass",
            SourceDataset::Dcsm     => "dcsm",
            SourceDataset::Hmc      => "hmc",
            SourceDataset::Isruc    => "isruc",
            SourceDataset::Svuh     => "svuh",
        }
    }

    /// Index used to give each source its own random stream when splitting.
    pub fn stream_id(&self) -> u64 {
        Self::ALL.iter().position(|s| s == self).unwrap_or(0) as u64
    }
}

impl fmt::Display for SourceDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceDataset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == wanted || d.as_str().replace('-', "") == wanted)
            .ok_or_else(|| format!("unknown dataset '{s}'"))
    }
}

/// (source, subject) — the identity of one recording everywhere in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectKey {
    pub source:  SourceDataset,
    pub subject: String,
}

impl SubjectKey {
    pub fn new(source: SourceDataset, subject: impl Into<String>) -> Self {
        Self { source, subject: subject.into() }
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.subject)
    }
}
