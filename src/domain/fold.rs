// ============================================================
// Layer 3 — Folds and Subject Fold Assignment
// ============================================================
// Folds are assigned per SUBJECT, never per window: a subject's
// windows all land in exactly one of train / validation / test.
// The assignment records the seed and ratios that produced it so
// checkpoints can prove they continue the same experiment.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::domain::subject::SubjectKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fold {
    Train,
    Validation,
    Test,
}

impl Fold {
    pub const ALL: [Fold; 3] = [Fold::Train, Fold::Validation, Fold::Test];

    pub fn slot(self) -> usize {
        match self {
            Fold::Train      => 0,
            Fold::Validation => 1,
            Fold::Test       => 2,
        }
    }
}

impl fmt::Display for Fold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Fold::Train      => "train",
            Fold::Validation => "validation",
            Fold::Test       => "test",
        })
    }
}

impl FromStr for Fold {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "train"               => Ok(Fold::Train),
            "val" | "validation"  => Ok(Fold::Validation),
            "test"                => Ok(Fold::Test),
            other => Err(format!("unknown fold '{other}'")),
        }
    }
}

// ─── FoldRatios ───────────────────────────────────────────────────────────────
/// Relative weights of the three folds. They need not sum to one:
/// `{1, 1, 0}` and `{0.5, 0.5, 0.0}` describe the same split.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FoldRatios {
    pub train:      f64,
    pub validation: f64,
    pub test:       f64,
}

impl FoldRatios {
    pub fn new(train: f64, validation: f64, test: f64) -> Self {
        Self { train, validation, test }
    }

    pub fn weight(&self, fold: Fold) -> f64 {
        match fold {
            Fold::Train      => self.train,
            Fold::Validation => self.validation,
            Fold::Test       => self.test,
        }
    }

    pub fn total(&self) -> f64 {
        self.train + self.validation + self.test
    }

    pub fn is_valid(&self) -> bool {
        let parts = [self.train, self.validation, self.test];
        parts.iter().all(|w| w.is_finite() && *w >= 0.0) && self.total() > 0.0
    }
}

impl Default for FoldRatios {
    /// 70 / 15 / 15.
    fn default() -> Self {
        Self::new(0.7, 0.15, 0.15)
    }
}

// ─── FoldAssignment ───────────────────────────────────────────────────────────
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectFold {
    pub subject: SubjectKey,
    pub fold:    Fold,
}

/// Immutable subject → fold mapping for one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldAssignment {
    pub seed:    u64,
    pub ratios:  FoldRatios,
    /// Sorted by subject key
    entries:     Vec<SubjectFold>,
}

impl FoldAssignment {
    /// Build from unordered pairs. A subject listed twice keeps its
    /// first fold so the mapping stays a function.
    pub fn new(seed: u64, ratios: FoldRatios, pairs: impl IntoIterator<Item = (SubjectKey, Fold)>) -> Self {
        let mut entries: Vec<SubjectFold> = pairs
            .into_iter()
            .map(|(subject, fold)| SubjectFold { subject, fold })
            .collect();
        entries.sort_by(|a, b| a.subject.cmp(&b.subject));
        entries.dedup_by(|later, first| later.subject == first.subject);
        Self { seed, ratios, entries }
    }

    pub fn fold_of(&self, subject: &SubjectKey) -> Option<Fold> {
        self.entries
            .binary_search_by(|e| e.subject.cmp(subject))
            .ok()
            .map(|i| self.entries[i].fold)
    }

    /// Subjects of one fold, in key order.
    pub fn subjects(&self, fold: Fold) -> impl Iterator<Item = &SubjectKey> + '_ {
        self.entries
            .iter()
            .filter(move |e| e.fold == fold)
            .map(|e| &e.subject)
    }

    pub fn count(&self, fold: Fold) -> usize {
        self.subjects(fold).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[SubjectFold] {
        &self.entries
    }
}
