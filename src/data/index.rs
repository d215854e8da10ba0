// ============================================================
// Layer 4 — Dataset Index
// ============================================================
// Catalogs canonical subjects across sources, owns the fold
// assignment and gives window-level random access per fold
// without loading recordings into memory.
//
// Per fold, subjects are kept in key order together with the
// cumulative window offsets:
//
//   subjects:  [ A (120) ][ B (95) ][ C (130) ]
//   offsets:   0          120       215       345
//
// get_window(fold, 200) → binary search → B, local 80 →
// one seek + one record read from B's store file. O(log n).
//
// Before serving anything the index checks that every subject
// file agrees on shape, channel roles, rate and epoch length.
// This is the only place store metadata is interpreted; the
// Window Loader asks the index for windows and never opens
// store files itself.
//
// Rebuilding is done on a fresh DatasetIndex and swapped into
// an IndexHandle under a write lock; readers hold an Arc
// snapshot and never observe a half-built index.

use std::sync::{Arc, RwLock};

use crate::data::splitter::build_index;
use crate::data::store::{CanonicalStore, StoreReader};
use crate::domain::error::{PipelineError, PipelineResult, Stage};
use crate::domain::fold::{Fold, FoldAssignment, FoldRatios};
use crate::domain::signal::ChannelRole;
use crate::domain::subject::{SourceDataset, SubjectKey};
use crate::domain::window::{CanonicalWindow, WindowShape};

#[derive(Debug, Clone, Default)]
struct FoldTable {
    subjects: Vec<StoreReader>,
    /// offsets[i] = first fold-level index of subjects[i]; one extra
    /// trailing entry holds the total
    offsets:  Vec<usize>,
}

impl FoldTable {
    fn new(subjects: Vec<StoreReader>) -> Self {
        let mut offsets = Vec::with_capacity(subjects.len() + 1);
        let mut acc = 0usize;
        offsets.push(0);
        for s in &subjects {
            acc += s.window_count();
            offsets.push(acc);
        }
        Self { subjects, offsets }
    }

    fn total(&self) -> usize {
        self.offsets.last().copied().unwrap_or(0)
    }

    /// (subject slot, local window index)
    fn locate(&self, i: usize) -> Option<(usize, usize)> {
        if i >= self.total() {
            return None;
        }
        // Last offset <= i; empty subjects share an offset with their
        // successor so partition_point lands on the one that holds i.
        let slot = self.offsets.partition_point(|&o| o <= i) - 1;
        Some((slot, i - self.offsets[slot]))
    }
}

#[derive(Debug)]
pub struct DatasetIndex {
    assignment:     FoldAssignment,
    shape:          WindowShape,
    roles:          Vec<ChannelRole>,
    target_rate:    f64,
    epoch_duration: f64,
    folds:          [FoldTable; 3],
}

impl DatasetIndex {
    /// Catalog every stored subject of `sources`, assign folds and
    /// validate compatibility.
    pub fn build(store: &CanonicalStore, sources: &[SourceDataset], ratios: FoldRatios, seed: u64) -> PipelineResult<Self> {
        if !ratios.is_valid() {
            return Err(PipelineError::InvalidConfig(format!("invalid fold ratios {ratios:?}")));
        }
        let subjects   = store.list(sources)?;
        let assignment = build_index(&subjects, ratios, seed);
        Self::from_assignment(store, assignment)
    }

    /// Re-open an existing assignment (resume, test runs).
    pub fn from_assignment(store: &CanonicalStore, assignment: FoldAssignment) -> PipelineResult<Self> {
        if assignment.is_empty() {
            return Err(PipelineError::EmptyFold { fold: Fold::Train, total_subjects: 0 });
        }

        let mut readers: [Vec<StoreReader>; 3] = Default::default();
        for entry in assignment.entries() {
            readers[entry.fold.slot()].push(store.open(&entry.subject)?);
        }

        // ── Compatibility across subjects ─────────────────────────────────────
        let reference = readers
            .iter()
            .flatten()
            .next()
            .map(|r| r.header.clone())
            .ok_or(PipelineError::EmptyFold { fold: Fold::Train, total_subjects: 0 })?;

        for r in readers.iter().flatten() {
            let h = &r.header;
            if h.shape() != reference.shape() {
                return Err(PipelineError::ShapeMismatch {
                    stage:    Stage::Indexing,
                    subject:  r.key.clone(),
                    expected: reference.shape(),
                    found:    h.shape(),
                });
            }
            if h.roles() != reference.roles()
                || h.spec.target_rate != reference.spec.target_rate
                || h.spec.epoch_duration != reference.spec.epoch_duration
            {
                return Err(PipelineError::StoreFormat {
                    stage:   Stage::Indexing,
                    subject: r.key.clone(),
                    path:    r.path.clone(),
                    reason:  format!(
                        "canonical parameters differ from {} (roles {:?} at {} Hz vs {:?} at {} Hz)",
                        reference.subject,
                        h.roles(),
                        h.spec.target_rate,
                        reference.roles(),
                        reference.spec.target_rate
                    ),
                });
            }
        }

        let index = Self::assemble(
            assignment,
            reference.shape(),
            reference.roles(),
            reference.spec.target_rate,
            reference.spec.epoch_duration,
            readers,
        );
        tracing::info!(
            "Dataset index: {} subjects, windows {} / {} / {} (train / val / test), shape {}",
            index.assignment.len(),
            index.folds[0].total(),
            index.folds[1].total(),
            index.folds[2].total(),
            index.shape
        );
        Ok(index)
    }

    /// Assemble without cross-subject validation.
    pub(crate) fn assemble(
        assignment:     FoldAssignment,
        shape:          WindowShape,
        roles:          Vec<ChannelRole>,
        target_rate:    f64,
        epoch_duration: f64,
        readers:        [Vec<StoreReader>; 3],
    ) -> Self {
        let [train, val, test] = readers;
        Self {
            assignment,
            shape,
            roles,
            target_rate,
            epoch_duration,
            folds: [FoldTable::new(train), FoldTable::new(val), FoldTable::new(test)],
        }
    }

    pub fn assignment(&self) -> &FoldAssignment {
        &self.assignment
    }

    pub fn shape(&self) -> WindowShape {
        self.shape
    }

    pub fn roles(&self) -> &[ChannelRole] {
        &self.roles
    }

    pub fn target_rate(&self) -> f64 {
        self.target_rate
    }

    pub fn epoch_duration(&self) -> f64 {
        self.epoch_duration
    }

    fn table(&self, fold: Fold) -> PipelineResult<&FoldTable> {
        let table = &self.folds[fold.slot()];
        if table.subjects.is_empty() {
            return Err(PipelineError::EmptyFold { fold, total_subjects: self.assignment.len() });
        }
        Ok(table)
    }

    /// Windows in `fold`. Fails with EmptyFold when the fold has no subjects.
    pub fn window_count(&self, fold: Fold) -> PipelineResult<usize> {
        Ok(self.table(fold)?.total())
    }

    /// Random access to the i-th window of `fold`.
    pub fn get_window(&self, fold: Fold, i: usize) -> PipelineResult<CanonicalWindow> {
        let table = self.table(fold)?;
        let (slot, local) = table.locate(i).ok_or_else(|| {
            PipelineError::InvalidConfig(format!(
                "window {} out of range for fold '{}' ({} windows)",
                i,
                fold,
                table.total()
            ))
        })?;
        table.subjects[slot].read_window(local)
    }

    /// Subjects of `fold` with their window counts, in key order.
    pub fn subjects(&self, fold: Fold) -> PipelineResult<Vec<(&SubjectKey, usize)>> {
        Ok(self
            .table(fold)?
            .subjects
            .iter()
            .map(|r| (&r.key, r.window_count()))
            .collect())
    }

    /// Consecutive windows of one subject of `fold` (the loader's access
    /// path for sequence context).
    pub fn subject_windows(&self, fold: Fold, slot: usize, start: usize, count: usize) -> PipelineResult<Vec<CanonicalWindow>> {
        let table = self.table(fold)?;
        let reader = table.subjects.get(slot).ok_or_else(|| {
            PipelineError::InvalidConfig(format!("subject slot {slot} out of range for fold '{fold}'"))
        })?;
        reader.read_windows(start, count)
    }
}

// ─── IndexHandle ──────────────────────────────────────────────────────────────

/// Shared, read-mostly access to the current index. Readers take cheap
/// snapshots; a rebuild replaces the index atomically.
#[derive(Debug, Clone)]
pub struct IndexHandle {
    current: Arc<RwLock<Arc<DatasetIndex>>>,
}

impl IndexHandle {
    pub fn new(index: DatasetIndex) -> Self {
        Self { current: Arc::new(RwLock::new(Arc::new(index))) }
    }

    pub fn snapshot(&self) -> Arc<DatasetIndex> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Build a replacement with `build` and swap it in. The write lock is
    /// held for the whole rebuild so two rebuilds never interleave.
    pub fn rebuild<F>(&self, build: F) -> PipelineResult<Arc<DatasetIndex>>
    where
        F: FnOnce() -> PipelineResult<DatasetIndex>,
    {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        let fresh = Arc::new(build()?);
        *guard = fresh.clone();
        Ok(fresh)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::canonicalizer::canonicalize;
    use crate::testutil::{populate_store, small_spec, synthetic_recording};

    #[test]
    fn test_two_subject_toy_dataset_has_empty_test_fold() {
        let dir   = tempfile::tempdir().unwrap();
        let store = populate_store(dir.path(), &[(SourceDataset::SleepEdf, 2)], 4);
        let index = DatasetIndex::build(
            &store,
            &[SourceDataset::SleepEdf],
            FoldRatios::new(1.0, 1.0, 0.0),
            0,
        )
        .unwrap();

        assert_eq!(index.window_count(Fold::Train).unwrap(), 4);
        assert_eq!(index.window_count(Fold::Validation).unwrap(), 4);
        let err = index.window_count(Fold::Test).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyFold { fold: Fold::Test, total_subjects: 2 }));
        assert!(matches!(index.get_window(Fold::Test, 0), Err(PipelineError::EmptyFold { .. })));
    }

    #[test]
    fn test_random_access_crosses_subject_boundaries() {
        let dir   = tempfile::tempdir().unwrap();
        let store = populate_store(dir.path(), &[(SourceDataset::Mass, 3)], 5);
        let index = DatasetIndex::build(&store, &[SourceDataset::Mass], FoldRatios::new(1.0, 0.0, 0.0), 7).unwrap();

        assert_eq!(index.window_count(Fold::Train).unwrap(), 15);
        let subjects: Vec<SubjectKey> = index
            .subjects(Fold::Train)
            .unwrap()
            .into_iter()
            .map(|(k, _)| k.clone())
            .collect();
        for i in 0..15 {
            let w = index.get_window(Fold::Train, i).unwrap();
            assert_eq!(w.subject, subjects[i / 5]);
            assert_eq!(w.index, i % 5);
        }
        assert!(index.get_window(Fold::Train, 15).is_err());
    }

    #[test]
    fn test_index_is_deterministic_and_leak_free() {
        let dir   = tempfile::tempdir().unwrap();
        let store = populate_store(dir.path(), &[(SourceDataset::Hmc, 10), (SourceDataset::Dcsm, 10)], 1);
        let sources = [SourceDataset::Hmc, SourceDataset::Dcsm];
        let a = DatasetIndex::build(&store, &sources, FoldRatios::default(), 11).unwrap();
        let b = DatasetIndex::build(&store, &sources, FoldRatios::default(), 11).unwrap();
        assert_eq!(a.assignment(), b.assignment());

        let total: usize = Fold::ALL.iter().map(|f| a.window_count(*f).unwrap()).sum();
        assert_eq!(total, 20);
    }

    #[test]
    fn test_incompatible_shapes_rejected() {
        let dir   = tempfile::tempdir().unwrap();
        let store = populate_store(dir.path(), &[(SourceDataset::Shhs, 2)], 2);

        let odd_key = SubjectKey::new(SourceDataset::Shhs, "zz");
        let mut spec = small_spec();
        spec.target_rate = 5.0;
        canonicalize(&synthetic_recording(&odd_key, 2, 0.0), &spec, &store).unwrap();

        let err = DatasetIndex::build(&store, &[SourceDataset::Shhs], FoldRatios::default(), 1).unwrap_err();
        assert!(matches!(err, PipelineError::ShapeMismatch { stage: Stage::Indexing, .. }));
    }

    #[test]
    fn test_no_subjects_is_empty_fold() {
        let dir   = tempfile::tempdir().unwrap();
        let store = CanonicalStore::new(dir.path());
        let err = DatasetIndex::build(&store, &[SourceDataset::Mass], FoldRatios::default(), 1).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyFold { .. }));
    }

    #[test]
    fn test_handle_swaps_snapshots() {
        let dir   = tempfile::tempdir().unwrap();
        let store = populate_store(dir.path(), &[(SourceDataset::Isruc, 4)], 2);
        let ratios = FoldRatios::new(1.0, 1.0, 0.0);
        let handle = IndexHandle::new(DatasetIndex::build(&store, &[SourceDataset::Isruc], ratios, 1).unwrap());

        let before = handle.snapshot();
        handle
            .rebuild(|| DatasetIndex::build(&store, &[SourceDataset::Isruc], ratios, 2))
            .unwrap();
        let after = handle.snapshot();

        assert_eq!(before.assignment().seed, 1);
        assert_eq!(after.assignment().seed, 2);
        // The old snapshot stays usable
        assert_eq!(before.window_count(Fold::Train).unwrap(), 4);
    }
}
