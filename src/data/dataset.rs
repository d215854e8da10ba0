// ============================================================
// Layer 4 — Burn Dataset Views
// ============================================================
// Read-only adapters that expose the pipeline through Burn's
// Dataset trait, so external tooling (explainability, custom
// DataLoaders) can consume a fold without knowing about the
// canonical store:
//
//   FoldDataset      Dataset<CanonicalWindow>  one window per item
//   SequenceDataset  Dataset<SequenceSample>   one loader target per item
//
// Both borrow nothing and copy nothing up front; every `get`
// reads from the store on demand. Read errors surface as `None`
// and are logged.

use burn::data::dataset::Dataset;
use std::sync::Arc;

use crate::data::index::DatasetIndex;
use crate::data::loader::{SequenceSample, WindowLoader};
use crate::domain::fold::Fold;
use crate::domain::window::CanonicalWindow;

pub struct FoldDataset {
    index: Arc<DatasetIndex>,
    fold:  Fold,
    len:   usize,
}

impl FoldDataset {
    pub fn new(index: Arc<DatasetIndex>, fold: Fold) -> Self {
        let len = index.window_count(fold).unwrap_or(0);
        Self { index, fold, len }
    }

    pub fn fold(&self) -> Fold {
        self.fold
    }
}

impl Dataset<CanonicalWindow> for FoldDataset {
    fn get(&self, index: usize) -> Option<CanonicalWindow> {
        match self.index.get_window(self.fold, index) {
            Ok(w) => Some(w),
            Err(e) => {
                if index < self.len {
                    tracing::warn!("{}", e);
                }
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.len
    }
}

pub struct SequenceDataset {
    loader: WindowLoader,
}

impl SequenceDataset {
    pub fn new(loader: WindowLoader) -> Self {
        Self { loader }
    }
}

impl Dataset<SequenceSample> for SequenceDataset {
    fn get(&self, index: usize) -> Option<SequenceSample> {
        if index >= self.loader.len() {
            return None;
        }
        self.loader
            .sample(index)
            .map_err(|e| tracing::warn!("{}", e))
            .ok()
    }

    fn len(&self) -> usize {
        self.loader.len()
    }
}
