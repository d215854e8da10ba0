// ============================================================
// Layer 4 — Bounded Batch Prefetcher
// ============================================================
// Overlaps canonical-store reads with model compute:
//
//   producer thread                      training loop
//   BatchIter ──► [ bounded channel ] ──► Prefetcher::next()
//                   depth = N
//
// The channel holds at most `depth` ready batches. When the
// consumer is slow the producer blocks on send (backpressure);
// memory never grows beyond depth batches.
//
// Dropping the Prefetcher drops the receiver first, which makes
// the producer's next send fail so it exits; the thread is then
// joined. An error from the producer is forwarded and ends the
// stream.
//
// Reference: crossbeam-channel documentation
//            Rust Book §16 (Message Passing)

use crossbeam::channel::{self, Receiver};
use std::thread::{self, JoinHandle};

use crate::data::loader::{Batch, BatchIter};
use crate::domain::error::PipelineResult;

pub struct Prefetcher {
    rx:     Option<Receiver<PipelineResult<Batch>>>,
    worker: Option<JoinHandle<()>>,
}

impl Prefetcher {
    /// Start producing `iter`'s batches on a background thread.
    /// `depth = 0` is treated as 1.
    pub fn spawn(iter: BatchIter, depth: usize) -> Self {
        let (tx, rx) = channel::bounded(depth.max(1));
        let worker = thread::spawn(move || {
            for item in iter {
                let failed = item.is_err();
                if tx.send(item).is_err() || failed {
                    break;
                }
            }
        });
        Self { rx: Some(rx), worker: Some(worker) }
    }
}

impl Iterator for Prefetcher {
    type Item = PipelineResult<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.as_ref()?.recv().ok()
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        drop(self.rx.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("Batch prefetch thread panicked");
            }
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::index::DatasetIndex;
    use crate::data::loader::{ContextBoundary, LoaderConfig, WindowLoader};
    use crate::domain::fold::{Fold, FoldRatios};
    use crate::domain::subject::SourceDataset;
    use crate::testutil::populate_store;
    use std::sync::Arc;

    fn loader() -> (tempfile::TempDir, WindowLoader) {
        let dir   = tempfile::tempdir().unwrap();
        let store = populate_store(dir.path(), &[(SourceDataset::Mass, 3)], 7);
        let index = DatasetIndex::build(&store, &[SourceDataset::Mass], FoldRatios::new(1.0, 0.0, 0.0), 0).unwrap();
        let cfg   = LoaderConfig { batch_size: 2, context_length: 1, boundary: ContextBoundary::ZeroPad };
        (dir, WindowLoader::new(Arc::new(index), Fold::Train, cfg).unwrap())
    }

    #[test]
    fn test_prefetched_batches_match_direct_iteration() {
        let (_dir, loader) = loader();
        let direct: Vec<_> = loader.batches(Some(1)).map(|b| b.unwrap()).collect();
        let fetched: Vec<_> = Prefetcher::spawn(loader.batches(Some(1)), 2).map(|b| b.unwrap()).collect();
        assert_eq!(direct, fetched);
        assert_eq!(direct.len(), 11);
    }

    #[test]
    fn test_early_drop_stops_producer() {
        let (_dir, loader) = loader();
        let mut p = Prefetcher::spawn(loader.batches(None), 1);
        assert!(p.next().is_some());
        drop(p);
    }
}
