// ============================================================
// Layer 4 — Data Pipeline
// ============================================================
// This layer handles everything from raw polysomnography files
// all the way to backend tensor batches.
//
// The pipeline flows in this order:
//
//   .edf + hypnogram files
//       │
//       ▼
//   EdfReader / SourceSchema  → raw channels + per-epoch labels
//       │
//       ▼
//   Canonicalizer (+ resample) → fixed-shape windows, one per epoch
//       │
//       ▼
//   CanonicalStore            → one self-describing file per subject
//       │
//       ▼
//   DatasetIndex (+ splitter) → subject folds, window random access
//       │
//       ▼
//   WindowLoader (+ normaliser, prefetcher) → lazy batches with context
//       │
//       ▼
//   SignalBatcher             → Burn tensors for the model adapter
//
// Each module is responsible for exactly one step.
//
// Reference: Burn Book §4 (Datasets and Dataloaders)
//            Rust Book §13 (Iterators and Closures)

/// EDF / EDF+ signal file parser
pub mod edf;

/// Per-source reading schemas (channel aliases, stage codes)
pub mod reader;

/// Deterministic per-epoch resampling
pub mod resample;

/// Recording → canonical windows, persisted once per subject
pub mod canonicalizer;

/// On-disk canonical representation
pub mod store;

/// Seeded subject-level fold assignment
pub mod splitter;

/// Fold catalog with window-level random access
pub mod index;

/// Frozen per-channel z-score statistics
pub mod normalizer;

/// Batches with sequence context
pub mod loader;

/// Bounded background batch queue
pub mod prefetch;

/// Implements Burn's Batcher trait to create tensor batches
pub mod batcher;

/// Implements Burn's Dataset trait over folds
pub mod dataset;
