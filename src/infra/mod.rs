// ============================================================
// Layer 6 — Infrastructure Layer
// ============================================================
// Handles all cross-cutting concerns that don't belong in
// any specific business layer:
//
//   checkpoint.rs — Experiment checkpoints
//                   Model and optimiser records (full precision
//                   MessagePack), experiment.json as the atomic
//                   commit point, best model, normalisation stats.
//
//   retry.rs      — Bounded retry with exponential backoff
//                   Wraps every checkpoint read/write; exhaustion
//                   surfaces as CheckpointIo.
//
//   metrics.rs    — Training metrics logging
//                   Writes epoch-level loss and validation metrics
//                   to a CSV file for plotting learning curves.
//
// Reference: Rust Book §7 (Modules)
//            Burn Book §5 (Checkpointing)

/// Experiment checkpoint saving and loading
pub mod checkpoint;

/// Retry policy for checkpoint I/O
pub mod retry;

/// Training metrics CSV logger
pub mod metrics;
