// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// Everything that touches model parameters lives here:
//
//   adapter.rs        — ModelAdapter: the fixed contract every
//                       architecture implements (forward, loss,
//                       parameters, optional explain)
//
//   baseline.rs       — Linear reference architecture over the
//                       flattened context sequence
//
//   registry.rs       — Architecture names → configs
//
//   metrics.rs        — Confusion matrix, accuracy, macro-F1,
//                       Cohen's kappa, monitored quantity
//
//   early_stopping.rs — Patience tracker on the monitored metric
//
//   state.rs          — Persisted experiment state and identity
//
//   trainer.rs        — The experiment orchestrator: epoch loop,
//                       validation, checkpoints, resume, finetune,
//                       cooperative stop
//
// Reference: Burn Book §3 (Building Blocks)
//            Burn Book §5 (Training)

/// Model adapter interface
pub mod adapter;

/// Linear baseline architecture
pub mod baseline;

/// Architecture registry
pub mod registry;

/// Classification metrics
pub mod metrics;

/// Early stopping
pub mod early_stopping;

/// Experiment state persisted with checkpoints
pub mod state;

/// Experiment orchestrator (training loop state machine)
pub mod trainer;
