// ============================================================
// Layer 3 — Domain Layer
// ============================================================
// Plain Rust structs, enums and traits that define the core
// concepts of the pipeline. Everything downstream speaks in
// these types:
//
//   SubjectKey        → (source dataset, subject id)
//   Recording         → one subject's raw channels + labels
//   CanonicalWindow   → one epoch at the canonical rate/shape
//   FoldAssignment    → subject → train / validation / test
//   PipelineError     → the error taxonomy shared by all layers
//
// Rules for this layer:
//   - NO Burn framework types allowed here
//   - NO file I/O
//   - Only plain data, invariants and traits
//
// Reference: Rust Book §5 (Structs), §6 (Enums), §10 (Traits)

/// Source datasets and subject identity
pub mod subject;

/// Channel roles, sleep stages, raw recordings and their locators
pub mod signal;

/// Canonical windows and their shape
pub mod window;

/// Folds, fold ratios and subject-level fold assignments
pub mod fold;

/// Error taxonomy and pipeline stages
pub mod error;

/// Core abstractions (traits) that other layers implement
pub mod traits;
