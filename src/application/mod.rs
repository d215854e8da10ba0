// ============================================================
// Layer 2 — Application / Use Cases
// ============================================================
// This layer orchestrates all the other layers to accomplish
// one goal of the command surface (prepare, train, test,
// finetune, explain).
//
// Rules for this layer:
//   - No ML math or model code here
//   - No UI or printing here (that's Layer 1)
//   - No direct file formats (that's Layer 4 and 6)
//   - Only workflow coordination
//
// Reference: Clean Architecture pattern
//            Rust Book §7 (Module System)

// The experiment configuration threaded into every use case
pub mod config;

// Raw recordings → canonical store
pub mod prepare_use_case;

// Training, testing and finetuning workflows
pub mod train_use_case;

// Read access for explainability tooling
pub mod explain_use_case;
