// ============================================================
// Layer 5 — Model Adapter Interface
// ============================================================
// The fixed contract every pluggable architecture satisfies.
// The orchestrator is generic over it and never looks inside
// a model:
//
//   forward(batch)        → per-window class scores [N, classes]
//   loss(scores, labels)  → scalar (cross-entropy by default)
//   parameters            → via the burn Module supertrait
//                           (visit / num_params / records)
//   explain(batch)        → optional attribution, None by default
//
// Reference: Rust Book §10 (Traits)
//            Burn Book §3 (Modules)

use burn::{nn::loss::CrossEntropyLossConfig, prelude::*};

use crate::data::batcher::SignalBatch;

/// Per-input attribution produced by `ModelAdapter::explain`.
#[derive(Debug, Clone)]
pub struct Attribution<B: Backend> {
    /// Same shape as the batch inputs: [N, L, C, S]
    pub scores:    Tensor<B, 4>,
    /// Class each attribution explains: [N]
    pub predicted: Tensor<B, 1, Int>,
}

pub trait ModelAdapter<B: Backend>: Module<B> {
    /// Class scores (logits) for the centre window of each sample.
    fn forward(&self, batch: &SignalBatch<B>) -> Tensor<B, 2>;

    /// Scalar training objective.
    fn loss(&self, scores: Tensor<B, 2>, labels: Tensor<B, 1, Int>) -> Tensor<B, 1> {
        CrossEntropyLossConfig::new()
            .init(&scores.device())
            .forward(scores, labels)
    }

    /// Number of trainable scalars.
    fn parameter_count(&self) -> usize {
        self.num_params()
    }

    fn explain(&self, _batch: &SignalBatch<B>) -> Option<Attribution<B>> {
        None
    }
}
