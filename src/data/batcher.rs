// ============================================================
// Layer 4 — Signal Batcher
// ============================================================
// Implements Burn's Batcher trait to convert a Vec of
// SequenceSamples into backend tensors.
//
// How batching works here:
//   Input:  N SequenceSamples, each inputs = L × C × S floats
//   Output: SignalBatch with
//             inputs  [N, L, C, S]  (f32)
//             mask    [N, L]        1 = real window, 0 = padding
//             labels  [N]           class index of the centre window
//
//   Every sample already has the same length (the Window Loader
//   guarantees one shape), so this is a flatten + reshape.
//
// B is generic so the same batcher builds autodiff batches for
// training and plain-backend batches for validation.
//
// Reference: Burn Book §4 (Batcher)

use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
};

use crate::data::loader::{Batch, SequenceSample};
use crate::domain::window::WindowShape;

// ─── SignalBatch ──────────────────────────────────────────────────────────────
#[derive(Debug, Clone)]
pub struct SignalBatch<B: Backend> {
    /// Shape: [batch, sequence, channels, samples]
    pub inputs: Tensor<B, 4>,
    /// Shape: [batch, sequence]
    pub mask:   Tensor<B, 2>,
    /// Shape: [batch]
    pub labels: Tensor<B, 1, Int>,
}

impl<B: Backend> SignalBatch<B> {
    pub fn len(&self) -> usize {
        self.labels.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── SignalBatcher ────────────────────────────────────────────────────────────
#[derive(Clone, Debug)]
pub struct SignalBatcher<B: Backend> {
    pub device:          B::Device,
    pub sequence_length: usize,
    pub shape:           WindowShape,
}

impl<B: Backend> SignalBatcher<B> {
    pub fn new(device: B::Device, sequence_length: usize, shape: WindowShape) -> Self {
        Self { device, sequence_length, shape }
    }

    /// Tensors for a loader batch (the loader batch is left untouched).
    pub fn from_batch(&self, batch: &Batch) -> SignalBatch<B> {
        self.batch(batch.samples.clone())
    }
}

impl<B: Backend> Batcher<SequenceSample, SignalBatch<B>> for SignalBatcher<B> {
    fn batch(&self, items: Vec<SequenceSample>) -> SignalBatch<B> {
        let n = items.len();
        let l = self.sequence_length;

        let inputs: Vec<f32> = items.iter().flat_map(|s| s.inputs.iter().copied()).collect();
        let mask:   Vec<f32> = items.iter().flat_map(|s| s.mask.iter().copied()).collect();
        let labels: Vec<i32> = items.iter().map(|s| s.label.index() as i32).collect();

        let inputs = Tensor::<B, 1>::from_floats(inputs.as_slice(), &self.device)
            .reshape([n, l, self.shape.channels, self.shape.samples]);
        let mask = Tensor::<B, 1>::from_floats(mask.as_slice(), &self.device)
            .reshape([n, l]);
        let labels = Tensor::<B, 1, Int>::from_ints(labels.as_slice(), &self.device);

        SignalBatch { inputs, mask, labels }
    }
}
