// ============================================================
// Layer 5 — Linear Baseline Architecture
// ============================================================
// The reference architecture registered with the pipeline:
// one dense layer over the flattened context sequence.
//
//   inputs [N, L, C, S] ──reshape──► [N, L·C·S] ──Linear──► [N, 5]
//
// Padding slots are already zero, so they contribute nothing.
// explain() returns input × weight for the predicted class,
// which for a linear model sums exactly to that class logit
// minus its bias.

use burn::{
    nn::{Linear, LinearConfig},
    prelude::*,
};

use crate::data::batcher::SignalBatch;
use crate::domain::signal::SleepStage;
use crate::ml::adapter::{Attribution, ModelAdapter};

// NOTE: #[derive(Config)] already generates Clone and Serialize/Deserialize.
#[derive(Config, Debug)]
pub struct LinearBaselineConfig {
    pub sequence_length: usize,
    pub channels:        usize,
    pub samples:         usize,
    #[config(default = 5)]
    pub classes:         usize,
}

impl LinearBaselineConfig {
    pub fn input_len(&self) -> usize {
        self.sequence_length * self.channels * self.samples
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> LinearBaseline<B> {
        LinearBaseline {
            head: LinearConfig::new(self.input_len(), self.classes).init(device),
        }
    }
}

#[derive(Module, Debug)]
pub struct LinearBaseline<B: Backend> {
    pub head: Linear<B>,
}

impl<B: Backend> LinearBaseline<B> {
    fn flatten(batch: &SignalBatch<B>) -> Tensor<B, 2> {
        let [n, l, c, s] = batch.inputs.dims();
        batch.inputs.clone().reshape([n, l * c * s])
    }
}

impl<B: Backend> ModelAdapter<B> for LinearBaseline<B> {
    fn forward(&self, batch: &SignalBatch<B>) -> Tensor<B, 2> {
        self.head.forward(Self::flatten(batch))
    }

    fn explain(&self, batch: &SignalBatch<B>) -> Option<Attribution<B>> {
        let dims      = batch.inputs.dims();
        let flat      = Self::flatten(batch);
        let predicted = self.head.forward(flat.clone()).argmax(1).flatten::<1>(0, 1);

        // weight: [inputs, classes] → rows of the predicted classes [N, inputs]
        let weights = self.head.weight.val().transpose().select(0, predicted.clone());
        let scores  = (flat * weights).reshape(dims);
        Some(Attribution { scores, predicted })
    }
}

/// Class count the baseline predicts by default.
pub const CLASSES: usize = SleepStage::COUNT;
