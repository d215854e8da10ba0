// ============================================================
// Layer 5 — Model Registry
// ============================================================
// Maps the architecture name in a configuration file or on the
// command line to a concrete ModelAdapter. The name is part of
// the experiment identity, so a checkpoint is never loaded into
// a different architecture.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use crate::domain::window::WindowShape;
use crate::ml::baseline::{LinearBaselineConfig, CLASSES};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    #[default]
    Linear,
}

impl ModelKind {
    pub const ALL: [ModelKind; 1] = [ModelKind::Linear];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Linear => "linear",
        }
    }

    /// Architecture config for inputs of `sequence_length` windows of `shape`.
    pub fn linear_config(&self, sequence_length: usize, shape: WindowShape) -> LinearBaselineConfig {
        LinearBaselineConfig::new(sequence_length, shape.channels, shape.samples).with_classes(CLASSES)
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        ModelKind::ALL
            .into_iter()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| {
                let known: Vec<&str> = ModelKind::ALL.iter().map(|k| k.as_str()).collect();
                format!("unknown model '{s}' (known: {})", known.join(", "))
            })
    }
}
