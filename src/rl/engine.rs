// src/rl/engine.rs
//
// Inference engine seam.
//
// An engine is loaded once and then evaluated synchronously once per tick.
// Tensors are flat f32 buffers addressed by name; the engine declares the
// names and lengths it consumes and produces so the policy adapter can check
// them against the observation layout before the loop starts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::InferenceError;

/// Named flat tensors, ordered by name for deterministic iteration.
pub type NamedTensors = BTreeMap<String, Vec<f32>>;

/// Declared name and flat length of one engine input or output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub len: usize,
}

impl TensorSpec {
    pub fn new(name: &str, len: usize) -> Self {
        Self {
            name: name.to_string(),
            len,
        }
    }
}

/// A loaded, deterministic model.
pub trait InferenceEngine: Send + Sync {
    /// Identifier of the loaded model (checkpoint name, file stem, ...).
    fn model_id(&self) -> &str;

    fn inputs(&self) -> &[TensorSpec];

    fn outputs(&self) -> &[TensorSpec];

    /// Evaluate the model. Same inputs always produce the same outputs.
    fn run(&self, inputs: &NamedTensors) -> Result<NamedTensors, InferenceError>;

    fn input(&self, name: &str) -> Option<&TensorSpec> {
        self.inputs().iter().find(|t| t.name == name)
    }

    fn output(&self, name: &str) -> Option<&TensorSpec> {
        self.outputs().iter().find(|t| t.name == name)
    }
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn model_id(&self) -> &str {
        (**self).model_id()
    }

    fn inputs(&self) -> &[TensorSpec] {
        (**self).inputs()
    }

    fn outputs(&self) -> &[TensorSpec] {
        (**self).outputs()
    }

    fn run(&self, inputs: &NamedTensors) -> Result<NamedTensors, InferenceError> {
        (**self).run(inputs)
    }
}
