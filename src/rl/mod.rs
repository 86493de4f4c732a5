// src/rl/mod.rs
//
// Learned-policy plumbing: observation schema, inference engines, and the
// adapter that binds them together.

pub mod engine;
pub mod mlp;
pub mod observation;
pub mod onnx;
pub mod policy;

use std::path::Path;

use crate::error::ConfigError;

pub use engine::{InferenceEngine, NamedTensors, TensorSpec};
pub use mlp::{Activation, DenseLayer, MlpEngine, MlpModel};
pub use observation::{
    ObsScales, ObservationBuilder, ObservationInputs, ObservationLayout, ObservationVector,
    Segment, SegmentKind, OBS_VERSION,
};
pub use onnx::OnnxEngine;
pub use policy::{PolicyAdapter, PolicyBinding, PolicyStep, RecurrentState};

/// Load a model file, picking the engine by extension: `.onnx` checkpoints
/// go to tract, anything else is read as a walkctl-mlp JSON model.
pub fn load_engine(path: &Path) -> Result<Box<dyn InferenceEngine>, ConfigError> {
    let is_onnx = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("onnx"));
    if is_onnx {
        Ok(Box::new(OnnxEngine::load(path)?))
    } else {
        Ok(Box::new(MlpEngine::load(path)?))
    }
}
