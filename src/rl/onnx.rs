// src/rl/onnx.rs
//
// ONNX checkpoint engine backed by tract.
//
// Graph inputs and outputs are addressed by their ONNX names, so a checkpoint
// exported with named inputs (`x_vel.1`, `buffer.1`, ...) binds directly to a
// named-segment layout, and a single `obs` input binds to a flat one. Every
// input and output must have a fixed f32 shape; the flat length of each is
// what the policy adapter checks against the layout.

use std::path::Path;

use tract_onnx::prelude::*;

use super::engine::{InferenceEngine, NamedTensors, TensorSpec};
use crate::error::{ConfigError, InferenceError};

pub struct OnnxEngine {
    model_id: String,
    inputs: Vec<TensorSpec>,
    input_shapes: Vec<Vec<usize>>,
    outputs: Vec<TensorSpec>,
    plan: TypedRunnableModel<TypedModel>,
}

impl std::fmt::Debug for OnnxEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxEngine")
            .field("model_id", &self.model_id)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

impl OnnxEngine {
    /// Load, type-check and optimise an ONNX model file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigError::ModelNotFound(path.to_path_buf()));
        }
        let malformed = |reason: String| ConfigError::ModelMalformed {
            path: path.to_path_buf(),
            reason,
        };

        let model = tract_onnx::onnx()
            .model_for_path(path)
            .and_then(|m| m.into_typed())
            .map_err(|e| malformed(format!("{e:#}")))?;

        let inputs = model
            .input_outlets()
            .map_err(|e| malformed(format!("{e:#}")))?
            .iter()
            .map(|&outlet| {
                let name = model.node(outlet.node).name.clone();
                tensor_shape(&model, outlet, &name).map(|shape| (name, shape))
            })
            .collect::<Result<Vec<_>, String>>()
            .map_err(&malformed)?;

        let outputs = model
            .output_outlets()
            .map_err(|e| malformed(format!("{e:#}")))?
            .iter()
            .map(|&outlet| {
                let name = model
                    .outlet_label(outlet)
                    .map(str::to_string)
                    .unwrap_or_else(|| model.node(outlet.node).name.clone());
                tensor_shape(&model, outlet, &name).map(|shape| (name, shape))
            })
            .collect::<Result<Vec<_>, String>>()
            .map_err(&malformed)?;

        let plan = model
            .into_optimized()
            .and_then(|m| m.into_runnable())
            .map_err(|e| malformed(format!("{e:#}")))?;

        let model_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".to_string());

        Ok(Self {
            model_id,
            inputs: inputs
                .iter()
                .map(|(name, shape)| TensorSpec::new(name, shape.iter().product()))
                .collect(),
            input_shapes: inputs.into_iter().map(|(_, shape)| shape).collect(),
            outputs: outputs
                .iter()
                .map(|(name, shape)| TensorSpec::new(name, shape.iter().product()))
                .collect(),
            plan,
        })
    }
}

/// Fixed shape of an f32 tensor, or why it is unusable.
fn tensor_shape(model: &TypedModel, outlet: OutletId, name: &str) -> Result<Vec<usize>, String> {
    let fact = model.outlet_fact(outlet).map_err(|e| format!("{e:#}"))?;
    if fact.datum_type != f32::datum_type() {
        return Err(format!(
            "tensor {name:?} has type {:?}, expected f32",
            fact.datum_type
        ));
    }
    fact.shape
        .as_concrete()
        .map(|dims| dims.to_vec())
        .ok_or_else(|| format!("tensor {name:?} has a dynamic shape {:?}", fact.shape))
}

impl InferenceEngine for OnnxEngine {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn inputs(&self) -> &[TensorSpec] {
        &self.inputs
    }

    fn outputs(&self) -> &[TensorSpec] {
        &self.outputs
    }

    fn run(&self, inputs: &NamedTensors) -> Result<NamedTensors, InferenceError> {
        let mut feed: TVec<TValue> = TVec::new();
        for (spec, shape) in self.inputs.iter().zip(&self.input_shapes) {
            let v = inputs
                .get(&spec.name)
                .ok_or_else(|| InferenceError::MissingInput(spec.name.clone()))?;
            if v.len() != spec.len {
                return Err(InferenceError::ShapeMismatch {
                    name: spec.name.clone(),
                    expected: spec.len,
                    actual: v.len(),
                });
            }
            let tensor = Tensor::from_shape(shape.as_slice(), v.as_slice())
                .map_err(|e| InferenceError::Engine(format!("{e:#}")))?;
            feed.push(tensor.into());
        }

        let results = self
            .plan
            .run(feed)
            .map_err(|e| InferenceError::Engine(format!("{e:#}")))?;

        let mut out = NamedTensors::new();
        for (spec, value) in self.outputs.iter().zip(results.iter()) {
            let data = value
                .as_slice::<f32>()
                .map_err(|e| InferenceError::Engine(format!("{e:#}")))?;
            if data.len() != spec.len {
                return Err(InferenceError::ShapeMismatch {
                    name: spec.name.clone(),
                    expected: spec.len,
                    actual: data.len(),
                });
            }
            out.insert(spec.name.clone(), data.to_vec());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_not_found() {
        let err = OnnxEngine::load("/nonexistent/policy.onnx").unwrap_err();
        assert!(matches!(err, ConfigError::ModelNotFound(_)));
    }

    #[test]
    fn garbage_file_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.onnx");
        std::fs::write(&path, b"definitely not protobuf").unwrap();
        let err = OnnxEngine::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ModelMalformed { .. }), "{err}");
    }
}
