// src/rl/mlp.rs
//
// Dense multi-layer perceptron engine loaded from a JSON model file.
//
// File format ("walkctl-mlp", version 1):
//
//   {
//     "format": "walkctl-mlp",
//     "version": 1,
//     "name": "kbot-walk-euler",          (optional)
//     "inputs":  [{"name": "obs", "len": 45}],
//     "outputs": [{"name": "actions", "len": 10}],
//     "layers": [
//       {"weights": [[...], ...], "bias": [...], "activation": "tanh"},
//       ...
//     ]
//   }
//
// Inputs are concatenated in declared order. Each layer computes
// act(W x + b) with W stored row-major as [out][in]. The last layer's output
// is split across the declared outputs in order.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::engine::{InferenceEngine, NamedTensors, TensorSpec};
use crate::error::{ConfigError, InferenceError};

pub const MLP_FORMAT: &str = "walkctl-mlp";
pub const MLP_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Identity,
    Tanh,
    Relu,
    Elu,
}

impl Activation {
    fn apply(self, v: f32) -> f32 {
        match self {
            Activation::Identity => v,
            Activation::Tanh => v.tanh(),
            Activation::Relu => v.max(0.0),
            Activation::Elu => {
                if v > 0.0 {
                    v
                } else {
                    v.exp_m1()
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseLayer {
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
    #[serde(default)]
    pub activation: Activation,
}

impl DenseLayer {
    fn out_dim(&self) -> usize {
        self.weights.len()
    }

    fn forward(&self, x: &[f32]) -> Vec<f32> {
        self.weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| {
                let acc: f32 = row.iter().zip(x).map(|(w, v)| w * v).sum();
                self.activation.apply(acc + b)
            })
            .collect()
    }
}

/// Serialized model description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpModel {
    pub format: String,
    pub version: u32,
    #[serde(default)]
    pub name: Option<String>,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
    pub layers: Vec<DenseLayer>,
}

impl MlpModel {
    pub fn new(inputs: Vec<TensorSpec>, outputs: Vec<TensorSpec>, layers: Vec<DenseLayer>) -> Self {
        Self {
            format: MLP_FORMAT.to_string(),
            version: MLP_FORMAT_VERSION,
            name: None,
            inputs,
            outputs,
            layers,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Structural checks: header, unique names, layer chaining, finiteness.
    pub fn validate(&self) -> Result<(), String> {
        if self.format != MLP_FORMAT {
            return Err(format!("format is {:?}, expected {MLP_FORMAT:?}", self.format));
        }
        if self.version != MLP_FORMAT_VERSION {
            return Err(format!(
                "format version {} is not supported (expected {MLP_FORMAT_VERSION})",
                self.version
            ));
        }
        check_specs("input", &self.inputs)?;
        check_specs("output", &self.outputs)?;
        if self.layers.is_empty() {
            return Err("model has no layers".to_string());
        }

        let mut dim: usize = self.inputs.iter().map(|t| t.len).sum();
        for (li, layer) in self.layers.iter().enumerate() {
            if layer.out_dim() == 0 {
                return Err(format!("layer {li} has no output rows"));
            }
            if layer.bias.len() != layer.out_dim() {
                return Err(format!(
                    "layer {li} has {} bias values for {} rows",
                    layer.bias.len(),
                    layer.out_dim()
                ));
            }
            for (ri, row) in layer.weights.iter().enumerate() {
                if row.len() != dim {
                    return Err(format!(
                        "layer {li} row {ri} has {} weights, expected {dim}",
                        row.len()
                    ));
                }
                if row.iter().any(|w| !w.is_finite()) {
                    return Err(format!("layer {li} row {ri} has a non-finite weight"));
                }
            }
            if layer.bias.iter().any(|b| !b.is_finite()) {
                return Err(format!("layer {li} has a non-finite bias"));
            }
            dim = layer.out_dim();
        }

        let out_total: usize = self.outputs.iter().map(|t| t.len).sum();
        if dim != out_total {
            return Err(format!(
                "last layer produces {dim} values but outputs declare {out_total}"
            ));
        }
        Ok(())
    }
}

fn check_specs(what: &str, specs: &[TensorSpec]) -> Result<(), String> {
    if specs.is_empty() {
        return Err(format!("model declares no {what}s"));
    }
    let mut seen = std::collections::HashSet::new();
    for t in specs {
        if t.len == 0 {
            return Err(format!("{what} {:?} has zero length", t.name));
        }
        if !seen.insert(t.name.as_str()) {
            return Err(format!("duplicate {what} name {:?}", t.name));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct MlpEngine {
    model_id: String,
    model: MlpModel,
}

impl MlpEngine {
    /// Load and validate a model file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::ModelNotFound(path.to_path_buf())
            } else {
                ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;
        let model: MlpModel =
            serde_json::from_str(&text).map_err(|e| ConfigError::ModelMalformed {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let fallback_id = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "mlp".to_string());
        Self::build(model, path.to_path_buf(), fallback_id)
    }

    /// Build from an in-memory model description.
    pub fn from_model(model: MlpModel) -> Result<Self, ConfigError> {
        Self::build(model, PathBuf::from("<memory>"), "mlp".to_string())
    }

    fn build(model: MlpModel, path: PathBuf, fallback_id: String) -> Result<Self, ConfigError> {
        model
            .validate()
            .map_err(|reason| ConfigError::ModelMalformed { path, reason })?;
        let model_id = model.name.clone().unwrap_or(fallback_id);
        Ok(Self { model_id, model })
    }
}

impl InferenceEngine for MlpEngine {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn inputs(&self) -> &[TensorSpec] {
        &self.model.inputs
    }

    fn outputs(&self) -> &[TensorSpec] {
        &self.model.outputs
    }

    fn run(&self, inputs: &NamedTensors) -> Result<NamedTensors, InferenceError> {
        let mut x = Vec::with_capacity(self.model.inputs.iter().map(|t| t.len).sum());
        for spec in &self.model.inputs {
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
            x.extend_from_slice(v);
        }

        for layer in &self.model.layers {
            x = layer.forward(&x);
        }

        let mut out = NamedTensors::new();
        let mut start = 0;
        for spec in &self.model.outputs {
            out.insert(spec.name.clone(), x[start..start + spec.len].to_vec());
            start += spec.len;
        }
        Ok(out)
    }
}
