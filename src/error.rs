// src/error.rs
//
// Error taxonomy for the walking controller.
//
// - ConfigError:    fatal at startup, never retried
// - RobotIoError:   a failed request to the robot service
// - InferenceError: a failed or malformed policy evaluation
// - SessionError:   what terminates a control session, tagged with the tick

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ActuatorId, PolicyIndex};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate physical actuator id {0}")]
    DuplicateActuatorId(ActuatorId),

    #[error("duplicate joint name {0:?}")]
    DuplicateJointName(String),

    #[error("policy indices must cover 0..{expected}; index {index} is {problem}")]
    PolicyIndexLayout {
        expected: usize,
        index: PolicyIndex,
        problem: &'static str,
    },

    #[error("actuator {physical_id} has sign {sign}; expected +1 or -1")]
    InvalidSign { physical_id: ActuatorId, sign: f64 },

    #[error("actuator {physical_id}: {field} must be finite and >= 0, got {value}")]
    InvalidGain {
        physical_id: ActuatorId,
        field: &'static str,
        value: f64,
    },

    #[error("actuator id {0} is not in the actuator map")]
    UnknownActuator(ActuatorId),

    #[error("joint {0:?} is not in the actuator map")]
    UnknownJoint(String),

    #[error("source pose has no reading for actuator {0}")]
    MissingSourcePose(ActuatorId),

    #[error("model file not found: {}", .0.display())]
    ModelNotFound(PathBuf),

    #[error("model file {} is malformed: {reason}", path.display())]
    ModelMalformed { path: PathBuf, reason: String },

    #[error("observation layout {layout}: {reason}")]
    Layout { layout: String, reason: String },

    #[error("invalid config value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {what}: {reason}")]
    Parse { what: String, reason: String },
}

#[derive(Debug, Error)]
pub enum RobotIoError {
    #[error("robot service request {op} failed: {message}")]
    Request { op: &'static str, message: String },

    #[error("actuator {physical_id} rejected {op}: {message}")]
    Actuator {
        op: &'static str,
        physical_id: ActuatorId,
        message: String,
    },

    #[error("state reply is missing actuator {0}")]
    MissingState(ActuatorId),

    #[error("actuator {physical_id} reported a non-finite {field}")]
    InvalidReading {
        physical_id: ActuatorId,
        field: &'static str,
    },
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("missing model input {0:?}")]
    MissingInput(String),

    #[error("missing model output {0:?}")]
    MissingOutput(String),

    #[error("tensor {name:?} has length {actual}, expected {expected}")]
    ShapeMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("tensor {name:?} contains a non-finite value at index {index}")]
    NonFinite { name: String, index: usize },

    #[error("inference engine failed: {0}")]
    Engine(String),
}

/// Terminal error of a control session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("robot I/O failed during {stage} (tick {tick:?}): {source}")]
    Io {
        stage: &'static str,
        tick: Option<u64>,
        #[source]
        source: RobotIoError,
    },

    #[error("inference failed at tick {tick}: {source}")]
    Inference {
        tick: u64,
        #[source]
        source: InferenceError,
    },

    #[error("session is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
}
