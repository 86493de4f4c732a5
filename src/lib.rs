//! walkctl core library.
//!
//! Drives a humanoid robot's legs with a learned walking policy through a
//! remote actuator/IMU service. Each control tick reads joint and inertial
//! state, builds a fixed-layout observation, runs the policy, and maps the
//! actions back onto physical actuator commands with sign and offset
//! corrections. The binary (`src/main.rs`) is a thin harness around the
//! session defined here.

pub mod actuator_map;
pub mod config;
pub mod error;
pub mod gait;
pub mod io;
pub mod logging;
pub mod loop_scheduler;
pub mod normalize;
pub mod rl;
pub mod session;
pub mod telemetry;
pub mod types;

// --- Re-exports for ergonomic external use ---------------------------------

pub use actuator_map::{ActuatorMap, ActuatorSpec, ActuatorTable, HeldActuator};

pub use config::{
    resolve_effective_variant, ActionMode, CommandDefaults, Config, EffectiveVariant,
    PolicyVariant, VariantSource,
};

pub use error::{ConfigError, InferenceError, RobotIoError, SessionError};

pub use gait::GaitPhase;

pub use io::{disable_torque, RobotIo, SimRobot};

pub use loop_scheduler::{run_duration, tick_period, LoopStats, LoopStatsWindow, TickPacer};

pub use normalize::{wrap_degrees, CoordinateNormalizer, SourcePose};

pub use rl::{
    load_engine, InferenceEngine, MlpEngine, ObservationBuilder, ObservationLayout, OnnxEngine,
    PolicyAdapter, PolicyBinding,
};

pub use session::{ControlSession, LoopSettings, LoopState, SessionReport, SessionStatus, StopReason};

pub use telemetry::{TelemetryConfig, TelemetrySink};

pub use types::{
    ActuatorCommand, ActuatorGains, ActuatorId, JointState, Orientation, PolicyIndex,
    VelocityCommand,
};
