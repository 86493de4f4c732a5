// src/config.rs
//
// Central configuration for the walking controller.
//
// A Config starts from a per-variant preset (the constants each checkpoint
// was trained with), is optionally overlaid by a YAML file, then by
// WALKCTL_* environment variables, and finally by CLI flags in the binary.
// `validate` runs once before anything talks to the robot.

use std::env;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::actuator_map::{ActuatorMap, ActuatorTable};
use crate::error::ConfigError;
use crate::loop_scheduler::{run_duration, tick_period, MAX_FREQUENCY_HZ, MIN_FREQUENCY_HZ};
use crate::rl::observation::{ObsScales, ObservationLayout, GRAVITY_HISTORY_LEN};
use crate::rl::policy::PolicyBinding;
use crate::types::VelocityCommand;

/// Which trained policy family the session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyVariant {
    /// Flat 45-element observation with gait phase and Euler orientation.
    EulerPhase,
    /// Named-input observation with projected gravity and a history buffer.
    ProjectedGravity,
}

impl PolicyVariant {
    /// Stable lowercase name (logs/telemetry).
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyVariant::EulerPhase => "euler_phase",
            PolicyVariant::ProjectedGravity => "projected_gravity",
        }
    }

    /// Case-insensitive; None if unrecognized.
    pub fn parse(s: &str) -> Option<PolicyVariant> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "euler_phase" | "euler" | "phase" => Some(PolicyVariant::EulerPhase),
            "projected_gravity" | "gravity" | "pg" => Some(PolicyVariant::ProjectedGravity),
            _ => None,
        }
    }
}

/// Where the effective variant came from.
///
/// Precedence (highest to lowest): CLI, WALKCTL_VARIANT, config file, default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantSource {
    Cli,
    Env,
    File,
    Default,
}

impl VariantSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariantSource::Cli => "cli",
            VariantSource::Env => "env",
            VariantSource::File => "file",
            VariantSource::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EffectiveVariant {
    pub variant: PolicyVariant,
    pub source: VariantSource,
}

impl EffectiveVariant {
    pub fn log_startup(&self) {
        info!(
            variant = self.variant.as_str(),
            source = self.source.as_str(),
            "effective policy variant"
        );
    }
}

/// Resolve the effective variant using standard precedence rules.
pub fn resolve_effective_variant(
    cli_variant: Option<PolicyVariant>,
    file_variant: Option<PolicyVariant>,
) -> EffectiveVariant {
    if let Some(variant) = cli_variant {
        return EffectiveVariant {
            variant,
            source: VariantSource::Cli,
        };
    }

    if let Ok(raw) = env::var("WALKCTL_VARIANT") {
        if !raw.is_empty() {
            if let Some(variant) = PolicyVariant::parse(&raw) {
                return EffectiveVariant {
                    variant,
                    source: VariantSource::Env,
                };
            }
            warn!(value = %raw, "invalid WALKCTL_VARIANT; ignoring");
        }
    }

    if let Some(variant) = file_variant {
        return EffectiveVariant {
            variant,
            source: VariantSource::File,
        };
    }

    EffectiveVariant {
        variant: PolicyVariant::EulerPhase,
        source: VariantSource::Default,
    }
}

/// How policy actions become joint targets (policy convention).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionMode {
    /// target = action + default_position
    OffsetFromDefault,
    /// target = current position + action
    DeltaFromCurrent,
}

/// Optional velocity/torque fields attached to every actuator command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandDefaults {
    #[serde(default)]
    pub velocity: Option<f64>,
    #[serde(default)]
    pub torque: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub variant: PolicyVariant,
    /// Control loop rate.
    pub frequency_hz: f64,
    /// Gait phase advance per second (radians).
    pub walk_speed: f64,
    pub command: VelocityCommand,
    /// Stop after this many seconds; None runs until cancelled.
    pub run_seconds: Option<f64>,
    pub model_path: Option<PathBuf>,
    pub obs_scales: ObsScales,
    /// Policy order, radians.
    pub default_position: Vec<f64>,
    /// Per-axis sign applied to projected gravity.
    pub gravity_axis_signs: [f64; 3],
    /// Use the pose captured while configuring as the zero reference.
    pub use_source_offsets: bool,
    pub action_mode: ActionMode,
    pub command_defaults: CommandDefaults,
    /// History buffer length for layouts that carry one.
    pub history_len: usize,
    pub binding: PolicyBinding,
    pub actuators: ActuatorTable,
}

impl Config {
    /// Preset matching the constants the given checkpoint family was
    /// trained and deployed with.
    pub fn for_variant(variant: PolicyVariant) -> Result<Self, ConfigError> {
        let cfg = match variant {
            PolicyVariant::EulerPhase => Config {
                variant,
                frequency_hz: 20.0,
                walk_speed: 0.1,
                command: VelocityCommand::default(),
                run_seconds: None,
                model_path: None,
                obs_scales: ObsScales {
                    lin_vel: 2.0,
                    ang_vel: 1.0,
                    dof_pos: 1.0,
                    dof_vel: 0.05,
                    orientation: 1.0,
                },
                default_position: vec![0.0; 10],
                gravity_axis_signs: [1.0, 1.0, 1.0],
                use_source_offsets: true,
                action_mode: ActionMode::DeltaFromCurrent,
                command_defaults: CommandDefaults {
                    velocity: Some(20.0),
                    torque: Some(0.1),
                },
                history_len: 0,
                binding: PolicyBinding::flat(),
                actuators: ActuatorMap::kbot_legs_euler()?.to_table(),
            },
            PolicyVariant::ProjectedGravity => Config {
                variant,
                frequency_hz: 50.0,
                walk_speed: 0.0,
                command: VelocityCommand::new(1.0, 0.0, 0.0),
                run_seconds: None,
                model_path: None,
                obs_scales: ObsScales::unit(),
                default_position: vec![0.23, 0.0, 0.0, 0.441, -0.195, -0.23, 0.0, 0.0, -0.441, 0.195],
                gravity_axis_signs: [-1.0, -1.0, 1.0],
                use_source_offsets: false,
                action_mode: ActionMode::OffsetFromDefault,
                command_defaults: CommandDefaults::default(),
                history_len: GRAVITY_HISTORY_LEN,
                binding: PolicyBinding::gravity_named(),
                actuators: ActuatorMap::kbot_legs_gravity()?.to_table(),
            },
        };
        Ok(cfg)
    }

    /// Preset plus WALKCTL_* env overrides.
    ///
    /// Supported env vars:
    ///   - WALKCTL_FREQUENCY_HZ   (f64, Hz)
    ///   - WALKCTL_WALK_SPEED     (f64, rad/s of phase)
    ///   - WALKCTL_CMD_X          (f64, m/s)
    ///   - WALKCTL_CMD_Y          (f64, m/s)
    ///   - WALKCTL_CMD_YAW        (f64, rad/s)
    ///   - WALKCTL_RUN_SECONDS    (f64, s)
    ///   - WALKCTL_MODEL_PATH     (path)
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env_or_variant(variant: PolicyVariant) -> Result<Self, ConfigError> {
        let mut cfg = Self::for_variant(variant)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        env_f64("WALKCTL_FREQUENCY_HZ", &mut self.frequency_hz);
        env_f64("WALKCTL_WALK_SPEED", &mut self.walk_speed);
        env_f64("WALKCTL_CMD_X", &mut self.command.x);
        env_f64("WALKCTL_CMD_Y", &mut self.command.y);
        env_f64("WALKCTL_CMD_YAW", &mut self.command.yaw);

        if let Ok(raw) = env::var("WALKCTL_RUN_SECONDS") {
            match raw.trim().parse::<f64>() {
                Ok(v) => {
                    info!(var = "WALKCTL_RUN_SECONDS", value = v, "overrode default");
                    self.run_seconds = Some(v);
                }
                Err(_) => warn!(
                    var = "WALKCTL_RUN_SECONDS",
                    value = %raw,
                    "could not parse as f64; keeping {:?}",
                    self.run_seconds
                ),
            }
        }

        if let Ok(raw) = env::var("WALKCTL_MODEL_PATH") {
            if !raw.trim().is_empty() {
                info!(var = "WALKCTL_MODEL_PATH", value = %raw, "overrode default");
                self.model_path = Some(PathBuf::from(raw.trim()));
            }
        }
    }

    /// Overlay a YAML document onto this config. Keys that are absent keep
    /// their current value; `variant` is read by the caller, not here.
    pub fn apply_yaml_str(&mut self, yaml: &str) -> Result<(), ConfigError> {
        let overlay: ConfigOverlay = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
            what: "config yaml".to_string(),
            reason: e.to_string(),
        })?;
        overlay.apply(self);
        Ok(())
    }

    pub fn apply_yaml_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let yaml = read_config_file(path)?;
        self.apply_yaml_str(&yaml)
    }

    pub fn actuator_map(&self) -> Result<ActuatorMap, ConfigError> {
        ActuatorMap::from_table(self.actuators.clone())
    }

    /// Observation layout for this variant and actuator count.
    pub fn layout(&self) -> Result<ObservationLayout, ConfigError> {
        let n = self.actuators.actuators.len();
        let layout = match self.variant {
            PolicyVariant::EulerPhase => ObservationLayout::euler_phase_v1(n),
            PolicyVariant::ProjectedGravity => {
                ObservationLayout::projected_gravity_v1(n, self.history_len)
            }
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Fail fast on anything the control loop would choke on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let map = self.actuator_map()?;
        if tick_period(self.frequency_hz).is_none() {
            return Err(invalid(
                "frequency_hz",
                format!(
                    "must be within [{MIN_FREQUENCY_HZ}, {MAX_FREQUENCY_HZ}], got {}",
                    self.frequency_hz
                ),
            ));
        }
        if !self.walk_speed.is_finite() {
            return Err(invalid("walk_speed", "must be finite".to_string()));
        }
        for (field, v) in [
            ("command.x", self.command.x),
            ("command.y", self.command.y),
            ("command.yaw", self.command.yaw),
        ] {
            if !v.is_finite() {
                return Err(invalid(field, format!("must be finite, got {v}")));
            }
        }
        if let Some(s) = self.run_seconds {
            if run_duration(s).is_none() {
                return Err(invalid(
                    "run_seconds",
                    format!("must be > 0 and representable as a duration, got {s}"),
                ));
            }
        }
        self.obs_scales.validate()?;
        if self.default_position.len() != map.len() {
            return Err(invalid(
                "default_position",
                format!(
                    "has {} entries but the actuator map has {}",
                    self.default_position.len(),
                    map.len()
                ),
            ));
        }
        if self.default_position.iter().any(|v| !v.is_finite()) {
            return Err(invalid("default_position", "must be finite".to_string()));
        }
        if self.gravity_axis_signs.iter().any(|s| s.abs() != 1.0) {
            return Err(invalid(
                "gravity_axis_signs",
                format!("entries must be +1 or -1, got {:?}", self.gravity_axis_signs),
            ));
        }
        for (field, v) in [
            ("command_defaults.velocity", self.command_defaults.velocity),
            ("command_defaults.torque", self.command_defaults.torque),
        ] {
            if let Some(v) = v {
                if !(v.is_finite() && v >= 0.0) {
                    return Err(invalid(field, format!("must be finite and >= 0, got {v}")));
                }
            }
        }
        self.layout()?;
        Ok(())
    }

    /// Stable hash of the full config, printed in the run header.
    pub fn config_hash(&self) -> u64 {
        fnv1a64(&format!("{self:?}"))
    }
}

/// YAML overlay: every field optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigOverlay {
    #[serde(default)]
    variant: Option<PolicyVariant>,
    frequency_hz: Option<f64>,
    walk_speed: Option<f64>,
    command: Option<VelocityCommand>,
    run_seconds: Option<f64>,
    model_path: Option<PathBuf>,
    obs_scales: Option<ObsScales>,
    default_position: Option<Vec<f64>>,
    gravity_axis_signs: Option<[f64; 3]>,
    use_source_offsets: Option<bool>,
    action_mode: Option<ActionMode>,
    command_defaults: Option<CommandDefaults>,
    history_len: Option<usize>,
    binding: Option<PolicyBinding>,
    actuators: Option<ActuatorTable>,
}

impl ConfigOverlay {
    fn apply(self, cfg: &mut Config) {
        macro_rules! overlay {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = self.$field { cfg.$field = v; })*
            };
        }
        overlay!(
            frequency_hz,
            walk_speed,
            command,
            obs_scales,
            default_position,
            gravity_axis_signs,
            use_source_offsets,
            action_mode,
            command_defaults,
            history_len,
            binding,
            actuators,
        );
        if self.run_seconds.is_some() {
            cfg.run_seconds = self.run_seconds;
        }
        if self.model_path.is_some() {
            cfg.model_path = self.model_path;
        }
    }
}

/// Variant named in a YAML config file, if any.
pub fn variant_from_yaml_str(yaml: &str) -> Result<Option<PolicyVariant>, ConfigError> {
    let overlay: ConfigOverlay = serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
        what: "config yaml".to_string(),
        reason: e.to_string(),
    })?;
    Ok(overlay.variant)
}

pub fn read_config_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn env_f64(var: &'static str, slot: &mut f64) {
    let Ok(raw) = env::var(var) else {
        return;
    };
    match raw.trim().parse::<f64>() {
        Ok(v) => {
            *slot = v;
            info!(var, value = v, "overrode default");
        }
        Err(_) => warn!(var, value = %raw, "could not parse as f64; using default {}", slot),
    }
}

fn invalid(field: &str, reason: String) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason,
    }
}

pub fn fnv1a64(s: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut h = FNV_OFFSET;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(FNV_PRIME);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_parse_roundtrip() {
        for v in [PolicyVariant::EulerPhase, PolicyVariant::ProjectedGravity] {
            assert_eq!(PolicyVariant::parse(v.as_str()), Some(v));
        }
        assert_eq!(PolicyVariant::parse(" Gravity "), Some(PolicyVariant::ProjectedGravity));
        assert_eq!(PolicyVariant::parse("euler-phase"), Some(PolicyVariant::EulerPhase));
        assert_eq!(PolicyVariant::parse("walk"), None);
    }

    #[test]
    fn presets_validate() {
        for v in [PolicyVariant::EulerPhase, PolicyVariant::ProjectedGravity] {
            let cfg = Config::for_variant(v).unwrap();
            cfg.validate().unwrap();
        }
        let g = Config::for_variant(PolicyVariant::ProjectedGravity).unwrap();
        assert_eq!(g.layout().unwrap().history_len(), GRAVITY_HISTORY_LEN);
        let e = Config::for_variant(PolicyVariant::EulerPhase).unwrap();
        assert_eq!(e.layout().unwrap().len(), 45);
    }

    #[test]
    fn yaml_overlay_keeps_unspecified_fields() {
        let mut cfg = Config::for_variant(PolicyVariant::EulerPhase).unwrap();
        cfg.apply_yaml_str(
            "frequency_hz: 40\ncommand: { x: 0.3 }\nobs_scales: { lin_vel: 1.0, ang_vel: 0.5, dof_pos: 1.0, dof_vel: 0.1, orientation: 1.0 }\n",
        )
        .unwrap();
        assert_eq!(cfg.frequency_hz, 40.0);
        assert_eq!(cfg.command, VelocityCommand::new(0.3, 0.0, 0.0));
        assert_eq!(cfg.obs_scales.ang_vel, 0.5);
        assert_eq!(cfg.walk_speed, 0.1);
        assert_eq!(cfg.actuators.actuators.len(), 10);
    }

    #[test]
    fn yaml_rejects_unknown_keys() {
        let mut cfg = Config::for_variant(PolicyVariant::EulerPhase).unwrap();
        assert!(matches!(
            cfg.apply_yaml_str("frequency: 40\n"),
            Err(ConfigError::Parse { .. })
        ));
        assert_eq!(
            variant_from_yaml_str("variant: projected_gravity\n").unwrap(),
            Some(PolicyVariant::ProjectedGravity)
        );
    }

    #[test]
    fn validate_catches_bad_values() {
        let base = Config::for_variant(PolicyVariant::ProjectedGravity).unwrap();

        let mut cfg = base.clone();
        cfg.frequency_hz = 0.0;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue { field, .. }) if field == "frequency_hz"));

        // Positive but too slow for a Duration period.
        let mut cfg = base.clone();
        cfg.frequency_hz = 1e-30;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue { field, .. }) if field == "frequency_hz"));

        let mut cfg = base.clone();
        cfg.run_seconds = Some(1e30);
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue { field, .. }) if field == "run_seconds"));

        let mut cfg = base.clone();
        cfg.default_position.pop();
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue { field, .. }) if field == "default_position"));

        let mut cfg = base.clone();
        cfg.obs_scales.dof_vel = f64::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = base.clone();
        cfg.gravity_axis_signs = [0.5, 1.0, 1.0];
        assert!(cfg.validate().is_err());

        let mut cfg = base;
        cfg.actuators.actuators[3].policy_index = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::PolicyIndexLayout { .. })));
    }

    #[test]
    fn config_hash_tracks_content() {
        let a = Config::for_variant(PolicyVariant::EulerPhase).unwrap();
        let mut b = a.clone();
        assert_eq!(a.config_hash(), b.config_hash());
        b.walk_speed = 0.2;
        assert_ne!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn fnv_known_vector() {
        assert_eq!(fnv1a64(""), 0xcbf29ce484222325);
        assert_eq!(fnv1a64("a"), 0xaf63dc4c8601ec8c);
    }
}
