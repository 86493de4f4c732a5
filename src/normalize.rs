// src/normalize.rs
//
// Conversions between the physical actuator convention (degrees, device
// zero offsets, mirrored sign per side) and the policy convention (radians
// relative to the captured source pose).
//
// Both directions wrap degrees into (-180, 180] with a Euclidean modulo, so
// inputs many turns away from zero still land in the canonical range.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::actuator_map::ActuatorMap;
use crate::error::{ConfigError, RobotIoError};
use crate::types::{ActuatorId, JointState, PolicyIndex};

/// Wrap an angle in degrees into (-180, 180].
pub fn wrap_degrees(deg: f64) -> f64 {
    let r = deg.rem_euclid(360.0);
    if r > 180.0 {
        r - 360.0
    } else {
        r
    }
}

/// Joint positions captured at session start; the zero reference for all
/// later relative motion. Immutable once captured.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourcePose {
    positions_deg: BTreeMap<ActuatorId, f64>,
}

impl SourcePose {
    pub fn from_states(states: &[JointState]) -> Self {
        Self {
            positions_deg: states
                .iter()
                .map(|s| (s.physical_id, s.position_deg))
                .collect(),
        }
    }

    /// All-zero pose for the given actuators (no offsets).
    pub fn zeros(ids: &[ActuatorId]) -> Self {
        Self {
            positions_deg: ids.iter().map(|&id| (id, 0.0)).collect(),
        }
    }

    pub fn get(&self, id: ActuatorId) -> Option<f64> {
        self.positions_deg.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.positions_deg.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions_deg.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ActuatorId, f64)> + '_ {
        self.positions_deg.iter().map(|(&id, &p)| (id, p))
    }
}

#[derive(Debug, Clone, Copy)]
struct Channel {
    physical_id: ActuatorId,
    sign: f64,
    offset_deg: f64,
}

/// Per-actuator sign/offset conversion, indexed both ways.
#[derive(Debug, Clone)]
pub struct CoordinateNormalizer {
    /// Indexed by policy index.
    channels: Vec<Channel>,
    index_of: BTreeMap<ActuatorId, PolicyIndex>,
}

impl CoordinateNormalizer {
    /// Build from the actuator map and a captured pose.
    ///
    /// With `use_offsets = false` the pose is ignored and every offset is zero.
    /// Every policy actuator must be present in the pose when offsets are used.
    pub fn new(
        map: &ActuatorMap,
        pose: &SourcePose,
        use_offsets: bool,
    ) -> Result<Self, ConfigError> {
        let mut channels = Vec::with_capacity(map.len());
        let mut index_of = BTreeMap::new();
        for spec in map.specs() {
            let offset_deg = if use_offsets {
                pose.get(spec.physical_id)
                    .ok_or(ConfigError::MissingSourcePose(spec.physical_id))?
            } else {
                0.0
            };
            index_of.insert(spec.physical_id, spec.policy_index);
            channels.push(Channel {
                physical_id: spec.physical_id,
                sign: spec.sign,
                offset_deg,
            });
        }
        Ok(Self { channels, index_of })
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn channel_for(&self, physical_id: ActuatorId) -> Result<&Channel, ConfigError> {
        self.index_of
            .get(&physical_id)
            .map(|&idx| &self.channels[idx])
            .ok_or(ConfigError::UnknownActuator(physical_id))
    }

    pub fn physical_id(&self, policy_index: PolicyIndex) -> Option<ActuatorId> {
        self.channels.get(policy_index).map(|c| c.physical_id)
    }

    pub fn policy_index(&self, physical_id: ActuatorId) -> Result<PolicyIndex, ConfigError> {
        self.index_of
            .get(&physical_id)
            .copied()
            .ok_or(ConfigError::UnknownActuator(physical_id))
    }

    /// Physical degrees -> policy radians in (-pi, pi].
    pub fn to_policy(&self, physical_id: ActuatorId, position_deg: f64) -> Result<f64, ConfigError> {
        let ch = self.channel_for(physical_id)?;
        Ok(wrap_degrees(ch.sign * (position_deg - ch.offset_deg)).to_radians())
    }

    /// Policy radians -> physical degrees in (-180, 180].
    pub fn to_physical(&self, policy_index: PolicyIndex, radians: f64) -> Result<f64, ConfigError> {
        let ch = self.channels.get(policy_index).ok_or_else(|| ConfigError::InvalidValue {
            field: "policy_index".to_string(),
            reason: format!("{policy_index} is outside 0..{}", self.channels.len()),
        })?;
        Ok(wrap_degrees(ch.sign * radians.to_degrees() + ch.offset_deg))
    }

    /// Physical deg/s -> policy rad/s. Sign only; velocities carry no offset.
    pub fn velocity_to_policy(
        &self,
        physical_id: ActuatorId,
        velocity_deg_per_s: f64,
    ) -> Result<f64, ConfigError> {
        let ch = self.channel_for(physical_id)?;
        Ok((ch.sign * velocity_deg_per_s).to_radians())
    }

    /// Reorder a physical-order state reply into policy-order position and
    /// velocity vectors. Every policy actuator must be present in the reply
    /// with a finite position and velocity.
    pub fn states_to_policy(
        &self,
        states: &[JointState],
    ) -> Result<(Vec<f64>, Vec<f64>), RobotIoError> {
        let mut readings: Vec<Option<(f64, f64)>> = vec![None; self.channels.len()];
        for s in states {
            // Replies may include held actuators; only policy channels matter.
            let Some(&idx) = self.index_of.get(&s.physical_id) else {
                continue;
            };
            let invalid = |field| RobotIoError::InvalidReading {
                physical_id: s.physical_id,
                field,
            };
            if !s.position_deg.is_finite() {
                return Err(invalid("position"));
            }
            if !s.velocity_deg_per_s.is_finite() {
                return Err(invalid("velocity"));
            }
            let ch = &self.channels[idx];
            readings[idx] = Some((
                wrap_degrees(ch.sign * (s.position_deg - ch.offset_deg)).to_radians(),
                (ch.sign * s.velocity_deg_per_s).to_radians(),
            ));
        }
        let mut pos = Vec::with_capacity(readings.len());
        let mut vel = Vec::with_capacity(readings.len());
        for (ch, reading) in self.channels.iter().zip(readings) {
            let (p, v) = reading.ok_or(RobotIoError::MissingState(ch.physical_id))?;
            pos.push(p);
            vel.push(v);
        }
        Ok((pos, vel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator_map::ActuatorMap;
    use approx::assert_relative_eq;

    /// Smallest signed angular distance, degrees.
    fn ang_diff(a: f64, b: f64) -> f64 {
        wrap_degrees(a - b).abs()
    }

    fn euler_normalizer(offsets: bool) -> (ActuatorMap, CoordinateNormalizer) {
        let map = ActuatorMap::kbot_legs_euler().unwrap();
        let states: Vec<JointState> = map
            .all_ids()
            .into_iter()
            .map(|id| JointState {
                physical_id: id,
                position_deg: id as f64 * 1.5 - 40.0,
                velocity_deg_per_s: 0.0,
            })
            .collect();
        let pose = SourcePose::from_states(&states);
        let norm = CoordinateNormalizer::new(&map, &pose, offsets).unwrap();
        (map, norm)
    }

    #[test]
    fn wrap_is_canonical() {
        assert_eq!(wrap_degrees(0.0), 0.0);
        assert_eq!(wrap_degrees(180.0), 180.0);
        assert_eq!(wrap_degrees(-180.0), 180.0);
        assert_relative_eq!(wrap_degrees(370.0), 10.0, epsilon = 1e-9);
        assert_relative_eq!(wrap_degrees(-730.0), -10.0, epsilon = 1e-9);
        assert_relative_eq!(wrap_degrees(190.0), -170.0, epsilon = 1e-9);
        assert_relative_eq!(wrap_degrees(36_000.5), 0.5, epsilon = 1e-6);
    }

    #[test]
    fn roundtrip_within_canonical_range() {
        for offsets in [false, true] {
            let (map, norm) = euler_normalizer(offsets);
            for spec in map.specs() {
                let mut p = -179.5;
                while p <= 180.0 {
                    let rad = norm.to_policy(spec.physical_id, p).unwrap();
                    let back = norm.to_physical(spec.policy_index, rad).unwrap();
                    assert!(
                        ang_diff(back, p) < 1e-9,
                        "id {} p {p} back {back}",
                        spec.physical_id
                    );
                    p += 7.25;
                }
            }
        }
    }

    #[test]
    fn outputs_always_in_canonical_range() {
        let (map, norm) = euler_normalizer(true);
        for spec in map.specs() {
            for p in [-1e4, -730.0, -360.0, -180.0, 0.0, 180.0, 370.0, 1e4] {
                let rad = norm.to_policy(spec.physical_id, p).unwrap();
                assert!(rad > -std::f64::consts::PI - 1e-12 && rad <= std::f64::consts::PI + 1e-12);
                let deg = norm.to_physical(spec.policy_index, p.to_radians()).unwrap();
                assert!(deg > -180.0 && deg <= 180.0, "deg {deg}");
            }
        }
    }

    #[test]
    fn out_of_range_inputs_match_canonical_equivalent() {
        let (map, norm) = euler_normalizer(true);
        let id = map.spec_at(0).unwrap().physical_id;
        let a = norm.to_policy(id, 370.0).unwrap();
        let b = norm.to_policy(id, 10.0).unwrap();
        assert_relative_eq!(a, b, epsilon = 1e-9);
        let c = norm.to_policy(id, -730.0).unwrap();
        let d = norm.to_policy(id, -10.0).unwrap();
        assert_relative_eq!(c, d, epsilon = 1e-9);
    }

    #[test]
    fn left_leg_is_mirrored() {
        let (map, norm) = euler_normalizer(false);
        let right = map.physical_id("right_knee_pitch").unwrap();
        let left = map.physical_id("left_knee_pitch").unwrap();
        assert_relative_eq!(
            norm.to_policy(right, 30.0).unwrap(),
            30f64.to_radians(),
            epsilon = 1e-12
        );
        assert_relative_eq!(
            norm.to_policy(left, 30.0).unwrap(),
            -(30f64.to_radians()),
            epsilon = 1e-12
        );
        assert_relative_eq!(
            norm.velocity_to_policy(left, 90.0).unwrap(),
            -(90f64.to_radians()),
            epsilon = 1e-12
        );
    }

    #[test]
    fn source_pose_is_the_zero_reference() {
        let map = ActuatorMap::kbot_legs_euler().unwrap();
        let states: Vec<JointState> = map
            .all_ids()
            .into_iter()
            .map(|id| JointState {
                physical_id: id,
                position_deg: 25.0,
                velocity_deg_per_s: 0.0,
            })
            .collect();
        let pose = SourcePose::from_states(&states);
        let norm = CoordinateNormalizer::new(&map, &pose, true).unwrap();
        for spec in map.specs() {
            assert_relative_eq!(norm.to_policy(spec.physical_id, 25.0).unwrap(), 0.0);
            assert_relative_eq!(norm.to_physical(spec.policy_index, 0.0).unwrap(), 25.0);
        }
    }

    #[test]
    fn missing_pose_entry_is_a_config_error() {
        let map = ActuatorMap::kbot_legs_gravity().unwrap();
        let pose = SourcePose::zeros(&[31, 32]);
        assert!(matches!(
            CoordinateNormalizer::new(&map, &pose, true),
            Err(ConfigError::MissingSourcePose(33))
        ));
        // Offsets disabled: pose is not consulted.
        assert!(CoordinateNormalizer::new(&map, &pose, false).is_ok());
    }

    #[test]
    fn unknown_ids_fail_fast() {
        let (_, norm) = euler_normalizer(false);
        assert!(matches!(
            norm.to_policy(99, 0.0),
            Err(ConfigError::UnknownActuator(99))
        ));
        assert!(norm.to_physical(10, 0.0).is_err());
    }

    #[test]
    fn states_are_reordered_into_policy_order() {
        let (map, norm) = euler_normalizer(false);
        // Physical order, plus a held actuator that must be skipped.
        let mut states: Vec<JointState> = map
            .ids_in_physical_order()
            .into_iter()
            .map(|id| JointState {
                physical_id: id,
                position_deg: id as f64,
                velocity_deg_per_s: 0.0,
            })
            .collect();
        states.push(JointState {
            physical_id: 11,
            position_deg: 5.0,
            velocity_deg_per_s: 0.0,
        });
        let (pos, vel) = norm.states_to_policy(&states).unwrap();
        assert_eq!(pos.len(), 10);
        assert_eq!(vel, vec![0.0; 10]);
        // Policy index 0 is right_hip_pitch (43, sign +1).
        assert_relative_eq!(pos[0], 43f64.to_radians(), epsilon = 1e-12);
        // Policy index 1 is left_hip_pitch (33, sign -1).
        assert_relative_eq!(pos[1], -(33f64.to_radians()), epsilon = 1e-12);

        states.retain(|s| s.physical_id != 45);
        assert!(matches!(
            norm.states_to_policy(&states),
            Err(RobotIoError::MissingState(45))
        ));
    }

    #[test]
    fn non_finite_reading_is_rejected_before_it_reaches_the_policy() {
        let (map, norm) = euler_normalizer(false);
        let mut states: Vec<JointState> = map
            .ids_in_physical_order()
            .into_iter()
            .map(|id| JointState {
                physical_id: id,
                position_deg: 0.0,
                velocity_deg_per_s: 0.0,
            })
            .collect();

        // A held actuator's garbage is not our concern.
        states.push(JointState {
            physical_id: 11,
            position_deg: f64::NAN,
            velocity_deg_per_s: 0.0,
        });
        assert!(norm.states_to_policy(&states).is_ok());

        let i = states.iter().position(|s| s.physical_id == 44).unwrap();
        states[i].position_deg = f64::NAN;
        assert!(matches!(
            norm.states_to_policy(&states),
            Err(RobotIoError::InvalidReading {
                physical_id: 44,
                field: "position"
            })
        ));

        states[i].position_deg = 0.0;
        states[i].velocity_deg_per_s = f64::INFINITY;
        assert!(matches!(
            norm.states_to_policy(&states),
            Err(RobotIoError::InvalidReading {
                physical_id: 44,
                field: "velocity"
            })
        ));
    }
}
