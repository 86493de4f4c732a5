// src/actuator_map.rs
//
// Static actuator table: joint name <-> physical id <-> policy index.
//
// The table is validated once at construction and is immutable afterwards.
// Policy-controlled actuators carry a policy index and an explicit side sign;
// held actuators (arms while walking) are configured and included in the
// source pose but never commanded by the policy.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{ActuatorGains, ActuatorId, PolicyIndex};

/// One policy-controlled actuator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorSpec {
    pub physical_id: ActuatorId,
    pub policy_index: PolicyIndex,
    pub joint_name: String,
    pub proportional_gain: f64,
    pub derivative_gain: f64,
    pub max_torque: f64,
    /// +1 or -1; mirrors the joint axis of one limb group onto the other.
    #[serde(default = "default_sign")]
    pub sign: f64,
}

fn default_sign() -> f64 {
    1.0
}

impl ActuatorSpec {
    pub fn gains(&self) -> ActuatorGains {
        ActuatorGains {
            kp: self.proportional_gain,
            kd: self.derivative_gain,
            max_torque: self.max_torque,
        }
    }
}

/// Actuator that is configured and held, but not driven by the policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeldActuator {
    pub physical_id: ActuatorId,
    pub joint_name: String,
    pub proportional_gain: f64,
    pub derivative_gain: f64,
    pub max_torque: f64,
}

impl HeldActuator {
    pub fn gains(&self) -> ActuatorGains {
        ActuatorGains {
            kp: self.proportional_gain,
            kd: self.derivative_gain,
            max_torque: self.max_torque,
        }
    }
}

/// YAML form of an actuator table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActuatorTable {
    pub actuators: Vec<ActuatorSpec>,
    #[serde(default)]
    pub held: Vec<HeldActuator>,
}

#[derive(Debug, Clone)]
pub struct ActuatorMap {
    /// Sorted by policy index.
    specs: Vec<ActuatorSpec>,
    held: Vec<HeldActuator>,
    by_id: HashMap<ActuatorId, PolicyIndex>,
    by_name: HashMap<String, ActuatorId>,
}

impl ActuatorMap {
    /// Validate and build a map.
    pub fn new(specs: Vec<ActuatorSpec>, held: Vec<HeldActuator>) -> Result<Self, ConfigError> {
        let mut seen_ids = HashSet::new();
        let mut by_name = HashMap::new();

        for spec in &specs {
            if !seen_ids.insert(spec.physical_id) {
                return Err(ConfigError::DuplicateActuatorId(spec.physical_id));
            }
            if by_name
                .insert(spec.joint_name.clone(), spec.physical_id)
                .is_some()
            {
                return Err(ConfigError::DuplicateJointName(spec.joint_name.clone()));
            }
            if spec.sign != 1.0 && spec.sign != -1.0 {
                return Err(ConfigError::InvalidSign {
                    physical_id: spec.physical_id,
                    sign: spec.sign,
                });
            }
            check_gains(
                spec.physical_id,
                spec.proportional_gain,
                spec.derivative_gain,
                spec.max_torque,
            )?;
        }
        for h in &held {
            if !seen_ids.insert(h.physical_id) {
                return Err(ConfigError::DuplicateActuatorId(h.physical_id));
            }
            if by_name.insert(h.joint_name.clone(), h.physical_id).is_some() {
                return Err(ConfigError::DuplicateJointName(h.joint_name.clone()));
            }
            check_gains(h.physical_id, h.proportional_gain, h.derivative_gain, h.max_torque)?;
        }

        // Policy indices must be exactly {0, .., n-1}.
        let n = specs.len();
        let mut slots: Vec<Option<ActuatorSpec>> = vec![None; n];
        for spec in specs {
            let idx = spec.policy_index;
            if idx >= n {
                return Err(ConfigError::PolicyIndexLayout {
                    expected: n,
                    index: idx,
                    problem: "out of range",
                });
            }
            if slots[idx].is_some() {
                return Err(ConfigError::PolicyIndexLayout {
                    expected: n,
                    index: idx,
                    problem: "duplicated",
                });
            }
            slots[idx] = Some(spec);
        }
        let specs: Vec<ActuatorSpec> = slots.into_iter().flatten().collect();

        let by_id = specs
            .iter()
            .map(|s| (s.physical_id, s.policy_index))
            .collect();

        Ok(Self {
            specs,
            held,
            by_id,
            by_name,
        })
    }

    pub fn from_table(table: ActuatorTable) -> Result<Self, ConfigError> {
        Self::new(table.actuators, table.held)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let table: ActuatorTable =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse {
                what: "actuator table".to_string(),
                reason: e.to_string(),
            })?;
        Self::from_table(table)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn to_table(&self) -> ActuatorTable {
        ActuatorTable {
            actuators: self.specs.clone(),
            held: self.held.clone(),
        }
    }

    /// Number of policy-controlled actuators.
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Policy-controlled actuators in policy order.
    pub fn specs(&self) -> &[ActuatorSpec] {
        &self.specs
    }

    pub fn held(&self) -> &[HeldActuator] {
        &self.held
    }

    pub fn physical_id(&self, joint_name: &str) -> Result<ActuatorId, ConfigError> {
        self.by_name
            .get(joint_name)
            .copied()
            .ok_or_else(|| ConfigError::UnknownJoint(joint_name.to_string()))
    }

    pub fn policy_index(&self, physical_id: ActuatorId) -> Result<PolicyIndex, ConfigError> {
        self.by_id
            .get(&physical_id)
            .copied()
            .ok_or(ConfigError::UnknownActuator(physical_id))
    }

    pub fn spec_at(&self, policy_index: PolicyIndex) -> Option<&ActuatorSpec> {
        self.specs.get(policy_index)
    }

    pub fn spec_for(&self, physical_id: ActuatorId) -> Result<&ActuatorSpec, ConfigError> {
        let idx = self.policy_index(physical_id)?;
        Ok(&self.specs[idx])
    }

    pub fn ids_in_policy_order(&self) -> Vec<ActuatorId> {
        self.specs.iter().map(|s| s.physical_id).collect()
    }

    /// Policy ids sorted ascending.
    pub fn ids_in_physical_order(&self) -> Vec<ActuatorId> {
        let mut ids = self.ids_in_policy_order();
        ids.sort_unstable();
        ids
    }

    /// Every configured actuator (policy and held), sorted ascending.
    pub fn all_ids(&self) -> Vec<ActuatorId> {
        let mut ids: Vec<ActuatorId> = self
            .specs
            .iter()
            .map(|s| s.physical_id)
            .chain(self.held.iter().map(|h| h.physical_id))
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Gains for every configured actuator, keyed and ordered by id.
    pub fn all_gains(&self) -> BTreeMap<ActuatorId, ActuatorGains> {
        self.specs
            .iter()
            .map(|s| (s.physical_id, s.gains()))
            .chain(self.held.iter().map(|h| (h.physical_id, h.gains())))
            .collect()
    }

    /// Leg table for the projected-gravity policy: left leg then right leg.
    pub fn kbot_legs_gravity() -> Result<Self, ConfigError> {
        let rows: [(ActuatorId, &str, f64, f64); 10] = [
            (31, "left_hip_pitch_04", 300.0, 40.0),
            (32, "left_hip_roll_03", 120.0, 30.0),
            (33, "left_hip_yaw_03", 120.0, 30.0),
            (34, "left_knee_04", 300.0, 40.0),
            (35, "left_ankle_02", 40.0, 10.0),
            (41, "right_hip_pitch_04", 300.0, 40.0),
            (42, "right_hip_roll_03", 120.0, 30.0),
            (43, "right_hip_yaw_03", 120.0, 30.0),
            (44, "right_knee_04", 300.0, 40.0),
            (45, "right_ankle_02", 40.0, 10.0),
        ];
        let specs = rows
            .iter()
            .enumerate()
            .map(|(idx, &(id, name, kp, max_torque))| ActuatorSpec {
                physical_id: id,
                policy_index: idx,
                joint_name: name.to_string(),
                proportional_gain: kp,
                derivative_gain: 5.0,
                max_torque,
                sign: 1.0,
            })
            .collect();
        Self::new(specs, Vec::new())
    }

    /// Leg table for the Euler/phase policy, with arms held.
    ///
    /// Policy order interleaves right/left per joint. Right-leg actuators
    /// (4x ids) use sign +1 and left-leg actuators (3x ids) use -1.
    /// Torque limits are borrowed from the gravity table's per-actuator-size
    /// values; this policy ships no limits of its own.
    pub fn kbot_legs_euler() -> Result<Self, ConfigError> {
        let rows: [(ActuatorId, &str, f64); 10] = [
            (43, "right_hip_pitch", 40.0),
            (33, "left_hip_pitch", 40.0),
            (41, "right_hip_yaw", 30.0),
            (31, "left_hip_yaw", 30.0),
            (42, "right_hip_roll", 30.0),
            (32, "left_hip_roll", 30.0),
            (44, "right_knee_pitch", 40.0),
            (34, "left_knee_pitch", 40.0),
            (45, "right_ankle_pitch", 10.0),
            (35, "left_ankle_pitch", 10.0),
        ];
        let specs = rows
            .iter()
            .enumerate()
            .map(|(idx, &(id, name, max_torque))| ActuatorSpec {
                physical_id: id,
                policy_index: idx,
                joint_name: name.to_string(),
                proportional_gain: 20.0,
                derivative_gain: 0.5,
                max_torque,
                sign: if id / 10 == 4 { 1.0 } else { -1.0 },
            })
            .collect();
        let held = [
            (11, "left_shoulder_yaw"),
            (12, "left_shoulder_pitch"),
            (13, "left_elbow"),
            (21, "right_shoulder_yaw"),
            (22, "right_shoulder_pitch"),
            (23, "right_elbow"),
        ]
        .iter()
        .map(|&(id, name)| HeldActuator {
            physical_id: id,
            joint_name: name.to_string(),
            proportional_gain: 20.0,
            derivative_gain: 0.5,
            max_torque: 10.0,
        })
        .collect();
        Self::new(specs, held)
    }
}

fn check_gains(id: ActuatorId, kp: f64, kd: f64, max_torque: f64) -> Result<(), ConfigError> {
    for (field, value) in [
        ("proportional_gain", kp),
        ("derivative_gain", kd),
        ("max_torque", max_torque),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(ConfigError::InvalidGain {
                physical_id: id,
                field,
                value,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: ActuatorId, idx: PolicyIndex, name: &str) -> ActuatorSpec {
        ActuatorSpec {
            physical_id: id,
            policy_index: idx,
            joint_name: name.to_string(),
            proportional_gain: 10.0,
            derivative_gain: 1.0,
            max_torque: 5.0,
            sign: 1.0,
        }
    }

    fn assert_permutation(map: &ActuatorMap) {
        let mut idx: Vec<PolicyIndex> = map.specs().iter().map(|s| s.policy_index).collect();
        idx.sort_unstable();
        assert_eq!(idx, (0..map.len()).collect::<Vec<_>>());
    }

    #[test]
    fn builtin_tables_are_valid_permutations() {
        let g = ActuatorMap::kbot_legs_gravity().unwrap();
        let e = ActuatorMap::kbot_legs_euler().unwrap();
        assert_eq!(g.len(), 10);
        assert_eq!(e.len(), 10);
        assert_permutation(&g);
        assert_permutation(&e);
        assert_eq!(e.held().len(), 6);
        assert_eq!(e.all_ids().len(), 16);
    }

    #[test]
    fn lookups_by_name_and_id() {
        let map = ActuatorMap::kbot_legs_euler().unwrap();
        assert_eq!(map.physical_id("right_hip_pitch").unwrap(), 43);
        assert_eq!(map.policy_index(43).unwrap(), 0);
        assert_eq!(map.policy_index(35).unwrap(), 9);
        assert_eq!(map.spec_at(1).unwrap().physical_id, 33);
        // Held actuators are addressable by name but have no policy index.
        assert_eq!(map.physical_id("left_elbow").unwrap(), 13);
        assert!(matches!(
            map.policy_index(13),
            Err(ConfigError::UnknownActuator(13))
        ));
        assert!(matches!(
            map.physical_id("tail"),
            Err(ConfigError::UnknownJoint(_))
        ));
    }

    #[test]
    fn euler_table_signs_follow_leg_side() {
        let map = ActuatorMap::kbot_legs_euler().unwrap();
        for s in map.specs() {
            let expected = if s.physical_id >= 40 { 1.0 } else { -1.0 };
            assert_eq!(s.sign, expected, "actuator {}", s.physical_id);
        }
    }

    #[test]
    fn euler_torque_limits_match_gravity_table() {
        let euler = ActuatorMap::kbot_legs_euler().unwrap();
        let gravity = ActuatorMap::kbot_legs_gravity().unwrap();
        for s in euler.specs() {
            let g = gravity.spec_for(s.physical_id).unwrap();
            assert_eq!(s.max_torque, g.max_torque, "actuator {}", s.physical_id);
        }
    }

    #[test]
    fn physical_order_is_sorted() {
        let map = ActuatorMap::kbot_legs_euler().unwrap();
        assert_eq!(
            map.ids_in_physical_order(),
            vec![31, 32, 33, 34, 35, 41, 42, 43, 44, 45]
        );
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = ActuatorMap::new(vec![spec(1, 0, "a"), spec(1, 1, "b")], vec![]).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateActuatorId(1)));
    }

    #[test]
    fn rejects_held_id_colliding_with_policy_id() {
        let held = vec![HeldActuator {
            physical_id: 1,
            joint_name: "arm".to_string(),
            proportional_gain: 1.0,
            derivative_gain: 0.0,
            max_torque: 1.0,
        }];
        let err = ActuatorMap::new(vec![spec(1, 0, "a")], held).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateActuatorId(1)));
    }

    #[test]
    fn rejects_index_gap_and_duplicate_index() {
        let gap = ActuatorMap::new(vec![spec(1, 0, "a"), spec(2, 2, "b")], vec![]).unwrap_err();
        assert!(matches!(
            gap,
            ConfigError::PolicyIndexLayout { index: 2, .. }
        ));

        let dup = ActuatorMap::new(vec![spec(1, 0, "a"), spec(2, 0, "b")], vec![]).unwrap_err();
        assert!(matches!(
            dup,
            ConfigError::PolicyIndexLayout {
                problem: "duplicated",
                ..
            }
        ));
    }

    #[test]
    fn rejects_bad_sign_and_gain() {
        let mut s = spec(1, 0, "a");
        s.sign = 0.5;
        assert!(matches!(
            ActuatorMap::new(vec![s], vec![]),
            Err(ConfigError::InvalidSign { .. })
        ));

        let mut s = spec(1, 0, "a");
        s.max_torque = f64::NAN;
        assert!(matches!(
            ActuatorMap::new(vec![s], vec![]),
            Err(ConfigError::InvalidGain {
                field: "max_torque",
                ..
            })
        ));
    }

    #[test]
    fn specs_are_stored_in_policy_order() {
        let map = ActuatorMap::new(vec![spec(7, 1, "b"), spec(9, 0, "a")], vec![]).unwrap();
        assert_eq!(map.ids_in_policy_order(), vec![9, 7]);
    }

    #[test]
    fn yaml_table_parses_and_validates() {
        let yaml = r#"
actuators:
  - physical_id: 41
    policy_index: 1
    joint_name: right_hip
    proportional_gain: 50.0
    derivative_gain: 2.0
    max_torque: 20.0
  - physical_id: 31
    policy_index: 0
    joint_name: left_hip
    proportional_gain: 50.0
    derivative_gain: 2.0
    max_torque: 20.0
    sign: -1.0
held:
  - physical_id: 11
    joint_name: left_shoulder
    proportional_gain: 5.0
    derivative_gain: 0.1
    max_torque: 2.0
"#;
        let map = ActuatorMap::from_yaml_str(yaml).unwrap();
        assert_eq!(map.ids_in_policy_order(), vec![31, 41]);
        assert_eq!(map.spec_for(41).unwrap().sign, 1.0);
        assert_eq!(map.spec_for(31).unwrap().sign, -1.0);
        assert_eq!(map.all_ids(), vec![11, 31, 41]);

        let bad = "actuators:\n  - physical_id: 1\n";
        assert!(matches!(
            ActuatorMap::from_yaml_str(bad),
            Err(ConfigError::Parse { .. })
        ));
    }
}
