// src/types.rs
//
// Common shared types for the walking controller: actuator identifiers,
// per-tick joint/IMU readings, and the command batch sent back to the robot.

use nalgebra::{Quaternion, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Physical actuator identifier as numbered on the robot bus (e.g. 31, 45).
pub type ActuatorId = u32;

/// Position of an actuator inside the policy's input/output vectors.
pub type PolicyIndex = usize;

/// One actuator reading produced by the robot service once per tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JointState {
    pub physical_id: ActuatorId,
    pub position_deg: f64,
    pub velocity_deg_per_s: f64,
}

/// Gain / torque configuration pushed to an actuator while configuring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActuatorGains {
    pub kp: f64,
    pub kd: f64,
    pub max_torque: f64,
}

/// Single actuator command in physical convention.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActuatorCommand {
    pub physical_id: ActuatorId,
    pub position_deg: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub velocity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub torque: Option<f64>,
}

/// Body orientation as reported by the IMU.
///
/// Quaternion components follow the scalar-last (x, y, z, w) convention of the
/// robot service; Euler angles are in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Orientation {
    Quaternion { x: f64, y: f64, z: f64, w: f64 },
    EulerDeg { roll: f64, pitch: f64, yaw: f64 },
}

impl Orientation {
    pub fn identity() -> Self {
        Orientation::Quaternion {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            w: 1.0,
        }
    }

    /// Rotation from body frame to world frame.
    pub fn rotation(&self) -> UnitQuaternion<f64> {
        match *self {
            Orientation::Quaternion { x, y, z, w } => {
                UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z))
            }
            Orientation::EulerDeg { roll, pitch, yaw } => UnitQuaternion::from_euler_angles(
                roll.to_radians(),
                pitch.to_radians(),
                yaw.to_radians(),
            ),
        }
    }

    /// Roll, pitch, yaw in radians.
    pub fn euler_rad(&self) -> [f64; 3] {
        match *self {
            Orientation::EulerDeg { roll, pitch, yaw } => {
                [roll.to_radians(), pitch.to_radians(), yaw.to_radians()]
            }
            Orientation::Quaternion { .. } => {
                let (r, p, y) = self.rotation().euler_angles();
                [r, p, y]
            }
        }
    }

    /// World gravity direction (0, 0, -1) expressed in the body frame.
    pub fn projected_gravity(&self) -> [f64; 3] {
        let g = self
            .rotation()
            .inverse_transform_vector(&Vector3::new(0.0, 0.0, -1.0));
        [g.x, g.y, g.z]
    }
}

/// Desired base velocity the policy should track.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VelocityCommand {
    /// Forward velocity (m/s).
    #[serde(default)]
    pub x: f64,
    /// Lateral velocity (m/s).
    #[serde(default)]
    pub y: f64,
    /// Yaw rate (rad/s).
    #[serde(default)]
    pub yaw: f64,
}

impl VelocityCommand {
    pub fn new(x: f64, y: f64, yaw: f64) -> Self {
        Self { x, y, yaw }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn upright_gravity_points_down() {
        let g = Orientation::identity().projected_gravity();
        assert_relative_eq!(g[0], 0.0, epsilon = 1e-12);
        assert_relative_eq!(g[1], 0.0, epsilon = 1e-12);
        assert_relative_eq!(g[2], -1.0, epsilon = 1e-12);
    }

    #[test]
    fn pitched_body_sees_gravity_along_x() {
        let o = Orientation::EulerDeg {
            roll: 0.0,
            pitch: 90.0,
            yaw: 0.0,
        };
        let g = o.projected_gravity();
        // Pitching nose-down by 90 degrees puts world -z along body +x.
        assert_relative_eq!(g[0].abs(), 1.0, epsilon = 1e-9);
        assert_relative_eq!(g[2], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn quaternion_euler_roundtrip() {
        let e = Orientation::EulerDeg {
            roll: 10.0,
            pitch: -5.0,
            yaw: 30.0,
        };
        let q = e.rotation();
        let as_quat = Orientation::Quaternion {
            x: q.i,
            y: q.j,
            z: q.k,
            w: q.w,
        };
        let a = e.euler_rad();
        let b = as_quat.euler_rad();
        for i in 0..3 {
            assert_relative_eq!(a[i], b[i], epsilon = 1e-9);
        }
    }
}
