// src/rl/observation.rs
//
// Versioned observation schema for the walking policy.
//
// A layout is an ordered list of named segments. The builder fills segments
// strictly in layout order, so the position of every feature is a property of
// the layout value and can be asserted in tests instead of being spread over
// literal indices. Each layout id is tied to the checkpoint it was trained
// with; the Euler/phase and projected-gravity conventions are deliberately
// kept as separate layouts.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, InferenceError};
use crate::gait::GaitPhase;
use crate::types::{Orientation, VelocityCommand};

/// Current observation schema version.
/// Increment when adding/removing/changing segment kinds.
pub const OBS_VERSION: u32 = 1;

/// Reserved tail of the Euler/phase layout.
pub const EULER_PHASE_RESERVED: usize = 4;

/// History buffer length of the projected-gravity checkpoint.
pub const GRAVITY_HISTORY_LEN: usize = 570;

/// What a segment holds. Lengths are fixed per kind except for the
/// per-joint, history, and reserved kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    /// sin(2pi*phase), cos(2pi*phase).
    PhaseSinCos,
    /// x, y scaled by lin_vel; yaw scaled by ang_vel.
    VelocityCommand,
    CommandX,
    CommandY,
    CommandYaw,
    /// Seconds since the loop started.
    ElapsedSeconds,
    /// (position - default) per joint, policy order.
    JointPosition,
    JointVelocity,
    /// Previous raw actions, unscaled.
    PreviousActions,
    AngularVelocity,
    EulerOrientation,
    /// Gravity in the body frame with per-axis sign corrections.
    ProjectedGravity,
    History,
    Reserved,
}

impl SegmentKind {
    fn fixed_len(self) -> Option<usize> {
        match self {
            SegmentKind::PhaseSinCos => Some(2),
            SegmentKind::VelocityCommand => Some(3),
            SegmentKind::CommandX | SegmentKind::CommandY | SegmentKind::CommandYaw => Some(1),
            SegmentKind::ElapsedSeconds => Some(1),
            SegmentKind::AngularVelocity
            | SegmentKind::EulerOrientation
            | SegmentKind::ProjectedGravity => Some(3),
            SegmentKind::JointPosition
            | SegmentKind::JointVelocity
            | SegmentKind::PreviousActions
            | SegmentKind::History
            | SegmentKind::Reserved => None,
        }
    }

    fn is_per_joint(self) -> bool {
        matches!(
            self,
            SegmentKind::JointPosition | SegmentKind::JointVelocity | SegmentKind::PreviousActions
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Model input name for named-input bindings.
    pub name: String,
    pub kind: SegmentKind,
    pub len: usize,
}

impl Segment {
    fn new(name: &str, kind: SegmentKind, len: usize) -> Self {
        Self {
            name: name.to_string(),
            kind,
            len,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservationLayout {
    pub id: String,
    pub obs_version: u32,
    pub num_joints: usize,
    pub segments: Vec<Segment>,
}

impl ObservationLayout {
    /// Flat layout with Euler orientation, 45 elements for ten joints.
    pub fn euler_phase_v1(num_joints: usize) -> Self {
        let n = num_joints;
        Self {
            id: "euler_phase_v1".to_string(),
            obs_version: OBS_VERSION,
            num_joints: n,
            segments: vec![
                Segment::new("phase", SegmentKind::PhaseSinCos, 2),
                Segment::new("command", SegmentKind::VelocityCommand, 3),
                Segment::new("dof_pos", SegmentKind::JointPosition, n),
                Segment::new("dof_vel", SegmentKind::JointVelocity, n),
                Segment::new("actions", SegmentKind::PreviousActions, n),
                Segment::new("ang_vel", SegmentKind::AngularVelocity, 3),
                Segment::new("euler", SegmentKind::EulerOrientation, 3),
                Segment::new("reserved", SegmentKind::Reserved, EULER_PHASE_RESERVED),
            ],
        }
    }

    /// Named-input layout with projected gravity and a recurrent buffer.
    pub fn projected_gravity_v1(num_joints: usize, history_len: usize) -> Self {
        let n = num_joints;
        Self {
            id: "projected_gravity_v1".to_string(),
            obs_version: OBS_VERSION,
            num_joints: n,
            segments: vec![
                Segment::new("x_vel.1", SegmentKind::CommandX, 1),
                Segment::new("y_vel.1", SegmentKind::CommandY, 1),
                Segment::new("rot.1", SegmentKind::CommandYaw, 1),
                Segment::new("t.1", SegmentKind::ElapsedSeconds, 1),
                Segment::new("dof_pos.1", SegmentKind::JointPosition, n),
                Segment::new("dof_vel.1", SegmentKind::JointVelocity, n),
                Segment::new("prev_actions.1", SegmentKind::PreviousActions, n),
                Segment::new("projected_gravity.1", SegmentKind::ProjectedGravity, 3),
                Segment::new("buffer.1", SegmentKind::History, history_len),
            ],
        }
    }

    /// Total vector length.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index range of the first segment of `kind`.
    pub fn range_of(&self, kind: SegmentKind) -> Option<Range<usize>> {
        let mut start = 0;
        for s in &self.segments {
            if s.kind == kind {
                return Some(start..start + s.len);
            }
            start += s.len;
        }
        None
    }

    /// Index range of the segment named `name`.
    pub fn range_of_name(&self, name: &str) -> Option<Range<usize>> {
        let mut start = 0;
        for s in &self.segments {
            if s.name == name {
                return Some(start..start + s.len);
            }
            start += s.len;
        }
        None
    }

    pub fn history_len(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.kind == SegmentKind::History)
            .map(|s| s.len)
            .sum()
    }

    /// Check segment lengths and uniqueness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let err = |reason: String| ConfigError::Layout {
            layout: self.id.clone(),
            reason,
        };
        let mut names = std::collections::HashSet::new();
        for s in &self.segments {
            if !names.insert(s.name.as_str()) {
                return Err(err(format!("duplicate segment name {:?}", s.name)));
            }
            if let Some(expected) = s.kind.fixed_len() {
                if s.len != expected {
                    return Err(err(format!(
                        "segment {:?} has length {}, expected {expected}",
                        s.name, s.len
                    )));
                }
            }
            if s.kind.is_per_joint() && s.len != self.num_joints {
                return Err(err(format!(
                    "segment {:?} has length {}, expected one per joint ({})",
                    s.name, s.len, self.num_joints
                )));
            }
        }
        if self.segments.iter().filter(|s| s.kind == SegmentKind::History).count() > 1 {
            return Err(err("more than one history segment".to_string()));
        }
        if self.is_empty() {
            return Err(err("layout is empty".to_string()));
        }
        Ok(())
    }
}

/// Per-feature scale factors. Commands x/y use `lin_vel`, yaw uses `ang_vel`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObsScales {
    pub lin_vel: f64,
    pub ang_vel: f64,
    pub dof_pos: f64,
    pub dof_vel: f64,
    pub orientation: f64,
}

impl ObsScales {
    pub fn unit() -> Self {
        Self {
            lin_vel: 1.0,
            ang_vel: 1.0,
            dof_pos: 1.0,
            dof_vel: 1.0,
            orientation: 1.0,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, v) in [
            ("obs_scales.lin_vel", self.lin_vel),
            ("obs_scales.ang_vel", self.ang_vel),
            ("obs_scales.dof_pos", self.dof_pos),
            ("obs_scales.dof_vel", self.dof_vel),
            ("obs_scales.orientation", self.orientation),
        ] {
            if !v.is_finite() {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: format!("must be finite, got {v}"),
                });
            }
        }
        Ok(())
    }
}

impl Default for ObsScales {
    fn default() -> Self {
        Self::unit()
    }
}

/// Everything the builder reads for one tick. Joint vectors are in policy
/// order and policy units (radians, rad/s).
#[derive(Debug, Clone, Copy)]
pub struct ObservationInputs<'a> {
    pub phase: GaitPhase,
    pub elapsed_s: f64,
    pub command: VelocityCommand,
    pub joint_pos: &'a [f64],
    pub joint_vel: &'a [f64],
    pub previous_actions: &'a [f64],
    /// Body angular velocity, rad/s.
    pub angular_velocity: [f64; 3],
    pub orientation: Orientation,
    pub history: &'a [f32],
}

/// Assembled observation; immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObservationVector {
    layout_id: String,
    values: Vec<f32>,
}

impl ObservationVector {
    pub fn layout_id(&self) -> &str {
        &self.layout_id
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ObservationBuilder {
    layout: ObservationLayout,
    scales: ObsScales,
    /// Subtracted from joint positions, policy order, radians.
    default_pose: Vec<f64>,
    /// Applied to projected gravity per axis.
    gravity_signs: [f64; 3],
}

impl ObservationBuilder {
    pub fn new(
        layout: ObservationLayout,
        scales: ObsScales,
        default_pose: Vec<f64>,
        gravity_signs: [f64; 3],
    ) -> Result<Self, ConfigError> {
        layout.validate()?;
        scales.validate()?;
        if default_pose.len() != layout.num_joints {
            return Err(ConfigError::InvalidValue {
                field: "default_position".to_string(),
                reason: format!(
                    "has {} entries, layout {} expects {}",
                    default_pose.len(),
                    layout.id,
                    layout.num_joints
                ),
            });
        }
        Ok(Self {
            layout,
            scales,
            default_pose,
            gravity_signs,
        })
    }

    pub fn layout(&self) -> &ObservationLayout {
        &self.layout
    }

    pub fn default_pose(&self) -> &[f64] {
        &self.default_pose
    }

    pub fn build(&self, inputs: &ObservationInputs<'_>) -> Result<ObservationVector, InferenceError> {
        let n = self.layout.num_joints;
        check_len("joint_pos", inputs.joint_pos.len(), n)?;
        check_len("joint_vel", inputs.joint_vel.len(), n)?;
        check_len("previous_actions", inputs.previous_actions.len(), n)?;

        let s = &self.scales;
        let mut values: Vec<f32> = Vec::with_capacity(self.layout.len());

        for seg in &self.layout.segments {
            let before = values.len();
            match seg.kind {
                SegmentKind::PhaseSinCos => {
                    let [sin, cos] = inputs.phase.features();
                    push(&mut values, [sin, cos]);
                }
                SegmentKind::VelocityCommand => push(
                    &mut values,
                    [
                        inputs.command.x * s.lin_vel,
                        inputs.command.y * s.lin_vel,
                        inputs.command.yaw * s.ang_vel,
                    ],
                ),
                SegmentKind::CommandX => push(&mut values, [inputs.command.x * s.lin_vel]),
                SegmentKind::CommandY => push(&mut values, [inputs.command.y * s.lin_vel]),
                SegmentKind::CommandYaw => push(&mut values, [inputs.command.yaw * s.ang_vel]),
                SegmentKind::ElapsedSeconds => push(&mut values, [inputs.elapsed_s]),
                SegmentKind::JointPosition => push(
                    &mut values,
                    inputs
                        .joint_pos
                        .iter()
                        .zip(&self.default_pose)
                        .map(|(p, d)| (p - d) * s.dof_pos),
                ),
                SegmentKind::JointVelocity => {
                    push(&mut values, inputs.joint_vel.iter().map(|v| v * s.dof_vel))
                }
                SegmentKind::PreviousActions => {
                    push(&mut values, inputs.previous_actions.iter().copied())
                }
                SegmentKind::AngularVelocity => push(
                    &mut values,
                    inputs.angular_velocity.iter().map(|w| w * s.ang_vel),
                ),
                SegmentKind::EulerOrientation => push(
                    &mut values,
                    inputs
                        .orientation
                        .euler_rad()
                        .iter()
                        .map(|a| a * s.orientation),
                ),
                SegmentKind::ProjectedGravity => {
                    let g = inputs.orientation.projected_gravity();
                    push(
                        &mut values,
                        (0..3).map(|i| g[i] * self.gravity_signs[i] * s.orientation),
                    )
                }
                SegmentKind::History => {
                    check_len(&seg.name, inputs.history.len(), seg.len)?;
                    values.extend_from_slice(inputs.history);
                }
                SegmentKind::Reserved => values.extend(std::iter::repeat(0.0).take(seg.len)),
            }
            // Every segment must produce exactly its declared length.
            check_len(&seg.name, values.len() - before, seg.len)?;
        }

        Ok(ObservationVector {
            layout_id: self.layout.id.clone(),
            values,
        })
    }
}

fn push<I: IntoIterator<Item = f64>>(out: &mut Vec<f32>, it: I) {
    out.extend(it.into_iter().map(|v| v as f32));
}

fn check_len(name: &str, actual: usize, expected: usize) -> Result<(), InferenceError> {
    if actual != expected {
        return Err(InferenceError::ShapeMismatch {
            name: name.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}
