// src/io/sim.rs
//
// In-process simulated robot.
//
// Not a physics model. Each commanded position is tracked with a first-order
// lag so that the policy sees joints move; orientation and angular velocity
// are whatever the caller sets. The simulator records every configure and
// command call and can inject failures and per-read latency, which is what
// the session tests rely on.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::RobotIo;
use crate::error::RobotIoError;
use crate::types::{ActuatorCommand, ActuatorGains, ActuatorId, JointState, Orientation};

/// One recorded `configure` request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfigureCall {
    pub physical_id: ActuatorId,
    pub gains: ActuatorGains,
    pub torque_enabled: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct SimJoint {
    position_deg: f64,
    velocity_deg_per_s: f64,
    torque_enabled: bool,
}

#[derive(Debug, Default)]
struct SimState {
    joints: BTreeMap<ActuatorId, SimJoint>,
    orientation: Option<Orientation>,
    angular_velocity_deg: [f64; 3],
    configure_calls: Vec<ConfigureCall>,
    command_batches: Vec<Vec<ActuatorCommand>>,
    get_states_calls: u64,
    fail_get_states_at: Option<u64>,
    fail_command_at: Option<u64>,
    fail_configure: BTreeSet<ActuatorId>,
}

#[derive(Debug)]
pub struct SimRobot {
    state: Mutex<SimState>,
    read_latency: Duration,
    /// Fraction of the remaining error closed per command, in (0, 1].
    tracking_gain: f64,
    /// Nominal command interval used to derive joint velocities.
    step: Duration,
}

impl SimRobot {
    /// Simulated robot with the given actuators, all at 0 degrees.
    pub fn new(ids: impl IntoIterator<Item = ActuatorId>) -> Self {
        let joints = ids
            .into_iter()
            .map(|id| (id, SimJoint::default()))
            .collect();
        Self {
            state: Mutex::new(SimState {
                joints,
                ..SimState::default()
            }),
            read_latency: Duration::ZERO,
            tracking_gain: 0.5,
            step: Duration::from_millis(20),
        }
    }

    /// Set the starting position of one actuator.
    pub fn with_position(self, id: ActuatorId, position_deg: f64) -> Self {
        self.lock()
            .joints
            .entry(id)
            .or_default()
            .position_deg = position_deg;
        self
    }

    /// Latency applied to every read request.
    pub fn with_read_latency(mut self, latency: Duration) -> Self {
        self.read_latency = latency;
        self
    }

    pub fn with_tracking(mut self, gain: f64, step: Duration) -> Self {
        self.tracking_gain = gain.clamp(f64::EPSILON, 1.0);
        self.step = step;
        self
    }

    pub fn set_orientation(&self, orientation: Orientation) {
        self.lock().orientation = Some(orientation);
    }

    pub fn set_angular_velocity_deg(&self, w: [f64; 3]) {
        self.lock().angular_velocity_deg = w;
    }

    /// Make the `call`-th `get_states` request fail (0-based, counting every
    /// request including the one made while configuring).
    pub fn fail_get_states_at(&self, call: u64) {
        self.lock().fail_get_states_at = Some(call);
    }

    /// Make the `batch`-th `command` request fail (0-based).
    pub fn fail_command_at(&self, batch: u64) {
        self.lock().fail_command_at = Some(batch);
    }

    /// Reject every `configure` request for this actuator.
    pub fn fail_configure(&self, id: ActuatorId) {
        self.lock().fail_configure.insert(id);
    }

    pub fn configure_calls(&self) -> Vec<ConfigureCall> {
        self.lock().configure_calls.clone()
    }

    pub fn command_batches(&self) -> Vec<Vec<ActuatorCommand>> {
        self.lock().command_batches.clone()
    }

    pub fn get_states_calls(&self) -> u64 {
        self.lock().get_states_calls
    }

    pub fn position_deg(&self, id: ActuatorId) -> Option<f64> {
        self.lock().joints.get(&id).map(|j| j.position_deg)
    }

    pub fn torque_enabled(&self, id: ActuatorId) -> Option<bool> {
        self.lock().joints.get(&id).map(|j| j.torque_enabled)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn read_delay(&self) {
        if !self.read_latency.is_zero() {
            tokio::time::sleep(self.read_latency).await;
        }
    }
}

#[async_trait]
impl RobotIo for SimRobot {
    fn name(&self) -> &str {
        "sim"
    }

    async fn configure(
        &self,
        physical_id: ActuatorId,
        gains: ActuatorGains,
        torque_enabled: bool,
    ) -> Result<(), RobotIoError> {
        let mut st = self.lock();
        st.configure_calls.push(ConfigureCall {
            physical_id,
            gains,
            torque_enabled,
        });
        if st.fail_configure.contains(&physical_id) {
            return Err(RobotIoError::Actuator {
                op: "configure",
                physical_id,
                message: "injected failure".to_string(),
            });
        }
        let joint = st
            .joints
            .get_mut(&physical_id)
            .ok_or_else(|| unknown("configure", physical_id))?;
        joint.torque_enabled = torque_enabled;
        Ok(())
    }

    async fn get_states(&self, ids: &[ActuatorId]) -> Result<Vec<JointState>, RobotIoError> {
        self.read_delay().await;
        let mut st = self.lock();
        let call = st.get_states_calls;
        st.get_states_calls += 1;
        if st.fail_get_states_at == Some(call) {
            return Err(RobotIoError::Request {
                op: "get_states",
                message: format!("injected failure on call {call}"),
            });
        }
        ids.iter()
            .map(|&id| {
                st.joints
                    .get(&id)
                    .map(|j| JointState {
                        physical_id: id,
                        position_deg: j.position_deg,
                        velocity_deg_per_s: j.velocity_deg_per_s,
                    })
                    .ok_or_else(|| unknown("get_states", id))
            })
            .collect()
    }

    async fn command(&self, commands: &[ActuatorCommand]) -> Result<(), RobotIoError> {
        let mut st = self.lock();
        let batch = st.command_batches.len() as u64;
        if st.fail_command_at == Some(batch) {
            return Err(RobotIoError::Request {
                op: "command",
                message: format!("injected failure on batch {batch}"),
            });
        }
        st.command_batches.push(commands.to_vec());
        let dt = self.step.as_secs_f64();
        for cmd in commands {
            let joint = st
                .joints
                .get_mut(&cmd.physical_id)
                .ok_or_else(|| unknown("command", cmd.physical_id))?;
            if !joint.torque_enabled {
                joint.velocity_deg_per_s = 0.0;
                continue;
            }
            let next =
                joint.position_deg + self.tracking_gain * (cmd.position_deg - joint.position_deg);
            joint.velocity_deg_per_s = if dt > 0.0 {
                (next - joint.position_deg) / dt
            } else {
                0.0
            };
            joint.position_deg = next;
        }
        Ok(())
    }

    async fn get_orientation(&self) -> Result<Orientation, RobotIoError> {
        self.read_delay().await;
        Ok(self.lock().orientation.unwrap_or_else(Orientation::identity))
    }

    async fn get_angular_velocity(&self) -> Result<[f64; 3], RobotIoError> {
        self.read_delay().await;
        Ok(self.lock().angular_velocity_deg)
    }
}

fn unknown(op: &'static str, physical_id: ActuatorId) -> RobotIoError {
    RobotIoError::Actuator {
        op,
        physical_id,
        message: "unknown actuator".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gains() -> ActuatorGains {
        ActuatorGains {
            kp: 20.0,
            kd: 0.5,
            max_torque: 10.0,
        }
    }

    fn cmd(id: ActuatorId, deg: f64) -> ActuatorCommand {
        ActuatorCommand {
            physical_id: id,
            position_deg: deg,
            velocity: None,
            torque: None,
        }
    }

    #[tokio::test]
    async fn commanded_joints_track_only_with_torque() {
        let sim = SimRobot::new([1, 2]).with_tracking(0.5, Duration::from_millis(10));
        sim.configure(1, gains(), true).await.unwrap();

        sim.command(&[cmd(1, 10.0), cmd(2, 10.0)]).await.unwrap();
        assert_eq!(sim.position_deg(1), Some(5.0));
        assert_eq!(sim.position_deg(2), Some(0.0));

        let states = sim.get_states(&[2, 1]).await.unwrap();
        assert_eq!(states[0].physical_id, 2);
        assert_eq!(states[1].position_deg, 5.0);
        assert!((states[1].velocity_deg_per_s - 500.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn injected_failures() {
        let sim = SimRobot::new([1]).with_position(1, 12.0);
        sim.fail_get_states_at(1);
        sim.fail_command_at(0);
        sim.fail_configure(1);

        assert_eq!(sim.get_states(&[1]).await.unwrap()[0].position_deg, 12.0);
        assert!(sim.get_states(&[1]).await.is_err());
        assert!(sim.get_states(&[1]).await.is_ok());
        assert_eq!(sim.get_states_calls(), 3);

        assert!(sim.command(&[cmd(1, 0.0)]).await.is_err());
        assert!(sim.command_batches().is_empty());

        assert!(matches!(
            sim.configure(1, gains(), true).await,
            Err(RobotIoError::Actuator { physical_id: 1, .. })
        ));
        assert_eq!(sim.configure_calls().len(), 1);
    }

    #[tokio::test]
    async fn unknown_actuators_are_errors() {
        let sim = SimRobot::new([1]);
        assert!(matches!(
            sim.get_states(&[1, 9]).await,
            Err(RobotIoError::Actuator { physical_id: 9, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reads_honour_latency() {
        let sim = SimRobot::new([1]).with_read_latency(Duration::from_millis(7));
        let t0 = tokio::time::Instant::now();
        let (s, o, w) = tokio::join!(
            sim.get_states(&[1]),
            sim.get_orientation(),
            sim.get_angular_velocity()
        );
        assert!(s.is_ok() && o.is_ok() && w.is_ok());
        // Concurrent reads overlap.
        let elapsed = t0.elapsed();
        assert!(elapsed >= Duration::from_millis(7) && elapsed < Duration::from_millis(14));
    }
}
