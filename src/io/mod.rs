// src/io/mod.rs
//
// Robot I/O boundary.
//
// The control loop only talks to the robot through the RobotIo trait, so the
// same session code drives a remote actuator/IMU service, the in-process
// simulator, or a test double.
//
// Conventions at this boundary are physical: positions in degrees, joint
// velocities and body angular velocity in deg/s.

pub mod sim;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::actuator_map::ActuatorMap;
use crate::error::RobotIoError;
use crate::types::{ActuatorCommand, ActuatorGains, ActuatorId, JointState, Orientation};

pub use sim::{ConfigureCall, SimRobot};

/// Async request/response access to one robot.
///
/// Methods take `&self` so the per-tick reads can be issued concurrently.
#[async_trait]
pub trait RobotIo: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    async fn configure(
        &self,
        physical_id: ActuatorId,
        gains: ActuatorGains,
        torque_enabled: bool,
    ) -> Result<(), RobotIoError>;

    /// One state per requested id, in request order.
    async fn get_states(&self, ids: &[ActuatorId]) -> Result<Vec<JointState>, RobotIoError>;

    async fn command(&self, commands: &[ActuatorCommand]) -> Result<(), RobotIoError>;

    async fn get_orientation(&self) -> Result<Orientation, RobotIoError>;

    /// Body angular velocity (x, y, z) in deg/s.
    async fn get_angular_velocity(&self) -> Result<[f64; 3], RobotIoError>;
}

/// Disable torque on every actuator in the map, held ones included.
///
/// Failures are logged and do not stop the remaining actuators. Returns the
/// number of actuators that could not be disabled.
pub async fn disable_torque(io: &dyn RobotIo, map: &ActuatorMap) -> usize {
    let mut failures = 0;
    for (id, gains) in map.all_gains() {
        match io.configure(id, gains, false).await {
            Ok(()) => debug!(actuator = id, "torque disabled"),
            Err(e) => {
                failures += 1;
                warn!(actuator = id, error = %e, "failed to disable torque");
            }
        }
    }
    failures
}
