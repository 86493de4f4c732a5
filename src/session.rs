// src/session.rs
//
// Fixed-frequency control session.
//
// Lifecycle: Uninitialized -> Configuring -> Running -> Stopped | Faulted.
//
// Per tick (policy convention in the middle, physical at both ends):
//   reads (joint states, orientation, angular velocity; concurrent)
//   -> phase advance by measured wall time
//   -> observation -> policy -> joint targets -> physical commands
//   -> dispatch -> sleep to the next boundary
//
// All per-tick mutable state lives in LoopState, which each tick consumes
// and returns. Any I/O or inference error faults the session; nothing is
// retried or substituted.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::actuator_map::ActuatorMap;
use crate::config::{ActionMode, CommandDefaults, Config};
use crate::error::{ConfigError, RobotIoError, SessionError};
use crate::gait::GaitPhase;
use crate::io::{disable_torque, RobotIo};
use crate::loop_scheduler::{
    run_duration, tick_period, LoopStats, LoopStatsWindow, TickPacer, MAX_FREQUENCY_HZ,
    MIN_FREQUENCY_HZ,
};
use crate::normalize::{CoordinateNormalizer, SourcePose};
use crate::rl::engine::InferenceEngine;
use crate::rl::observation::{ObsScales, ObservationBuilder, ObservationInputs, ObservationVector};
use crate::rl::policy::{PolicyAdapter, PolicyStep, RecurrentState};
use crate::telemetry::{
    LoopStatsRecord, TelemetryConfig, TelemetrySink, TickRecord, SCHEMA_VERSION,
};
use crate::types::{ActuatorCommand, ActuatorId, VelocityCommand};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Uninitialized,
    Configuring,
    Running,
    Stopped,
    Faulted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Uninitialized => "uninitialized",
            SessionStatus::Configuring => "configuring",
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Faulted => "faulted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Stopped | SessionStatus::Faulted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Cancelled,
    DurationElapsed,
}

/// Loop parameters, usually taken from a Config.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub frequency_hz: f64,
    pub walk_speed: f64,
    pub command: VelocityCommand,
    pub run_for: Option<Duration>,
    pub obs_scales: ObsScales,
    /// Policy order, radians.
    pub default_position: Vec<f64>,
    pub gravity_axis_signs: [f64; 3],
    pub use_source_offsets: bool,
    pub action_mode: ActionMode,
    pub command_defaults: CommandDefaults,
    /// Ticks per stats window; defaults to one second of ticks.
    pub stats_window_ticks: Option<u64>,
}

impl LoopSettings {
    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        let run_for = cfg
            .run_seconds
            .map(|s| {
                run_duration(s).ok_or_else(|| ConfigError::InvalidValue {
                    field: "run_seconds".to_string(),
                    reason: format!("{s} is not a usable duration"),
                })
            })
            .transpose()?;
        Ok(Self {
            frequency_hz: cfg.frequency_hz,
            walk_speed: cfg.walk_speed,
            command: cfg.command,
            run_for,
            obs_scales: cfg.obs_scales,
            default_position: cfg.default_position.clone(),
            gravity_axis_signs: cfg.gravity_axis_signs,
            use_source_offsets: cfg.use_source_offsets,
            action_mode: cfg.action_mode,
            command_defaults: cfg.command_defaults,
            stats_window_ticks: None,
        })
    }

    fn stats_window(&self) -> u64 {
        self.stats_window_ticks
            .unwrap_or_else(|| self.frequency_hz.round().max(1.0) as u64)
    }
}

/// Per-session mutable loop state, threaded through every tick.
#[derive(Debug, Clone)]
pub struct LoopState {
    pub tick: u64,
    pub phase: GaitPhase,
    pub previous_actions: Vec<f64>,
    pub recurrent: RecurrentState,
    pub started_at: Instant,
    pub last_tick_at: Option<Instant>,
}

impl LoopState {
    pub fn new(started_at: Instant, num_actions: usize, recurrent: RecurrentState) -> Self {
        Self {
            tick: 0,
            phase: GaitPhase::default(),
            previous_actions: vec![0.0; num_actions],
            recurrent,
            started_at,
            last_tick_at: None,
        }
    }
}

/// What one tick produced, for telemetry and tests.
#[derive(Debug, Clone)]
pub struct TickOutput {
    pub observation: ObservationVector,
    pub step: PolicyStep,
    /// Commanded positions, degrees, policy order.
    pub command_deg: Vec<f64>,
}

/// Summary returned when a session stops.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub status: SessionStatus,
    pub stop_reason: StopReason,
    pub ticks: u64,
    pub overruns: u64,
    pub elapsed_s: f64,
    pub last_window: Option<LoopStatsWindow>,
}

pub struct ControlSession {
    io: Arc<dyn RobotIo>,
    map: ActuatorMap,
    builder: ObservationBuilder,
    policy: PolicyAdapter,
    settings: LoopSettings,
    period: Duration,
    status: SessionStatus,
    /// Policy ids in policy order, requested every tick.
    read_ids: Vec<ActuatorId>,
    source_pose: Option<SourcePose>,
    normalizer: Option<CoordinateNormalizer>,
    telemetry: TelemetrySink,
}

impl std::fmt::Debug for ControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession")
            .field("robot", &self.io.name())
            .field("model_id", &self.policy.model_id())
            .field("status", &self.status)
            .field("period", &self.period)
            .finish()
    }
}

impl ControlSession {
    pub fn new(
        io: Arc<dyn RobotIo>,
        map: ActuatorMap,
        policy: PolicyAdapter,
        settings: LoopSettings,
    ) -> Result<Self, ConfigError> {
        let layout = policy.layout().clone();
        if layout.num_joints != map.len() {
            return Err(ConfigError::Layout {
                layout: layout.id.clone(),
                reason: format!(
                    "layout has {} joints but the actuator map has {}",
                    layout.num_joints,
                    map.len()
                ),
            });
        }
        let period = tick_period(settings.frequency_hz).ok_or_else(|| ConfigError::InvalidValue {
            field: "frequency_hz".to_string(),
            reason: format!(
                "must be within [{MIN_FREQUENCY_HZ}, {MAX_FREQUENCY_HZ}], got {}",
                settings.frequency_hz
            ),
        })?;
        let builder = ObservationBuilder::new(
            layout,
            settings.obs_scales,
            settings.default_position.clone(),
            settings.gravity_axis_signs,
        )?;
        let read_ids = map.ids_in_policy_order();
        Ok(Self {
            io,
            map,
            builder,
            policy,
            settings,
            period,
            status: SessionStatus::Uninitialized,
            read_ids,
            source_pose: None,
            normalizer: None,
            telemetry: TelemetrySink::from_config(TelemetryConfig::off()),
        })
    }

    /// Validate the config and assemble a session around `engine`.
    pub fn from_config(
        cfg: &Config,
        io: Arc<dyn RobotIo>,
        engine: Box<dyn InferenceEngine>,
    ) -> Result<Self, ConfigError> {
        cfg.validate()?;
        let map = cfg.actuator_map()?;
        let policy = PolicyAdapter::new(engine, cfg.binding.clone(), cfg.layout()?)?;
        Self::new(io, map, policy, LoopSettings::from_config(cfg)?)
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn map(&self) -> &ActuatorMap {
        &self.map
    }

    pub fn source_pose(&self) -> Option<&SourcePose> {
        self.source_pose.as_ref()
    }

    /// Configure every actuator and capture the source pose.
    pub async fn configure(&mut self) -> Result<(), SessionError> {
        self.expect_status(SessionStatus::Uninitialized)?;
        self.status = SessionStatus::Configuring;
        match self.configure_inner().await {
            Ok(()) => {
                self.status = SessionStatus::Running;
                Ok(())
            }
            Err(e) => {
                self.status = SessionStatus::Faulted;
                error!(error = %e, "configuration failed");
                Err(e)
            }
        }
    }

    async fn configure_inner(&mut self) -> Result<(), SessionError> {
        info!(
            robot = self.io.name(),
            actuators = self.map.len(),
            held = self.map.held().len(),
            "configuring actuators"
        );
        for (id, gains) in self.map.all_gains() {
            self.io
                .configure(id, gains, true)
                .await
                .map_err(|source| SessionError::Io {
                    stage: "configure",
                    tick: None,
                    source,
                })?;
            debug!(actuator = id, kp = gains.kp, kd = gains.kd, "configured");
        }

        let states = self
            .io
            .get_states(&self.map.all_ids())
            .await
            .map_err(|source| SessionError::Io {
                stage: "capture_pose",
                tick: None,
                source,
            })?;
        let pose = SourcePose::from_states(&states);
        let normalizer =
            CoordinateNormalizer::new(&self.map, &pose, self.settings.use_source_offsets)?;
        info!(
            joints = pose.len(),
            offsets = self.settings.use_source_offsets,
            "source pose captured"
        );
        self.source_pose = Some(pose);
        self.normalizer = Some(normalizer);
        Ok(())
    }

    /// Run ticks until cancelled, the run duration elapses, or a fault.
    ///
    /// `shutdown` is observed at tick boundaries only.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SessionReport, SessionError> {
        self.expect_status(SessionStatus::Running)?;
        let Some(normalizer) = self.normalizer.clone() else {
            self.status = SessionStatus::Faulted;
            return Err(SessionError::InvalidState {
                expected: "configured",
                actual: self.status.as_str(),
            });
        };

        let start = Instant::now();
        let mut pacer = TickPacer::new(start, self.period);
        let mut stats = LoopStats::new(self.settings.stats_window());
        let mut state = LoopState::new(start, self.policy.num_actions(), self.policy.initial_state());
        let mut last_window = None;
        // A deadline past the clock's range is never reached.
        let run_until = self.settings.run_for.and_then(|d| start.checked_add(d));

        info!(
            model = self.policy.model_id(),
            layout = %self.policy.layout().id,
            frequency_hz = self.settings.frequency_hz,
            period_ms = pacer.period().as_secs_f64() * 1e3,
            "control loop started"
        );

        let stop_reason = loop {
            if *shutdown.borrow() {
                break StopReason::Cancelled;
            }
            let tick_started = Instant::now();
            if run_until.is_some_and(|t| tick_started >= t) {
                break StopReason::DurationElapsed;
            }

            let tick = state.tick;
            let (next, out) = match self.tick(&normalizer, state, tick_started).await {
                Ok(v) => v,
                Err(e) => {
                    self.status = SessionStatus::Faulted;
                    self.telemetry.flush();
                    error!(tick, error = %e, "control loop faulted");
                    return Err(e);
                }
            };
            state = next;

            let finished = Instant::now();
            let processing = finished.saturating_duration_since(tick_started);
            let pace = pacer.finish_tick(finished);
            if let Some(over) = pace.overrun {
                warn!(
                    tick,
                    overrun_ms = over.as_secs_f64() * 1e3,
                    "tick overran its period"
                );
            }

            self.telemetry.log(&TickRecord {
                schema_version: SCHEMA_VERSION,
                tick,
                elapsed_s: tick_started.duration_since(start).as_secs_f64(),
                phase: state.phase.value(),
                layout: out.observation.layout_id(),
                observation: out.observation.as_slice(),
                actions: &out.step.actions,
                command_deg: &out.command_deg,
                processing_ms: processing.as_secs_f64() * 1e3,
                overrun: pace.overrun.is_some(),
            });
            if let Some(window) = stats.record(tick_started, processing, pace.overrun.is_some()) {
                info!(
                    ticks = window.ticks,
                    avg_ms = window.avg_ms,
                    min_ms = window.min_ms,
                    max_ms = window.max_ms,
                    jitter_ms = window.jitter_ms,
                    achieved_hz = window.achieved_hz,
                    overruns = window.overruns,
                    "loop stats"
                );
                self.telemetry.log(&LoopStatsRecord {
                    schema_version: SCHEMA_VERSION,
                    event: "loop_stats",
                    tick,
                    stats: window,
                });
                last_window = Some(window);
            }

            if !pace.sleep.is_zero() {
                let sleep = tokio::time::sleep(pace.sleep);
                tokio::pin!(sleep);
                let interrupted = tokio::select! {
                    _ = &mut sleep => false,
                    changed = shutdown.changed() => changed.is_ok(),
                };
                // A dropped sender or a reset flag finishes the sleep.
                if !(interrupted && *shutdown.borrow()) && !sleep.is_elapsed() {
                    sleep.await;
                }
            }
        };

        self.status = SessionStatus::Stopped;
        self.telemetry.flush();
        let report = SessionReport {
            status: self.status,
            stop_reason,
            ticks: stats.total_ticks(),
            overruns: stats.total_overruns(),
            elapsed_s: start.elapsed().as_secs_f64(),
            last_window,
        };
        info!(
            reason = ?report.stop_reason,
            ticks = report.ticks,
            overruns = report.overruns,
            "control loop stopped"
        );
        Ok(report)
    }

    /// One control tick. Commands for this tick are dispatched before it
    /// returns; nothing is sent if any earlier step fails.
    pub async fn tick(
        &self,
        normalizer: &CoordinateNormalizer,
        mut state: LoopState,
        now: Instant,
    ) -> Result<(LoopState, TickOutput), SessionError> {
        let tick = state.tick;
        let io_err = |stage: &'static str| {
            move |source: RobotIoError| SessionError::Io {
                stage,
                tick: Some(tick),
                source,
            }
        };

        let (states, orientation, ang_vel_deg) = tokio::try_join!(
            self.io.get_states(&self.read_ids),
            self.io.get_orientation(),
            self.io.get_angular_velocity(),
        )
        .map_err(io_err("read"))?;

        if let Some(prev) = state.last_tick_at {
            state
                .phase
                .advance(self.settings.walk_speed, now.saturating_duration_since(prev));
        }
        state.last_tick_at = Some(now);

        let (joint_pos, joint_vel) = normalizer
            .states_to_policy(&states)
            .map_err(io_err("read"))?;
        let angular_velocity = ang_vel_deg.map(f64::to_radians);

        let observation = self
            .builder
            .build(&ObservationInputs {
                phase: state.phase,
                elapsed_s: now.saturating_duration_since(state.started_at).as_secs_f64(),
                command: self.settings.command,
                joint_pos: &joint_pos,
                joint_vel: &joint_vel,
                previous_actions: &state.previous_actions,
                angular_velocity,
                orientation,
                history: state.recurrent.as_slice(),
            })
            .map_err(|source| SessionError::Inference { tick, source })?;

        let (step, recurrent) = self
            .policy
            .infer(&observation, &state.recurrent)
            .map_err(|source| SessionError::Inference { tick, source })?;

        let defaults = self.settings.command_defaults;
        let mut commands = Vec::with_capacity(step.command_actions.len());
        let mut command_deg = Vec::with_capacity(step.command_actions.len());
        for (idx, &action) in step.command_actions.iter().enumerate() {
            let target = match self.settings.action_mode {
                ActionMode::OffsetFromDefault => action + self.settings.default_position[idx],
                ActionMode::DeltaFromCurrent => joint_pos[idx] + action,
            };
            let position_deg = normalizer.to_physical(idx, target)?;
            let physical_id = normalizer
                .physical_id(idx)
                .ok_or_else(|| ConfigError::InvalidValue {
                    field: "policy_index".to_string(),
                    reason: format!("{idx} has no actuator"),
                })?;
            commands.push(ActuatorCommand {
                physical_id,
                position_deg,
                velocity: defaults.velocity,
                torque: defaults.torque,
            });
            command_deg.push(position_deg);
        }

        self.io
            .command(&commands)
            .await
            .map_err(io_err("command"))?;

        state.previous_actions = step.actions.clone();
        state.recurrent = recurrent;
        state.tick += 1;

        Ok((
            state,
            TickOutput {
                observation,
                step,
                command_deg,
            },
        ))
    }

    /// Disable torque on every actuator. Safe to call in any state.
    pub async fn teardown(&self) -> usize {
        let failures = disable_torque(self.io.as_ref(), &self.map).await;
        if failures == 0 {
            info!("torque disabled on all actuators");
        } else {
            warn!(failures, "teardown could not disable every actuator");
        }
        failures
    }

    fn expect_status(&self, expected: SessionStatus) -> Result<(), SessionError> {
        if self.status != expected {
            return Err(SessionError::InvalidState {
                expected: expected.as_str(),
                actual: self.status.as_str(),
            });
        }
        Ok(())
    }
}
