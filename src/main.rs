// src/main.rs
//
// Thin harness around the walkctl library: resolve config, load the model,
// configure the robot, run the control loop, and always disable torque on
// the way out.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info, warn};

use walkctl::config::{read_config_file, variant_from_yaml_str};
use walkctl::logging::init_tracing;
use walkctl::{
    load_engine, resolve_effective_variant, wrap_degrees, Config, ControlSession, PolicyVariant,
    RobotIo, SessionStatus, SimRobot, TelemetrySink,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum VariantArg {
    EulerPhase,
    ProjectedGravity,
}

impl From<VariantArg> for PolicyVariant {
    fn from(v: VariantArg) -> Self {
        match v {
            VariantArg::EulerPhase => PolicyVariant::EulerPhase,
            VariantArg::ProjectedGravity => PolicyVariant::ProjectedGravity,
        }
    }
}

/// Run a learned walking policy against a humanoid robot.
#[derive(Parser, Debug)]
#[command(name = "walkctl", version, about, long_about = None)]
struct Args {
    /// Robot service host.
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Robot service port.
    #[arg(long, default_value_t = 50051)]
    port: u16,

    /// Path to the policy model (`.onnx` checkpoint or walkctl-mlp JSON).
    /// Falls back to WALKCTL_MODEL_PATH or the config file.
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Control loop frequency in Hz (default depends on the variant).
    #[arg(short, long)]
    freq: Option<f64>,

    /// Stop after this many seconds; runs until Ctrl+C when omitted.
    #[arg(long)]
    num_seconds: Option<f64>,

    /// Policy variant. If omitted, uses WALKCTL_VARIANT, then the config
    /// file, then euler-phase.
    #[arg(long, value_enum)]
    variant: Option<VariantArg>,

    /// YAML config overlay.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Forward velocity command (m/s).
    #[arg(long, allow_hyphen_values = true)]
    vel_x: Option<f64>,

    /// Lateral velocity command (m/s).
    #[arg(long, allow_hyphen_values = true)]
    vel_y: Option<f64>,

    /// Yaw rate command (rad/s).
    #[arg(long, allow_hyphen_values = true)]
    yaw_rate: Option<f64>,

    /// Verbosity: -v, -vv
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn resolve_config(args: &Args) -> Result<Config> {
    let file_yaml = args
        .config
        .as_deref()
        .map(read_config_file)
        .transpose()?;
    let file_variant = match file_yaml.as_deref() {
        Some(yaml) => variant_from_yaml_str(yaml)?,
        None => None,
    };

    let effective = resolve_effective_variant(args.variant.map(Into::into), file_variant);
    effective.log_startup();

    let mut cfg = Config::for_variant(effective.variant)?;
    if let (Some(yaml), Some(path)) = (&file_yaml, &args.config) {
        cfg.apply_yaml_str(yaml)
            .with_context(|| format!("applying config file {}", path.display()))?;
    }
    cfg.apply_env_overrides();

    if let Some(hz) = args.freq {
        cfg.frequency_hz = hz;
    }
    if let Some(s) = args.num_seconds {
        cfg.run_seconds = Some(s);
    }
    if let Some(m) = &args.model {
        cfg.model_path = Some(m.clone());
    }
    if let Some(x) = args.vel_x {
        cfg.command.x = x;
    }
    if let Some(y) = args.vel_y {
        cfg.command.y = y;
    }
    if let Some(yaw) = args.yaw_rate {
        cfg.command.yaw = yaw;
    }

    cfg.validate()?;
    Ok(cfg)
}

/// Simulated robot standing at the configured default pose.
fn simulated_robot(cfg: &Config) -> Result<SimRobot> {
    let map = cfg.actuator_map()?;
    let mut sim = SimRobot::new(map.all_ids());
    if !cfg.use_source_offsets {
        for (spec, default) in map.specs().iter().zip(&cfg.default_position) {
            sim = sim.with_position(
                spec.physical_id,
                wrap_degrees(spec.sign * default.to_degrees()),
            );
        }
    }
    Ok(sim)
}

async fn run(args: Args) -> Result<SessionStatus> {
    let cfg = resolve_config(&args)?;

    let model_path = cfg
        .model_path
        .clone()
        .context("no model path: pass --model or set WALKCTL_MODEL_PATH")?;
    let engine = load_engine(&model_path)?;

    info!(
        variant = cfg.variant.as_str(),
        config_hash = %format!("0x{:016x}", cfg.config_hash()),
        model = %model_path.display(),
        frequency_hz = cfg.frequency_hz,
        walk_speed = cfg.walk_speed,
        cmd_x = cfg.command.x,
        cmd_y = cfg.command.y,
        cmd_yaw = cfg.command.yaw,
        run_seconds = ?cfg.run_seconds,
        "walkctl run"
    );

    warn!(
        host = %args.host,
        port = args.port,
        "no network transport in this build; driving the in-process simulated robot"
    );
    let io: Arc<dyn RobotIo> = Arc::new(simulated_robot(&cfg)?);

    let mut session = ControlSession::from_config(&cfg, io, engine)?
        .with_telemetry(TelemetrySink::from_env());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received Ctrl+C, stopping at the next tick boundary");
            let _ = shutdown_tx.send(true);
        }
    });

    let outcome = match session.configure().await {
        Ok(()) => session.run(shutdown_rx).await,
        Err(e) => Err(e),
    };

    // Teardown runs after any terminal state.
    session.teardown().await;

    match outcome {
        Ok(report) => {
            info!(
                ticks = report.ticks,
                overruns = report.overruns,
                elapsed_s = report.elapsed_s,
                reason = ?report.stop_reason,
                "session finished"
            );
            Ok(session.status())
        }
        Err(e) => Err(e).context(format!("session {}", session.status().as_str())),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args).await {
        Ok(SessionStatus::Faulted) => ExitCode::FAILURE,
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("walkctl failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}
