//! telemetry.rs
//!
//! JSONL telemetry sink for the walking controller.
//!
//! One JSON object per control tick, written to a file chosen by environment
//! variables so a run can be recorded without code or flag changes.
//!
//! # Environment variables
//!
//! - `WALKCTL_TELEMETRY_MODE`: `"off"` (default) or `"jsonl"`.
//! - `WALKCTL_TELEMETRY_PATH`: JSONL file path; required for `"jsonl"`.
//! - `WALKCTL_TELEMETRY_APPEND`: `"1"`/`"true"`/`"yes"` appends instead of
//!   truncating.
//!
//! Telemetry never fails the control loop: if the file cannot be opened or a
//! write fails, the sink logs one warning and turns itself off.

use std::env;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use serde::Serialize;
use tracing::warn;

use crate::loop_scheduler::LoopStatsWindow;

/// Current telemetry schema version.
pub const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryMode {
    Off,
    Jsonl,
}

impl TelemetryMode {
    /// Parse WALKCTL_TELEMETRY_MODE; unknown values mean Off.
    pub fn from_env() -> Self {
        match env::var("WALKCTL_TELEMETRY_MODE") {
            Ok(s) if s.trim().eq_ignore_ascii_case("jsonl") => TelemetryMode::Jsonl,
            _ => TelemetryMode::Off,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub mode: TelemetryMode,
    pub path: Option<PathBuf>,
    pub append: bool,
}

impl TelemetryConfig {
    pub fn off() -> Self {
        Self {
            mode: TelemetryMode::Off,
            path: None,
            append: false,
        }
    }

    pub fn jsonl(path: impl Into<PathBuf>) -> Self {
        Self {
            mode: TelemetryMode::Jsonl,
            path: Some(path.into()),
            append: false,
        }
    }

    pub fn from_env() -> Self {
        let mode = TelemetryMode::from_env();
        let path = if mode == TelemetryMode::Jsonl {
            env::var("WALKCTL_TELEMETRY_PATH").ok().map(PathBuf::from)
        } else {
            None
        };
        Self {
            mode,
            path,
            append: Self::append_from_env(),
        }
    }

    pub fn append_from_env() -> bool {
        env::var("WALKCTL_TELEMETRY_APPEND")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false)
    }
}

/// One control tick as recorded in telemetry.
#[derive(Debug, Clone, Serialize)]
pub struct TickRecord<'a> {
    pub schema_version: i64,
    pub tick: u64,
    pub elapsed_s: f64,
    pub phase: f64,
    pub layout: &'a str,
    pub observation: &'a [f32],
    pub actions: &'a [f64],
    /// Commanded positions, degrees, policy order.
    pub command_deg: &'a [f64],
    pub processing_ms: f64,
    pub overrun: bool,
}

/// Window summary record, emitted alongside tick records.
#[derive(Debug, Clone, Serialize)]
pub struct LoopStatsRecord {
    pub schema_version: i64,
    pub event: &'static str,
    pub tick: u64,
    #[serde(flatten)]
    pub stats: LoopStatsWindow,
}

pub struct TelemetrySink {
    mode: TelemetryMode,
    path: Option<PathBuf>,
    append: bool,
    writer: Option<BufWriter<File>>,
}

impl TelemetrySink {
    pub fn from_env() -> Self {
        Self::from_config(TelemetryConfig::from_env())
    }

    pub fn from_config(cfg: TelemetryConfig) -> Self {
        Self {
            mode: cfg.mode,
            path: cfg.path,
            append: cfg.append,
            writer: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.mode == TelemetryMode::Jsonl
    }

    fn disable(&mut self, reason: &str) {
        warn!(path = ?self.path, reason, "telemetry disabled");
        self.mode = TelemetryMode::Off;
        self.writer = None;
    }

    fn ensure_writer(&mut self) -> Option<&mut BufWriter<File>> {
        if self.mode != TelemetryMode::Jsonl {
            return None;
        }
        if self.writer.is_none() {
            let Some(path) = self.path.clone() else {
                self.disable("WALKCTL_TELEMETRY_PATH is not set");
                return None;
            };
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let mut options = OpenOptions::new();
            options.create(true).write(true);
            if self.append {
                options.append(true);
            } else {
                options.truncate(true);
            }
            match options.open(&path) {
                Ok(f) => self.writer = Some(BufWriter::new(f)),
                Err(e) => {
                    self.disable(&e.to_string());
                    return None;
                }
            }
        }
        self.writer.as_mut()
    }

    /// Serialize any record as one line. No-op when off.
    pub fn log<T: Serialize>(&mut self, record: &T) {
        if self.mode != TelemetryMode::Jsonl {
            return;
        }
        let line = match serde_json::to_string(record) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "telemetry record not serializable; skipped");
                return;
            }
        };
        let Some(writer) = self.ensure_writer() else {
            return;
        };
        if let Err(e) = writeln!(writer, "{line}") {
            self.disable(&e.to_string());
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

impl Drop for TelemetrySink {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value as JsonValue};

    #[test]
    fn writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("run.jsonl");
        let mut sink = TelemetrySink::from_config(TelemetryConfig::jsonl(&path));
        assert!(sink.is_enabled());

        let obs = [0.0f32, 1.0];
        let actions = [0.5];
        let cmd = [12.0];
        for tick in 0..3 {
            sink.log(&TickRecord {
                schema_version: SCHEMA_VERSION,
                tick,
                elapsed_s: tick as f64 * 0.02,
                phase: 0.0,
                layout: "euler_phase_v1",
                observation: &obs,
                actions: &actions,
                command_deg: &cmd,
                processing_ms: 1.0,
                overrun: false,
            });
        }
        sink.log(&json!({"schema_version": SCHEMA_VERSION, "event": "done"}));
        sink.flush();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<JsonValue> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[2]["tick"], 2);
        assert_eq!(lines[2]["observation"], json!([0.0, 1.0]));
        assert_eq!(lines[3]["schema_version"], 1);
    }

    #[test]
    fn off_mode_writes_nothing() {
        let mut sink = TelemetrySink::from_config(TelemetryConfig::off());
        sink.log(&json!({"tick": 1}));
        assert!(!sink.is_enabled());
    }

    #[test]
    fn missing_path_disables_sink() {
        let mut sink = TelemetrySink::from_config(TelemetryConfig {
            mode: TelemetryMode::Jsonl,
            path: None,
            append: false,
        });
        sink.log(&json!({"tick": 1}));
        assert!(!sink.is_enabled());
    }
}
