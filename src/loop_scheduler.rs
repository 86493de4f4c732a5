// src/loop_scheduler.rs
//
// Fixed-period tick pacing for the control loop, plus rolling timing stats.
//
// The pacer never bursts: when a tick overruns its budget the next tick
// starts immediately and the schedule is re-anchored at that point, so at
// most one tick runs per period after an overrun.

use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

/// Supported control rates, Hz.
pub const MIN_FREQUENCY_HZ: f64 = 1e-3;
pub const MAX_FREQUENCY_HZ: f64 = 1e4;

/// Tick period for `frequency_hz`; None outside the supported range.
pub fn tick_period(frequency_hz: f64) -> Option<Duration> {
    if !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&frequency_hz) {
        return None;
    }
    Duration::try_from_secs_f64(1.0 / frequency_hz).ok()
}

/// Run duration for `seconds`; None unless finite, positive and
/// representable.
pub fn run_duration(seconds: f64) -> Option<Duration> {
    if !(seconds.is_finite() && seconds > 0.0) {
        return None;
    }
    Duration::try_from_secs_f64(seconds).ok()
}

/// What the loop should do at the end of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickPace {
    /// Time to sleep before the next tick starts (zero after an overrun).
    pub sleep: Duration,
    /// How far past the deadline the tick finished, if it overran.
    pub overrun: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct TickPacer {
    period: Duration,
    next_deadline: Instant,
}

impl TickPacer {
    /// First deadline is one period after `start`.
    pub fn new(start: Instant, period: Duration) -> Self {
        let period = period.max(Duration::from_micros(1));
        Self {
            period,
            next_deadline: start + period,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn next_deadline(&self) -> Instant {
        self.next_deadline
    }

    /// Close out the current tick at `now` and schedule the next one.
    pub fn finish_tick(&mut self, now: Instant) -> TickPace {
        if now < self.next_deadline {
            let sleep = self.next_deadline - now;
            self.next_deadline += self.period;
            TickPace {
                sleep,
                overrun: None,
            }
        } else {
            let overrun = now - self.next_deadline;
            self.next_deadline = now + self.period;
            TickPace {
                sleep: Duration::ZERO,
                overrun: Some(overrun),
            }
        }
    }
}

/// Per-window timing summary.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoopStatsWindow {
    pub ticks: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub jitter_ms: f64,
    pub achieved_hz: f64,
    pub overruns: u64,
}

/// Tick processing-time statistics, reported once per window of ticks.
#[derive(Debug, Clone)]
pub struct LoopStats {
    window_len: u64,
    window_ticks: u64,
    window_total: Duration,
    window_min: Duration,
    window_max: Duration,
    window_overruns: u64,
    window_started: Option<Instant>,
    total_ticks: u64,
    total_overruns: u64,
}

impl LoopStats {
    pub fn new(window_len: u64) -> Self {
        Self {
            window_len: window_len.max(1),
            window_ticks: 0,
            window_total: Duration::ZERO,
            window_min: Duration::MAX,
            window_max: Duration::ZERO,
            window_overruns: 0,
            window_started: None,
            total_ticks: 0,
            total_overruns: 0,
        }
    }

    pub fn total_ticks(&self) -> u64 {
        self.total_ticks
    }

    pub fn total_overruns(&self) -> u64 {
        self.total_overruns
    }

    /// Record one tick; returns a summary when the window fills.
    pub fn record(
        &mut self,
        tick_started: Instant,
        processing: Duration,
        overran: bool,
    ) -> Option<LoopStatsWindow> {
        let started = *self.window_started.get_or_insert(tick_started);
        self.window_ticks += 1;
        self.total_ticks += 1;
        self.window_total += processing;
        self.window_min = self.window_min.min(processing);
        self.window_max = self.window_max.max(processing);
        if overran {
            self.window_overruns += 1;
            self.total_overruns += 1;
        }

        if self.window_ticks < self.window_len {
            return None;
        }

        let elapsed = (tick_started + processing).saturating_duration_since(started);
        let achieved_hz = if elapsed > Duration::ZERO {
            self.window_ticks as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let avg = self.window_total / self.window_ticks as u32;
        let summary = LoopStatsWindow {
            ticks: self.window_ticks,
            avg_ms: avg.as_secs_f64() * 1e3,
            min_ms: self.window_min.as_secs_f64() * 1e3,
            max_ms: self.window_max.as_secs_f64() * 1e3,
            jitter_ms: (self.window_max - self.window_min).as_secs_f64() * 1e3,
            achieved_hz,
            overruns: self.window_overruns,
        };

        self.window_ticks = 0;
        self.window_total = Duration::ZERO;
        self.window_min = Duration::MAX;
        self.window_max = Duration::ZERO;
        self.window_overruns = 0;
        self.window_started = None;
        Some(summary)
    }
}
