// src/gait.rs
//
// Gait phase accumulator driving the periodic sin/cos observation features.

use std::f64::consts::TAU;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Progress through one step cycle, always in [0, 2pi).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GaitPhase {
    phase: f64,
}

impl GaitPhase {
    pub fn new(phase: f64) -> Self {
        Self {
            phase: phase.rem_euclid(TAU),
        }
    }

    pub fn value(&self) -> f64 {
        self.phase
    }

    /// Advance by `walk_speed * dt` and wrap modulo 2pi.
    pub fn advance(&mut self, walk_speed: f64, dt: Duration) {
        let next = (self.phase + walk_speed * dt.as_secs_f64()).rem_euclid(TAU);
        // rem_euclid can round up to exactly TAU for tiny negative inputs.
        self.phase = if next >= TAU { 0.0 } else { next };
    }

    /// (sin(2pi * phase), cos(2pi * phase)).
    pub fn features(&self) -> [f64; 2] {
        let a = TAU * self.phase;
        [a.sin(), a.cos()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn phase_after_ticks_equals_total_time_mod_tau() {
        let walk_speed = 3.7;
        let dts_ms = [20u64, 19, 23, 20, 41, 18, 20, 20, 250, 7, 1000, 20];
        let mut phase = GaitPhase::default();
        let mut total = 0.0;
        for &d in dts_ms.iter().cycle().take(600) {
            let dt = Duration::from_millis(d);
            phase.advance(walk_speed, dt);
            total += dt.as_secs_f64();
            let expected = (walk_speed * total).rem_euclid(TAU);
            let diff = (phase.value() - expected).abs();
            assert!(
                diff < 1e-6 || (TAU - diff) < 1e-6,
                "phase {} expected {expected}",
                phase.value()
            );
            assert!(phase.value() >= 0.0 && phase.value() < TAU);
        }
    }

    #[test]
    fn zero_phase_features() {
        let [s, c] = GaitPhase::default().features();
        assert_eq!(s, 0.0);
        assert_eq!(c, 1.0);
    }

    #[test]
    fn new_wraps_input() {
        assert_relative_eq!(GaitPhase::new(TAU + 0.5).value(), 0.5, epsilon = 1e-12);
        assert_relative_eq!(GaitPhase::new(-0.5).value(), TAU - 0.5, epsilon = 1e-12);
    }
}
