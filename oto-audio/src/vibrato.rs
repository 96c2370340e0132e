//! Vibrato LFO evaluated at control rate by the pitch shifters

use crate::note::VibratoParams;
use std::f64::consts::TAU;

/// Depth ramp-in after the onset delay, in seconds
const RAMP_IN: f64 = 0.1;
/// Depth ramp-out before the note ends, in seconds
const RAMP_OUT: f64 = 0.05;

/// Sinusoidal pitch modulation for one note
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VibratoModulator {
    rate_hz: f64,
    depth_cents: f64,
    delay: f64,
    duration: f64,
}

impl VibratoModulator {
    pub fn new(params: &VibratoParams, duration: f64) -> Self {
        Self {
            rate_hz: params.rate.max(0.0) as f64,
            depth_cents: params.depth.max(0.0) as f64,
            delay: params.delay.max(0.0) as f64 / 1000.0,
            duration: duration.max(0.0),
        }
    }

    /// Pitch deviation in cents at `t` seconds into the note
    pub fn cents_at(&self, t: f64) -> f64 {
        if t < self.delay || t >= self.duration {
            return 0.0;
        }
        let since_onset = t - self.delay;
        let ramp = (since_onset / RAMP_IN).min(1.0) * ((self.duration - t) / RAMP_OUT).min(1.0);
        self.depth_cents * ramp * (TAU * self.rate_hz * since_onset).sin()
    }

    /// Playback-rate multiplier at `t` seconds into the note
    pub fn factor_at(&self, t: f64) -> f32 {
        2f64.powf(self.cents_at(t) / 1200.0) as f32
    }
}
