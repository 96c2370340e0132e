//! Crossfade curves and per-note gain envelopes

use crate::note::AdsrEnvelope;
use std::f32::consts::FRAC_PI_2;

/// Shape of a crossfade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrossfadeCurve {
    #[default]
    Linear,
    /// sin/cos pair, constant summed power
    EqualPower,
}

impl CrossfadeCurve {
    /// Fade-in gain at normalized position `t` (0.0 - 1.0)
    #[inline]
    pub fn fade_in(self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            CrossfadeCurve::Linear => t,
            CrossfadeCurve::EqualPower => (t * FRAC_PI_2).sin(),
        }
    }

    /// Fade-out gain at normalized position `t` (0.0 - 1.0)
    #[inline]
    pub fn fade_out(self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            CrossfadeCurve::Linear => 1.0 - t,
            CrossfadeCurve::EqualPower => (t * FRAC_PI_2).cos(),
        }
    }

    /// `n` evenly spaced fade-in gains from 0.0 to 1.0 inclusive
    pub fn fade_in_curve(self, n: usize) -> Vec<f32> {
        sampled(n, |t| self.fade_in(t))
    }

    /// `n` evenly spaced fade-out gains from 1.0 to 0.0 inclusive
    pub fn fade_out_curve(self, n: usize) -> Vec<f32> {
        sampled(n, |t| self.fade_out(t))
    }
}

fn sampled(n: usize, f: impl Fn(f32) -> f32) -> Vec<f32> {
    match n {
        0 => Vec::new(),
        1 => vec![f(1.0)],
        _ => (0..n).map(|i| f(i as f32 / (n - 1) as f32)).collect(),
    }
}

/// Gain envelope of one scheduled note, times in seconds
///
/// Attack and release are limited to the note's crossfade windows, so the
/// fade into and out of a neighbour follows the crossfade curve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteEnvelope {
    duration: f64,
    attack: f64,
    decay: f64,
    sustain: f32,
    release: f64,
    curve: CrossfadeCurve,
}

impl NoteEnvelope {
    pub fn new(
        adsr: &AdsrEnvelope,
        duration: f64,
        fade_in: f64,
        fade_out: f64,
        curve: CrossfadeCurve,
    ) -> Self {
        let duration = duration.max(0.0);
        let ms = |v: f32| (v.max(0.0) as f64) / 1000.0;

        let release = ms(adsr.release).min(fade_out.max(0.0)).min(duration);
        let mut attack = ms(adsr.attack).min(fade_in.max(0.0));
        let mut decay = ms(adsr.decay);

        let available = duration - release;
        if attack + decay > available && attack + decay > 0.0 {
            let scale = available / (attack + decay);
            attack *= scale;
            decay *= scale;
        }

        Self {
            duration,
            attack,
            decay,
            sustain: adsr.sustain.clamp(0.0, 1.0),
            release,
            curve,
        }
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn attack(&self) -> f64 {
        self.attack
    }

    pub fn decay(&self) -> f64 {
        self.decay
    }

    pub fn release(&self) -> f64 {
        self.release
    }

    pub fn curve(&self) -> CrossfadeCurve {
        self.curve
    }

    /// Envelope gain at `t` seconds into the note
    pub fn gain_at(&self, t: f64) -> f32 {
        if t < 0.0 || t >= self.duration {
            return 0.0;
        }
        let release_start = self.duration - self.release;
        if t < release_start {
            return self.level_before_release(t);
        }
        let level = self.level_before_release(release_start);
        let progress = ((t - release_start) / self.release) as f32;
        level * self.curve.fade_out(progress)
    }

    fn level_before_release(&self, t: f64) -> f32 {
        if t < self.attack {
            self.curve.fade_in((t / self.attack) as f32)
        } else if t < self.attack + self.decay {
            let progress = ((t - self.attack) / self.decay) as f32;
            1.0 + (self.sustain - 1.0) * progress
        } else {
            self.sustain
        }
    }
}
