//! Resampling pitch shifter
//!
//! Reads the source at `rate × source_rate / output_rate` frames per output
//! frame with linear interpolation. Vibrato is applied per control block.

use super::{ShiftError, ShiftRequest, VoiceSource};
use crate::envelope::NoteEnvelope;
use crate::vibrato::VibratoModulator;
use std::sync::Arc;

/// Frames between vibrato updates
const CONTROL_BLOCK: usize = 128;

/// Stateless factory for [`RateVoice`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct RateShifter;

impl RateShifter {
    pub fn new() -> Self {
        Self
    }

    pub fn prepare(&self, request: &ShiftRequest<'_>) -> Result<RateVoice, ShiftError> {
        let sample = request.sample;
        if sample.sample_rate() == 0 || request.output_rate == 0 {
            return Err(ShiftError::UnsupportedSampleRate(sample.sample_rate()));
        }
        let region = request.window.region(sample.sample_rate(), sample.samples().len());
        if region.is_empty() {
            return Err(ShiftError::EmptyRegion);
        }

        Ok(RateVoice {
            samples: Arc::clone(sample.samples()),
            position: region.start() as f64,
            end: region.end(),
            step: request.rate.max(0.0) as f64 * sample.sample_rate() as f64
                / request.output_rate as f64,
            gain: request.gain,
            envelope: request.envelope,
            vibrato: request.vibrato,
            output_rate: request.output_rate as f64,
            frame: 0,
            total_frames: request.output_frames(),
            vibrato_factor: 1.0,
        })
    }
}

/// A note played back by resampling
pub struct RateVoice {
    samples: Arc<[f32]>,
    position: f64,
    end: usize,
    step: f64,
    gain: f32,
    envelope: NoteEnvelope,
    vibrato: Option<VibratoModulator>,
    output_rate: f64,
    frame: usize,
    total_frames: usize,
    vibrato_factor: f64,
}

impl RateVoice {
    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    #[inline]
    fn interpolate(&self) -> f32 {
        let index = self.position as usize;
        let frac = (self.position - index as f64) as f32;
        let s0 = self.samples[index];
        let s1 = self.samples[(index + 1).min(self.end - 1)];
        s0 + (s1 - s0) * frac
    }
}

impl VoiceSource for RateVoice {
    fn render_add(&mut self, out: &mut [f32]) -> usize {
        for (i, sample) in out.iter_mut().enumerate() {
            if self.frame >= self.total_frames || self.position >= self.end as f64 {
                return i;
            }

            let t = self.frame as f64 / self.output_rate;
            if self.frame % CONTROL_BLOCK == 0 {
                self.vibrato_factor = self.vibrato.map_or(1.0, |v| v.factor_at(t) as f64);
            }

            *sample += self.interpolate() * self.gain * self.envelope.gain_at(t);
            self.position += self.step * self.vibrato_factor;
            self.frame += 1;
        }
        out.len()
    }
}
