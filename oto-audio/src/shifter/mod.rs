//! Pitch shifting backends
//!
//! Both backends turn a resolved note into a [`VoiceSource`] the renderer can
//! play from an absolute start frame:
//! - [`RateShifter`]: resampling playback, pitch and speed change together
//! - [`GranularShifter`]: overlap-added grains (fixed size or PSOLA), pitch
//!   independent of duration

mod granular;
mod rate;

pub use granular::{GrainSettings, GranularShifter, RenderedVoice};
pub use rate::{RateShifter, RateVoice};

use crate::envelope::NoteEnvelope;
use crate::note::SampleData;
use crate::timing::PlaybackWindow;
use crate::vibrato::VibratoModulator;
use std::fmt;
use thiserror::Error;

/// Errors a backend raises when it cannot render a note
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShiftError {
    #[error("granular engine is not initialized")]
    NotInitialized,
    #[error("unsupported source sample rate: {0} Hz")]
    UnsupportedSampleRate(u32),
    #[error("playback region is empty")]
    EmptyRegion,
}

/// Which backend renders a note
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PitchBackend {
    Rate,
    Granular,
}

impl PitchBackend {
    /// Backend to retry with when this one fails
    pub fn fallback(self) -> Option<PitchBackend> {
        match self {
            PitchBackend::Granular => Some(PitchBackend::Rate),
            PitchBackend::Rate => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PitchBackend::Rate => "rate",
            PitchBackend::Granular => "granular",
        }
    }
}

impl fmt::Display for PitchBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Playback-rate ratio for a pitch offset in semitones
#[inline]
pub fn pitch_to_rate(semitones: f32) -> f32 {
    2f32.powf(semitones / 12.0)
}

/// Render-side audio of one voice
pub trait VoiceSource: Send {
    /// Mix up to `out.len()` frames into `out`
    ///
    /// Returns the number of frames produced; fewer than requested means the
    /// voice has ended.
    fn render_add(&mut self, out: &mut [f32]) -> usize;
}

/// Everything a backend needs to render one note
#[derive(Debug, Clone, Copy)]
pub struct ShiftRequest<'a> {
    pub sample: &'a SampleData,
    pub window: &'a PlaybackWindow,
    /// Pitch ratio (see [`pitch_to_rate`])
    pub rate: f32,
    /// Output length in seconds
    pub duration: f64,
    /// Linear gain (velocity and loudness corrections)
    pub gain: f32,
    pub envelope: NoteEnvelope,
    pub vibrato: Option<VibratoModulator>,
    /// Device sample rate
    pub output_rate: u32,
}

impl ShiftRequest<'_> {
    /// Vibrato multiplier at `t` seconds into the note
    fn vibrato_factor(&self, t: f64) -> f32 {
        self.vibrato.map_or(1.0, |v| v.factor_at(t))
    }

    fn output_frames(&self) -> usize {
        (self.duration.max(0.0) * self.output_rate as f64).round() as usize
    }
}
