//! Oto timing resolution
//!
//! oto.ini markers are milliseconds measured from the start of the file
//! (`offset`, `cutoff`) or from the offset (`consonant`, `preutterance`).
//! `cutoff` has three meanings depending on its sign:
//! - `< 0`: distance measured back from the end of the buffer
//! - `> 0`: absolute position from the start of the buffer
//! - `== 0`: play to the end of the buffer

use oto_analysis::SampleRegion;
use thiserror::Error;

/// A sample's timing cannot produce a playable window
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TimingError {
    #[error("sample buffer is empty")]
    EmptyBuffer,
    #[error("playback window {start_ms:.1}..{end_ms:.1} ms is empty")]
    EmptyWindow { start_ms: f64, end_ms: f64 },
}

/// Raw oto markers for one sample, in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct OtoTiming {
    pub offset: f64,
    pub consonant: f64,
    pub cutoff: f64,
    pub preutterance: f64,
    pub overlap: f64,
}

/// Resolved playback window of one sample, in seconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackWindow {
    pub sample_start: f64,
    pub sample_end: f64,
    pub sample_duration: f64,
    /// Start of the sustained vowel (offset + consonant), clamped into the window
    pub vowel_start: f64,
    pub preutterance: f64,
    pub overlap: f64,
}

impl OtoTiming {
    pub fn new(offset: f64, consonant: f64, cutoff: f64, preutterance: f64, overlap: f64) -> Self {
        Self {
            offset,
            consonant,
            cutoff,
            preutterance,
            overlap,
        }
    }

    /// Resolve the markers against a buffer of `buffer_duration` seconds
    pub fn resolve(&self, buffer_duration: f64) -> Result<PlaybackWindow, TimingError> {
        if !(buffer_duration > 0.0) {
            return Err(TimingError::EmptyBuffer);
        }

        let offset = non_negative(self.offset) / 1000.0;
        let consonant = non_negative(self.consonant) / 1000.0;
        let preutterance = non_negative(self.preutterance) / 1000.0;
        let overlap = non_negative(self.overlap) / 1000.0;
        let cutoff = if self.cutoff.is_finite() { self.cutoff / 1000.0 } else { 0.0 };

        let sample_start = offset.min(buffer_duration);
        let sample_end = if cutoff < 0.0 {
            buffer_duration + cutoff
        } else if cutoff > 0.0 {
            cutoff.min(buffer_duration)
        } else {
            buffer_duration
        };

        let sample_duration = sample_end - sample_start;
        if !(sample_duration > 0.0) {
            return Err(TimingError::EmptyWindow {
                start_ms: sample_start * 1000.0,
                end_ms: sample_end * 1000.0,
            });
        }

        Ok(PlaybackWindow {
            sample_start,
            sample_end,
            sample_duration,
            vowel_start: (sample_start + consonant).min(sample_end),
            preutterance,
            overlap,
        })
    }
}

fn non_negative(ms: f64) -> f64 {
    if ms.is_finite() {
        ms.max(0.0)
    } else {
        0.0
    }
}

impl PlaybackWindow {
    /// Frame region of this window in a buffer of `len` frames at `sample_rate`
    pub fn region(&self, sample_rate: u32, len: usize) -> SampleRegion {
        let to_frame = |secs: f64| ((secs * sample_rate as f64).round() as usize).min(len);
        SampleRegion::new(
            to_frame(self.sample_start),
            to_frame(self.vowel_start),
            to_frame(self.sample_end),
        )
    }
}
