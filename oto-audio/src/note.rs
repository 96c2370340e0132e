//! Note and sample types consumed by the engine

use crate::timing::{OtoTiming, PlaybackWindow};
use oto_analysis::{AnalysisError, AnalysisSource};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SAMPLE_ID: AtomicU64 = AtomicU64::new(1);

/// ADSR envelope; times in milliseconds, sustain as a fraction of peak
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdsrEnvelope {
    pub attack: f32,
    pub decay: f32,
    pub sustain: f32,
    pub release: f32,
}

impl Default for AdsrEnvelope {
    fn default() -> Self {
        Self {
            attack: 5.0,
            decay: 50.0,
            sustain: 0.85,
            release: 30.0,
        }
    }
}

/// Vibrato settings for one note
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VibratoParams {
    /// LFO rate in Hz
    pub rate: f32,
    /// Depth in cents
    pub depth: f32,
    /// Onset delay in milliseconds
    pub delay: f32,
}

impl Default for VibratoParams {
    fn default() -> Self {
        Self {
            rate: 5.5,
            depth: 30.0,
            delay: 150.0,
        }
    }
}

/// A pitched, timed note; times in seconds relative to the sequence start
#[derive(Debug, Clone, PartialEq)]
pub struct NoteEvent {
    /// Semitones relative to the recorded pitch
    pub pitch: f32,
    pub start_time: f64,
    pub duration: f64,
    /// 0.0 - 1.0
    pub velocity: f32,
    pub envelope: Option<AdsrEnvelope>,
    pub vibrato: Option<VibratoParams>,
}

impl NoteEvent {
    pub fn new(pitch: f32, start_time: f64, duration: f64) -> Self {
        Self {
            pitch,
            start_time,
            duration,
            velocity: 1.0,
            envelope: None,
            vibrato: None,
        }
    }

    pub fn with_velocity(mut self, velocity: f32) -> Self {
        self.velocity = velocity.clamp(0.0, 1.0);
        self
    }

    pub fn with_envelope(mut self, envelope: AdsrEnvelope) -> Self {
        self.envelope = Some(envelope);
        self
    }

    pub fn with_vibrato(mut self, vibrato: VibratoParams) -> Self {
        self.vibrato = Some(vibrato);
        self
    }
}

/// A note bound to a voicebank alias
#[derive(Debug, Clone, PartialEq)]
pub struct PhraseNote {
    pub alias: String,
    pub note: NoteEvent,
}

impl PhraseNote {
    pub fn new(alias: impl Into<String>, note: NoteEvent) -> Self {
        Self {
            alias: alias.into(),
            note,
        }
    }
}

/// Decoded mono PCM with its oto timing
///
/// The buffer is shared and never written after construction. Every instance
/// gets a process-unique id that keys the analysis caches.
#[derive(Debug)]
pub struct SampleData {
    id: u64,
    samples: Arc<[f32]>,
    sample_rate: u32,
    oto: OtoTiming,
}

impl SampleData {
    pub fn new(samples: impl Into<Arc<[f32]>>, sample_rate: u32, oto: OtoTiming) -> Self {
        Self {
            id: NEXT_SAMPLE_ID.fetch_add(1, Ordering::Relaxed),
            samples: samples.into(),
            sample_rate,
            oto,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn samples(&self) -> &Arc<[f32]> {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn oto(&self) -> &OtoTiming {
        &self.oto
    }

    /// Buffer length in seconds
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Analysis view over a resolved playback window
    pub fn analysis_source(&self, window: &PlaybackWindow) -> Result<AnalysisSource<'_>, AnalysisError> {
        let region = window.region(self.sample_rate, self.samples.len());
        AnalysisSource::new(self.id, &self.samples, self.sample_rate, region)
    }
}

/// Alias -> sample lookup for phrase playback
pub type SampleMap = HashMap<String, Arc<SampleData>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_ids_are_unique() {
        let a = SampleData::new(vec![0.0f32; 10], 44100, OtoTiming::default());
        let b = SampleData::new(vec![0.0f32; 10], 44100, OtoTiming::default());
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_sample_duration() {
        let sample = SampleData::new(vec![0.0f32; 22050], 44100, OtoTiming::default());
        assert!((sample.duration() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_note_builders() {
        let note = NoteEvent::new(2.0, 0.5, 0.25)
            .with_velocity(1.5)
            .with_vibrato(VibratoParams::default());
        assert_eq!(note.velocity, 1.0);
        assert!(note.vibrato.is_some());
        assert!(note.envelope.is_none());
    }

    #[test]
    fn test_analysis_source_uses_window() {
        let sample = SampleData::new(vec![0.1f32; 1000], 1000, OtoTiming::new(100.0, 100.0, -100.0, 0.0, 0.0));
        let window = sample.oto().resolve(sample.duration()).unwrap();
        let source = sample.analysis_source(&window).unwrap();
        assert_eq!(source.playback().len(), 800);
        assert_eq!(source.vowel().len(), 700);
        assert_eq!(source.id(), sample.id());
    }
}
