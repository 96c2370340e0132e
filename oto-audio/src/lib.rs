//! Synthesis engine for otosing
//!
//! This crate turns timed, pitched notes into sample-accurate audio:
//! - Timing: oto.ini markers resolved to playback windows
//! - Shifter: rate and granular/PSOLA pitch shifting
//! - Envelope: crossfade curves and per-note ADSR gain
//! - Engine: note scheduling, phrase pre-pass, voice registry
//! - Context: frame clock and the render-side voice mixer

mod context;
mod engine;
mod envelope;
mod note;
pub mod shifter;
mod timing;
mod vibrato;
mod voice;

pub use context::{AudioContext, DeviceError, RenderCommand, RenderVoice, VoiceRenderer, COMMAND_CAPACITY};
pub use engine::{
    EngineError, NoteError, PhraseOptions, ScheduledNote, SequenceOptions, SessionReport,
    SkippedNote, SynthEngine,
};
pub use envelope::{CrossfadeCurve, NoteEnvelope};
pub use note::{AdsrEnvelope, NoteEvent, PhraseNote, SampleData, SampleMap, VibratoParams};
pub use shifter::{pitch_to_rate, PitchBackend, ShiftError};
pub use timing::{OtoTiming, PlaybackWindow, TimingError};
pub use vibrato::VibratoModulator;
pub use voice::{ActiveVoice, CompletionToken, VoiceId, VoiceRegistry};

pub use oto_analysis::{
    JoinCorrectionOptions, NormalizationOptions, SpectralDistanceOptions,
};
