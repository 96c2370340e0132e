//! Phrase scheduler
//!
//! Turns timed notes into sample-accurate voices on the context clock:
//! 1. Stop the previous session, resume the device, pre-warm the granular backend
//! 2. Stable-sort notes by start time and resolve each note's oto window
//! 3. Phrase pre-pass: spectral crossfade stretching and loudness gains
//! 4. Render each note with the selected backend (rate fallback on failure)
//! 5. Read the clock, anchor the sequence so no preutterance is cut off and
//!    hand every voice to the renderer with an absolute start frame
//!
//! Problems with single notes (missing sample, bad timing, backend failure)
//! never abort the session; they are logged and listed in the [`SessionReport`].

use crate::context::{AudioContext, DeviceError, RenderCommand, RenderVoice};
use crate::envelope::{CrossfadeCurve, NoteEnvelope};
use crate::note::{AdsrEnvelope, NoteEvent, PhraseNote, SampleData, SampleMap};
use crate::shifter::{
    pitch_to_rate, GrainSettings, GranularShifter, PitchBackend, RateShifter, ShiftError,
    ShiftRequest, VoiceSource,
};
use crate::timing::{PlaybackWindow, TimingError};
use crate::vibrato::VibratoModulator;
use crate::voice::{ActiveVoice, CompletionToken, VoiceId, VoiceRegistry};
use oto_analysis::{
    dynamic_overlap, AdaptiveGrainSizer, AnalysisError, AnalysisSource, JoinCorrectionOptions,
    JoinGainCorrection, LoudnessNormalizer, NormalizationOptions, SpectralDistanceAnalyzer,
    SpectralDistanceOptions,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Longest crossfade between two notes, in seconds
const MAX_CROSSFADE: f64 = 0.1;
/// Fade applied where no crossfade hides the edge, in seconds
const ANTI_CLICK_FADE: f64 = 0.005;

/// Session-level failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("audio device unavailable: {0}")]
    Device(#[from] DeviceError),
}

/// Why a single note was not scheduled
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NoteError {
    #[error("no sample for alias '{alias}'")]
    MissingSample { alias: String },
    #[error("invalid oto timing: {0}")]
    InvalidTiming(#[from] TimingError),
    #[error("note has no playable duration")]
    ZeroDuration,
    #[error("pitch shifter failed: {0}")]
    Backend(#[from] ShiftError),
    #[error("voice could not be queued: {0}")]
    Device(#[from] DeviceError),
}

/// Options for playing notes from one sample
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceOptions {
    pub use_granular: bool,
    /// Size grains from the sample's pitch period (fixed-grain mode only)
    pub use_adaptive_grain_size: bool,
    /// Fixed grain size in seconds
    pub grain_size: f32,
    /// Grain overlap fraction
    pub grain_overlap: f32,
    /// Envelope for notes without their own
    pub default_envelope: AdsrEnvelope,
    pub crossfade_curve: CrossfadeCurve,
    /// Pitch-synchronous grains (granular backend only)
    pub use_psola: bool,
}

impl Default for SequenceOptions {
    fn default() -> Self {
        Self {
            use_granular: false,
            use_adaptive_grain_size: false,
            grain_size: 0.1,
            grain_overlap: 0.5,
            default_envelope: AdsrEnvelope::default(),
            crossfade_curve: CrossfadeCurve::Linear,
            use_psola: false,
        }
    }
}

/// Options for playing notes across a voicebank
#[derive(Debug, Clone, PartialEq)]
pub struct PhraseOptions {
    pub sequence: SequenceOptions,
    /// Stretch crossfades by the spectral distance at each join
    pub use_dynamic_overlap: bool,
    pub dynamic_overlap_max_scale: f32,
    pub spectral: SpectralDistanceOptions,
    pub use_loudness_normalization: bool,
    pub normalization: NormalizationOptions,
    pub join_correction: JoinCorrectionOptions,
}

impl Default for PhraseOptions {
    fn default() -> Self {
        Self {
            sequence: SequenceOptions::default(),
            use_dynamic_overlap: false,
            dynamic_overlap_max_scale: 2.0,
            spectral: SpectralDistanceOptions::default(),
            use_loudness_normalization: false,
            normalization: NormalizationOptions::default(),
            join_correction: JoinCorrectionOptions::default(),
        }
    }
}

/// A note that was handed to the renderer
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledNote {
    /// Position in the caller's note slice
    pub index: usize,
    pub voice: VoiceId,
    pub backend: PitchBackend,
    /// Absolute context time in seconds
    pub start_time: f64,
    pub end_time: f64,
    pub fade_in: f64,
    pub fade_out: f64,
    /// Crossfade length after dynamic scaling, in seconds
    pub overlap: f64,
    /// Velocity times loudness corrections
    pub gain: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SkippedNote {
    pub index: usize,
    pub reason: NoteError,
}

/// Outcome of one `play_*` call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionReport {
    /// Context time of sequence time zero
    pub anchor_time: f64,
    pub scheduled: Vec<ScheduledNote>,
    pub skipped: Vec<SkippedNote>,
    /// Indices of notes re-dispatched to a fallback backend
    pub fallbacks: Vec<usize>,
}

/// A resolved note waiting to be scheduled
struct PendingNote<'a> {
    index: usize,
    note: &'a NoteEvent,
    sample: &'a Arc<SampleData>,
    window: PlaybackWindow,
    overlap: f64,
    gain: f32,
}

impl<'a> PendingNote<'a> {
    fn source(&self) -> Result<AnalysisSource<'a>, AnalysisError> {
        let sample: &'a SampleData = self.sample;
        sample.analysis_source(&self.window)
    }
}

/// A rendered note waiting for the anchor
struct ReadyNote {
    index: usize,
    /// Start relative to the anchor (`start_time - preutterance`)
    offset: f64,
    duration: f64,
    fade_in: f64,
    fade_out: f64,
    overlap: f64,
    gain: f32,
    backend: PitchBackend,
    vibrato: Option<VibratoModulator>,
    source: Box<dyn VoiceSource>,
}

/// Concatenative synthesis engine bound to one audio context
pub struct SynthEngine {
    context: Arc<AudioContext>,
    registry: VoiceRegistry,
    rate: RateShifter,
    granular: GranularShifter,
    grain_sizer: AdaptiveGrainSizer,
    spectral: SpectralDistanceAnalyzer,
    loudness: LoudnessNormalizer,
    disposed: bool,
}

impl SynthEngine {
    pub fn new(context: Arc<AudioContext>) -> Self {
        Self {
            context,
            registry: VoiceRegistry::new(),
            rate: RateShifter::new(),
            granular: GranularShifter::new(),
            grain_sizer: AdaptiveGrainSizer::default(),
            spectral: SpectralDistanceAnalyzer::default(),
            loudness: LoudnessNormalizer::new(),
            disposed: false,
        }
    }

    pub fn context(&self) -> &Arc<AudioContext> {
        &self.context
    }

    /// Play notes that all use the same sample
    pub fn play_sequence(
        &mut self,
        notes: &[NoteEvent],
        sample: &Arc<SampleData>,
        options: &SequenceOptions,
    ) -> Result<SessionReport, EngineError> {
        if self.disposed {
            warn!(target: "oto_audio::engine", "play_sequence on a disposed engine ignored");
            return Ok(self.empty_report());
        }
        self.begin_session(options)?;

        let mut report = SessionReport::default();
        let window = match sample.oto().resolve(sample.duration()) {
            Ok(window) => window,
            Err(err) => {
                warn!(target: "oto_audio::engine", sample = sample.id(), error = %err, "invalid sample timing, skipping all notes");
                report.anchor_time = self.context.current_time();
                report.skipped = (0..notes.len())
                    .map(|index| SkippedNote {
                        index,
                        reason: NoteError::InvalidTiming(err.clone()),
                    })
                    .collect();
                return Ok(report);
            }
        };

        let pending = sorted_order(notes.iter().map(|n| n.start_time))
            .into_iter()
            .map(|index| PendingNote {
                index,
                note: &notes[index],
                sample,
                window,
                overlap: window.overlap,
                gain: notes[index].velocity,
            })
            .collect();

        Ok(self.schedule(pending, options, report))
    }

    /// Play notes that each name a voicebank alias
    pub fn play_phrase(
        &mut self,
        notes: &[PhraseNote],
        samples: &SampleMap,
        options: &PhraseOptions,
    ) -> Result<SessionReport, EngineError> {
        if self.disposed {
            warn!(target: "oto_audio::engine", "play_phrase on a disposed engine ignored");
            return Ok(self.empty_report());
        }
        self.begin_session(&options.sequence)?;

        if self.spectral.options() != &options.spectral {
            self.spectral = SpectralDistanceAnalyzer::new(options.spectral);
        }

        let mut report = SessionReport::default();
        let mut pending = Vec::with_capacity(notes.len());

        for index in sorted_order(notes.iter().map(|n| n.note.start_time)) {
            let phrase_note = &notes[index];
            let Some(sample) = samples.get(&phrase_note.alias) else {
                warn!(target: "oto_audio::engine", note = index, alias = %phrase_note.alias, "no sample for alias, skipping note");
                report.skipped.push(SkippedNote {
                    index,
                    reason: NoteError::MissingSample {
                        alias: phrase_note.alias.clone(),
                    },
                });
                continue;
            };

            match sample.oto().resolve(sample.duration()) {
                Ok(window) => pending.push(PendingNote {
                    index,
                    note: &phrase_note.note,
                    sample,
                    window,
                    overlap: window.overlap,
                    gain: phrase_note.note.velocity,
                }),
                Err(err) => {
                    warn!(target: "oto_audio::engine", note = index, alias = %phrase_note.alias, error = %err, "invalid oto timing, skipping note");
                    report.skipped.push(SkippedNote {
                        index,
                        reason: err.into(),
                    });
                }
            }
        }

        if options.use_dynamic_overlap {
            self.apply_dynamic_overlap(&mut pending, options.dynamic_overlap_max_scale);
        }
        if options.use_loudness_normalization {
            self.apply_loudness(&mut pending, &options.normalization, &options.join_correction);
        }

        Ok(self.schedule(pending, &options.sequence, report))
    }

    /// Cancel every voice of the current session
    pub fn stop(&mut self) {
        self.registry.detach_listeners();
        if let Err(err) = self.context.send(RenderCommand::StopAll) {
            match err {
                DeviceError::QueueFull => {
                    warn!(target: "oto_audio::engine", "render queue full, stop not delivered")
                }
                DeviceError::Disconnected => {
                    debug!(target: "oto_audio::engine", "renderer gone, nothing to stop")
                }
            }
        }
        self.context.drain_completions(|_| {});
        self.registry.clear();
    }

    /// Stop and release backend tables and analysis caches
    ///
    /// Later `play_*` calls are ignored.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.stop();
        self.granular.release();
        self.grain_sizer.clear_cache();
        self.spectral.clear_cache();
        self.loudness.clear_cache();
        self.disposed = true;
        info!(target: "oto_audio::engine", "engine disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// True while any voice of the current session has not ended
    pub fn is_playing(&mut self) -> bool {
        self.poll_completions();
        !self.registry.is_empty()
    }

    pub fn active_voices(&mut self) -> &[ActiveVoice] {
        self.poll_completions();
        self.registry.voices()
    }

    fn poll_completions(&mut self) {
        let registry = &mut self.registry;
        self.context.drain_completions(|id| {
            if let Some(voice) = registry.finish(id) {
                debug!(target: "oto_audio::engine", voice = %voice.id, "voice finished");
            }
        });
    }

    fn empty_report(&self) -> SessionReport {
        SessionReport {
            anchor_time: self.context.current_time(),
            ..Default::default()
        }
    }

    fn begin_session(&mut self, options: &SequenceOptions) -> Result<(), EngineError> {
        self.stop();
        if let Err(err) = self.context.ensure_running() {
            error!(target: "oto_audio::engine", error = %err, "output device not available");
            return Err(err.into());
        }
        if options.use_granular {
            self.granular.prewarm();
        }
        self.registry.attach_listeners();
        Ok(())
    }

    fn apply_dynamic_overlap(&self, pending: &mut [PendingNote<'_>], max_scale: f32) {
        for i in 1..pending.len() {
            let (Ok(outgoing), Ok(incoming)) = (pending[i - 1].source(), pending[i].source()) else {
                continue;
            };
            let distance = self.spectral.distance(&outgoing, &incoming);
            let base = pending[i].overlap;
            let overlap = dynamic_overlap(base, distance, max_scale);
            debug!(target: "oto_audio::engine", note = pending[i].index, distance, base, overlap, "dynamic overlap");
            pending[i].overlap = overlap;
        }
    }

    fn apply_loudness(
        &self,
        pending: &mut [PendingNote<'_>],
        normalization: &NormalizationOptions,
        join: &JoinCorrectionOptions,
    ) {
        let sources: Vec<Option<AnalysisSource<'_>>> =
            pending.iter().map(|p| p.source().ok()).collect();
        let globals: Vec<f32> = sources
            .iter()
            .map(|s| {
                s.as_ref()
                    .map_or(1.0, |s| self.loudness.normalization_gain(s, normalization))
            })
            .collect();
        let joins: Vec<JoinGainCorrection> = sources
            .windows(2)
            .enumerate()
            .map(|(i, pair)| match (&pair[0], &pair[1]) {
                (Some(a), Some(b)) => {
                    self.loudness.join_correction(a, globals[i], b, globals[i + 1], join)
                }
                _ => JoinGainCorrection::default(),
            })
            .collect();

        for (i, note) in pending.iter_mut().enumerate() {
            let incoming = if i > 0 { joins[i - 1].gain_b } else { 1.0 };
            let outgoing = joins.get(i).map_or(1.0, |j| j.gain_a);
            note.gain *= globals[i] * incoming * outgoing;
        }
    }

    fn schedule(
        &mut self,
        pending: Vec<PendingNote<'_>>,
        options: &SequenceOptions,
        mut report: SessionReport,
    ) -> SessionReport {
        let output_rate = self.context.sample_rate();
        let preferred = if options.use_granular {
            PitchBackend::Granular
        } else {
            PitchBackend::Rate
        };

        // All rendering happens before the clock is read
        let mut ready: Vec<ReadyNote> = Vec::with_capacity(pending.len());
        for (position, note) in pending.iter().enumerate() {
            let window = &note.window;
            let rate = pitch_to_rate(note.note.pitch);
            let duration = (note.note.duration.max(0.0) + window.preutterance)
                .min(window.sample_duration)
                .min(window.sample_duration / rate as f64);
            if !(duration > 0.0) {
                warn!(target: "oto_audio::engine", note = note.index, "note has no playable duration, skipping");
                report.skipped.push(SkippedNote {
                    index: note.index,
                    reason: NoteError::ZeroDuration,
                });
                continue;
            }

            // Both sides of a join fade over the incoming note's overlap
            let anti_click = ANTI_CLICK_FADE.min(duration * 0.5);
            let fade_time = |overlap: f64| overlap.min(duration * 0.5).min(MAX_CROSSFADE);
            let fade_in = if position > 0 {
                fade_time(note.overlap)
            } else {
                anti_click
            };
            let outgoing_overlap = pending.get(position + 1).map_or(note.overlap, |next| next.overlap);
            let fade_out = fade_time(outgoing_overlap).max(anti_click);

            let adsr = note.note.envelope.unwrap_or(options.default_envelope);
            let vibrato = note.note.vibrato.map(|v| VibratoModulator::new(&v, duration));
            let request = ShiftRequest {
                sample: note.sample.as_ref(),
                window,
                rate,
                duration,
                gain: note.gain,
                envelope: NoteEnvelope::new(&adsr, duration, fade_in, fade_out, options.crossfade_curve),
                vibrato,
                output_rate,
            };

            let mut backend = preferred;
            let prepared = loop {
                match self.prepare(backend, &request, note, options) {
                    Ok(source) => break Ok(source),
                    Err(err) => match backend.fallback() {
                        Some(next) => {
                            warn!(target: "oto_audio::engine", note = note.index, from = %backend, to = %next, error = %err, "pitch backend failed, falling back");
                            report.fallbacks.push(note.index);
                            backend = next;
                        }
                        None => break Err(err),
                    },
                }
            };
            match prepared {
                Ok(source) => ready.push(ReadyNote {
                    index: note.index,
                    offset: note.note.start_time - window.preutterance,
                    duration,
                    fade_in,
                    fade_out,
                    overlap: note.overlap,
                    gain: note.gain,
                    backend,
                    vibrato,
                    source,
                }),
                Err(err) => {
                    warn!(target: "oto_audio::engine", note = note.index, error = %err, "no backend could render note, skipping");
                    report.skipped.push(SkippedNote {
                        index: note.index,
                        reason: err.into(),
                    });
                }
            }
        }

        let now = self.context.current_time();
        let lead = ready.iter().map(|r| -r.offset).fold(0.0f64, f64::max);
        let anchor = now + lead;
        report.anchor_time = anchor;

        for note in ready {
            let start_time = (anchor + note.offset).max(now);
            let end_time = start_time + note.duration;
            let id = self.registry.allocate_id();
            let voice = RenderVoice {
                id,
                start_frame: self.context.time_to_frame(start_time),
                source: note.source,
                token: CompletionToken::new(id),
            };
            if let Err(err) = self.context.send(RenderCommand::Start(Box::new(voice))) {
                warn!(target: "oto_audio::engine", note = note.index, error = %err, "voice could not be queued, skipping");
                report.skipped.push(SkippedNote {
                    index: note.index,
                    reason: err.into(),
                });
                continue;
            }

            self.registry.insert(ActiveVoice {
                id,
                backend: note.backend,
                start_time,
                end_time,
                vibrato: note.vibrato,
            });

            debug!(
                target: "oto_audio::engine",
                note = note.index,
                voice = %id,
                backend = %note.backend,
                start_time,
                end_time,
                fade_in = note.fade_in,
                fade_out = note.fade_out,
                gain = note.gain,
                "note scheduled"
            );

            report.scheduled.push(ScheduledNote {
                index: note.index,
                voice: id,
                backend: note.backend,
                start_time,
                end_time,
                fade_in: note.fade_in,
                fade_out: note.fade_out,
                overlap: note.overlap,
                gain: note.gain,
            });
        }

        info!(
            target: "oto_audio::engine",
            scheduled = report.scheduled.len(),
            skipped = report.skipped.len(),
            fallbacks = report.fallbacks.len(),
            anchor,
            "session scheduled"
        );
        report
    }

    fn prepare(
        &self,
        backend: PitchBackend,
        request: &ShiftRequest<'_>,
        note: &PendingNote<'_>,
        options: &SequenceOptions,
    ) -> Result<Box<dyn VoiceSource>, ShiftError> {
        match backend {
            PitchBackend::Rate => Ok(Box::new(self.rate.prepare(request)?)),
            PitchBackend::Granular => {
                let grain_size = match note.source() {
                    Ok(source) if options.use_adaptive_grain_size && !options.use_psola => {
                        self.grain_sizer.grain_size(&source)
                    }
                    _ => options.grain_size,
                };
                let settings = GrainSettings {
                    grain_size,
                    grain_overlap: options.grain_overlap,
                    psola: options.use_psola,
                };
                Ok(Box::new(self.granular.render(request, &settings)?))
            }
        }
    }
}

/// Note indices ordered by start time, ties kept in input order
fn sorted_order(start_times: impl Iterator<Item = f64>) -> Vec<usize> {
    let times: Vec<f64> = start_times.collect();
    let mut order: Vec<usize> = (0..times.len()).collect();
    order.sort_by(|&a, &b| times[a].total_cmp(&times[b]));
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::VoiceRenderer;
    use crate::note::VibratoParams;
    use crate::timing::OtoTiming;
    use std::f32::consts::PI;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Duration;

    const RATE: u32 = 44100;

    fn tone(freqs: &[f32], gain: f32, sample_rate: u32, secs: f32) -> Vec<f32> {
        let len = (sample_rate as f32 * secs) as usize;
        (0..len)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                freqs.iter().map(|f| (2.0 * PI * f * t).sin()).sum::<f32>() * gain
                    / freqs.len() as f32
            })
            .collect()
    }

    fn sample(freqs: &[f32], gain: f32, sample_rate: u32, oto: OtoTiming) -> Arc<SampleData> {
        Arc::new(SampleData::new(tone(freqs, gain, sample_rate, 2.0), sample_rate, oto))
    }

    fn scenario_oto() -> OtoTiming {
        OtoTiming::new(0.0, 0.0, 0.0, 50.0, 20.0)
    }

    fn scenario_notes() -> Vec<NoteEvent> {
        [(0.0, 0.0), (2.0, 0.4), (4.0, 0.8)]
            .iter()
            .map(|&(pitch, start)| NoteEvent::new(pitch, start, 0.4))
            .collect()
    }

    fn new_engine() -> (SynthEngine, VoiceRenderer) {
        let (context, renderer) = AudioContext::new(RATE);
        (SynthEngine::new(context), renderer)
    }

    fn phrase(aliases: &[&str]) -> Vec<PhraseNote> {
        aliases
            .iter()
            .enumerate()
            .map(|(i, alias)| PhraseNote::new(*alias, NoteEvent::new(0.0, i as f64 * 0.4, 0.4)))
            .collect()
    }

    #[test]
    fn test_sequence_anchors_on_preutterance() {
        let (mut engine, mut renderer) = new_engine();
        let sample = sample(&[220.0], 0.5, RATE, scenario_oto());

        let report = engine
            .play_sequence(&scenario_notes(), &sample, &SequenceOptions::default())
            .unwrap();
        assert_eq!(report.scheduled.len(), 3);
        assert!(report.skipped.is_empty());
        assert!((report.anchor_time - 0.05).abs() < 1e-9);

        for (i, note) in report.scheduled.iter().enumerate() {
            assert_eq!(note.index, i);
            assert_eq!(note.backend, PitchBackend::Rate);
            assert!((note.start_time - 0.4 * i as f64).abs() < 1e-9);
            assert!((note.end_time - note.start_time - 0.45).abs() < 1e-9);
        }
        assert!((report.scheduled[0].fade_in - ANTI_CLICK_FADE).abs() < 1e-12);
        assert!((report.scheduled[1].fade_in - 0.02).abs() < 1e-12);
        assert!((report.scheduled[2].fade_out - 0.02).abs() < 1e-12);

        assert!(engine.is_playing());
        assert_eq!(engine.active_voices().len(), 3);

        let mut out = vec![0.0f32; 1024];
        let mut heard = false;
        for _ in 0..200 {
            renderer.render(&mut out, 1);
            heard |= out.iter().any(|s| s.abs() > 0.01);
            if !engine.is_playing() {
                break;
            }
        }
        assert!(heard);
        assert!(!engine.is_playing());
        assert!(engine.active_voices().is_empty());
    }

    #[test]
    fn test_notes_are_sorted_by_start_time() {
        let (mut engine, _renderer) = new_engine();
        let sample = sample(&[220.0], 0.5, RATE, scenario_oto());
        let notes = vec![
            NoteEvent::new(0.0, 0.8, 0.2),
            NoteEvent::new(0.0, 0.0, 0.2),
            NoteEvent::new(0.0, 0.4, 0.2),
        ];

        let report = engine
            .play_sequence(&notes, &sample, &SequenceOptions::default())
            .unwrap();
        let order: Vec<usize> = report.scheduled.iter().map(|n| n.index).collect();
        assert_eq!(order, vec![1, 2, 0]);
        assert!(report
            .scheduled
            .windows(2)
            .all(|pair| pair[0].start_time <= pair[1].start_time));
    }

    #[test]
    fn test_missing_alias_is_skipped() {
        let (mut engine, _renderer) = new_engine();
        let mut samples = SampleMap::new();
        samples.insert("a".into(), sample(&[220.0], 0.5, RATE, scenario_oto()));
        samples.insert("i".into(), sample(&[330.0], 0.5, RATE, scenario_oto()));

        let report = engine
            .play_phrase(&phrase(&["a", "zz", "i"]), &samples, &PhraseOptions::default())
            .unwrap();
        assert_eq!(report.scheduled.len(), 2);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].index, 1);
        assert_eq!(
            report.skipped[0].reason,
            NoteError::MissingSample { alias: "zz".into() }
        );
        assert!(engine.is_playing());
    }

    #[test]
    fn test_cutoff_limits_note_length() {
        let (mut engine, _renderer) = new_engine();
        let sample = sample(&[220.0], 0.5, RATE, OtoTiming::new(0.0, 0.0, -100.0, 0.0, 0.0));
        let notes = vec![NoteEvent::new(0.0, 0.0, 5.0)];

        let report = engine
            .play_sequence(&notes, &sample, &SequenceOptions::default())
            .unwrap();
        let note = &report.scheduled[0];
        assert!((note.end_time - note.start_time - 1.9).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_timing_is_skipped() {
        let (mut engine, _renderer) = new_engine();
        let mut samples = SampleMap::new();
        samples.insert("a".into(), sample(&[220.0], 0.5, RATE, scenario_oto()));
        samples.insert(
            "broken".into(),
            sample(&[220.0], 0.5, RATE, OtoTiming::new(1500.0, 0.0, 1000.0, 0.0, 0.0)),
        );

        let report = engine
            .play_phrase(&phrase(&["broken", "a"]), &samples, &PhraseOptions::default())
            .unwrap();
        assert_eq!(report.scheduled.len(), 1);
        assert!(matches!(report.skipped[0].reason, NoteError::InvalidTiming(_)));
        // the skipped note does not shift the anchor
        assert!((report.scheduled[0].start_time - 0.4 + 0.05 - report.anchor_time).abs() < 1e-9);
    }

    #[test]
    fn test_granular_failure_falls_back_to_rate() {
        let mut samples = SampleMap::new();
        // 4 kHz is below what the granular backend accepts
        samples.insert("lo".into(), sample(&[220.0], 0.5, 4000, scenario_oto()));
        samples.insert("a".into(), sample(&[220.0], 0.5, RATE, scenario_oto()));
        let notes = phrase(&["lo", "a"]);

        let (mut engine, _renderer) = new_engine();
        let mut options = PhraseOptions::default();
        options.sequence.use_granular = true;
        let report = engine.play_phrase(&notes, &samples, &options).unwrap();

        assert_eq!(report.fallbacks, vec![0]);
        assert_eq!(report.scheduled.len(), 2);
        assert_eq!(report.scheduled[0].backend, PitchBackend::Rate);
        assert_eq!(report.scheduled[1].backend, PitchBackend::Granular);

        let (mut reference, _reference_renderer) = new_engine();
        let rate_only = reference
            .play_phrase(&notes, &samples, &PhraseOptions::default())
            .unwrap();
        assert_eq!(report.scheduled[0].start_time, rate_only.scheduled[0].start_time);
        assert_eq!(report.scheduled[0].end_time, rate_only.scheduled[0].end_time);
    }

    #[test]
    fn test_stop_clears_voices() {
        let (mut engine, mut renderer) = new_engine();
        let sample = sample(&[220.0], 0.5, RATE, scenario_oto());
        engine
            .play_sequence(&scenario_notes(), &sample, &SequenceOptions::default())
            .unwrap();

        let mut out = vec![0.0f32; 512];
        renderer.render(&mut out, 1);
        engine.stop();
        assert!(!engine.is_playing());
        assert!(engine.active_voices().is_empty());

        renderer.render(&mut out, 1);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(renderer.active_voices(), 0);
    }

    #[test]
    fn test_new_session_replaces_previous() {
        let (mut engine, _renderer) = new_engine();
        let sample = sample(&[220.0], 0.5, RATE, scenario_oto());
        engine
            .play_sequence(&scenario_notes(), &sample, &SequenceOptions::default())
            .unwrap();
        engine
            .play_sequence(&[NoteEvent::new(0.0, 0.0, 0.3)], &sample, &SequenceOptions::default())
            .unwrap();
        assert_eq!(engine.active_voices().len(), 1);
    }

    #[test]
    fn test_dispose_makes_engine_inert() {
        let (mut engine, _renderer) = new_engine();
        let sample = sample(&[220.0], 0.5, RATE, scenario_oto());
        let options = SequenceOptions {
            use_granular: true,
            use_adaptive_grain_size: true,
            ..Default::default()
        };
        engine.play_sequence(&scenario_notes(), &sample, &options).unwrap();
        assert!(engine.granular.is_initialized());
        assert_eq!(engine.grain_sizer.cached_len(), 1);

        engine.dispose();
        assert!(engine.is_disposed());
        assert!(!engine.is_playing());
        assert!(!engine.granular.is_initialized());
        assert_eq!(engine.grain_sizer.cached_len(), 0);

        let report = engine.play_sequence(&scenario_notes(), &sample, &options).unwrap();
        assert!(report.scheduled.is_empty());
        assert!(!engine.is_playing());
    }

    #[test]
    fn test_device_failure_aborts_session() {
        let (mut engine, renderer) = new_engine();
        drop(renderer);
        let sample = sample(&[220.0], 0.5, RATE, scenario_oto());
        let result = engine.play_sequence(&scenario_notes(), &sample, &SequenceOptions::default());
        assert_eq!(result, Err(EngineError::Device(DeviceError::Disconnected)));
    }

    #[test]
    fn test_suspended_device_is_resumed() {
        let (mut engine, _renderer) = new_engine();
        engine.context().suspend();
        let sample = sample(&[220.0], 0.5, RATE, scenario_oto());
        engine
            .play_sequence(&scenario_notes(), &sample, &SequenceOptions::default())
            .unwrap();
        assert!(!engine.context().is_suspended());
    }

    #[test]
    fn test_dynamic_overlap_stretches_mismatched_joins() {
        let (mut engine, _renderer) = new_engine();
        let mut samples = SampleMap::new();
        samples.insert("dark".into(), sample(&[200.0, 400.0], 0.5, RATE, scenario_oto()));
        samples.insert("bright".into(), sample(&[2500.0, 5000.0], 0.5, RATE, scenario_oto()));
        let options = PhraseOptions {
            use_dynamic_overlap: true,
            ..Default::default()
        };

        let report = engine
            .play_phrase(&phrase(&["dark", "bright"]), &samples, &options)
            .unwrap();
        let overlap = report.scheduled[1].overlap;
        assert!(overlap > 0.02, "overlap {}", overlap);
        assert!(overlap <= 0.04 + 1e-12);
        assert_eq!(report.scheduled[0].overlap, 0.02);
        assert_eq!(engine.spectral.cached_len(), 1);

        // The outgoing note fades over the stretched overlap too
        assert!((report.scheduled[0].fade_out - overlap).abs() < 1e-12);
        assert!((report.scheduled[1].fade_in - overlap).abs() < 1e-12);
        assert!((report.scheduled[1].fade_out - overlap).abs() < 1e-12);
    }

    #[test]
    fn test_loudness_normalization_evens_levels() {
        let (mut engine, _renderer) = new_engine();
        let mut samples = SampleMap::new();
        samples.insert("loud".into(), sample(&[220.0], 0.8, RATE, scenario_oto()));
        samples.insert("quiet".into(), sample(&[220.0], 0.05, RATE, scenario_oto()));
        let options = PhraseOptions {
            use_loudness_normalization: true,
            ..Default::default()
        };

        let report = engine
            .play_phrase(&phrase(&["loud", "quiet"]), &samples, &options)
            .unwrap();
        let (a, b) = (&report.scheduled[0], &report.scheduled[1]);
        assert!(a.gain < 1.0);
        assert!(b.gain > 1.0);

        let raw_step = (0.05f32 / 0.8).ln().abs();
        let normalized_step = ((0.05 * b.gain) / (0.8 * a.gain)).ln().abs();
        assert!(normalized_step < raw_step);
    }

    #[test]
    fn test_vibrato_is_tracked() {
        let (mut engine, _renderer) = new_engine();
        let sample = sample(&[220.0], 0.5, RATE, scenario_oto());
        let notes = vec![NoteEvent::new(0.0, 0.0, 1.0).with_vibrato(VibratoParams::default())];
        engine
            .play_sequence(&notes, &sample, &SequenceOptions::default())
            .unwrap();
        assert!(engine.active_voices()[0].vibrato.is_some());
    }

    #[test]
    fn test_psola_session_renders() {
        let (mut engine, mut renderer) = new_engine();
        let sample = sample(&[180.0], 0.5, RATE, scenario_oto());
        let options = SequenceOptions {
            use_granular: true,
            use_psola: true,
            crossfade_curve: CrossfadeCurve::EqualPower,
            ..Default::default()
        };
        let report = engine.play_sequence(&scenario_notes(), &sample, &options).unwrap();
        assert!(report.fallbacks.is_empty());
        assert!(report.scheduled.iter().all(|n| n.backend == PitchBackend::Granular));

        let mut out = vec![0.0f32; 2048];
        let mut heard = false;
        for _ in 0..100 {
            renderer.render(&mut out, 2);
            heard |= out.iter().any(|s| s.abs() > 0.01);
            if !engine.is_playing() {
                break;
            }
        }
        assert!(heard);
        assert!(!engine.is_playing());
    }

    #[test]
    fn test_rendering_finishes_before_the_anchor() {
        let (mut engine, mut renderer) = new_engine();
        let running = Arc::new(AtomicBool::new(true));

        // Clock that runs no faster than real time
        let clock = {
            let running = Arc::clone(&running);
            thread::spawn(move || {
                let mut out = vec![0.0f32; RATE as usize / 100];
                while running.load(Ordering::Relaxed) {
                    renderer.render(&mut out, 1);
                    thread::sleep(Duration::from_millis(10));
                }
            })
        };
        while engine.context().current_frame() == 0 {
            thread::sleep(Duration::from_millis(1));
        }

        let sample = sample(&[180.0], 0.5, RATE, scenario_oto());
        let options = SequenceOptions {
            use_granular: true,
            use_psola: true,
            ..Default::default()
        };
        let notes: Vec<NoteEvent> = (0..8)
            .map(|i| NoteEvent::new((i % 3) as f32, 0.1 + i as f64 * 0.25, 0.25))
            .collect();

        let report = engine.play_sequence(&notes, &sample, &options).unwrap();
        let returned_at = engine.context().current_time();
        running.store(false, Ordering::Relaxed);
        clock.join().unwrap();

        assert_eq!(report.scheduled.len(), 8);
        assert!(report.fallbacks.is_empty());
        for (i, note) in report.scheduled.iter().enumerate() {
            let planned = report.anchor_time + 0.1 + i as f64 * 0.25 - 0.05;
            assert!((note.start_time - planned).abs() < 1e-9);
        }
        let first = report.scheduled[0].start_time;
        assert!(
            first > returned_at,
            "first note at {:.3}s but scheduling returned at {:.3}s",
            first,
            returned_at
        );
        assert_eq!(engine.granular.cached_len(), 1);
    }
}
