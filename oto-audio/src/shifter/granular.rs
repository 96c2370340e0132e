//! Granular and PSOLA pitch shifter
//!
//! Notes are rendered ahead of time on the control thread; the renderer only
//! copies the finished buffer.
//!
//! Fixed grains: Hann-windowed grains resampled by the pitch ratio, placed at
//! a constant hop while the source read position follows output time 1:1, so
//! duration does not depend on pitch.
//!
//! PSOLA: two-period grains centered on the analysis pitch marks are placed
//! at synthesis marks `period / ratio` apart. Grains are not resampled, which
//! keeps the formants where they were recorded. Unvoiced stretches are copied
//! with short grains at unity spacing.

use super::{ShiftError, ShiftRequest, VoiceSource};
use crate::note::SampleData;
use crate::timing::PlaybackWindow;
use oto_analysis::PeriodDetector;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::f64::consts::TAU;
use std::ops::RangeInclusive;
use std::sync::Arc;
use tracing::debug;

const WINDOW_TABLE_SIZE: usize = 2048;
const SUPPORTED_RATES: RangeInclusive<u32> = 8000..=192_000;
const MIN_GRAIN_FRAMES: usize = 16;
/// Window sums below this are left unnormalized
const NORM_FLOOR: f32 = 1e-3;
/// Grain period used for unvoiced stretches, in seconds
const UNVOICED_PERIOD: f64 = 0.01;

/// Fixed-grain parameters; ignored in PSOLA mode
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrainSettings {
    /// Grain length in seconds
    pub grain_size: f32,
    /// Fraction of each grain shared with the next (0.0 - 0.95)
    pub grain_overlap: f32,
    pub psola: bool,
}

impl Default for GrainSettings {
    fn default() -> Self {
        Self {
            grain_size: 0.1,
            grain_overlap: 0.5,
            psola: false,
        }
    }
}

/// Sample id and playback region in frames
type MarkKey = (u64, usize, usize);

/// Granular backend; must be pre-warmed before it can render
pub struct GranularShifter {
    window: Option<Arc<[f32]>>,
    detector: PeriodDetector,
    marks: Mutex<HashMap<MarkKey, Arc<[usize]>>>,
}

impl Default for GranularShifter {
    fn default() -> Self {
        Self::new()
    }
}

impl GranularShifter {
    pub fn new() -> Self {
        Self {
            window: None,
            detector: PeriodDetector::default(),
            marks: Mutex::new(HashMap::new()),
        }
    }

    /// Build the window table; cheap to call again once initialized
    pub fn prewarm(&mut self) {
        if self.window.is_some() {
            return;
        }
        let table: Vec<f32> = (0..=WINDOW_TABLE_SIZE)
            .map(|i| (0.5 * (1.0 - (TAU * i as f64 / WINDOW_TABLE_SIZE as f64).cos())) as f32)
            .collect();
        self.window = Some(table.into());
        debug!(target: "oto_audio::granular", size = WINDOW_TABLE_SIZE, "window table ready");
    }

    /// Drop the window table and cached pitch marks; rendering fails until
    /// the next `prewarm`
    pub fn release(&mut self) {
        self.window = None;
        self.clear_cache();
    }

    /// Pitch marks of a sample's playback region (cached by sample id and region)
    pub fn pitch_marks(&self, sample: &SampleData, window: &PlaybackWindow) -> Arc<[usize]> {
        let sample_rate = sample.sample_rate();
        let region = window.region(sample_rate, sample.samples().len());
        let key = (sample.id(), region.start(), region.end());
        if let Some(marks) = self.marks.lock().get(&key) {
            return Arc::clone(marks);
        }

        let source = &sample.samples()[region.start()..region.end()];
        let marks: Arc<[usize]> = self.detector.pitch_marks(source, sample_rate).into();
        debug!(
            target: "oto_audio::granular",
            sample = sample.id(),
            marks = marks.len(),
            "pitch marks detected"
        );
        self.marks.lock().insert(key, Arc::clone(&marks));
        marks
    }

    pub fn clear_cache(&self) {
        self.marks.lock().clear();
    }

    pub fn cached_len(&self) -> usize {
        self.marks.lock().len()
    }

    pub fn is_initialized(&self) -> bool {
        self.window.is_some()
    }

    /// Render a whole note
    pub fn render(
        &self,
        request: &ShiftRequest<'_>,
        settings: &GrainSettings,
    ) -> Result<RenderedVoice, ShiftError> {
        let window = self.window.as_deref().ok_or(ShiftError::NotInitialized)?;

        let sample = request.sample;
        let sample_rate = sample.sample_rate();
        if !SUPPORTED_RATES.contains(&sample_rate) || request.output_rate == 0 {
            return Err(ShiftError::UnsupportedSampleRate(sample_rate));
        }
        let region = request.window.region(sample_rate, sample.samples().len());
        if region.is_empty() {
            return Err(ShiftError::EmptyRegion);
        }
        let source = &sample.samples()[region.start()..region.end()];

        let out_len = request.output_frames();
        let mut grains = GrainBuffer::new(window, out_len);

        if settings.psola {
            let marks = self.pitch_marks(sample, request.window);
            if marks.len() >= 2 {
                let max_period = self.detector.frame_len(sample_rate) / 2;
                psola(request, source, &marks, max_period, &mut grains);
            } else {
                debug!(
                    target: "oto_audio::granular",
                    sample = sample.id(),
                    "no pitch marks, using fixed grains"
                );
                fixed_grains(request, settings, source, &mut grains);
            }
        } else {
            fixed_grains(request, settings, source, &mut grains);
        }

        let output_rate = request.output_rate as f64;
        let frames = grains
            .finish()
            .into_iter()
            .enumerate()
            .map(|(i, s)| s * request.gain * request.envelope.gain_at(i as f64 / output_rate))
            .collect();

        Ok(RenderedVoice { frames, position: 0 })
    }
}

/// Overlap-add accumulator with a running window sum
struct GrainBuffer<'a> {
    window: &'a [f32],
    out: Vec<f32>,
    norm: Vec<f32>,
}

impl<'a> GrainBuffer<'a> {
    fn new(window: &'a [f32], len: usize) -> Self {
        Self {
            window,
            out: vec![0.0; len],
            norm: vec![0.0; len],
        }
    }

    fn len(&self) -> usize {
        self.out.len()
    }

    /// Window value at `phase` (0.0 - 1.0)
    #[inline]
    fn window_at(&self, phase: f64) -> f32 {
        let pos = phase.clamp(0.0, 1.0) * WINDOW_TABLE_SIZE as f64;
        let index = (pos as usize).min(WINDOW_TABLE_SIZE - 1);
        let frac = (pos - index as f64) as f32;
        let (a, b) = (self.window[index], self.window[index + 1]);
        a + (b - a) * frac
    }

    /// Add one grain of `len` frames starting at output frame `start`
    ///
    /// `read(k)` returns the unwindowed grain sample at grain offset `k`.
    fn add_grain(&mut self, start: i64, len: usize, read: impl Fn(usize) -> f32) {
        for k in 0..len {
            let index = start + k as i64;
            if index < 0 {
                continue;
            }
            let index = index as usize;
            if index >= self.out.len() {
                break;
            }
            let w = self.window_at(k as f64 / len as f64);
            self.out[index] += read(k) * w;
            self.norm[index] += w;
        }
    }

    fn finish(self) -> Vec<f32> {
        let mut out = self.out;
        for (s, &w) in out.iter_mut().zip(&self.norm) {
            if w > NORM_FLOOR {
                *s /= w;
            }
        }
        out
    }
}

/// Linear interpolation with silence outside the buffer
#[inline]
fn read_source(source: &[f32], pos: f64) -> f32 {
    if pos < 0.0 {
        return 0.0;
    }
    let index = pos as usize;
    if index + 1 >= source.len() {
        return if index + 1 == source.len() { source[index] } else { 0.0 };
    }
    let frac = (pos - index as f64) as f32;
    source[index] + (source[index + 1] - source[index]) * frac
}

fn fixed_grains(
    request: &ShiftRequest<'_>,
    settings: &GrainSettings,
    source: &[f32],
    grains: &mut GrainBuffer<'_>,
) {
    let output_rate = request.output_rate as f64;
    let src_per_out = request.sample.sample_rate() as f64 / output_rate;
    let overlap = settings.grain_overlap.clamp(0.0, 0.95) as f64;
    let grain_len =
        ((settings.grain_size.max(0.0) as f64 * output_rate).round() as usize).max(MIN_GRAIN_FRAMES);
    let hop = ((grain_len as f64 * (1.0 - overlap)).round() as usize).max(1);
    let half = grain_len as f64 / 2.0;

    // First grain starts early enough that frame 0 is fully overlapped
    let mut start = hop as i64 - grain_len as i64;
    while start < grains.len() as i64 {
        let center = start as f64 + half;
        let ratio = request.rate as f64 * request.vibrato_factor(center.max(0.0) / output_rate) as f64;
        let center_src = center * src_per_out;
        grains.add_grain(start, grain_len, |k| {
            read_source(source, center_src + (k as f64 - half) * ratio * src_per_out)
        });
        start += hop as i64;
    }
}

fn psola(
    request: &ShiftRequest<'_>,
    source: &[f32],
    marks: &[usize],
    max_period: usize,
    grains: &mut GrainBuffer<'_>,
) {
    let output_rate = request.output_rate as f64;
    let src_per_out = request.sample.sample_rate() as f64 / output_rate;
    let unvoiced_period = UNVOICED_PERIOD * request.sample.sample_rate() as f64;

    let mut out_pos = 0.0f64;
    while out_pos < grains.len() as f64 {
        let src_time = out_pos * src_per_out;
        let nearest = nearest_mark(marks, src_time);
        let period = local_period(marks, nearest) as f64;
        let distance = (marks[nearest] as f64 - src_time).abs();

        let voiced = period <= max_period as f64 && distance <= period * 1.5;
        let (center, period, step) = if voiced {
            let ratio = request.rate as f64 * request.vibrato_factor(out_pos / output_rate) as f64;
            (marks[nearest] as f64, period, period / src_per_out / ratio.max(1e-3))
        } else {
            (src_time, unvoiced_period, unvoiced_period / src_per_out)
        };

        // Two periods, centered on the mark, placed centered on the synthesis mark
        let half = (period / src_per_out).round().max(1.0) as usize;
        let start = out_pos.round() as i64 - half as i64;
        grains.add_grain(start, 2 * half, |k| {
            read_source(source, center + (k as f64 - half as f64) * src_per_out)
        });

        out_pos += step.max(1.0);
    }
}

fn nearest_mark(marks: &[usize], position: f64) -> usize {
    let after = marks.partition_point(|&m| (m as f64) < position);
    if after == 0 {
        return 0;
    }
    if after == marks.len() {
        return marks.len() - 1;
    }
    if position - marks[after - 1] as f64 <= marks[after] as f64 - position {
        after - 1
    } else {
        after
    }
}

/// Spacing to the next mark (or from the previous one for the last mark)
fn local_period(marks: &[usize], index: usize) -> usize {
    if index + 1 < marks.len() {
        marks[index + 1] - marks[index]
    } else {
        marks[index] - marks[index - 1]
    }
}

/// A pre-rendered note
pub struct RenderedVoice {
    frames: Vec<f32>,
    position: usize,
}

impl RenderedVoice {
    pub fn frames(&self) -> &[f32] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl VoiceSource for RenderedVoice {
    fn render_add(&mut self, out: &mut [f32]) -> usize {
        let remaining = &self.frames[self.position..];
        let n = remaining.len().min(out.len());
        for (o, s) in out.iter_mut().zip(&remaining[..n]) {
            *o += s;
        }
        self.position += n;
        n
    }
}
