//! Spectral-envelope distance between adjacent samples at a join
//!
//! Compares the tail of the outgoing sample with the head of the incoming one:
//! 1. Hann-windowed FFT of each join window
//! 2. Log-spaced band envelope in dB (level removed by subtracting the mean)
//! 3. Mean absolute band difference scaled by a dB span, clamped to [0, 1]
//!
//! The score stretches authored crossfades: timbres that do not match need a
//! longer overlap to hide the seam.

use crate::region::AnalysisSource;
use parking_lot::Mutex;
use rustfft::{num_complex::Complex, FftPlanner};
use std::collections::HashMap;
use std::f32::consts::PI;
use tracing::debug;

/// Band levels more than this far below the loudest band are floored
const DYNAMIC_RANGE_DB: f32 = 60.0;

/// Tuning for [`SpectralDistanceAnalyzer`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectralDistanceOptions {
    /// Join window length in milliseconds (rounded up to a power of two in frames)
    pub window_ms: f32,
    /// Number of log-spaced envelope bands
    pub bands: usize,
    /// Lowest band edge in Hz
    pub min_freq: f32,
    /// Highest band edge in Hz (limited by Nyquist)
    pub max_freq: f32,
    /// Mean band difference (dB) that maps to a distance of 1.0
    pub db_span: f32,
}

impl Default for SpectralDistanceOptions {
    fn default() -> Self {
        Self {
            window_ms: 40.0,
            bands: 24,
            min_freq: 80.0,
            max_freq: 8000.0,
            db_span: 24.0,
        }
    }
}

/// Scale an authored overlap by a join's spectral distance
///
/// `distance = 0` keeps `base`; `distance = 1` gives `base * max_scale`.
pub fn dynamic_overlap(base: f64, distance: f32, max_scale: f32) -> f64 {
    let distance = distance.clamp(0.0, 1.0) as f64;
    let max_scale = (max_scale as f64).max(1.0);
    base * (1.0 + (max_scale - 1.0) * distance)
}

/// Join mismatch analyzer with a per-pair cache
pub struct SpectralDistanceAnalyzer {
    options: SpectralDistanceOptions,
    planner: Mutex<FftPlanner<f32>>,
    cache: Mutex<HashMap<(u64, u64), f32>>,
}

impl Default for SpectralDistanceAnalyzer {
    fn default() -> Self {
        Self::new(SpectralDistanceOptions::default())
    }
}

impl SpectralDistanceAnalyzer {
    pub fn new(options: SpectralDistanceOptions) -> Self {
        Self {
            options,
            planner: Mutex::new(FftPlanner::new()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &SpectralDistanceOptions {
        &self.options
    }

    /// Distance in [0, 1] between `outgoing`'s tail and `incoming`'s head
    ///
    /// Cached by the `(outgoing, incoming)` id pair, so a phrase re-analyzes
    /// each join at most once.
    pub fn distance(&self, outgoing: &AnalysisSource<'_>, incoming: &AnalysisSource<'_>) -> f32 {
        let key = (outgoing.id(), incoming.id());
        if let Some(&cached) = self.cache.lock().get(&key) {
            return cached;
        }

        let tail = self.envelope(outgoing, JoinSide::Tail);
        let head = self.envelope(incoming, JoinSide::Head);
        let distance = envelope_distance(&tail, &head, self.options.db_span);

        debug!(
            target: "oto_analysis::spectral",
            outgoing = outgoing.id(),
            incoming = incoming.id(),
            distance,
            "join spectral distance"
        );

        self.cache.lock().insert(key, distance);
        distance
    }

    /// Mean-removed band envelope (dB) of one join window
    fn envelope(&self, source: &AnalysisSource<'_>, side: JoinSide) -> Vec<f32> {
        let sample_rate = source.sample_rate();
        let fft_size = source
            .ms_to_frames(self.options.window_ms)
            .max(64)
            .next_power_of_two();

        let playback = source.playback();
        let window_len = fft_size.min(playback.len());
        let frames = match side {
            JoinSide::Tail => &playback[playback.len() - window_len..],
            JoinSide::Head => &playback[..window_len],
        };

        let mut buffer: Vec<Complex<f32>> = (0..fft_size)
            .map(|i| {
                let sample = frames.get(i).copied().unwrap_or(0.0);
                let w = 0.5 * (1.0 - (2.0 * PI * i as f32 / fft_size as f32).cos());
                Complex::new(sample * w, 0.0)
            })
            .collect();

        let fft = self.planner.lock().plan_fft_forward(fft_size);
        fft.process(&mut buffer);

        let bin_width = sample_rate as f32 / fft_size as f32;
        let nyquist_bin = fft_size / 2;
        let bands = self.options.bands.max(1);
        let min_freq = self.options.min_freq.max(bin_width);
        let max_freq = self.options.max_freq.min(sample_rate as f32 / 2.0).max(min_freq * 2.0);
        let (log_min, log_max) = (min_freq.ln(), max_freq.ln());

        let mut envelope: Vec<f32> = (0..bands)
            .map(|b| {
                let low = (log_min + (log_max - log_min) * b as f32 / bands as f32).exp();
                let high = (log_min + (log_max - log_min) * (b + 1) as f32 / bands as f32).exp();
                let start_bin = ((low / bin_width) as usize).min(nyquist_bin);
                let end_bin = ((high / bin_width).ceil() as usize).clamp(start_bin + 1, nyquist_bin + 1);
                let magnitude = buffer[start_bin..end_bin].iter().map(|c| c.norm()).sum::<f32>()
                    / (end_bin - start_bin) as f32;
                20.0 * (magnitude + 1e-10).log10()
            })
            .collect();

        let loudest = envelope.iter().copied().fold(f32::MIN, f32::max);
        for level in &mut envelope {
            *level = level.max(loudest - DYNAMIC_RANGE_DB);
        }

        let mean = envelope.iter().sum::<f32>() / envelope.len() as f32;
        for level in &mut envelope {
            *level -= mean;
        }
        envelope
    }

    /// Drop all cached distances
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }
}

#[derive(Debug, Clone, Copy)]
enum JoinSide {
    Tail,
    Head,
}

fn envelope_distance(a: &[f32], b: &[f32], db_span: f32) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mean_diff = a.iter().zip(b).map(|(x, y)| (x - y).abs()).sum::<f32>() / a.len() as f32;
    (mean_diff / db_span.max(f32::EPSILON)).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::SampleRegion;

    fn tone(freqs: &[f32], gain: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| {
                let t = i as f32 / 44100.0;
                freqs.iter().map(|f| (2.0 * PI * f * t).sin()).sum::<f32>() * gain
                    / freqs.len() as f32
            })
            .collect()
    }

    fn source(id: u64, samples: &[f32]) -> AnalysisSource<'_> {
        AnalysisSource::new(id, samples, 44100, SampleRegion::new(0, 0, samples.len())).unwrap()
    }

    #[test]
    fn test_identical_timbre_has_zero_distance() {
        let a = tone(&[220.0, 440.0, 660.0], 0.5, 8820);
        let analyzer = SpectralDistanceAnalyzer::default();
        let d = analyzer.distance(&source(1, &a), &source(2, &a));
        assert!(d < 0.05, "distance {}", d);
    }

    #[test]
    fn test_distance_ignores_level() {
        let a = tone(&[220.0, 440.0, 660.0], 0.8, 8820);
        let b = tone(&[220.0, 440.0, 660.0], 0.1, 8820);
        let analyzer = SpectralDistanceAnalyzer::default();
        let d = analyzer.distance(&source(1, &a), &source(2, &b));
        assert!(d < 0.05, "distance {}", d);
    }

    #[test]
    fn test_different_timbre_is_farther() {
        let dark = tone(&[200.0, 400.0], 0.5, 8820);
        let bright = tone(&[2500.0, 5000.0], 0.5, 8820);
        let similar = tone(&[210.0, 420.0], 0.5, 8820);

        let analyzer = SpectralDistanceAnalyzer::default();
        let far = analyzer.distance(&source(1, &dark), &source(2, &bright));
        let near = analyzer.distance(&source(1, &dark), &source(3, &similar));
        assert!(far > near, "far {} near {}", far, near);
        assert!((0.0..=1.0).contains(&far));
    }

    #[test]
    fn test_pairs_are_cached() {
        let a = tone(&[300.0], 0.5, 4410);
        let b = tone(&[900.0], 0.5, 4410);
        let analyzer = SpectralDistanceAnalyzer::default();
        let first = analyzer.distance(&source(1, &a), &source(2, &b));
        let again = analyzer.distance(&source(1, &a), &source(2, &b));
        assert_eq!(first, again);
        assert_eq!(analyzer.cached_len(), 1);

        analyzer.distance(&source(2, &b), &source(1, &a));
        assert_eq!(analyzer.cached_len(), 2);

        analyzer.clear_cache();
        assert_eq!(analyzer.cached_len(), 0);
    }

    #[test]
    fn test_dynamic_overlap_bounds() {
        let base = 0.03;
        for i in 0..=10 {
            let d = i as f32 / 10.0;
            let overlap = dynamic_overlap(base, d, 2.0);
            assert!(overlap >= base - 1e-12);
            assert!(overlap <= base * 2.0 + 1e-12);
        }
        assert_eq!(dynamic_overlap(base, 0.0, 2.0), base);
        assert!((dynamic_overlap(base, 1.0, 2.0) - 0.06).abs() < 1e-12);
        assert!((dynamic_overlap(base, 0.5, 3.0) - 0.06).abs() < 1e-12);
        // Out-of-range distances are clamped
        assert!((dynamic_overlap(base, 4.0, 2.0) - 0.06).abs() < 1e-12);
    }
}
