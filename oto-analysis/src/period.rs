//! Pitch period detection and pitch-mark placement
//!
//! Uses the normalized square difference function (McLeod & Wyvill, 2005):
//! 1. n(τ) = 2·Σ x[j]x[j+τ] / Σ (x[j]² + x[j+τ]²), bounded to [-1, 1]
//! 2. Ignore the zero-lag lobe (everything before the first negative value)
//! 3. Pick the first local maximum within 90% of the highest one
//! 4. Parabolic interpolation for sub-sample accuracy
//!
//! Pitch marks are placed one period apart on the largest absolute sample
//! near each expected position, which is what PSOLA needs for grain centers.

/// Mean power below which a frame counts as silence
const SILENCE_POWER: f32 = 1e-7;

/// A detected pitch period
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodEstimate {
    /// Period length in frames (sub-sample accurate)
    pub period: f32,
    /// Height of the chosen correlation peak (0.0 - 1.0)
    pub clarity: f32,
}

impl PeriodEstimate {
    /// Fundamental frequency in Hz
    pub fn frequency(&self, sample_rate: u32) -> f32 {
        sample_rate as f32 / self.period
    }
}

/// Autocorrelation-style pitch period detector
#[derive(Debug, Clone)]
pub struct PeriodDetector {
    min_freq: f32,
    max_freq: f32,
    threshold: f32,
}

impl Default for PeriodDetector {
    fn default() -> Self {
        Self::new(60.0, 1000.0)
    }
}

impl PeriodDetector {
    /// Candidate peaks must reach this fraction of the highest peak
    const PEAK_RATIO: f32 = 0.9;

    /// Create a detector for the given frequency range (Hz)
    pub fn new(min_freq: f32, max_freq: f32) -> Self {
        let min_freq = min_freq.max(1.0);
        Self {
            min_freq,
            max_freq: max_freq.max(min_freq * 2.0),
            threshold: 0.6,
        }
    }

    /// Set the minimum clarity for a frame to count as voiced (0.1 - 0.99)
    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold.clamp(0.1, 0.99);
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Frames needed to detect the lowest frequency (two periods)
    pub fn frame_len(&self, sample_rate: u32) -> usize {
        2 * self.max_lag(sample_rate)
    }

    fn min_lag(&self, sample_rate: u32) -> usize {
        ((sample_rate as f32 / self.max_freq).floor() as usize).max(2)
    }

    fn max_lag(&self, sample_rate: u32) -> usize {
        (sample_rate as f32 / self.min_freq).ceil() as usize
    }

    /// Detect the pitch period of one frame, `None` for unvoiced or silent input
    pub fn detect(&self, frame: &[f32], sample_rate: u32) -> Option<PeriodEstimate> {
        if sample_rate == 0 || frame.is_empty() {
            return None;
        }

        let min_lag = self.min_lag(sample_rate);
        let max_lag = self.max_lag(sample_rate).min(frame.len() / 2);
        if max_lag <= min_lag + 1 {
            return None;
        }

        let power = frame.iter().map(|s| s * s).sum::<f32>() / frame.len() as f32;
        if power < SILENCE_POWER {
            return None;
        }

        let nsdf: Vec<f32> = (0..=max_lag + 1).map(|lag| nsdf_at(frame, lag)).collect();

        let first_negative = nsdf.iter().position(|&v| v < 0.0)?;
        let search_start = first_negative.max(min_lag).max(1);

        let peaks: Vec<(usize, f32)> = (search_start..max_lag)
            .filter(|&lag| {
                let v = nsdf[lag];
                v > 0.0 && v >= nsdf[lag - 1] && v > nsdf[lag + 1]
            })
            .map(|lag| (lag, nsdf[lag]))
            .collect();

        let best = peaks.iter().map(|&(_, v)| v).fold(0.0f32, f32::max);
        if best < self.threshold {
            return None;
        }

        let (lag, clarity) = peaks
            .into_iter()
            .find(|&(_, v)| v >= best * Self::PEAK_RATIO)?;

        Some(PeriodEstimate {
            period: parabolic_peak(&nsdf, lag),
            clarity: clarity.min(1.0),
        })
    }

    /// Place pitch marks (frame indices into `samples`) across all voiced parts
    ///
    /// Marks are strictly increasing. Unvoiced stretches produce no marks.
    pub fn pitch_marks(&self, samples: &[f32], sample_rate: u32) -> Vec<usize> {
        let len = samples.len();
        let frame_len = self.frame_len(sample_rate).min(len);
        if sample_rate == 0 || frame_len < 4 {
            return Vec::new();
        }
        let hop = (frame_len / 2).max(1);

        // Period track, one entry per analysis frame
        let mut track: Vec<Option<f32>> = Vec::new();
        let mut start = 0;
        while start + frame_len <= len {
            let frame = &samples[start..start + frame_len];
            track.push(self.detect(frame, sample_rate).map(|e| e.period));
            start += hop;
        }
        if track.is_empty() {
            return Vec::new();
        }
        let period_at = |pos: usize| track[(pos / hop).min(track.len() - 1)];

        let mut marks: Vec<usize> = Vec::new();
        let mut chained = false;
        let mut pos = 0;

        while pos < len {
            let Some(period) = period_at(pos) else {
                chained = false;
                pos += hop;
                continue;
            };
            let p = (period.round() as usize).max(1);

            let mark = match (chained, marks.last()) {
                (true, Some(&last)) => {
                    let expected = last + p;
                    if expected >= len {
                        break;
                    }
                    let radius = (p / 4).max(1);
                    let from = expected.saturating_sub(radius).max(last + 1);
                    argmax_abs(samples, from, (expected + radius + 1).min(len))
                }
                _ => argmax_abs(samples, pos, (pos + p).min(len)),
            };

            marks.push(mark);
            chained = true;
            pos = mark + 1;
        }

        marks
    }
}

/// Normalized square difference at one lag
fn nsdf_at(frame: &[f32], lag: usize) -> f32 {
    if lag >= frame.len() {
        return 0.0;
    }
    let mut acf = 0.0f32;
    let mut energy = 0.0f32;
    for (a, b) in frame.iter().zip(&frame[lag..]) {
        acf += a * b;
        energy += a * a + b * b;
    }
    if energy <= f32::EPSILON {
        0.0
    } else {
        2.0 * acf / energy
    }
}

/// Sub-sample peak position from the three values around `index`
fn parabolic_peak(values: &[f32], index: usize) -> f32 {
    if index == 0 || index + 1 >= values.len() {
        return index as f32;
    }
    let (a, b, c) = (values[index - 1], values[index], values[index + 1]);
    let denom = a - 2.0 * b + c;
    if denom.abs() < 1e-12 {
        index as f32
    } else {
        index as f32 + 0.5 * (a - c) / denom
    }
}

/// Index of the largest absolute sample in `from..to`
fn argmax_abs(samples: &[f32], from: usize, to: usize) -> usize {
    let to = to.min(samples.len());
    if from >= to {
        return from;
    }
    let mut best = from;
    for i in from..to {
        if samples[i].abs() > samples[best].abs() {
            best = i;
        }
    }
    best
}
