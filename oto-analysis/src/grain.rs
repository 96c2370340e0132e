//! Adaptive grain sizing from a sample's dominant pitch period
//!
//! Grains that are not a whole number of pitch periods beat against the
//! fundamental when overlap-added. Sizing them to a couple of periods of the
//! sample's own pitch removes most of that modulation.

use crate::period::PeriodDetector;
use crate::region::AnalysisSource;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

/// Tuning for [`AdaptiveGrainSizer`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrainSizerOptions {
    /// Number of analysis windows spread over the vowel region
    pub windows: usize,
    /// Fraction of the vowel region skipped at its start (attack)
    pub skip_attack: f32,
    /// Grain length in pitch periods
    pub periods_per_grain: f32,
    /// Smallest grain in seconds
    pub min_grain: f32,
    /// Largest grain in seconds
    pub max_grain: f32,
    /// Grain used when no reliable pitch is found, in seconds
    pub default_grain: f32,
}

impl Default for GrainSizerOptions {
    fn default() -> Self {
        Self {
            windows: 5,
            skip_attack: 0.1,
            periods_per_grain: 2.0,
            min_grain: 0.020,
            max_grain: 0.200,
            default_grain: 0.100,
        }
    }
}

/// Result of grain sizing for one sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GrainEstimate {
    /// Representative pitch period in seconds (`None` when unvoiced)
    pub period: Option<f32>,
    /// Grain size in seconds
    pub grain_size: f32,
}

/// Derives beating-free grain sizes, caching one estimate per sample
pub struct AdaptiveGrainSizer {
    options: GrainSizerOptions,
    detector: PeriodDetector,
    cache: Mutex<HashMap<u64, GrainEstimate>>,
}

impl Default for AdaptiveGrainSizer {
    fn default() -> Self {
        Self::new(GrainSizerOptions::default())
    }
}

impl AdaptiveGrainSizer {
    pub fn new(options: GrainSizerOptions) -> Self {
        Self {
            options,
            detector: PeriodDetector::default(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &GrainSizerOptions {
        &self.options
    }

    /// Period detector shared with pitch-mark placement
    pub fn detector(&self) -> &PeriodDetector {
        &self.detector
    }

    /// Estimate the grain size for a sample (cached by source id)
    pub fn estimate(&self, source: &AnalysisSource<'_>) -> GrainEstimate {
        if let Some(cached) = self.cache.lock().get(&source.id()) {
            return *cached;
        }

        let estimate = self.analyze(source);
        self.cache.lock().insert(source.id(), estimate);
        estimate
    }

    /// Grain size in seconds for a sample
    pub fn grain_size(&self, source: &AnalysisSource<'_>) -> f32 {
        self.estimate(source).grain_size
    }

    fn analyze(&self, source: &AnalysisSource<'_>) -> GrainEstimate {
        let sample_rate = source.sample_rate();
        let vowel = source.vowel();
        let skip = (vowel.len() as f32 * self.options.skip_attack.clamp(0.0, 0.9)) as usize;
        let body = &vowel[skip..];
        let frame_len = self.detector.frame_len(sample_rate).min(body.len());

        let mut periods: Vec<f32> = Vec::new();
        if frame_len > 0 {
            let windows = self.options.windows.max(1);
            let span = body.len() - frame_len;
            for i in 0..windows {
                let start = if windows == 1 {
                    span / 2
                } else {
                    span * i / (windows - 1)
                };
                let frame = &body[start..start + frame_len];
                if let Some(estimate) = self.detector.detect(frame, sample_rate) {
                    periods.push(estimate.period);
                }
            }
        }

        if periods.is_empty() {
            debug!(
                target: "oto_analysis::grain",
                source = source.id(),
                grain = self.options.default_grain,
                "no reliable pitch, using default grain size"
            );
            return GrainEstimate {
                period: None,
                grain_size: self.options.default_grain,
            };
        }

        periods.sort_by(|a, b| a.total_cmp(b));
        let period_frames = periods[periods.len() / 2];
        let period = period_frames / sample_rate as f32;
        let grain_size = (period * self.options.periods_per_grain)
            .clamp(self.options.min_grain, self.options.max_grain);

        debug!(
            target: "oto_analysis::grain",
            source = source.id(),
            voiced_windows = periods.len(),
            period,
            grain_size,
            "adaptive grain size"
        );

        GrainEstimate {
            period: Some(period),
            grain_size,
        }
    }

    /// Drop all cached estimates
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }
}
