//! Loudness normalization across independently recorded samples
//!
//! Loudness is measured as RMS over the sustained vowel only. Consonant
//! transients (flaps, plosives) have high peaks but little average energy, so
//! including them would under-estimate how loud the sample sounds and
//! over-attenuate it. The peak is tracked over the whole playback region and
//! only used to keep the normalized sample from clipping.

use crate::region::AnalysisSource;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

/// RMS below which a region counts as silent
const SILENCE_RMS: f32 = 1e-4;

/// Measured loudness of one sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoudnessProfile {
    /// RMS of the vowel region
    pub rms: f32,
    /// Absolute peak of the full playback region
    pub peak: f32,
}

/// Target and limits for the per-sample normalization gain
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizationOptions {
    /// Vowel RMS every sample is pulled toward (0.1 = -20 dBFS)
    pub target_rms: f32,
    pub min_gain: f32,
    pub max_gain: f32,
    /// The normalized peak never exceeds this
    ///
    /// The peak is taken over the whole playback region, consonant included.
    /// Gains depend only on the vowel region as long as `peak * gain` stays
    /// under the ceiling; past it, a loud consonant lowers the gain.
    pub peak_ceiling: f32,
}

impl Default for NormalizationOptions {
    fn default() -> Self {
        Self {
            target_rms: 0.1,
            min_gain: 0.25,
            max_gain: 4.0,
            peak_ceiling: 0.95,
        }
    }
}

/// Tuning for the pairwise join correction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JoinCorrectionOptions {
    /// Length of the tail/head windows compared at a join
    pub window_ms: f32,
    /// 0.0 = no correction, 1.0 = both sides meet at their geometric mean
    pub strength: f32,
    /// Largest correction applied to either side, in dB
    pub max_correction_db: f32,
}

impl Default for JoinCorrectionOptions {
    fn default() -> Self {
        Self {
            window_ms: 30.0,
            strength: 0.5,
            max_correction_db: 6.0,
        }
    }
}

/// Gains applied at one join: `gain_a` to the outgoing tail, `gain_b` to the incoming head
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JoinGainCorrection {
    pub gain_a: f32,
    pub gain_b: f32,
}

impl Default for JoinGainCorrection {
    fn default() -> Self {
        Self {
            gain_a: 1.0,
            gain_b: 1.0,
        }
    }
}

/// Per-sample loudness measurement with a profile cache
#[derive(Default)]
pub struct LoudnessNormalizer {
    cache: Mutex<HashMap<u64, LoudnessProfile>>,
}

impl LoudnessNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Measure (or fetch the cached) loudness profile of a sample
    pub fn profile(&self, source: &AnalysisSource<'_>) -> LoudnessProfile {
        if let Some(profile) = self.cache.lock().get(&source.id()) {
            return *profile;
        }

        let profile = LoudnessProfile {
            rms: rms(source.vowel()),
            peak: peak(source.playback()),
        };
        self.cache.lock().insert(source.id(), profile);
        profile
    }

    /// Gain that brings the sample's vowel RMS to the target level
    pub fn normalization_gain(
        &self,
        source: &AnalysisSource<'_>,
        options: &NormalizationOptions,
    ) -> f32 {
        let profile = self.profile(source);
        if profile.rms < SILENCE_RMS {
            return 1.0;
        }

        let mut gain = (options.target_rms / profile.rms).clamp(options.min_gain, options.max_gain);
        if profile.peak > 0.0 {
            gain = gain.min(options.peak_ceiling / profile.peak);
        }

        debug!(
            target: "oto_analysis::loudness",
            source = source.id(),
            rms = profile.rms,
            peak = profile.peak,
            gain,
            "normalization gain"
        );
        gain
    }

    /// Correction for the level step between `outgoing`'s tail and `incoming`'s head
    ///
    /// `outgoing_gain`/`incoming_gain` are the global gains already applied to
    /// each side, so the correction only covers what normalization left over.
    pub fn join_correction(
        &self,
        outgoing: &AnalysisSource<'_>,
        outgoing_gain: f32,
        incoming: &AnalysisSource<'_>,
        incoming_gain: f32,
        options: &JoinCorrectionOptions,
    ) -> JoinGainCorrection {
        let tail = outgoing.vowel();
        let tail_len = outgoing.ms_to_frames(options.window_ms).clamp(1, tail.len());
        let head = incoming.vowel();
        let head_len = incoming.ms_to_frames(options.window_ms).clamp(1, head.len());

        let rms_a = rms(&tail[tail.len() - tail_len..]) * outgoing_gain;
        let rms_b = rms(&head[..head_len]) * incoming_gain;
        if rms_a < SILENCE_RMS || rms_b < SILENCE_RMS {
            return JoinGainCorrection::default();
        }

        let ratio = rms_b / rms_a;
        let exponent = options.strength.clamp(0.0, 1.0) * 0.5;
        let limit = 10f32.powf(options.max_correction_db.max(0.0) / 20.0);

        JoinGainCorrection {
            gain_a: ratio.powf(exponent).clamp(1.0 / limit, limit),
            gain_b: ratio.powf(-exponent).clamp(1.0 / limit, limit),
        }
    }

    /// Drop all cached profiles
    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

fn peak(samples: &[f32]) -> f32 {
    samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::SampleRegion;
    use std::f32::consts::PI;

    /// 200 ms consonant burst followed by a sustained vowel
    fn syllable(burst: f32, vowel: f32) -> Vec<f32> {
        (0..44100)
            .map(|i| {
                let s = (2.0 * PI * 220.0 * i as f32 / 44100.0).sin();
                if i < 8820 {
                    s * burst
                } else {
                    s * vowel
                }
            })
            .collect()
    }

    fn source(id: u64, samples: &[f32]) -> AnalysisSource<'_> {
        AnalysisSource::new(id, samples, 44100, SampleRegion::new(0, 8820, samples.len())).unwrap()
    }

    #[test]
    fn test_gain_ignores_consonant_transient() {
        let soft = syllable(0.1, 0.05);
        let hard = syllable(0.2, 0.05);
        let normalizer = LoudnessNormalizer::new();
        let options = NormalizationOptions::default();

        let g_soft = normalizer.normalization_gain(&source(1, &soft), &options);
        let g_hard = normalizer.normalization_gain(&source(2, &hard), &options);
        assert_eq!(g_soft, g_hard);

        // vowel RMS = 0.05 / sqrt(2) -> gain toward 0.1
        assert!((g_soft - 0.1 / (0.05 / 2f32.sqrt())).abs() < 0.01);
    }

    #[test]
    fn test_peak_ceiling_limits_gain() {
        let samples = syllable(0.9, 0.02);
        let normalizer = LoudnessNormalizer::new();
        let options = NormalizationOptions::default();
        let profile = normalizer.profile(&source(1, &samples));
        assert!((profile.peak - 0.9).abs() < 0.01);

        let gain = normalizer.normalization_gain(&source(1, &samples), &options);
        assert!(gain * profile.peak <= options.peak_ceiling + 1e-6);
    }

    #[test]
    fn test_loud_consonant_hits_the_ceiling() {
        let soft = syllable(0.1, 0.05);
        let loud = syllable(0.6, 0.05);
        let normalizer = LoudnessNormalizer::new();
        let options = NormalizationOptions::default();

        let g_soft = normalizer.normalization_gain(&source(1, &soft), &options);
        let g_loud = normalizer.normalization_gain(&source(2, &loud), &options);
        assert!(g_loud < g_soft);
        assert!((g_loud - options.peak_ceiling / 0.6).abs() < 0.01);
    }

    #[test]
    fn test_silence_is_unity() {
        let samples = vec![0.0f32; 44100];
        let normalizer = LoudnessNormalizer::new();
        let gain = normalizer.normalization_gain(&source(1, &samples), &NormalizationOptions::default());
        assert_eq!(gain, 1.0);
    }

    #[test]
    fn test_join_correction_meets_in_the_middle() {
        let loud = syllable(0.1, 0.4);
        let quiet = syllable(0.1, 0.1);
        let normalizer = LoudnessNormalizer::new();
        let options = JoinCorrectionOptions {
            strength: 1.0,
            max_correction_db: 24.0,
            ..Default::default()
        };

        let join = normalizer.join_correction(&source(1, &loud), 1.0, &source(2, &quiet), 1.0, &options);
        // ratio 0.25 -> tail down by 2x, head up by 2x
        assert!((join.gain_a - 0.5).abs() < 0.02, "gain_a {}", join.gain_a);
        assert!((join.gain_b - 2.0).abs() < 0.08, "gain_b {}", join.gain_b);
    }

    #[test]
    fn test_join_correction_is_limited() {
        let loud = syllable(0.1, 0.8);
        let quiet = syllable(0.1, 0.01);
        let normalizer = LoudnessNormalizer::new();
        let options = JoinCorrectionOptions {
            strength: 1.0,
            max_correction_db: 6.0,
            ..Default::default()
        };
        let join = normalizer.join_correction(&source(1, &loud), 1.0, &source(2, &quiet), 1.0, &options);
        let limit = 10f32.powf(6.0 / 20.0);
        assert!((join.gain_a - 1.0 / limit).abs() < 1e-4);
        assert!((join.gain_b - limit).abs() < 1e-4);
    }

    #[test]
    fn test_matched_join_is_unity() {
        let a = syllable(0.3, 0.2);
        let normalizer = LoudnessNormalizer::new();
        let join = normalizer.join_correction(
            &source(1, &a),
            1.0,
            &source(2, &a),
            1.0,
            &JoinCorrectionOptions::default(),
        );
        assert!((join.gain_a - 1.0).abs() < 0.02);
        assert!((join.gain_b - 1.0).abs() < 0.02);
    }
}
