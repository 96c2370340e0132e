//! Sample analysis for otosing
//!
//! Offline measurements the scheduler runs before a phrase is played:
//! spectral distance at joins, vowel loudness, and pitch-period detection
//! for adaptive grain sizing and PSOLA pitch marks.

mod grain;
mod loudness;
mod period;
mod region;
mod spectral;

pub use grain::{AdaptiveGrainSizer, GrainEstimate, GrainSizerOptions};
pub use loudness::{
    JoinCorrectionOptions, JoinGainCorrection, LoudnessNormalizer, LoudnessProfile,
    NormalizationOptions,
};
pub use period::{PeriodDetector, PeriodEstimate};
pub use region::{AnalysisError, AnalysisSource, SampleRegion};
pub use spectral::{dynamic_overlap, SpectralDistanceAnalyzer, SpectralDistanceOptions};
