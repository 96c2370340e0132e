//! Sample regions - the frame ranges every analyzer works on

use thiserror::Error;

/// Errors raised when an analysis input is malformed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("sample rate must be positive")]
    ZeroSampleRate,
    #[error("region {start}..{end} is empty or outside a buffer of {len} frames")]
    InvalidRegion { start: usize, end: usize, len: usize },
}

/// Frame ranges of one sample's playback window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleRegion {
    start: usize,
    vowel_start: usize,
    end: usize,
}

impl SampleRegion {
    /// Create a region; `vowel_start` is clamped into `start..=end`
    pub fn new(start: usize, vowel_start: usize, end: usize) -> Self {
        let end = end.max(start);
        Self {
            start,
            vowel_start: vowel_start.clamp(start, end),
            end,
        }
    }

    /// First frame of playback (oto offset)
    pub fn start(&self) -> usize {
        self.start
    }

    /// First frame of the sustained vowel (offset + consonant)
    pub fn vowel_start(&self) -> usize {
        self.vowel_start
    }

    /// One past the last playable frame (resolved cutoff)
    pub fn end(&self) -> usize {
        self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Read-only view of one sample for analysis
///
/// `id` identifies the underlying buffer and keys the analyzer caches.
#[derive(Debug, Clone, Copy)]
pub struct AnalysisSource<'a> {
    id: u64,
    samples: &'a [f32],
    sample_rate: u32,
    region: SampleRegion,
}

impl<'a> AnalysisSource<'a> {
    /// Validate and wrap a mono buffer
    pub fn new(
        id: u64,
        samples: &'a [f32],
        sample_rate: u32,
        region: SampleRegion,
    ) -> Result<Self, AnalysisError> {
        if sample_rate == 0 {
            return Err(AnalysisError::ZeroSampleRate);
        }
        if region.is_empty() || region.end > samples.len() {
            return Err(AnalysisError::InvalidRegion {
                start: region.start,
                end: region.end,
                len: samples.len(),
            });
        }
        Ok(Self {
            id,
            samples,
            sample_rate,
            region,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn region(&self) -> SampleRegion {
        self.region
    }

    /// Full playback region (offset to cutoff)
    pub fn playback(&self) -> &'a [f32] {
        &self.samples[self.region.start..self.region.end]
    }

    /// Sustained vowel region, or the playback region when the consonant covers everything
    pub fn vowel(&self) -> &'a [f32] {
        if self.region.vowel_start >= self.region.end {
            self.playback()
        } else {
            &self.samples[self.region.vowel_start..self.region.end]
        }
    }

    /// Convert milliseconds to a frame count at this source's rate
    pub fn ms_to_frames(&self, ms: f32) -> usize {
        (ms.max(0.0) * self.sample_rate as f32 / 1000.0).round() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_clamps_vowel_start() {
        let region = SampleRegion::new(100, 50, 400);
        assert_eq!(region.vowel_start(), 100);

        let region = SampleRegion::new(100, 900, 400);
        assert_eq!(region.vowel_start(), 400);
        assert_eq!(region.len(), 300);
    }

    #[test]
    fn test_source_rejects_bad_input() {
        let samples = vec![0.0f32; 1000];
        assert_eq!(
            AnalysisSource::new(1, &samples, 0, SampleRegion::new(0, 0, 10)).unwrap_err(),
            AnalysisError::ZeroSampleRate
        );
        assert!(AnalysisSource::new(1, &samples, 44100, SampleRegion::new(0, 0, 2000)).is_err());
        assert!(AnalysisSource::new(1, &samples, 44100, SampleRegion::new(10, 10, 10)).is_err());
    }

    #[test]
    fn test_vowel_falls_back_to_playback() {
        let samples = vec![0.5f32; 1000];
        let source =
            AnalysisSource::new(1, &samples, 44100, SampleRegion::new(100, 1000, 1000)).unwrap();
        assert_eq!(source.vowel().len(), 900);

        let source =
            AnalysisSource::new(1, &samples, 44100, SampleRegion::new(100, 300, 1000)).unwrap();
        assert_eq!(source.vowel().len(), 700);
        assert_eq!(source.ms_to_frames(10.0), 441);
    }
}
