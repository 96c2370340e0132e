//! Sample decoding
//!
//! Voicebank recordings are decoded with Symphonia, mixed down to mono and
//! optionally resampled to the output rate with rubato.

use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tracing::debug;

/// Frames per resampler chunk
const RESAMPLE_CHUNK: usize = 1024;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no audio track found in file")]
    NoAudioTrack,
    #[error("file has no sample rate")]
    UnknownSampleRate,
    #[error("decode error: {0}")]
    Decode(String),
    #[error("resample error: {0}")]
    Resample(String),
}

/// A decoded mono sample
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Channel count of the file before downmixing
    pub source_channels: u16,
}

/// Decoder with an optional resampling target
#[derive(Debug, Clone, Default)]
pub struct SampleLoader {
    target_sample_rate: Option<u32>,
}

impl SampleLoader {
    /// Keep every file at its own rate
    pub fn new() -> Self {
        Self::default()
    }

    /// Resample every file to `sample_rate`
    pub fn with_sample_rate(sample_rate: u32) -> Self {
        Self {
            target_sample_rate: Some(sample_rate),
        }
    }

    pub fn target_sample_rate(&self) -> Option<u32> {
        self.target_sample_rate
    }

    pub fn load(&self, path: &Path) -> Result<DecodedAudio, LoadError> {
        let file = std::fs::File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| LoadError::Decode(e.to_string()))?;
        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(LoadError::NoAudioTrack)?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let source_rate = codec_params.sample_rate.ok_or(LoadError::UnknownSampleRate)?;
        let mut channels = codec_params.channels.map(|c| c.count()).unwrap_or(1);

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| LoadError::Decode(e.to_string()))?;

        let mut interleaved: Vec<f32> = Vec::new();
        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(_) => break,
            };
            if packet.track_id() != track_id {
                continue;
            }
            let decoded = match decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(_) => continue,
            };

            let spec = *decoded.spec();
            channels = spec.channels.count();
            let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
            buffer.copy_interleaved_ref(decoded);
            interleaved.extend_from_slice(buffer.samples());
        }

        let mono = downmix(&interleaved, channels);
        let (samples, sample_rate) = match self.target_sample_rate {
            Some(target) if target != source_rate => (resample(&mono, source_rate, target)?, target),
            _ => (mono, source_rate),
        };

        debug!(
            target: "oto_library::loader",
            path = %path.display(),
            source_rate,
            sample_rate,
            channels,
            frames = samples.len(),
            "sample decoded"
        );

        Ok(DecodedAudio {
            samples,
            sample_rate,
            source_channels: channels as u16,
        })
    }
}

/// Average interleaved channels into one
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Resample a mono buffer
///
/// The resampler's output delay is removed so sample positions (and the oto
/// markers that point at them) keep their time.
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Result<Vec<f32>, LoadError> {
    use rubato::{FftFixedInOut, Resampler};

    if samples.is_empty() || source_rate == target_rate {
        return Ok(samples.to_vec());
    }

    let mut resampler =
        FftFixedInOut::<f32>::new(source_rate as usize, target_rate as usize, RESAMPLE_CHUNK, 1)
            .map_err(|e| LoadError::Resample(e.to_string()))?;
    let chunk = resampler.input_frames_next();
    let delay = resampler.output_delay();
    let expected = (samples.len() as u64 * target_rate as u64 / source_rate as u64) as usize;
    let mut output: Vec<f32> = Vec::with_capacity(delay + expected + resampler.output_frames_next());

    // Past the end of the input, zero chunks flush the delayed tail
    let mut padded = vec![0.0f32; chunk];
    let mut pos = 0;
    while output.len() < delay + expected {
        let resampled = if pos + chunk <= samples.len() {
            resampler.process(&[&samples[pos..pos + chunk]], None)
        } else {
            padded.fill(0.0);
            if pos < samples.len() {
                padded[..samples.len() - pos].copy_from_slice(&samples[pos..]);
            }
            resampler.process(&[padded.as_slice()], None)
        }
        .map_err(|e| LoadError::Resample(e.to_string()))?;
        output.extend_from_slice(&resampled[0]);
        pos += chunk;
    }

    output.drain(..delay);
    output.truncate(expected);
    Ok(output)
}
