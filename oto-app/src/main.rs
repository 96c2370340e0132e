//! otosing - play a phrase from a UTAU-style voicebank

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context};
use clap::Parser;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use oto_audio::{AudioContext, CrossfadeCurve, NoteEvent, PhraseNote, SynthEngine};
use oto_library::{EngineConfig, SampleLoader, Voicebank};

/// Engine poll interval while waiting for the phrase to end
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Time allowed past the last note end before giving up
const DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "otosing")]
#[command(about = "Oto-synchronized singing synthesis", long_about = None)]
struct Cli {
    /// Voicebank directory containing oto.ini (defaults to the configured one)
    #[arg(short, long)]
    voicebank: Option<PathBuf>,

    /// Notes as alias[:semitones[:beats]], e.g. "- ka:0:1" "a:2:0.5"
    #[arg(required = true)]
    notes: Vec<String>,

    /// Tempo in beats per minute
    #[arg(long, default_value = "120")]
    bpm: f64,

    /// Use the granular pitch shifter
    #[arg(long)]
    granular: bool,

    /// Pitch-synchronous grains (implies --granular)
    #[arg(long)]
    psola: bool,

    /// Size grains from the detected pitch period
    #[arg(long)]
    adaptive_grain: bool,

    /// Stretch crossfades at spectrally distant joins
    #[arg(long)]
    dynamic_overlap: bool,

    /// Normalize vowel loudness and smooth joins
    #[arg(long)]
    normalize: bool,

    /// Equal-power crossfades
    #[arg(long)]
    equal_power: bool,

    /// Config file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,
}

/// A note as typed on the command line
#[derive(Debug, Clone, PartialEq)]
struct NoteArg {
    alias: String,
    semitones: f32,
    beats: f64,
}

fn parse_note(text: &str) -> anyhow::Result<NoteArg> {
    let mut parts = text.split(':');
    let alias = parts.next().unwrap_or_default().trim();
    if alias.is_empty() {
        bail!("note '{}' has no alias", text);
    }

    let semitones = match parts.next() {
        Some(s) if !s.trim().is_empty() => s
            .trim()
            .parse::<f32>()
            .with_context(|| format!("invalid semitones in '{}'", text))?,
        _ => 0.0,
    };
    let beats = match parts.next() {
        Some(s) if !s.trim().is_empty() => s
            .trim()
            .parse::<f64>()
            .with_context(|| format!("invalid beats in '{}'", text))?,
        _ => 1.0,
    };
    if parts.next().is_some() {
        bail!("note '{}' has too many fields", text);
    }
    if !(beats.is_finite() && beats > 0.0) {
        bail!("note '{}' must last a positive number of beats", text);
    }

    Ok(NoteArg {
        alias: alias.to_string(),
        semitones,
        beats,
    })
}

/// Lay notes end to end at the given tempo
fn build_phrase(notes: &[NoteArg], bpm: f64) -> Vec<PhraseNote> {
    let beat = 60.0 / bpm;
    let mut start = 0.0;
    notes
        .iter()
        .map(|arg| {
            let duration = arg.beats * beat;
            let note = PhraseNote::new(arg.alias.clone(), NoteEvent::new(arg.semitones, start, duration));
            start += duration;
            note
        })
        .collect()
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    if !(cli.bpm.is_finite() && cli.bpm > 0.0) {
        bail!("--bpm must be positive");
    }

    let config = match &cli.config {
        Some(path) => EngineConfig::load_from(path)
            .with_context(|| format!("failed to read config {}", path.display()))?,
        None => EngineConfig::load(),
    };

    let mut options = config.phrase.clone();
    options.sequence.use_granular |= cli.granular || cli.psola;
    options.sequence.use_psola |= cli.psola;
    options.sequence.use_adaptive_grain_size |= cli.adaptive_grain;
    options.use_dynamic_overlap |= cli.dynamic_overlap;
    options.use_loudness_normalization |= cli.normalize;
    if cli.equal_power {
        options.sequence.crossfade_curve = CrossfadeCurve::EqualPower;
    }

    let voicebank_dir = cli
        .voicebank
        .clone()
        .or(config.voicebank)
        .ok_or_else(|| anyhow!("no voicebank given and none configured"))?;

    let args = cli
        .notes
        .iter()
        .map(|text| parse_note(text))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let phrase = build_phrase(&args, cli.bpm);

    // Audio device
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| anyhow!("no audio output device found"))?;
    let stream_config = device
        .default_output_config()
        .context("failed to get audio config")?;
    let sample_rate = stream_config.sample_rate().0;
    let channels = stream_config.channels() as usize;

    let voicebank = Voicebank::load(&voicebank_dir, &SampleLoader::with_sample_rate(sample_rate))
        .with_context(|| format!("failed to load voicebank {}", voicebank_dir.display()))?;
    if voicebank.is_empty() {
        bail!("voicebank {} has no playable samples", voicebank_dir.display());
    }

    let (context, mut renderer) = AudioContext::new(sample_rate);
    let stream = device
        .build_output_stream(
            &stream_config.into(),
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                renderer.render(data, channels);
            },
            |err| {
                error!(target: "otosing", error = %err, "audio stream error");
            },
            None,
        )
        .context("failed to create audio stream")?;
    stream.play().context("failed to start audio")?;

    info!(
        target: "otosing",
        voicebank = %voicebank_dir.display(),
        sample_rate,
        channels,
        notes = phrase.len(),
        "playing phrase"
    );

    let mut engine = SynthEngine::new(context);
    let report = engine.play_phrase(&phrase, voicebank.samples(), &options)?;
    for skipped in &report.skipped {
        warn!(
            target: "otosing",
            note = skipped.index,
            alias = %phrase[skipped.index].alias,
            reason = %skipped.reason,
            "note skipped"
        );
    }

    let last_end = report
        .scheduled
        .iter()
        .map(|n| n.end_time)
        .fold(report.anchor_time, f64::max);
    let remaining = (last_end - engine.context().current_time()).max(0.0);
    let deadline = Instant::now() + Duration::from_secs_f64(remaining) + DRAIN_GRACE;

    while engine.is_playing() {
        if Instant::now() >= deadline {
            warn!(target: "otosing", "voices still active after the phrase end, stopping");
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    engine.dispose();
    drop(stream);

    info!(
        target: "otosing",
        scheduled = report.scheduled.len(),
        skipped = report.skipped.len(),
        fallbacks = report.fallbacks.len(),
        "phrase finished"
    );
    Ok(())
}
