//! Engine configuration persistence
//!
//! Stores the default voicebank and synthesis options as `key=value` lines.

use oto_audio::{CrossfadeCurve, PhraseOptions};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Saved engine configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    /// Voicebank used when none is given on the command line
    pub voicebank: Option<PathBuf>,
    pub phrase: PhraseOptions,
}

impl EngineConfig {
    /// Load config from the default location
    ///
    /// Returns default config if the file doesn't exist or can't be read.
    pub fn load() -> Self {
        let path = Self::config_path();
        Self::load_from(&path).unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.serialize())?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("otosing")
            .join("config.txt")
    }

    /// Parse `key=value` lines; bad values keep their default
    pub fn parse(content: &str) -> Self {
        let mut config = Self::default();
        let phrase = &mut config.phrase;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            match key {
                "voicebank" => {
                    if !value.is_empty() {
                        config.voicebank = Some(PathBuf::from(value));
                    }
                }
                "use_granular" => set(key, value, &mut phrase.sequence.use_granular),
                "use_psola" => set(key, value, &mut phrase.sequence.use_psola),
                "use_adaptive_grain_size" => set(key, value, &mut phrase.sequence.use_adaptive_grain_size),
                "grain_size" => set_positive(key, value, &mut phrase.sequence.grain_size),
                "grain_overlap" => {
                    let mut overlap = phrase.sequence.grain_overlap;
                    set(key, value, &mut overlap);
                    if (0.0..1.0).contains(&overlap) {
                        phrase.sequence.grain_overlap = overlap;
                    } else {
                        warn!(target: "oto_library::config", key, value, "grain overlap must be in [0, 1)");
                    }
                }
                "crossfade_curve" => match value {
                    "linear" => phrase.sequence.crossfade_curve = CrossfadeCurve::Linear,
                    "equal_power" => phrase.sequence.crossfade_curve = CrossfadeCurve::EqualPower,
                    _ => warn!(target: "oto_library::config", key, value, "unknown crossfade curve"),
                },
                "use_dynamic_overlap" => set(key, value, &mut phrase.use_dynamic_overlap),
                "dynamic_overlap_max_scale" => set_positive(key, value, &mut phrase.dynamic_overlap_max_scale),
                "use_loudness_normalization" => set(key, value, &mut phrase.use_loudness_normalization),
                "target_rms" => set_positive(key, value, &mut phrase.normalization.target_rms),
                _ => {} // Ignore unknown keys
            }
        }

        config
    }

    pub fn serialize(&self) -> String {
        let phrase = &self.phrase;
        let sequence = &phrase.sequence;
        let mut lines = vec!["# otosing configuration".to_string()];

        if let Some(ref voicebank) = self.voicebank {
            lines.push(format!("voicebank={}", voicebank.display()));
        }
        lines.push(format!("use_granular={}", sequence.use_granular));
        lines.push(format!("use_psola={}", sequence.use_psola));
        lines.push(format!("use_adaptive_grain_size={}", sequence.use_adaptive_grain_size));
        lines.push(format!("grain_size={}", sequence.grain_size));
        lines.push(format!("grain_overlap={}", sequence.grain_overlap));
        lines.push(format!(
            "crossfade_curve={}",
            match sequence.crossfade_curve {
                CrossfadeCurve::Linear => "linear",
                CrossfadeCurve::EqualPower => "equal_power",
            }
        ));
        lines.push(format!("use_dynamic_overlap={}", phrase.use_dynamic_overlap));
        lines.push(format!("dynamic_overlap_max_scale={}", phrase.dynamic_overlap_max_scale));
        lines.push(format!("use_loudness_normalization={}", phrase.use_loudness_normalization));
        lines.push(format!("target_rms={}", phrase.normalization.target_rms));

        lines.join("\n")
    }
}

fn set<T: FromStr>(key: &str, value: &str, field: &mut T) {
    match value.parse() {
        Ok(parsed) => *field = parsed,
        Err(_) => warn!(target: "oto_library::config", key, value, "invalid config value"),
    }
}

fn set_positive(key: &str, value: &str, field: &mut f32) {
    match value.parse::<f32>() {
        Ok(parsed) if parsed.is_finite() && parsed > 0.0 => *field = parsed,
        _ => warn!(target: "oto_library::config", key, value, "expected a positive number"),
    }
}
