//! Voicebank library for otosing
//!
//! - oto.ini parsing
//! - Sample decoding and resampling
//! - Voicebank loading into a [`SampleMap`](oto_audio::SampleMap)
//! - Engine configuration persistence

mod config;
mod loader;
mod oto;
mod voicebank;

pub use config::{ConfigError, EngineConfig};
pub use loader::{downmix, resample, DecodedAudio, LoadError, SampleLoader};
pub use oto::{parse_line, OtoEntry, OtoIni, OtoParseError};
pub use voicebank::{Voicebank, OTO_FILE_NAME};
