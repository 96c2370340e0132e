//! Voicebank loading: oto.ini plus the recordings it references

use crate::loader::{DecodedAudio, LoadError, SampleLoader};
use crate::oto::{OtoIni, OtoParseError};
use oto_audio::{SampleData, SampleMap};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const OTO_FILE_NAME: &str = "oto.ini";

/// A loaded voicebank
#[derive(Debug)]
pub struct Voicebank {
    root: PathBuf,
    samples: SampleMap,
    parse_errors: Vec<OtoParseError>,
    missing: Vec<String>,
}

impl Voicebank {
    /// Load `dir/oto.ini` and decode every referenced file
    ///
    /// Files that cannot be decoded are skipped with a warning; their aliases
    /// are listed by [`Voicebank::missing_files`]. The first entry of an alias wins.
    pub fn load(dir: &Path, loader: &SampleLoader) -> Result<Self, LoadError> {
        let bytes = std::fs::read(dir.join(OTO_FILE_NAME))?;
        let ini = OtoIni::parse(&String::from_utf8_lossy(&bytes));
        for err in ini.errors() {
            warn!(target: "oto_library::voicebank", error = %err, "skipping oto.ini line");
        }

        let mut decoded: HashMap<String, Option<(Arc<[f32]>, u32)>> = HashMap::new();
        let mut samples = SampleMap::new();
        let mut missing = Vec::new();

        for entry in ini.entries() {
            if samples.contains_key(&entry.alias) {
                continue;
            }

            let audio = decoded
                .entry(entry.file.clone())
                .or_insert_with(|| match loader.load(&dir.join(&entry.file)) {
                    Ok(DecodedAudio { samples, sample_rate, .. }) => Some((samples.into(), sample_rate)),
                    Err(err) => {
                        warn!(target: "oto_library::voicebank", file = %entry.file, error = %err, "could not load sample");
                        None
                    }
                });

            match audio {
                Some((buffer, sample_rate)) => {
                    let data = SampleData::new(Arc::clone(buffer), *sample_rate, entry.timing);
                    samples.insert(entry.alias.clone(), Arc::new(data));
                }
                None => missing.push(entry.alias.clone()),
            }
        }

        info!(
            target: "oto_library::voicebank",
            root = %dir.display(),
            aliases = samples.len(),
            files = decoded.len(),
            missing = missing.len(),
            "voicebank loaded"
        );

        Ok(Self {
            root: dir.to_path_buf(),
            samples,
            parse_errors: ini.errors().to_vec(),
            missing,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn samples(&self) -> &SampleMap {
        &self.samples
    }

    pub fn get(&self, alias: &str) -> Option<&Arc<SampleData>> {
        self.samples.get(alias)
    }

    /// Aliases whose file could not be decoded
    pub fn missing_files(&self) -> &[String] {
        &self.missing
    }

    pub fn parse_errors(&self) -> &[OtoParseError] {
        &self.parse_errors
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
