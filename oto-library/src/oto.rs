//! oto.ini parsing
//!
//! One entry per line:
//!
//! ```text
//! file.wav=alias,offset,consonant,cutoff,preutterance,overlap
//! ```
//!
//! Numbers are milliseconds; an empty number means 0 and an empty alias means
//! the file name without its extension.

use oto_audio::OtoTiming;
use std::path::Path;
use thiserror::Error;

const FIELD_COUNT: usize = 6;

/// A malformed oto.ini line (1-based line numbers)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OtoParseError {
    #[error("line {line}: missing '=' between file name and parameters")]
    MissingSeparator { line: usize },
    #[error("line {line}: empty file name")]
    EmptyFileName { line: usize },
    #[error("line {line}: expected 6 fields, found {found}")]
    FieldCount { line: usize, found: usize },
    #[error("line {line}: invalid {field} value '{value}'")]
    InvalidNumber {
        line: usize,
        field: &'static str,
        value: String,
    },
}

impl OtoParseError {
    pub fn line(&self) -> usize {
        match self {
            OtoParseError::MissingSeparator { line }
            | OtoParseError::EmptyFileName { line }
            | OtoParseError::FieldCount { line, .. }
            | OtoParseError::InvalidNumber { line, .. } => *line,
        }
    }
}

/// One oto.ini entry
#[derive(Debug, Clone, PartialEq)]
pub struct OtoEntry {
    /// Sample file name relative to the voicebank directory
    pub file: String,
    pub alias: String,
    pub timing: OtoTiming,
}

/// Parsed oto.ini; malformed lines are collected instead of aborting the parse
#[derive(Debug, Clone, Default)]
pub struct OtoIni {
    entries: Vec<OtoEntry>,
    errors: Vec<OtoParseError>,
}

impl OtoIni {
    pub fn parse(content: &str) -> Self {
        let mut ini = Self::default();
        let content = content.strip_prefix('\u{feff}').unwrap_or(content);

        for (index, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line, index + 1) {
                Ok(entry) => ini.entries.push(entry),
                Err(err) => ini.errors.push(err),
            }
        }

        ini
    }

    pub fn entries(&self) -> &[OtoEntry] {
        &self.entries
    }

    pub fn errors(&self) -> &[OtoParseError] {
        &self.errors
    }

    /// First entry with this alias
    pub fn find(&self, alias: &str) -> Option<&OtoEntry> {
        self.entries.iter().find(|e| e.alias == alias)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse a single non-blank line
pub fn parse_line(line: &str, line_number: usize) -> Result<OtoEntry, OtoParseError> {
    let (file, params) = line
        .split_once('=')
        .ok_or(OtoParseError::MissingSeparator { line: line_number })?;
    let file = file.trim();
    if file.is_empty() {
        return Err(OtoParseError::EmptyFileName { line: line_number });
    }

    let fields: Vec<&str> = params.split(',').map(str::trim).collect();
    if fields.len() != FIELD_COUNT {
        return Err(OtoParseError::FieldCount {
            line: line_number,
            found: fields.len(),
        });
    }

    let number = |index: usize, field: &'static str| -> Result<f64, OtoParseError> {
        let value = fields[index];
        if value.is_empty() {
            return Ok(0.0);
        }
        value
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| OtoParseError::InvalidNumber {
                line: line_number,
                field,
                value: value.to_string(),
            })
    };

    let alias = if fields[0].is_empty() {
        Path::new(file)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(file)
            .to_string()
    } else {
        fields[0].to_string()
    };

    Ok(OtoEntry {
        file: file.to_string(),
        alias,
        timing: OtoTiming {
            offset: number(1, "offset")?,
            consonant: number(2, "consonant")?,
            cutoff: number(3, "cutoff")?,
            preutterance: number(4, "preutterance")?,
            overlap: number(5, "overlap")?,
        },
    })
}
