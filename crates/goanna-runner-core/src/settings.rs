//! Scalar lookups in `.ini` style files such as `application.ini`.

use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum SettingError {
    #[error("Section [{0}] not found")]
    SectionNotFound(String),
    #[error("Key {key} not found in section [{section}]")]
    KeyNotFound { section: String, key: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read `key` from `[section]` of `path`.
///
/// A missing file is only a warning and yields `Ok(None)`; a missing section
/// or key is an error.
pub fn read_setting(path: &Path, section: &str, key: &str) -> Result<Option<String>, SettingError> {
    if !path.exists() {
        warn!("File {} not found", path.display());
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    parse_setting(&content, section, key).map(Some)
}

pub fn parse_setting(content: &str, section: &str, key: &str) -> Result<String, SettingError> {
    let mut current: Option<&str> = None;
    let mut section_found = false;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = name.trim();
            section_found |= name == section;
            current = Some(name);
            continue;
        }

        if current != Some(section) {
            continue;
        }

        match line.split_once('=') {
            Some((name, value)) if name.trim() == key => {
                return Ok(clean_value(value).to_string());
            }
            _ => {}
        }
    }

    if section_found {
        Err(SettingError::KeyNotFound {
            section: section.to_string(),
            key: key.to_string(),
        })
    } else {
        Err(SettingError::SectionNotFound(section.to_string()))
    }
}

fn clean_value(value: &str) -> &str {
    let value = value.trim();
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    strip_inline_comment(value)
}

/// Drop a trailing `# ...` or `; ...` that follows whitespace
fn strip_inline_comment(value: &str) -> &str {
    let end = value
        .char_indices()
        .zip(value.chars().skip(1))
        .find(|((_, c), next)| c.is_whitespace() && (*next == '#' || *next == ';'))
        .map(|((i, _), _)| i);
    match end {
        Some(end) => value[..end].trim_end(),
        None => value,
    }
}
