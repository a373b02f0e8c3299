//! Pulls one integer field out of a controller command's stdout.

use thiserror::Error;

/// How the text after `<field>:` is cut down to the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrimMode {
    /// Everything after the marker up to the end of the line, trimmed.
    /// Used for responses carrying a single bare value.
    #[default]
    RestOfLine,
    /// First whitespace-delimited token after the marker. Used for lines
    /// that carry further tokens after the value.
    FirstToken,
}

/// Errors surfaced by [`extract_field`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExtractError {
    /// No line contains `<field>:`.
    #[error("field `{field}` not found in controller output")]
    FieldNotFound {
        /// Field that was searched for.
        field: String,
    },
    /// The matched text is not a base-10 integer.
    #[error("field `{field}` has non-integer value `{raw}`")]
    FieldParseError {
        /// Field that was matched.
        field: String,
        /// Text that failed to parse.
        raw: String,
    },
}

/// Finds the first line containing `<field>:` and parses its value.
pub fn extract_field(response: &str, field: &str, mode: TrimMode) -> Result<i64, ExtractError> {
    let marker = format!("{field}:");
    let raw = response
        .lines()
        .find_map(|line| line.find(&marker).map(|at| &line[at + marker.len()..]))
        .map(|rest| match mode {
            TrimMode::RestOfLine => rest.trim(),
            TrimMode::FirstToken => rest.split_whitespace().next().unwrap_or(""),
        })
        .ok_or_else(|| ExtractError::FieldNotFound {
            field: field.to_string(),
        })?;
    raw.parse::<i64>()
        .map_err(|_| ExtractError::FieldParseError {
            field: field.to_string(),
            raw: raw.to_string(),
        })
}
