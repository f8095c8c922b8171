//! Field sanitizer
//!
//! Turns one raw delimited row into a clean, fixed-width field tuple:
//!
//! - surrounding whitespace is trimmed
//! - characters outside printable ASCII are dropped
//! - numeric-looking fields are rewritten in a canonical form
//! - backslash and double quote are escaped in every other field
//! - the row is padded with empty fields or truncated to the expected width
//!
//! A row that cannot be sanitized is logged and replaced by an all-empty row
//! of the expected width, so one bad line never aborts a multi-million-row load.

use regex::Regex;
use std::sync::LazyLock;
use tracing::warn;

use crate::error::MalformedRecordError;

#[allow(clippy::unwrap_used)]
static NUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(-)?([0-9]*)(?:\.([0-9]*))?$").unwrap());

/// Per-field limits applied while sanitizing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SanitizeOptions {
    /// Longest accepted field after cleaning; `None` means unlimited
    pub max_field_len: Option<usize>,
}

/// What happened to a row on its way through the sanitizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    Clean,
    /// Padded or truncated to the expected width
    Repaired,
    /// Replaced by an empty row
    Malformed,
}

/// Sanitize one row with default options.
///
/// ```
/// use kgload_ingest::sanitize::sanitize;
///
/// let row = sanitize(&["  42 ", "", "foo\"bar", "3.0"], 5);
/// assert_eq!(row, vec!["42", "", "foo\\\"bar", "3.0", ""]);
/// ```
pub fn sanitize<S: AsRef<str>>(raw_fields: &[S], expected_column_count: usize) -> Vec<String> {
    sanitize_with(raw_fields, expected_column_count, &SanitizeOptions::default())
}

/// Sanitize one row, falling back to an empty row on error
pub fn sanitize_with<S: AsRef<str>>(
    raw_fields: &[S],
    expected_column_count: usize,
    options: &SanitizeOptions,
) -> Vec<String> {
    sanitize_row(raw_fields, expected_column_count, options).0
}

/// Sanitize one row and report whether it had to be repaired or replaced
pub fn sanitize_row<S: AsRef<str>>(
    raw_fields: &[S],
    expected_column_count: usize,
    options: &SanitizeOptions,
) -> (Vec<String>, RowOutcome) {
    match try_sanitize(raw_fields, expected_column_count, options) {
        Ok(fields) => {
            let outcome = if raw_fields.len() == expected_column_count {
                RowOutcome::Clean
            } else {
                RowOutcome::Repaired
            };
            (fields, outcome)
        },
        Err(e) => {
            let raw: Vec<&str> = raw_fields.iter().map(AsRef::as_ref).collect();
            warn!(error = %e, raw = ?raw, "Malformed record replaced with an empty row");
            (vec![String::new(); expected_column_count], RowOutcome::Malformed)
        },
    }
}

/// Sanitize one row, surfacing field-level errors instead of recovering
pub fn try_sanitize<S: AsRef<str>>(
    raw_fields: &[S],
    expected_column_count: usize,
    options: &SanitizeOptions,
) -> Result<Vec<String>, MalformedRecordError> {
    let mut fields = Vec::with_capacity(expected_column_count);

    for (column, raw) in raw_fields.iter().take(expected_column_count).enumerate() {
        let cleaned = clean_field(raw.as_ref());
        if let Some(max) = options.max_field_len {
            if cleaned.len() > max {
                return Err(MalformedRecordError::FieldTooLong {
                    column,
                    len: cleaned.len(),
                    max,
                });
            }
        }
        fields.push(cleaned);
    }

    fields.resize(expected_column_count, String::new());
    Ok(fields)
}

/// Clean a single field value
pub fn clean_field(raw: &str) -> String {
    let printable: String = raw
        .trim()
        .chars()
        .filter(|c| matches!(c, ' '..='~'))
        .collect();
    let value = printable.trim();

    if let Some(number) = canonical_number(value) {
        return number;
    }

    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if c == '\\' || c == '"' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Canonical form of a numeric-looking value, or `None` when it is not numeric.
///
/// Leading zeros of the integer part are dropped (keeping one digit), trailing
/// zeros of the fraction are dropped (keeping one digit when a decimal point
/// was present), and negative zero loses its sign.
pub fn canonical_number(value: &str) -> Option<String> {
    let caps = NUMERIC.captures(value)?;
    let int = caps.get(2).map_or("", |m| m.as_str());
    let frac = caps.get(3).map(|m| m.as_str());

    if int.is_empty() && frac.is_none_or(str::is_empty) {
        return None;
    }

    let int = match int.trim_start_matches('0') {
        "" => "0",
        digits => digits,
    };
    let frac = frac.map(|f| match f.trim_end_matches('0') {
        "" => "0",
        digits => digits,
    });

    let is_zero = int == "0" && frac.is_none_or(|f| f == "0");
    let sign = if caps.get(1).is_some() && !is_zero { "-" } else { "" };

    Some(match frac {
        Some(frac) => format!("{sign}{int}.{frac}"),
        None => format!("{sign}{int}"),
    })
}

/// A row is blank when every field is empty after trimming
pub fn is_blank_row<S: AsRef<str>>(raw_fields: &[S]) -> bool {
    raw_fields.iter().all(|f| f.as_ref().trim().is_empty())
}
