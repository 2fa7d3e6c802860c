//! Index entries and CSV loading.
//!
//! The input dataset is a text file with one `key,id` pair per line, e.g.
//! `0.4123,17`. Blank lines are skipped.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// A point entry: the id of a data point and its scalar key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Entry {
    pub id: u32,
    pub key: f32,
}

impl Entry {
    #[must_use]
    pub const fn new(id: u32, key: f32) -> Self {
        Self { id, key }
    }
}

/// Errors that can occur when loading entries.
#[derive(Debug)]
pub enum EntryError {
    /// The input file could not be read.
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A line is not a valid `key,id` pair.
    Parse { line: usize, message: String },
}

impl std::fmt::Display for EntryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read {}: {source}", path.display())
            }
            Self::Parse { line, message } => write!(f, "line {line}: {message}"),
        }
    }
}

impl std::error::Error for EntryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse { .. } => None,
        }
    }
}

/// Parse one `key,id` line. `line_number` is 1-based and only used in errors.
pub fn parse_line(line: &str, line_number: usize) -> Result<Entry, EntryError> {
    let parse_error = |message: String| EntryError::Parse {
        line: line_number,
        message,
    };

    let (key, id) = line
        .split_once(',')
        .ok_or_else(|| parse_error(format!("expected `key,id`, got {line:?}")))?;

    let key = key
        .trim()
        .parse::<f32>()
        .map_err(|e| parse_error(format!("invalid key {key:?}: {e}")))?;
    if !key.is_finite() {
        return Err(parse_error(format!("key must be finite, got {key}")));
    }

    let id = id
        .trim()
        .parse::<u32>()
        .map_err(|e| parse_error(format!("invalid id {id:?}: {e}")))?;

    Ok(Entry { id, key })
}

/// Load up to `limit` entries from a `key,id` CSV file.
pub fn load_csv(path: &Path, limit: Option<usize>) -> Result<Vec<Entry>, EntryError> {
    let io_error = |source| EntryError::Io {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(io_error)?;
    let limit = limit.unwrap_or(usize::MAX);
    let mut entries = Vec::new();

    for (index, line) in BufReader::new(file).lines().enumerate() {
        if entries.len() >= limit {
            break;
        }
        let line = line.map_err(io_error)?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(parse_line(&line, index + 1)?);
    }

    Ok(entries)
}

/// Whether the entries are in ascending key order.
#[must_use]
pub fn is_sorted_by_key(entries: &[Entry]) -> bool {
    entries.is_sorted_by(|a, b| a.key.total_cmp(&b.key).is_le())
}

/// Sort entries by ascending key. Equal keys keep their input order.
pub fn sort_by_key(entries: &mut [Entry]) {
    entries.sort_by(|a, b| a.key.total_cmp(&b.key));
}
